//! FX2 boot firmware images and their upload.
//!
//! A firmware file is a text file of records, one per line:
//!
//! ```text
//! :LLAAAATT<data...>[CC]
//! ```
//!
//! `LL` is the number of data bytes, `AAAA` the 16-bit value passed as
//! `wValue` of the firmware-load vendor request (the target address in FX2
//! RAM), `TT` the record type and `CC` an optional checksum byte. Lines
//! starting with `#` are comments. Blank lines are ignored. Surrounding
//! whitespace and letter case do not matter.
//!
//! The record type is not interpreted; uploading just replays every record
//! as a control transfer while the 8051 is held in reset.

use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use perseus_core::error::{Error, Result};
use perseus_core::transport::UsbHandle;
use tracing::{debug, info};

use crate::commands::{cpu_reset, CPUCS_ADDRESS, REQUEST_FIRMWARE_LOAD, REQUEST_TYPE_VENDOR_OUT};

/// Largest payload a single record may carry.
pub const MAX_BLOCK_LEN: usize = 128;

/// The two firmware builds shipped for the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareKind {
    /// Default firmware: the FPGA runs a digital down-converter and the
    /// unit streams a narrow band around the center frequency.
    Narrowband,
    /// Wideband firmware: the whole 0-40 MHz span is streamed.
    Wideband,
}

impl FirmwareKind {
    /// File name of this firmware inside the resource directory.
    pub fn file_name(self) -> &'static str {
        match self {
            FirmwareKind::Narrowband => "perseus_default_ds16v21.hex",
            FirmwareKind::Wideband => "perseus_wb_ds16v21.hex",
        }
    }

    /// True for the wideband build.
    pub fn is_wideband(self) -> bool {
        self == FirmwareKind::Wideband
    }
}

impl std::fmt::Display for FirmwareKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FirmwareKind::Narrowband => write!(f, "FX2"),
            FirmwareKind::Wideband => write!(f, "WB"),
        }
    }
}

/// One firmware record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareBlock {
    address: u16,
    content: Option<Vec<u8>>,
    checksum: Option<u8>,
}

impl FirmwareBlock {
    /// Build a block. Fails if `content` exceeds [`MAX_BLOCK_LEN`].
    pub fn new(address: u16, content: Option<Vec<u8>>, checksum: Option<u8>) -> Result<Self> {
        if let Some(ref data) = content {
            if data.len() > MAX_BLOCK_LEN {
                return Err(Error::Configuration(format!(
                    "firmware block of {} bytes exceeds the {MAX_BLOCK_LEN}-byte maximum",
                    data.len()
                )));
            }
        }
        Ok(FirmwareBlock {
            address,
            content,
            checksum,
        })
    }

    /// Target address, sent as the request value.
    pub fn address(&self) -> u16 {
        self.address
    }

    /// Payload, if the record declared any bytes.
    pub fn content(&self) -> Option<&[u8]> {
        self.content.as_deref()
    }

    /// Checksum byte, if the record carried one.
    pub fn checksum(&self) -> Option<u8> {
        self.checksum
    }

    fn payload(&self) -> &[u8] {
        self.content.as_deref().unwrap_or(&[])
    }
}

// ---------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------

fn hex_byte(digits: &[u8]) -> Option<u8> {
    let hi = (digits[0] as char).to_digit(16)?;
    let lo = (digits[1] as char).to_digit(16)?;
    Some((hi << 4 | lo) as u8)
}

fn parse_record(record: &[u8], line: usize) -> Result<FirmwareBlock> {
    let err = |reason: &str| Error::FirmwareFormat {
        line,
        reason: reason.to_string(),
    };
    let byte_at = |pos: usize| hex_byte(&record[pos..pos + 2]).ok_or_else(|| err("invalid hex digit"));

    if record.len() < 2 {
        return Err(err("missing byte count"));
    }
    let count = byte_at(0)? as usize;
    if record.len() < 2 * count + 8 {
        return Err(err("record shorter than its byte count"));
    }
    let address = u16::from(byte_at(2)?) << 8 | u16::from(byte_at(4)?);
    // Record type is validated but not used.
    byte_at(6)?;

    let mut col = 8;
    let content = if count == 0 {
        None
    } else {
        let mut data = Vec::with_capacity(count);
        for _ in 0..count {
            data.push(byte_at(col)?);
            col += 2;
        }
        Some(data)
    };
    let checksum = if record.len() == col + 2 {
        Some(byte_at(col)?)
    } else {
        None
    };

    FirmwareBlock::new(address, content, checksum).map_err(|e| err(&e.to_string()))
}

// ---------------------------------------------------------------
// FirmwareImage
// ---------------------------------------------------------------

/// A parsed firmware file: its kind and its records in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    kind: FirmwareKind,
    blocks: Vec<FirmwareBlock>,
}

impl FirmwareImage {
    /// Build an image from already-parsed blocks.
    pub fn new(kind: FirmwareKind, blocks: Vec<FirmwareBlock>) -> Self {
        FirmwareImage { kind, blocks }
    }

    /// Parse the text of a firmware file.
    pub fn parse(kind: FirmwareKind, text: &str) -> Result<Self> {
        let mut blocks = Vec::new();
        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let row = raw.trim().to_ascii_uppercase();
            let row = row.as_bytes();
            match row.first() {
                None | Some(b'#') => continue,
                Some(b':') => blocks.push(parse_record(&row[1..], line)?),
                Some(_) => {
                    return Err(Error::FirmwareFormat {
                        line,
                        reason: "line does not start with ':' or '#'".into(),
                    })
                }
            }
        }
        debug!(kind = %kind, blocks = blocks.len(), "parsed firmware image");
        Ok(FirmwareImage { kind, blocks })
    }

    /// Read and parse a firmware file.
    pub fn load(kind: FirmwareKind, path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("{}: {e}", path.display()),
            ))
        })?;
        Self::parse(kind, &text)
    }

    /// Render the image back to record text, one record per line.
    /// The record type is written as `00`.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for block in &self.blocks {
            let payload = block.payload();
            let _ = write!(out, ":{:02X}{:04X}00", payload.len(), block.address);
            for b in payload {
                let _ = write!(out, "{b:02X}");
            }
            if let Some(cs) = block.checksum {
                let _ = write!(out, "{cs:02X}");
            }
            out.push('\n');
        }
        out
    }

    /// Which firmware build this is.
    pub fn kind(&self) -> FirmwareKind {
        self.kind
    }

    /// Records in file order.
    pub fn blocks(&self) -> &[FirmwareBlock] {
        &self.blocks
    }
}

// ---------------------------------------------------------------
// Upload
// ---------------------------------------------------------------

fn control_write(handle: &dyn UsbHandle, value: u16, data: &[u8], timeout: Duration) -> Result<()> {
    let written = handle.write_control(
        REQUEST_TYPE_VENDOR_OUT,
        REQUEST_FIRMWARE_LOAD,
        value,
        0,
        data,
        timeout,
    )?;
    if written != data.len() {
        return Err(Error::ShortTransfer {
            expected: data.len(),
            actual: written,
        });
    }
    Ok(())
}

/// Download `image` into the FX2: hold the CPU in reset, write every
/// block, then release the reset.
pub fn upload(handle: &dyn UsbHandle, image: &FirmwareImage, timeout: Duration) -> Result<()> {
    control_write(handle, CPUCS_ADDRESS, &cpu_reset(true), timeout).map_err(|e| {
        Error::Transport(format!("unable to hold FX2 CPU in reset: {e}"))
    })?;

    for block in image.blocks() {
        control_write(handle, block.address(), block.payload(), timeout)?;
    }

    control_write(handle, CPUCS_ADDRESS, &cpu_reset(false), timeout)?;
    info!(kind = %image.kind(), blocks = image.blocks().len(), "firmware uploaded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use perseus_core::{DeviceInfo, UsbAddress, UsbContext};
    use perseus_test_harness::{MockUsb, WriteOutcome};

    const SAMPLE: &str = "\
# FX2 test image
:03000000020006F5

:0400060075810BE4
:00E60000
";

    #[test]
    fn parse_sample_image() {
        let image = FirmwareImage::parse(FirmwareKind::Narrowband, SAMPLE).unwrap();
        let blocks = image.blocks();
        assert_eq!(blocks.len(), 3);

        assert_eq!(blocks[0].address(), 0x0000);
        assert_eq!(blocks[0].content(), Some(&[0x02, 0x00, 0x06][..]));
        assert_eq!(blocks[0].checksum(), Some(0xF5));

        assert_eq!(blocks[1].address(), 0x0006);
        assert_eq!(blocks[1].content(), Some(&[0x75, 0x81, 0x0B, 0xE4][..]));
        assert_eq!(blocks[1].checksum(), None);

        assert_eq!(blocks[2].address(), 0xE600);
        assert_eq!(blocks[2].content(), None);
        assert_eq!(blocks[2].checksum(), None);
    }

    #[test]
    fn parse_ignores_case_and_whitespace() {
        let image = FirmwareImage::parse(FirmwareKind::Wideband, "   :01e60000ab  \n").unwrap();
        assert_eq!(image.blocks()[0].address(), 0xE600);
        assert_eq!(image.blocks()[0].content(), Some(&[0xAB][..]));
    }

    #[test]
    fn parse_short_record_names_line() {
        let err = FirmwareImage::parse(FirmwareKind::Narrowband, "# c\n\n:0400000001\n").unwrap_err();
        match err {
            Error::FirmwareFormat { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn parse_bad_hex_names_line() {
        let err = FirmwareImage::parse(FirmwareKind::Narrowband, ":0100000000\n:01000000ZZ\n")
            .unwrap_err();
        assert!(matches!(err, Error::FirmwareFormat { line: 2, .. }));
    }

    #[test]
    fn parse_rejects_unknown_leading_character() {
        let err = FirmwareImage::parse(FirmwareKind::Narrowband, ":0100000000\nS1130000\n")
            .unwrap_err();
        assert!(matches!(err, Error::FirmwareFormat { line: 2, .. }));
    }

    #[test]
    fn parse_rejects_oversized_block() {
        let record = format!(":81000000{}", "00".repeat(129));
        let err = FirmwareImage::parse(FirmwareKind::Narrowband, &record).unwrap_err();
        assert!(matches!(err, Error::FirmwareFormat { line: 1, .. }));
    }

    #[test]
    fn block_new_enforces_maximum() {
        assert!(FirmwareBlock::new(0, Some(vec![0; MAX_BLOCK_LEN]), None).is_ok());
        assert!(matches!(
            FirmwareBlock::new(0, Some(vec![0; MAX_BLOCK_LEN + 1]), None),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn serialize_then_parse_preserves_blocks() {
        let image = FirmwareImage::parse(FirmwareKind::Narrowband, SAMPLE).unwrap();
        let text = image.serialize();
        let again = FirmwareImage::parse(FirmwareKind::Narrowband, &text).unwrap();
        assert_eq!(image, again);
        assert!(text.starts_with(":03000000020006F5\n"));
    }

    #[test]
    fn serialize_then_parse_generated_images() {
        let payload = |len: usize, salt: u8| -> Option<Vec<u8>> {
            (len > 0).then(|| (0..len).map(|i| (i as u8).wrapping_mul(31) ^ salt).collect())
        };
        let mut cases = Vec::new();
        for len in [0usize, 1, 16, MAX_BLOCK_LEN] {
            for address in [0x0000u16, 0x0006, 0x1234, 0xE600, 0xFFFF] {
                for checksum in [None, Some(0x00), Some(0xA7)] {
                    cases.push(vec![
                        FirmwareBlock::new(address, payload(len, address as u8), checksum).unwrap(),
                    ]);
                }
            }
        }
        // Multi-block images mixing sizes and checksum presence.
        cases.push(
            (0..8u16)
                .map(|i| {
                    let len = [0usize, 1, 16, MAX_BLOCK_LEN][usize::from(i % 4)];
                    let checksum = (i % 2 == 0).then_some(i as u8);
                    FirmwareBlock::new(i * 0x80, payload(len, i as u8), checksum).unwrap()
                })
                .collect(),
        );
        cases.push(Vec::new());

        for blocks in cases {
            for kind in [FirmwareKind::Narrowband, FirmwareKind::Wideband] {
                let image = FirmwareImage::new(kind, blocks.clone());
                let text = image.serialize();
                let again = FirmwareImage::parse(kind, &text).unwrap();
                assert_eq!(again, image, "{text}");
            }
        }
    }

    #[test]
    fn kind_file_names() {
        assert_eq!(FirmwareKind::Narrowband.file_name(), "perseus_default_ds16v21.hex");
        assert_eq!(FirmwareKind::Wideband.file_name(), "perseus_wb_ds16v21.hex");
        assert!(FirmwareKind::Wideband.is_wideband());
    }

    fn open_mock() -> (MockUsb, perseus_test_harness::MockDevice, Box<dyn UsbHandle>) {
        let usb = MockUsb::new();
        let dev = usb.add_device(DeviceInfo {
            vendor_id: 0x04B4,
            product_id: 0x325C,
            location: UsbAddress::new(1, 3),
            device_address: 7,
            interface_number: 0,
        });
        let handle = usb.open(&dev.info()).unwrap();
        (usb, dev, handle)
    }

    #[test]
    fn upload_holds_reset_writes_blocks_then_releases() {
        let (_usb, dev, handle) = open_mock();
        let image = FirmwareImage::parse(FirmwareKind::Narrowband, SAMPLE).unwrap();
        upload(handle.as_ref(), &image, Duration::from_secs(1)).unwrap();

        assert_eq!(
            dev.control_log(),
            vec![
                (0xE600, vec![1]),
                (0x0000, vec![0x02, 0x00, 0x06]),
                (0x0006, vec![0x75, 0x81, 0x0B, 0xE4]),
                (0xE600, vec![]),
                (0xE600, vec![0]),
            ]
        );
    }

    #[test]
    fn upload_fails_when_reset_cannot_be_held() {
        let (_usb, dev, handle) = open_mock();
        dev.push_control_outcome(WriteOutcome::Fail);
        let image = FirmwareImage::parse(FirmwareKind::Narrowband, SAMPLE).unwrap();
        let err = upload(handle.as_ref(), &image, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(dev.control_log().len(), 1);
    }

    #[test]
    fn upload_reports_short_block() {
        let (_usb, dev, handle) = open_mock();
        dev.push_control_outcome(WriteOutcome::Ok);
        dev.push_control_outcome(WriteOutcome::Short(1));
        let image = FirmwareImage::parse(FirmwareKind::Narrowband, SAMPLE).unwrap();
        let err = upload(handle.as_ref(), &image, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(
            err,
            Error::ShortTransfer {
                expected: 3,
                actual: 1
            }
        ));
    }
}
