//! FPGA bitstream variants, the bitstream cipher and the upload protocol.
//!
//! Each sample rate the receiver supports is a separate FPGA bitstream
//! (`<name>.sbs` in the resource directory). Bitstreams are stored
//! encoded. On upload every byte is run through a keystream cipher before
//! it is sent in 63-byte blocks, each prefixed with the FPGA-config command
//! byte.
//!
//! The keystream generator is a 48-bit register seeded with the variant's
//! 6-byte seed. For each byte, the current low register byte is taken as
//! the key byte, then the register is shifted left eight times; whenever a
//! one falls out of the top, every register byte is XORed with a fixed
//! secret key. The output byte is the bit-reversal of `input ^ key`.
//!
//! | Variant  | Bitstream            | Rate (S/s) | Decimation | Firmware |
//! |----------|----------------------|-----------:|-----------:|----------|
//! | 48 k     | `perseus48k24v31`    |     48 000 |       1664 | FX2      |
//! | 96 k     | `perseus96k24v31`    |     96 000 |        832 | FX2      |
//! | 192 k    | `perseus192k24v31`   |    192 000 |        416 | FX2      |
//! | 95 k     | `perseus95k24v31`    |     95 000 |        842 | FX2      |
//! | 125 k    | `perseus125k24v21`   |    125 000 |        640 | FX2      |
//! | 250 k    | `perseus250k24v21`   |    250 000 |        320 | FX2      |
//! | 500 k    | `perseus500k24v21`   |    500 000 |        160 | FX2      |
//! | 1 M      | `perseus1m24v21`     |  1 000 000 |         80 | FX2      |
//! | 2 M      | `perseus2m24v21`     |  2 000 000 |         40 | FX2      |
//! | Wideband | `perseusds16v10`     |  6 553 600 |         10 | WB       |

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use perseus_core::error::{Error, Result};
use perseus_core::helpers::hex_bytes;
use perseus_core::transport::UsbHandle;
use tracing::{debug, info};

use crate::commands::{fpga_check, fpga_reset, CMD_FPGA_CONFIG, EP_CMD, EP_STATUS, FPGA_CHECK_REPLY_LEN};
use crate::firmware::FirmwareKind;

/// Raw bitstream bytes per upload block.
pub const BLOCK_SIZE: usize = 63;

/// Frames per streaming buffer.
pub const FRAMES_PER_BUFFER: usize = 8;

/// Time the FPGA needs after the last block before it reports DONE.
pub const FPGA_SETTLE: Duration = Duration::from_millis(50);

/// Secret key XORed into the keystream register on feedback.
const SECRET_KEY: [u8; 6] = [0x81, 0xB2, 0x25, 0xAA, 0x75, 0xAA];

/// Nibble bit-reversal.
const NIBBLE_REVERSE: [u8; 16] = [0, 8, 4, 12, 2, 10, 6, 14, 1, 9, 5, 13, 3, 11, 7, 15];

/// Substitution table: byte bit-reversal built from reversed nibbles.
const SUBSTITUTION: [u8; 256] = build_substitution();

const fn build_substitution() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = NIBBLE_REVERSE[i >> 4] | NIBBLE_REVERSE[i & 0x0F] << 4;
        i += 1;
    }
    table
}

// ---------------------------------------------------------------
// Variants
// ---------------------------------------------------------------

struct VariantInfo {
    index: u8,
    name: &'static str,
    samples_per_frame: usize,
    bytes_per_sample: usize,
    components_per_sample: usize,
    sample_rate: u32,
    decimation: u32,
    firmware: FirmwareKind,
    seed: [u8; 6],
}

static VARIANTS: [VariantInfo; 10] = [
    VariantInfo {
        index: 0,
        name: "perseus48k24v31",
        samples_per_frame: 170,
        bytes_per_sample: 3,
        components_per_sample: 2,
        sample_rate: 48_000,
        decimation: 1664,
        firmware: FirmwareKind::Narrowband,
        seed: [0xE4, 0x37, 0x73, 0x7B, 0x9A, 0x6A],
    },
    VariantInfo {
        index: 1,
        name: "perseus96k24v31",
        samples_per_frame: 170,
        bytes_per_sample: 3,
        components_per_sample: 2,
        sample_rate: 96_000,
        decimation: 832,
        firmware: FirmwareKind::Narrowband,
        seed: [0x39, 0x18, 0x79, 0xF5, 0x90, 0x8C],
    },
    VariantInfo {
        index: 2,
        name: "perseus192k24v31",
        samples_per_frame: 170,
        bytes_per_sample: 3,
        components_per_sample: 2,
        sample_rate: 192_000,
        decimation: 416,
        firmware: FirmwareKind::Narrowband,
        seed: [0x7B, 0x39, 0x26, 0x75, 0x9F, 0x7B],
    },
    VariantInfo {
        index: 3,
        name: "perseus95k24v31",
        samples_per_frame: 170,
        bytes_per_sample: 3,
        components_per_sample: 2,
        sample_rate: 95_000,
        decimation: 842,
        firmware: FirmwareKind::Narrowband,
        seed: [0x22, 0x33, 0xB8, 0xEA, 0x2C, 0xBC],
    },
    VariantInfo {
        index: 4,
        name: "perseus125k24v21",
        samples_per_frame: 170,
        bytes_per_sample: 3,
        components_per_sample: 2,
        sample_rate: 125_000,
        decimation: 640,
        firmware: FirmwareKind::Narrowband,
        seed: [0x45, 0x7C, 0xD4, 0x3A, 0x0E, 0xD4],
    },
    VariantInfo {
        index: 5,
        name: "perseus250k24v21",
        samples_per_frame: 170,
        bytes_per_sample: 3,
        components_per_sample: 2,
        sample_rate: 250_000,
        decimation: 320,
        firmware: FirmwareKind::Narrowband,
        seed: [0xCF, 0x4B, 0x9F, 0x02, 0xB2, 0x1E],
    },
    VariantInfo {
        index: 6,
        name: "perseus500k24v21",
        samples_per_frame: 170,
        bytes_per_sample: 3,
        components_per_sample: 2,
        sample_rate: 500_000,
        decimation: 160,
        firmware: FirmwareKind::Narrowband,
        seed: [0xF2, 0x9E, 0x67, 0x49, 0x51, 0x6B],
    },
    VariantInfo {
        index: 7,
        name: "perseus1m24v21",
        samples_per_frame: 170,
        bytes_per_sample: 3,
        components_per_sample: 2,
        sample_rate: 1_000_000,
        decimation: 80,
        firmware: FirmwareKind::Narrowband,
        seed: [0xC5, 0xC1, 0x96, 0x4D, 0xA8, 0x05],
    },
    VariantInfo {
        index: 8,
        name: "perseus2m24v21",
        samples_per_frame: 170,
        bytes_per_sample: 3,
        components_per_sample: 2,
        sample_rate: 2_000_000,
        decimation: 40,
        firmware: FirmwareKind::Narrowband,
        seed: [0xDE, 0xEA, 0x57, 0x52, 0x14, 0x35],
    },
    VariantInfo {
        index: 10,
        name: "perseusds16v10",
        samples_per_frame: 512,
        bytes_per_sample: 2,
        components_per_sample: 1,
        sample_rate: 6_553_600,
        decimation: 10,
        firmware: FirmwareKind::Wideband,
        seed: [0x1E, 0x8A, 0x3B, 0x9B, 0xBE, 0xD0],
    },
];

/// An FPGA bitstream the receiver can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitstreamVariant {
    Ddc48k,
    Ddc96k,
    Ddc192k,
    Ddc95k,
    Ddc125k,
    Ddc250k,
    Ddc500k,
    Ddc1m,
    Ddc2m,
    Wideband,
}

impl BitstreamVariant {
    /// Every variant, in table order.
    pub const ALL: [BitstreamVariant; 10] = [
        BitstreamVariant::Ddc48k,
        BitstreamVariant::Ddc96k,
        BitstreamVariant::Ddc192k,
        BitstreamVariant::Ddc95k,
        BitstreamVariant::Ddc125k,
        BitstreamVariant::Ddc250k,
        BitstreamVariant::Ddc500k,
        BitstreamVariant::Ddc1m,
        BitstreamVariant::Ddc2m,
        BitstreamVariant::Wideband,
    ];

    fn info(self) -> &'static VariantInfo {
        let slot = match self {
            BitstreamVariant::Ddc48k => 0,
            BitstreamVariant::Ddc96k => 1,
            BitstreamVariant::Ddc192k => 2,
            BitstreamVariant::Ddc95k => 3,
            BitstreamVariant::Ddc125k => 4,
            BitstreamVariant::Ddc250k => 5,
            BitstreamVariant::Ddc500k => 6,
            BitstreamVariant::Ddc1m => 7,
            BitstreamVariant::Ddc2m => 8,
            BitstreamVariant::Wideband => 9,
        };
        &VARIANTS[slot]
    }

    /// Find the variant producing `rate` samples per second.
    pub fn from_sample_rate(rate: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.sample_rate() == rate)
    }

    /// Device-side index of the variant.
    pub fn index(self) -> u8 {
        self.info().index
    }

    /// Bitstream base name, e.g. `perseus2m24v21`.
    pub fn name(self) -> &'static str {
        self.info().name
    }

    /// Bitstream file name inside the resource directory.
    pub fn file_name(self) -> String {
        format!("{}.sbs", self.name())
    }

    pub fn sample_rate(self) -> u32 {
        self.info().sample_rate
    }

    pub fn decimation(self) -> u32 {
        self.info().decimation
    }

    pub fn samples_per_frame(self) -> usize {
        self.info().samples_per_frame
    }

    /// Bytes per sample component (3 for 24-bit I/Q, 2 for wideband).
    pub fn bytes_per_sample(self) -> usize {
        self.info().bytes_per_sample
    }

    pub fn components_per_sample(self) -> usize {
        self.info().components_per_sample
    }

    /// The firmware this bitstream runs under.
    pub fn firmware(self) -> FirmwareKind {
        self.info().firmware
    }

    /// Keystream seed.
    pub fn seed(self) -> [u8; 6] {
        self.info().seed
    }

    /// Bytes in one USB frame of samples.
    pub fn frame_length(self) -> usize {
        self.bytes_per_sample() * self.components_per_sample() * self.samples_per_frame()
    }

    /// Recommended streaming buffer size: [`FRAMES_PER_BUFFER`] frames.
    pub fn buffer_length(self) -> usize {
        self.frame_length() * FRAMES_PER_BUFFER
    }
}

impl std::fmt::Display for BitstreamVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------
// Keystream
// ---------------------------------------------------------------

/// The 48-bit keystream register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keystream {
    register: [u8; 6],
}

impl Keystream {
    pub fn new(seed: [u8; 6]) -> Self {
        Keystream { register: seed }
    }

    /// Build a keystream from a seed slice, which must be exactly 6 bytes.
    pub fn from_slice(seed: &[u8]) -> Result<Self> {
        let register: [u8; 6] = seed.try_into().map_err(|_| {
            Error::Configuration(format!("keystream seed must be 6 bytes, got {}", seed.len()))
        })?;
        Ok(Keystream { register })
    }

    /// Return the next key byte and advance the register.
    pub fn next_key(&mut self) -> u8 {
        let key = self.register[0];
        for _ in 0..8 {
            let mut carry = 0u8;
            for byte in self.register.iter_mut() {
                let out = *byte >> 7;
                *byte = (*byte << 1) | carry;
                carry = out;
            }
            if carry != 0 {
                for (byte, k) in self.register.iter_mut().zip(SECRET_KEY) {
                    *byte ^= k;
                }
            }
        }
        key
    }

    /// Transform stored bitstream bytes into what the FPGA expects.
    pub fn descramble(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            let key = self.next_key();
            *byte = SUBSTITUTION[(*byte ^ key) as usize];
        }
    }

    /// Inverse of [`descramble`](Self::descramble) for the same register state.
    pub fn scramble(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            let key = self.next_key();
            *byte = SUBSTITUTION[*byte as usize] ^ key;
        }
    }
}

// ---------------------------------------------------------------
// Block reader
// ---------------------------------------------------------------

/// Splits a stored bitstream into upload blocks.
///
/// Each block is the FPGA-config command byte followed by up to
/// [`BLOCK_SIZE`] descrambled bytes. The keystream carries over from one
/// block to the next.
pub struct BlockReader<R> {
    source: R,
    keystream: Keystream,
    blocks: usize,
}

impl<R: Read> BlockReader<R> {
    pub fn new(source: R, seed: [u8; 6]) -> Self {
        BlockReader {
            source,
            keystream: Keystream::new(seed),
            blocks: 0,
        }
    }

    /// Read the next block, or `None` at end of input.
    pub fn next_block(&mut self) -> Result<Option<Bytes>> {
        let mut raw = [0u8; BLOCK_SIZE];
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            match self.source.read(&mut raw[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        let chunk = &mut raw[..filled];
        self.keystream.descramble(chunk);

        let mut block = BytesMut::with_capacity(filled + 1);
        block.put_u8(CMD_FPGA_CONFIG);
        block.put_slice(chunk);
        self.blocks += 1;
        Ok(Some(block.freeze()))
    }

    /// Number of blocks produced so far.
    pub fn blocks_read(&self) -> usize {
        self.blocks
    }
}

// ---------------------------------------------------------------
// Upload
// ---------------------------------------------------------------

fn bulk_write_exact(handle: &dyn UsbHandle, data: &[u8], timeout: Duration) -> Result<()> {
    let written = handle.write_bulk(EP_CMD, data, timeout)?;
    if written != data.len() {
        return Err(Error::ShortTransfer {
            expected: data.len(),
            actual: written,
        });
    }
    Ok(())
}

/// Configure the FPGA with `variant`, reading the stored bitstream from
/// `source`.
///
/// Resets the FPGA, sends every block, asks for the configuration status
/// and requires the DONE flag (second status byte) to be 1.
pub fn upload<R: Read>(
    handle: &dyn UsbHandle,
    variant: BitstreamVariant,
    source: R,
    timeout: Duration,
) -> Result<()> {
    bulk_write_exact(handle, &fpga_reset(), timeout)?;

    let mut reader = BlockReader::new(source, variant.seed());
    while let Some(block) = reader.next_block()? {
        bulk_write_exact(handle, &block, timeout)?;
    }
    debug!(variant = %variant, blocks = reader.blocks_read(), "bitstream blocks sent");

    bulk_write_exact(handle, &fpga_check(), timeout)?;
    std::thread::sleep(FPGA_SETTLE);

    let mut status = [0u8; FPGA_CHECK_REPLY_LEN];
    let n = handle.read_bulk(EP_STATUS, &mut status, Some(timeout))?;
    if n != FPGA_CHECK_REPLY_LEN {
        return Err(Error::ShortTransfer {
            expected: FPGA_CHECK_REPLY_LEN,
            actual: n,
        });
    }
    if status[1] != 1 {
        return Err(Error::Protocol(format!(
            "configuration of FPGA failed with RC=[{}]",
            hex_bytes(&status).replace(' ', ",")
        )));
    }
    info!(variant = %variant, rate = variant.sample_rate(), "FPGA configured");
    Ok(())
}

/// Open `path` and [`upload`] it.
pub fn upload_file(
    handle: &dyn UsbHandle,
    variant: BitstreamVariant,
    path: &Path,
    timeout: Duration,
) -> Result<()> {
    let file = std::fs::File::open(path).map_err(|e| {
        Error::Io(std::io::Error::new(e.kind(), format!("{}: {e}", path.display())))
    })?;
    upload(handle, variant, std::io::BufReader::new(file), timeout)
}
