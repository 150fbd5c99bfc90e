//! Firmware and bitstream files on disk.

use std::path::{Path, PathBuf};

use perseus_core::error::Result;

use crate::bitstream::BitstreamVariant;
use crate::firmware::{FirmwareImage, FirmwareKind};

/// A directory holding the `.hex` firmware and `.sbs` bitstream files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resources {
    dir: PathBuf,
}

impl Resources {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Resources {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn firmware_path(&self, kind: FirmwareKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    pub fn bitstream_path(&self, variant: BitstreamVariant) -> PathBuf {
        self.dir.join(variant.file_name())
    }

    /// Parse the firmware image of `kind`.
    pub fn load_firmware(&self, kind: FirmwareKind) -> Result<FirmwareImage> {
        FirmwareImage::load(kind, &self.firmware_path(kind))
    }

    /// Kinds whose firmware file is present.
    pub fn available_firmware(&self) -> Vec<FirmwareKind> {
        [FirmwareKind::Narrowband, FirmwareKind::Wideband]
            .into_iter()
            .filter(|k| self.firmware_path(*k).is_file())
            .collect()
    }

    /// Bitstream variants whose file is present.
    pub fn available_bitstreams(&self) -> Vec<BitstreamVariant> {
        BitstreamVariant::ALL
            .into_iter()
            .filter(|v| self.bitstream_path(*v).is_file())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perseus_core::Error;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("perseus-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn file_names() {
        let res = Resources::new("/res");
        assert_eq!(
            res.firmware_path(FirmwareKind::Narrowband),
            Path::new("/res/perseus_default_ds16v21.hex")
        );
        assert_eq!(
            res.firmware_path(FirmwareKind::Wideband),
            Path::new("/res/perseus_wb_ds16v21.hex")
        );
        assert_eq!(
            res.bitstream_path(BitstreamVariant::Ddc192k),
            Path::new("/res").join(BitstreamVariant::Ddc192k.file_name())
        );
    }

    #[test]
    fn missing_firmware_is_io_error_naming_path() {
        let res = Resources::new(scratch_dir("missing"));
        match res.load_firmware(FirmwareKind::Wideband) {
            Err(Error::Io(e)) => assert!(e.to_string().contains("perseus_wb_ds16v21.hex")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn loads_and_lists_present_files() {
        let dir = scratch_dir("present");
        std::fs::write(
            dir.join(FirmwareKind::Narrowband.file_name()),
            ":03000000020006F5\n",
        )
        .unwrap();
        std::fs::write(dir.join(BitstreamVariant::Ddc96k.file_name()), [0u8; 4]).unwrap();

        let res = Resources::new(&dir);
        let image = res.load_firmware(FirmwareKind::Narrowband).unwrap();
        assert_eq!(image.blocks().len(), 1);
        assert_eq!(res.available_firmware(), vec![FirmwareKind::Narrowband]);
        assert_eq!(res.available_bitstreams(), vec![BitstreamVariant::Ddc96k]);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
