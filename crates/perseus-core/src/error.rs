//! Error types for the Perseus driver.
//!
//! All fallible operations across the workspace return [`Result<T>`], which
//! uses [`Error`] as the error type. Configuration, transport, protocol and
//! range errors are all captured here.
//!
//! Precondition failures on front-end and streaming operations are *not*
//! surfaced through this type: those operations log a warning and return
//! `Ok(false)`. [`Error::Precondition`] is reserved for the calls that must
//! refuse outright, such as uploading a bitstream before any firmware.

/// The error type for all Perseus driver operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed firmware or bitstream source, bad seed, or an invalid
    /// static description.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A firmware record that could not be parsed.
    ///
    /// `line` is 1-based, counting comment and blank lines.
    #[error("firmware format error on line {line}: {reason}")]
    FirmwareFormat {
        /// The offending line number.
        line: usize,
        /// What was wrong with the record.
        reason: String,
    },

    /// The operation requires a state the unit is not in.
    #[error("precondition not met: {0}")]
    Precondition(String),

    /// A control or bulk transfer returned a non-success status.
    #[error("transport error: {0}")]
    Transport(String),

    /// A transfer moved fewer bytes than requested.
    #[error("short transfer: expected {expected} bytes, transferred {actual}")]
    ShortTransfer {
        /// Number of bytes requested.
        expected: usize,
        /// Number of bytes actually moved.
        actual: usize,
    },

    /// The device answered, but not with what the protocol requires.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A center frequency outside `[0, ADC clock / 2)`.
    #[error("frequency out of range: {0} Hz")]
    FrequencyOutOfRange(f64),

    /// No preselector band has a cutoff above the requested frequency.
    #[error("no preselector filter covers {0} Hz")]
    NoPreselectorFilter(f64),

    /// Timed out waiting for a synchronous transfer.
    #[error("timeout waiting for transfer")]
    Timeout,

    /// The unit has no open device handle.
    #[error("device not open")]
    NotOpen,

    /// The device is gone (unplugged or re-enumerated).
    #[error("no such device")]
    NoDevice,

    /// An underlying I/O error (resource files, bitstream reader).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_firmware_format() {
        let e = Error::FirmwareFormat {
            line: 12,
            reason: "record too short".into(),
        };
        assert_eq!(
            e.to_string(),
            "firmware format error on line 12: record too short"
        );
    }

    #[test]
    fn error_display_short_transfer() {
        let e = Error::ShortTransfer {
            expected: 64,
            actual: 10,
        };
        assert_eq!(
            e.to_string(),
            "short transfer: expected 64 bytes, transferred 10"
        );
    }

    #[test]
    fn error_display_protocol() {
        let e = Error::Protocol("FPGA configuration failed with RC=[02,00]".into());
        assert_eq!(
            e.to_string(),
            "protocol error: FPGA configuration failed with RC=[02,00]"
        );
    }

    #[test]
    fn error_display_range() {
        assert_eq!(
            Error::FrequencyOutOfRange(41_000_000.0).to_string(),
            "frequency out of range: 41000000 Hz"
        );
        assert_eq!(
            Error::NoPreselectorFilter(32_000_000.0).to_string(),
            "no preselector filter covers 32000000 Hz"
        );
    }

    #[test]
    fn error_display_simple_variants() {
        assert_eq!(Error::Timeout.to_string(), "timeout waiting for transfer");
        assert_eq!(Error::NotOpen.to_string(), "device not open");
        assert_eq!(Error::NoDevice.to_string(), "no such device");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "perseus2m24v21.sbs");
        let e: Error = io_err.into();
        assert!(matches!(e, Error::Io(_)));
        assert!(e.to_string().contains("perseus2m24v21.sbs"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
