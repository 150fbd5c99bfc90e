//! Product identity stored in the onboard EEPROM.
//!
//! The firmware answers an EEPROM read of the identity block (12 bytes at
//! offset 8) with a 14-byte reply:
//!
//! | Offset | Size | Field                          |
//! |--------|------|--------------------------------|
//! | 0      | 1    | operation echo                 |
//! | 1      | 1    | return code                    |
//! | 2      | 2    | serial number                  |
//! | 4      | 2    | product code                   |
//! | 6      | 1    | hardware release               |
//! | 7      | 1    | hardware version               |
//! | 8      | 6    | signature words 3, 2, 1        |
//!
//! Multi-byte words are big-endian.

use std::fmt;
use std::time::Duration;

use perseus_core::error::{Error, Result};
use perseus_core::transport::UsbHandle;
use tracing::debug;

use crate::commands::{
    eeprom_read, EEPROM_ID_ADDRESS, EEPROM_ID_SIZE, EEPROM_REPLY_HEADER, EP_CMD, EP_STATUS,
};

/// Product code of production units.
pub const PRODUCTION_PRODUCT_CODE: u16 = 0x8014;

/// Length of the identity reply.
pub const IDENTITY_REPLY_LEN: usize = EEPROM_ID_SIZE as usize + EEPROM_REPLY_HEADER;

/// Decoded identity block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EepromInfo {
    pub operation: u8,
    pub return_code: u8,
    pub serial_number: u16,
    pub product_code: u16,
    pub hardware_release: u8,
    pub hardware_version: u8,
    /// Signature words in the order they are printed (word 1 first).
    pub signature: [u16; 3],
}

impl EepromInfo {
    /// Decode a 14-byte identity reply.
    pub fn parse(reply: &[u8]) -> Result<Self> {
        if reply.len() != IDENTITY_REPLY_LEN {
            return Err(Error::Protocol(format!(
                "EEPROM reply must be {IDENTITY_REPLY_LEN} bytes, got {}",
                reply.len()
            )));
        }
        let word = |at: usize| u16::from_be_bytes([reply[at], reply[at + 1]]);
        Ok(EepromInfo {
            operation: reply[0],
            return_code: reply[1],
            serial_number: word(2),
            product_code: word(4),
            hardware_release: reply[6],
            hardware_version: reply[7],
            signature: [word(12), word(10), word(8)],
        })
    }

    /// Serial number as printed on the unit, e.g. `00123`.
    pub fn serial(&self) -> String {
        format!("{:05}", self.serial_number)
    }

    /// Product code as `0x8014`.
    pub fn product_code_string(&self) -> String {
        format!("0x{:04X}", self.product_code)
    }

    /// Hardware `version.release`.
    pub fn hardware(&self) -> String {
        format!("{}.{}", self.hardware_version, self.hardware_release)
    }

    /// Product signature `S1-S2-S3`.
    pub fn signature_string(&self) -> String {
        let [s1, s2, s3] = self.signature;
        format!("{s1:04X}-{s2:04X}-{s3:04X}")
    }

    /// Pre-production units carry any product code but the production one.
    pub fn is_preproduction(&self) -> bool {
        self.product_code != PRODUCTION_PRODUCT_CODE
    }

    /// Three-line identity summary.
    pub fn describe(&self) -> String {
        format!(
            "Microtelecom product code: {}\nSerial Number            : {}-{}\nHardware version/revision: {}\n",
            self.product_code_string(),
            self.serial(),
            self.signature_string(),
            self.hardware()
        )
    }
}

impl fmt::Display for EepromInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Perseus #{} ({}, hw {})",
            self.serial(),
            self.product_code_string(),
            self.hardware()
        )
    }
}

/// Request the identity block and decode it.
pub fn read(handle: &dyn UsbHandle, timeout: Duration) -> Result<EepromInfo> {
    let request = eeprom_read(EEPROM_ID_ADDRESS, EEPROM_ID_SIZE);
    let written = handle.write_bulk(EP_CMD, &request, timeout)?;
    if written != request.len() {
        return Err(Error::ShortTransfer {
            expected: request.len(),
            actual: written,
        });
    }

    let mut reply = [0u8; IDENTITY_REPLY_LEN];
    let n = handle.read_bulk(EP_STATUS, &mut reply, Some(timeout))?;
    let info = EepromInfo::parse(&reply[..n])?;
    debug!(
        serial = %info.serial(),
        product = %info.product_code_string(),
        return_code = info.return_code,
        "EEPROM identity read"
    );
    Ok(info)
}
