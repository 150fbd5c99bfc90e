//! Perseus USB identifiers, endpoints and command builders.
//!
//! The FX2 microcontroller firmware accepts single-byte commands on the
//! command-out endpoint, some followed by a payload. This module holds the
//! constants and pure functions that build those command buffers. Nothing
//! here performs I/O.

use bytes::{BufMut, BytesMut};

// ---------------------------------------------------------------
// USB identifiers
// ---------------------------------------------------------------

/// Cypress vendor ID used by Perseus units.
pub const VENDOR_ID: u16 = 0x04B4;

/// Product ID of a unit with a programmed EEPROM.
pub const PRODUCT_ID: u16 = 0x325C;

/// Product ID reported by a unit whose EEPROM is blank.
pub const PRODUCT_ID_BLANK_EEPROM: u16 = 0x8613;

/// USB configuration selected on open.
pub const CONFIGURATION: u8 = 1;

// ---------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------

/// Command output endpoint.
pub const EP_CMD: u8 = 0x01;

/// Command status input endpoint.
pub const EP_STATUS: u8 = 0x81;

/// Sample data input endpoint.
pub const EP_DATA_IN: u8 = 0x82;

// ---------------------------------------------------------------
// Firmware download (FX2 vendor control request)
// ---------------------------------------------------------------

/// bmRequestType for a vendor request to the device.
pub const REQUEST_TYPE_VENDOR_OUT: u8 = 0x40;

/// FX2 "firmware load" vendor request.
pub const REQUEST_FIRMWARE_LOAD: u8 = 0xA0;

/// FX2 CPU control and status register. Writing 1 holds the 8051 in
/// reset, writing 0 releases it.
pub const CPUCS_ADDRESS: u16 = 0xE600;

// ---------------------------------------------------------------
// Bulk commands
// ---------------------------------------------------------------

/// Prefix of every FPGA configuration block.
pub const CMD_FPGA_CONFIG: u8 = 0x00;

/// Reset the FPGA before configuration.
pub const CMD_FPGA_RESET: u8 = 0x01;

/// Ask the firmware whether the FPGA accepted its configuration.
pub const CMD_FPGA_CHECK: u8 = 0x02;

/// Serial IO to the FPGA: control byte and DDC phase accumulator.
pub const CMD_FPGA_SIO: u8 = 0x03;

/// Write the FX2 port E register (attenuator and preselector).
pub const CMD_FX2_PORT_E: u8 = 0x04;

/// Read a block of the onboard EEPROM.
pub const CMD_EEPROM_READ: u8 = 0x06;

/// Put the unit into its low-power state.
pub const CMD_SHUTDOWN: u8 = 0x08;

/// EEPROM offset of the product identity block.
pub const EEPROM_ID_ADDRESS: u16 = 8;

/// Size of the product identity block.
pub const EEPROM_ID_SIZE: u8 = 12;

/// Bytes in an EEPROM read reply: command echo, return code, then data.
pub const EEPROM_REPLY_HEADER: usize = 2;

/// Bytes in an FPGA check reply.
pub const FPGA_CHECK_REPLY_LEN: usize = 2;

/// Bytes in the serial-IO status reply.
pub const SIO_REPLY_LEN: usize = 6;

// ---------------------------------------------------------------
// Builders
// ---------------------------------------------------------------

/// Payload for the CPUCS register: hold (`true`) or release the 8051.
pub fn cpu_reset(hold: bool) -> [u8; 1] {
    [hold as u8]
}

/// `[0x01]`: reset the FPGA.
pub fn fpga_reset() -> Vec<u8> {
    vec![CMD_FPGA_RESET]
}

/// `[0x02]`: check the FPGA configuration status.
pub fn fpga_check() -> Vec<u8> {
    vec![CMD_FPGA_CHECK]
}

/// `[0x04, value]`: write the port E register.
pub fn port_e(value: u8) -> Vec<u8> {
    vec![CMD_FX2_PORT_E, value]
}

/// Serial-IO command.
///
/// With a phase accumulator the buffer is `[0x03, ctl, acc0..acc3]`,
/// accumulator little-endian. Without one (wideband firmware) it is
/// `[0x03, ctl, 0, 0, 0]`.
pub fn sio(control: u8, accumulator: Option<u32>) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(6);
    buf.put_u8(CMD_FPGA_SIO);
    buf.put_u8(control);
    match accumulator {
        Some(acc) => buf.put_u32_le(acc),
        None => buf.put_slice(&[0, 0, 0]),
    }
    buf.to_vec()
}

/// `[0x06, addr_lo, addr_hi, size]`: read `size` bytes of EEPROM.
pub fn eeprom_read(address: u16, size: u8) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u8(CMD_EEPROM_READ);
    buf.put_u16_le(address);
    buf.put_u8(size);
    buf.to_vec()
}

/// `[0x08]`: shut the unit down.
pub fn shutdown() -> Vec<u8> {
    vec![CMD_SHUTDOWN]
}
