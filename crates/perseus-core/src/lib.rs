//! perseus-core: Core traits, types, and error definitions for the Perseus
//! driver.
//!
//! This crate defines the USB abstractions the driver is written against.
//! The `perseus` crate depends only on these types, so it can run on the
//! `rusb` back-end in `perseus-transport` or on the scripted mock in
//! `perseus-test-harness`.
//!
//! # Key types
//!
//! - [`UsbContext`] -- enumeration, device opening, event pump
//! - [`UsbHandle`] -- one open device: sync and async transfers
//! - [`UsbAddress`] -- bus/port key for firmware associations
//! - [`Error`] / [`Result`] -- error handling

pub mod error;
pub mod helpers;
pub mod transport;

// Re-export key types at crate root for ergonomic `use perseus_core::*`.
pub use error::{Error, Result};
pub use helpers::{format_freq_mhz, format_sample_rate, hex_bytes};
pub use transport::{
    Completion, CompletionCallback, DeviceInfo, TransferAction, TransferId, TransferStatus,
    UsbAddress, UsbContext, UsbHandle,
};
