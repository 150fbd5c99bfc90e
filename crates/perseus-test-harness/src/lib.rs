//! perseus-test-harness: Test utilities for the Perseus driver.
//!
//! This crate provides [`MockUsb`], a scripted [`UsbContext`] for
//! deterministic testing of the session, upload and streaming code without
//! a receiver attached.
//!
//! [`UsbContext`]: perseus_core::UsbContext

pub mod mock_usb;

pub use mock_usb::{MockDevice, MockEvent, MockUsb, WriteOutcome};
