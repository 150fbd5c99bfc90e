//! Transport implementations for the Perseus driver.
//!
//! This crate provides [`RusbContext`], the libusb-backed implementation of
//! the [`UsbContext`](perseus_core::UsbContext) trait from `perseus-core`.
//! It is what the driver runs on when real hardware is attached; tests use
//! `MockUsb` from `perseus-test-harness` instead.

pub mod usb;

pub use usb::RusbContext;
