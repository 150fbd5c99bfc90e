//! USB transport traits for Perseus communication.
//!
//! The [`UsbContext`] and [`UsbHandle`] traits abstract over the USB stack.
//! The driver in the `perseus` crate only ever talks to these traits, so the
//! same session, upload and streaming code runs against real hardware
//! (`perseus-transport`, backed by `rusb`) and against the scripted
//! `MockUsb` from `perseus-test-harness`.
//!
//! Synchronous transfers block the calling thread. Asynchronous bulk-in
//! transfers are submitted with a completion callback which is only ever
//! invoked from inside [`UsbContext::handle_events`], i.e. on the thread
//! running the event pump.

use std::fmt;
use std::time::Duration;

use crate::error::Result;

// ---------------------------------------------------------------------------
// Addressing and descriptors
// ---------------------------------------------------------------------------

/// Physical location of a unit: bus number and port number.
///
/// This is the key used to remember firmware associations across
/// re-enumeration, since device addresses change when the FX2 renumerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsbAddress {
    /// USB bus number.
    pub bus: u8,
    /// Port number on the bus.
    pub port: u8,
}

impl UsbAddress {
    /// Create an address from a bus and port number.
    pub fn new(bus: u8, port: u8) -> Self {
        UsbAddress { bus, port }
    }
}

impl fmt::Display for UsbAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BUS#{:03}-PORT#{:03}", self.bus, self.port)
    }
}

/// What enumeration knows about an attached device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// USB vendor ID.
    pub vendor_id: u16,
    /// USB product ID.
    pub product_id: u16,
    /// Bus and port the device is attached to.
    pub location: UsbAddress,
    /// Device address on the bus.
    pub device_address: u8,
    /// Interface number the driver claims.
    pub interface_number: u8,
}

// ---------------------------------------------------------------------------
// Asynchronous transfers
// ---------------------------------------------------------------------------

/// Final status of an asynchronous transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// The transfer finished. It may still be short.
    Completed,
    /// Generic transfer error.
    Error,
    /// The transfer's timeout elapsed.
    TimedOut,
    /// The transfer was cancelled.
    Cancelled,
    /// The endpoint halted.
    Stall,
    /// The device went away.
    NoDevice,
    /// The device sent more data than requested.
    Overflow,
    /// A status code the back-end could not classify.
    Unknown(i32),
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Completed => write!(f, "completed"),
            TransferStatus::Error => write!(f, "error"),
            TransferStatus::TimedOut => write!(f, "timed out"),
            TransferStatus::Cancelled => write!(f, "cancelled"),
            TransferStatus::Stall => write!(f, "stall"),
            TransferStatus::NoDevice => write!(f, "no device"),
            TransferStatus::Overflow => write!(f, "overflow"),
            TransferStatus::Unknown(code) => write!(f, "unknown ({code})"),
        }
    }
}

/// Opaque handle for a submitted asynchronous transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(pub u64);

/// A finished asynchronous transfer, as seen by its completion callback.
#[derive(Debug)]
pub struct Completion<'a> {
    /// How the transfer ended.
    pub status: TransferStatus,
    /// The bytes actually received.
    pub data: &'a [u8],
    /// The number of bytes that were requested.
    pub requested: usize,
}

impl Completion<'_> {
    /// True when the transfer completed and filled the whole buffer.
    pub fn is_full(&self) -> bool {
        self.status == TransferStatus::Completed && self.data.len() == self.requested
    }
}

/// What the transport should do with a transfer after its callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferAction {
    /// Submit the same transfer again.
    Resubmit,
    /// Leave the transfer idle until it is freed.
    Release,
}

/// Completion callback for an asynchronous transfer.
///
/// Runs on the event-pump thread and must not block.
pub type CompletionCallback = Box<dyn FnMut(&Completion<'_>) -> TransferAction + Send>;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A USB stack session: enumeration, device opening and event handling.
pub trait UsbContext: Send + Sync {
    /// List attached devices with `vendor_id` and any of `product_ids`.
    fn list_devices(&self, vendor_id: u16, product_ids: &[u16]) -> Result<Vec<DeviceInfo>>;

    /// Open a device previously returned by [`list_devices`](Self::list_devices).
    fn open(&self, device: &DeviceInfo) -> Result<Box<dyn UsbHandle>>;

    /// Whether the platform supports detaching kernel drivers.
    fn supports_detach_kernel_driver(&self) -> bool;

    /// Service pending asynchronous transfers for at most `timeout`.
    ///
    /// Completion callbacks run inside this call.
    fn handle_events(&self, timeout: Duration) -> Result<()>;
}

/// An open device.
///
/// All methods take `&self`; implementations synchronize internally so the
/// owning session and the event pump can share the device.
pub trait UsbHandle: Send + Sync {
    /// Whether a kernel driver is bound to `interface`.
    fn kernel_driver_active(&self, interface: u8) -> Result<bool>;

    /// Detach the kernel driver bound to `interface`.
    fn detach_kernel_driver(&self, interface: u8) -> Result<()>;

    /// Reattach the kernel driver to `interface`.
    fn attach_kernel_driver(&self, interface: u8) -> Result<()>;

    /// Select the active configuration.
    fn set_active_configuration(&self, config: u8) -> Result<()>;

    /// Claim `interface` for exclusive use.
    fn claim_interface(&self, interface: u8) -> Result<()>;

    /// Release a claimed interface.
    fn release_interface(&self, interface: u8) -> Result<()>;

    /// Select an alternate setting on `interface`.
    fn set_alternate_setting(&self, interface: u8, setting: u8) -> Result<()>;

    /// Clear a halt condition on `endpoint`.
    fn clear_halt(&self, endpoint: u8) -> Result<()>;

    /// Synchronous control-out transfer. Returns the number of bytes written.
    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize>;

    /// Synchronous bulk-out transfer. Returns the number of bytes written.
    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize>;

    /// Synchronous bulk-in transfer. `None` waits without bound.
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Option<Duration>)
        -> Result<usize>;

    /// Submit an asynchronous bulk-in transfer of `length` bytes.
    ///
    /// `None` as timeout waits without bound. `callback` runs on the event
    /// pump each time the transfer completes; its return value decides
    /// whether the transfer is resubmitted.
    fn submit_bulk_in(
        &self,
        endpoint: u8,
        length: usize,
        timeout: Option<Duration>,
        callback: CompletionCallback,
    ) -> Result<TransferId>;

    /// Request cancellation. The callback later sees
    /// [`TransferStatus::Cancelled`]. Cancelling twice is harmless.
    fn cancel_transfer(&self, id: TransferId) -> Result<()>;

    /// Release a transfer that is no longer in flight.
    fn free_transfer(&self, id: TransferId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usb_address_display() {
        assert_eq!(UsbAddress::new(1, 2).to_string(), "BUS#001-PORT#002");
        assert_eq!(UsbAddress::new(12, 104).to_string(), "BUS#012-PORT#104");
    }

    #[test]
    fn completion_full_only_when_completed_and_complete() {
        let data = [0u8; 16];
        let full = Completion {
            status: TransferStatus::Completed,
            data: &data,
            requested: 16,
        };
        assert!(full.is_full());

        let short = Completion {
            status: TransferStatus::Completed,
            data: &data[..8],
            requested: 16,
        };
        assert!(!short.is_full());

        let stalled = Completion {
            status: TransferStatus::Stall,
            data: &data,
            requested: 16,
        };
        assert!(!stalled.is_full());
    }

    #[test]
    fn transfer_status_display() {
        assert_eq!(TransferStatus::TimedOut.to_string(), "timed out");
        assert_eq!(TransferStatus::Unknown(-99).to_string(), "unknown (-99)");
    }

    #[test]
    fn traits_are_object_safe() {
        fn _takes_context(_: &dyn UsbContext) {}
        fn _takes_handle(_: &dyn UsbHandle) {}
    }
}
