//! libusb transport for Perseus receivers.
//!
//! [`RusbContext`] implements [`UsbContext`] on top of a [`rusb::Context`].
//! Synchronous transfers map one-to-one onto `rusb` calls. Asynchronous
//! bulk-in transfers are kept in a pending list shared by the context and
//! every handle it opened; [`UsbContext::handle_events`] services that list
//! with bounded bulk reads and runs the completion callbacks.
//!
//! Bulk reads are issued one endpoint packet at a time into a buffer that
//! persists across [`UsbContext::handle_events`] calls. A read that times
//! out never carried data, so a slowly filling buffer keeps everything it
//! has received and the transfer stays pending. A transfer submitted with a
//! timeout completes as [`TransferStatus::TimedOut`] once that much time
//! has passed without filling.
//!
//! # Example
//!
//! ```no_run
//! use perseus_core::UsbContext;
//! use perseus_transport::RusbContext;
//!
//! # fn example() -> perseus_core::Result<()> {
//! let usb = RusbContext::new()?;
//! for device in usb.list_devices(0x04B4, &[0x325C, 0x8613])? {
//!     println!("{} {:04x}:{:04x}", device.location, device.vendor_id, device.product_id);
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use perseus_core::error::{Error, Result};
use perseus_core::transport::{
    Completion, CompletionCallback, DeviceInfo, TransferAction, TransferId, TransferStatus,
    UsbAddress, UsbContext, UsbHandle,
};
use rusb::UsbContext as _;
use tracing::{debug, trace, warn};

/// Longest time one transfer is serviced per `handle_events` call.
const READ_SLICE: Duration = Duration::from_millis(100);

/// libusb reads a zero timeout as unlimited, so shorter waits are not issued.
const MIN_READ: Duration = Duration::from_millis(1);

/// Sleep used by `handle_events` when nothing is pending.
const IDLE_SLEEP: Duration = Duration::from_millis(50);

/// High-speed bulk packet size, used when the endpoint descriptor is
/// unavailable.
const DEFAULT_PACKET_SIZE: usize = 512;

type SharedHandle = Arc<RwLock<rusb::DeviceHandle<rusb::Context>>>;

fn map_error(e: rusb::Error) -> Error {
    match e {
        rusb::Error::Timeout => Error::Timeout,
        rusb::Error::NoDevice => Error::NoDevice,
        other => Error::Transport(other.to_string()),
    }
}

fn transfer_status(e: rusb::Error) -> TransferStatus {
    match e {
        rusb::Error::Timeout => TransferStatus::TimedOut,
        rusb::Error::Pipe => TransferStatus::Stall,
        rusb::Error::NoDevice => TransferStatus::NoDevice,
        rusb::Error::Overflow => TransferStatus::Overflow,
        rusb::Error::Interrupted => TransferStatus::Cancelled,
        _ => TransferStatus::Error,
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::Transport("device lock poisoned".into())
}

fn max_packet_size(handle: &rusb::DeviceHandle<rusb::Context>, endpoint: u8) -> Option<usize> {
    let config = handle.device().active_config_descriptor().ok()?;
    for interface in config.interfaces() {
        for setting in interface.descriptors() {
            for ep in setting.endpoint_descriptors() {
                if ep.address() == endpoint {
                    return Some(usize::from(ep.max_packet_size() & 0x07FF));
                }
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Buffer filling
// ---------------------------------------------------------------------------

/// Result of servicing a transfer for one slice.
#[derive(Debug, PartialEq)]
enum Fill {
    /// Buffer full, or a short packet ended the transfer.
    Done,
    /// Waiting for more data. Everything received so far is kept.
    Pending,
    Failed(rusb::Error),
}

/// Read at most one packet per call into `buffer` after `*received` until
/// the buffer is full, a short packet arrives or `slice` runs out.
fn fill(
    buffer: &mut [u8],
    received: &mut usize,
    packet: usize,
    slice: Duration,
    mut read: impl FnMut(&mut [u8], Duration) -> rusb::Result<usize>,
) -> Fill {
    let packet = packet.max(1);
    let started = Instant::now();
    while *received < buffer.len() {
        let left = slice.saturating_sub(started.elapsed());
        if left < MIN_READ {
            return Fill::Pending;
        }
        let end = (*received + packet).min(buffer.len());
        let wanted = end - *received;
        match read(&mut buffer[*received..end], left) {
            Ok(n) => {
                *received += n.min(wanted);
                if n < wanted {
                    return Fill::Done;
                }
            }
            Err(rusb::Error::Timeout) => return Fill::Pending,
            Err(e) => return Fill::Failed(e),
        }
    }
    Fill::Done
}

// ---------------------------------------------------------------------------
// Pending transfers
// ---------------------------------------------------------------------------

/// Progress of one submitted transfer.
struct Slot {
    buffer: Vec<u8>,
    received: usize,
    submitted: Instant,
    /// Taken while the transfer is being serviced, dropped on release.
    callback: Option<CompletionCallback>,
    active: bool,
    cancel_requested: bool,
}

impl Slot {
    fn new(length: usize, callback: CompletionCallback) -> Self {
        Slot {
            buffer: vec![0u8; length],
            received: 0,
            submitted: Instant::now(),
            callback: Some(callback),
            active: true,
            cancel_requested: false,
        }
    }

    /// Return a serviced transfer. `outcome` is `None` when the callback did
    /// not run, otherwise the status it saw and what it asked for.
    ///
    /// A resubmit keeps the transfer live even if a cancel arrived while the
    /// callback ran; the next pass then reports it as cancelled.
    fn settle(
        &mut self,
        callback: CompletionCallback,
        buffer: Vec<u8>,
        received: usize,
        outcome: Option<(TransferStatus, TransferAction)>,
    ) {
        self.buffer = buffer;
        match outcome {
            None => {
                self.received = received;
                self.callback = Some(callback);
            }
            Some((status, TransferAction::Resubmit)) if status != TransferStatus::Cancelled => {
                self.received = 0;
                self.submitted = Instant::now();
                self.callback = Some(callback);
            }
            Some(_) => self.active = false,
        }
    }
}

struct PendingTransfer {
    id: TransferId,
    handle: SharedHandle,
    endpoint: u8,
    packet_size: usize,
    timeout: Option<Duration>,
    slot: Slot,
}

#[derive(Default)]
struct Transfers {
    pending: Mutex<Vec<PendingTransfer>>,
    next_id: AtomicU64,
}

impl Transfers {
    fn lock(&self) -> Result<MutexGuard<'_, Vec<PendingTransfer>>> {
        self.pending.lock().map_err(poisoned)
    }
}

struct Work {
    id: TransferId,
    handle: SharedHandle,
    endpoint: u8,
    packet_size: usize,
    buffer: Vec<u8>,
    received: usize,
    expired: bool,
    cancelled: bool,
    callback: CompletionCallback,
}

// ---------------------------------------------------------------------------
// RusbContext
// ---------------------------------------------------------------------------

/// A libusb session implementing [`UsbContext`].
pub struct RusbContext {
    context: rusb::Context,
    transfers: Arc<Transfers>,
}

impl RusbContext {
    /// Initialise a new libusb session.
    pub fn new() -> Result<Self> {
        let context = rusb::Context::new().map_err(map_error)?;
        Ok(RusbContext {
            context,
            transfers: Arc::new(Transfers::default()),
        })
    }

    fn find(&self, info: &DeviceInfo) -> Result<rusb::Device<rusb::Context>> {
        let devices = self.context.devices().map_err(map_error)?;
        for device in devices.iter() {
            if device.bus_number() == info.location.bus
                && device.address() == info.device_address
            {
                return Ok(device);
            }
        }
        Err(Error::NoDevice)
    }

    /// Take every active transfer that has no callback in flight.
    fn collect_work(&self) -> Result<Vec<Work>> {
        let mut pending = self.transfers.lock()?;
        let now = Instant::now();
        let mut work = Vec::new();
        for transfer in pending.iter_mut().filter(|t| t.slot.active) {
            let slot = &mut transfer.slot;
            if let Some(callback) = slot.callback.take() {
                let expired = transfer
                    .timeout
                    .is_some_and(|limit| now.duration_since(slot.submitted) >= limit);
                work.push(Work {
                    id: transfer.id,
                    handle: Arc::clone(&transfer.handle),
                    endpoint: transfer.endpoint,
                    packet_size: transfer.packet_size,
                    buffer: std::mem::take(&mut slot.buffer),
                    received: slot.received,
                    expired,
                    cancelled: slot.cancel_requested,
                    callback,
                });
            }
        }
        Ok(work)
    }

    fn finish(&self, item: Work, outcome: Option<(TransferStatus, TransferAction)>) -> Result<()> {
        let mut pending = self.transfers.lock()?;
        if let Some(transfer) = pending.iter_mut().find(|t| t.id == item.id) {
            transfer
                .slot
                .settle(item.callback, item.buffer, item.received, outcome);
        }
        Ok(())
    }
}

impl UsbContext for RusbContext {
    fn list_devices(&self, vendor_id: u16, product_ids: &[u16]) -> Result<Vec<DeviceInfo>> {
        let devices = self.context.devices().map_err(map_error)?;
        let mut found = Vec::new();
        for device in devices.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(d) => d,
                Err(e) => {
                    debug!(error = %e, "skipping device without descriptor");
                    continue;
                }
            };
            if descriptor.vendor_id() != vendor_id
                || !product_ids.contains(&descriptor.product_id())
            {
                continue;
            }
            found.push(DeviceInfo {
                vendor_id: descriptor.vendor_id(),
                product_id: descriptor.product_id(),
                location: UsbAddress::new(device.bus_number(), device.port_number()),
                device_address: device.address(),
                interface_number: 0,
            });
        }
        Ok(found)
    }

    fn open(&self, info: &DeviceInfo) -> Result<Box<dyn UsbHandle>> {
        let device = self.find(info)?;
        let handle = device.open().map_err(map_error)?;
        debug!(location = %info.location, "opened usb device");
        Ok(Box::new(RusbHandle {
            handle: Arc::new(RwLock::new(handle)),
            transfers: Arc::clone(&self.transfers),
        }))
    }

    fn supports_detach_kernel_driver(&self) -> bool {
        rusb::supports_detach_kernel_driver()
    }

    fn handle_events(&self, timeout: Duration) -> Result<()> {
        let work = self.collect_work()?;
        if work.is_empty() {
            std::thread::sleep(timeout.min(IDLE_SLEEP));
            return Ok(());
        }

        let slice = timeout.min(READ_SLICE).max(MIN_READ);
        for mut item in work {
            let status = if item.cancelled {
                Some(TransferStatus::Cancelled)
            } else {
                let endpoint = item.endpoint;
                let result = {
                    let handle = item.handle.read().map_err(poisoned)?;
                    fill(
                        &mut item.buffer,
                        &mut item.received,
                        item.packet_size,
                        slice,
                        |chunk, wait| handle.read_bulk(endpoint, chunk, wait),
                    )
                };
                match result {
                    Fill::Done => Some(TransferStatus::Completed),
                    Fill::Pending if item.expired => Some(TransferStatus::TimedOut),
                    Fill::Pending => None,
                    Fill::Failed(e) => Some(transfer_status(e)),
                }
            };

            let Some(status) = status else {
                trace!(
                    endpoint = item.endpoint,
                    received = item.received,
                    "bulk read slice elapsed"
                );
                self.finish(item, None)?;
                continue;
            };
            if status != TransferStatus::Completed {
                debug!(endpoint = item.endpoint, %status, "async transfer ended");
            }
            let action = (item.callback)(&Completion {
                status,
                data: &item.buffer[..item.received],
                requested: item.buffer.len(),
            });
            self.finish(item, Some((status, action)))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RusbHandle
// ---------------------------------------------------------------------------

/// An open device. The `rusb` handle sits behind a lock because interface
/// and endpoint management need exclusive access while transfers only read.
struct RusbHandle {
    handle: SharedHandle,
    transfers: Arc<Transfers>,
}

impl RusbHandle {
    fn shared(&self) -> Result<RwLockReadGuard<'_, rusb::DeviceHandle<rusb::Context>>> {
        self.handle.read().map_err(poisoned)
    }

    fn exclusive(&self) -> Result<RwLockWriteGuard<'_, rusb::DeviceHandle<rusb::Context>>> {
        self.handle.write().map_err(poisoned)
    }
}

impl UsbHandle for RusbHandle {
    fn kernel_driver_active(&self, interface: u8) -> Result<bool> {
        self.shared()?
            .kernel_driver_active(interface)
            .map_err(map_error)
    }

    fn detach_kernel_driver(&self, interface: u8) -> Result<()> {
        self.exclusive()?
            .detach_kernel_driver(interface)
            .map_err(map_error)
    }

    fn attach_kernel_driver(&self, interface: u8) -> Result<()> {
        self.exclusive()?
            .attach_kernel_driver(interface)
            .map_err(map_error)
    }

    fn set_active_configuration(&self, config: u8) -> Result<()> {
        self.exclusive()?
            .set_active_configuration(config)
            .map_err(map_error)
    }

    fn claim_interface(&self, interface: u8) -> Result<()> {
        self.exclusive()?.claim_interface(interface).map_err(map_error)
    }

    fn release_interface(&self, interface: u8) -> Result<()> {
        self.exclusive()?
            .release_interface(interface)
            .map_err(map_error)
    }

    fn set_alternate_setting(&self, interface: u8, setting: u8) -> Result<()> {
        self.exclusive()?
            .set_alternate_setting(interface, setting)
            .map_err(map_error)
    }

    fn clear_halt(&self, endpoint: u8) -> Result<()> {
        self.exclusive()?.clear_halt(endpoint).map_err(map_error)
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.shared()?
            .write_control(request_type, request, value, index, data, timeout)
            .map_err(map_error)
    }

    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize> {
        self.shared()?
            .write_bulk(endpoint, data, timeout)
            .map_err(map_error)
    }

    fn read_bulk(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        // libusb treats a zero timeout as unlimited.
        self.shared()?
            .read_bulk(endpoint, buf, timeout.unwrap_or(Duration::ZERO))
            .map_err(map_error)
    }

    fn submit_bulk_in(
        &self,
        endpoint: u8,
        length: usize,
        timeout: Option<Duration>,
        callback: CompletionCallback,
    ) -> Result<TransferId> {
        let packet_size = max_packet_size(&*self.shared()?, endpoint).unwrap_or_else(|| {
            debug!(endpoint, "no endpoint descriptor, assuming 512-byte packets");
            DEFAULT_PACKET_SIZE
        });
        let id = TransferId(self.transfers.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.transfers.lock()?.push(PendingTransfer {
            id,
            handle: Arc::clone(&self.handle),
            endpoint,
            packet_size,
            timeout,
            slot: Slot::new(length, callback),
        });
        debug!(endpoint, length, packet_size, id = id.0, "submitted bulk-in transfer");
        Ok(id)
    }

    fn cancel_transfer(&self, id: TransferId) -> Result<()> {
        let mut pending = self.transfers.lock()?;
        match pending.iter_mut().find(|t| t.id == id) {
            Some(transfer) => {
                transfer.slot.cancel_requested = true;
                Ok(())
            }
            None => Err(Error::Transport(format!("unknown transfer {}", id.0))),
        }
    }

    fn free_transfer(&self, id: TransferId) -> Result<()> {
        let mut pending = self.transfers.lock()?;
        if let Some(transfer) = pending.iter().find(|t| t.id == id) {
            if transfer.slot.active {
                warn!(id = id.0, "freeing a transfer that is still active");
            }
        }
        let before = pending.len();
        pending.retain(|t| t.id != id);
        if pending.len() == before {
            return Err(Error::Transport(format!("unknown transfer {}", id.0)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_mapping() {
        assert!(matches!(map_error(rusb::Error::Timeout), Error::Timeout));
        assert!(matches!(map_error(rusb::Error::NoDevice), Error::NoDevice));
        assert!(matches!(map_error(rusb::Error::Busy), Error::Transport(_)));
    }

    #[test]
    fn transfer_status_mapping() {
        assert_eq!(transfer_status(rusb::Error::Timeout), TransferStatus::TimedOut);
        assert_eq!(transfer_status(rusb::Error::Pipe), TransferStatus::Stall);
        assert_eq!(transfer_status(rusb::Error::NoDevice), TransferStatus::NoDevice);
        assert_eq!(transfer_status(rusb::Error::Overflow), TransferStatus::Overflow);
        assert_eq!(transfer_status(rusb::Error::Io), TransferStatus::Error);
    }

    /// Replays scripted read results, filling each chunk with a running
    /// byte counter.
    fn scripted(
        results: Vec<rusb::Result<usize>>,
    ) -> impl FnMut(&mut [u8], Duration) -> rusb::Result<usize> {
        let mut results = results.into_iter();
        let mut next = 0u8;
        move |chunk: &mut [u8], _wait: Duration| {
            let result = results.next().unwrap_or(Err(rusb::Error::Timeout));
            if let Ok(n) = result {
                for byte in &mut chunk[..n] {
                    *byte = next;
                    next = next.wrapping_add(1);
                }
            }
            result
        }
    }

    fn noop_callback() -> CompletionCallback {
        Box::new(|_: &Completion<'_>| TransferAction::Resubmit)
    }

    #[test]
    fn partial_fill_survives_timeouts() {
        let mut buffer = vec![0u8; 64];
        let mut received = 0;
        let slice = Duration::from_millis(100);

        let first = fill(&mut buffer, &mut received, 16, slice, scripted(vec![Ok(16), Err(rusb::Error::Timeout)]));
        assert_eq!(first, Fill::Pending);
        assert_eq!(received, 16);

        let second = fill(&mut buffer, &mut received, 16, slice, scripted(vec![Err(rusb::Error::Timeout)]));
        assert_eq!(second, Fill::Pending);
        assert_eq!(received, 16);

        let third = fill(&mut buffer[..], &mut received, 16, slice, {
            let mut next = 16u8;
            move |chunk: &mut [u8], _wait: Duration| {
                for byte in chunk.iter_mut() {
                    *byte = next;
                    next += 1;
                }
                Ok(chunk.len())
            }
        });
        assert_eq!(third, Fill::Done);
        assert_eq!(received, 64);
        let expected: Vec<u8> = (0..64).collect();
        assert_eq!(buffer, expected);
    }

    #[test]
    fn reads_never_exceed_one_packet() {
        let mut buffer = vec![0u8; 40];
        let mut received = 0;
        let mut sizes = Vec::new();
        let result = fill(&mut buffer, &mut received, 16, Duration::from_millis(100), |chunk: &mut [u8], _: Duration| {
            sizes.push(chunk.len());
            Ok(chunk.len())
        });
        assert_eq!(result, Fill::Done);
        assert_eq!(sizes, vec![16, 16, 8]);
    }

    #[test]
    fn short_packet_ends_transfer() {
        let mut buffer = vec![0u8; 64];
        let mut received = 0;
        let result = fill(&mut buffer, &mut received, 16, Duration::from_millis(100), scripted(vec![Ok(16), Ok(5)]));
        assert_eq!(result, Fill::Done);
        assert_eq!(received, 21);
    }

    #[test]
    fn read_error_fails_transfer() {
        let mut buffer = vec![0u8; 64];
        let mut received = 0;
        let result = fill(&mut buffer, &mut received, 16, Duration::from_millis(100), scripted(vec![Ok(16), Err(rusb::Error::Pipe)]));
        assert_eq!(result, Fill::Failed(rusb::Error::Pipe));
        assert_eq!(received, 16);
    }

    #[test]
    fn pending_settle_keeps_partial_data() {
        let mut slot = Slot::new(32, noop_callback());
        let callback = slot.callback.take().unwrap();
        let buffer = std::mem::take(&mut slot.buffer);
        slot.settle(callback, buffer, 12, None);
        assert!(slot.active);
        assert!(slot.callback.is_some());
        assert_eq!(slot.received, 12);
        assert_eq!(slot.buffer.len(), 32);
    }

    #[test]
    fn cancel_during_callback_is_reported_next_pass() {
        let mut slot = Slot::new(32, noop_callback());

        // The callback ran on a full buffer and asked to resubmit, but a
        // cancel landed meanwhile.
        let callback = slot.callback.take().unwrap();
        let buffer = std::mem::take(&mut slot.buffer);
        slot.cancel_requested = true;
        slot.settle(
            callback,
            buffer,
            32,
            Some((TransferStatus::Completed, TransferAction::Resubmit)),
        );
        assert!(slot.active);
        assert!(slot.callback.is_some());
        assert_eq!(slot.received, 0);

        // The cancelled completion ends it, whatever the callback returns.
        let callback = slot.callback.take().unwrap();
        let buffer = std::mem::take(&mut slot.buffer);
        slot.settle(
            callback,
            buffer,
            0,
            Some((TransferStatus::Cancelled, TransferAction::Resubmit)),
        );
        assert!(!slot.active);
        assert!(slot.callback.is_none());
    }

    #[test]
    fn release_deactivates() {
        let mut slot = Slot::new(8, noop_callback());
        let callback = slot.callback.take().unwrap();
        let buffer = std::mem::take(&mut slot.buffer);
        slot.settle(
            callback,
            buffer,
            0,
            Some((TransferStatus::Stall, TransferAction::Release)),
        );
        assert!(!slot.active);
    }
}
