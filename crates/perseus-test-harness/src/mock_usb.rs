//! Mock USB stack for deterministic testing of the Perseus driver.
//!
//! [`MockUsb`] implements [`UsbContext`] over a scripted bus. Devices are
//! added with [`MockUsb::add_device`], which returns a [`MockDevice`] used
//! to script that device's behaviour and to inspect what the driver sent
//! to it.
//!
//! - Control and bulk-out writes succeed by default. Queue a
//!   [`WriteOutcome`] to make the next one short or failing.
//! - Bulk-in reads return queued data in order; an empty queue times out.
//! - Asynchronous transfers complete only when a completion is queued with
//!   [`MockDevice::queue_completion`], and only inside
//!   [`UsbContext::handle_events`], just like a real back-end.
//!
//! # Example
//!
//! ```
//! use perseus_core::{DeviceInfo, UsbAddress, UsbContext};
//! use perseus_test_harness::MockUsb;
//!
//! let usb = MockUsb::new();
//! let device = usb.add_device(DeviceInfo {
//!     vendor_id: 0x04B4,
//!     product_id: 0x325C,
//!     location: UsbAddress::new(1, 2),
//!     device_address: 5,
//!     interface_number: 0,
//! });
//! device.queue_bulk_in(0x81, &[0x02, 0x01]);
//!
//! let found = usb.list_devices(0x04B4, &[0x325C]).unwrap();
//! assert_eq!(found.len(), 1);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use perseus_core::error::{Error, Result};
use perseus_core::transport::{
    Completion, CompletionCallback, DeviceInfo, TransferAction, TransferId, TransferStatus,
    UsbContext, UsbHandle,
};

/// Upper bound on how long an idle `handle_events` call sleeps.
const IDLE_SLEEP: Duration = Duration::from_millis(2);

/// Scripted result for the next control or bulk-out write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Write everything.
    Ok,
    /// Report only this many bytes written.
    Short(usize),
    /// Fail with a transport error.
    Fail,
}

/// One operation the driver performed against a mock device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Opened,
    Closed,
    DetachKernelDriver(u8),
    AttachKernelDriver(u8),
    SetConfiguration(u8),
    ClaimInterface(u8),
    ReleaseInterface(u8),
    SetAlternateSetting(u8, u8),
    ClearHalt(u8),
    Control {
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: Vec<u8>,
    },
    BulkOut {
        endpoint: u8,
        data: Vec<u8>,
    },
    BulkIn {
        endpoint: u8,
        length: usize,
    },
    Submit {
        endpoint: u8,
        length: usize,
    },
    Cancel,
    Free,
}

#[derive(Debug, Default)]
struct DeviceState {
    plugged: bool,
    kernel_driver_active: bool,
    fail_open: bool,
    fail_claim: bool,
    fail_clear_halt: Vec<u8>,
    control_outcomes: VecDeque<WriteOutcome>,
    bulk_out_outcomes: VecDeque<WriteOutcome>,
    bulk_in: HashMap<u8, VecDeque<Vec<u8>>>,
    completions: VecDeque<(TransferStatus, Vec<u8>)>,
    events: Vec<MockEvent>,
}

struct PendingTransfer {
    id: TransferId,
    device: usize,
    length: usize,
    /// `None` while the callback is running or after the transfer was released.
    callback: Option<CompletionCallback>,
    active: bool,
    cancel_requested: bool,
}

#[derive(Default)]
struct Bus {
    devices: Vec<(DeviceInfo, DeviceState)>,
    pending: Vec<PendingTransfer>,
    next_transfer: u64,
    detach_unsupported: bool,
}

fn lock(bus: &Mutex<Bus>) -> MutexGuard<'_, Bus> {
    // A panicking test thread must not hide the rest of the log.
    match bus.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ---------------------------------------------------------------------------
// MockUsb
// ---------------------------------------------------------------------------

/// A scripted USB bus implementing [`UsbContext`].
///
/// Clones share the same bus, so a test can hand one clone to the driver
/// and keep another for scripting.
#[derive(Clone, Default)]
pub struct MockUsb {
    bus: Arc<Mutex<Bus>>,
}

impl MockUsb {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device and return its scripting handle.
    pub fn add_device(&self, info: DeviceInfo) -> MockDevice {
        let mut bus = lock(&self.bus);
        bus.devices.push((
            info,
            DeviceState {
                plugged: true,
                ..DeviceState::default()
            },
        ));
        MockDevice {
            bus: Arc::clone(&self.bus),
            index: bus.devices.len() - 1,
        }
    }

    /// Report the platform as unable to detach kernel drivers.
    pub fn set_detach_supported(&self, supported: bool) {
        lock(&self.bus).detach_unsupported = !supported;
    }

    /// Number of asynchronous transfers that have not been freed.
    pub fn allocated_transfers(&self) -> usize {
        lock(&self.bus).pending.len()
    }
}

impl UsbContext for MockUsb {
    fn list_devices(&self, vendor_id: u16, product_ids: &[u16]) -> Result<Vec<DeviceInfo>> {
        let bus = lock(&self.bus);
        Ok(bus
            .devices
            .iter()
            .filter(|(info, state)| {
                state.plugged
                    && info.vendor_id == vendor_id
                    && product_ids.contains(&info.product_id)
            })
            .map(|(info, _)| info.clone())
            .collect())
    }

    fn open(&self, device: &DeviceInfo) -> Result<Box<dyn UsbHandle>> {
        let mut bus = lock(&self.bus);
        let index = bus
            .devices
            .iter()
            .position(|(info, state)| info == device && state.plugged)
            .ok_or(Error::NoDevice)?;
        let state = &mut bus.devices[index].1;
        if state.fail_open {
            return Err(Error::Transport("scripted open failure".into()));
        }
        state.events.push(MockEvent::Opened);
        Ok(Box::new(MockHandle {
            bus: Arc::clone(&self.bus),
            index,
        }))
    }

    fn supports_detach_kernel_driver(&self) -> bool {
        !lock(&self.bus).detach_unsupported
    }

    fn handle_events(&self, timeout: Duration) -> Result<()> {
        // Pick up every transfer that has something to report.
        let mut ready = Vec::new();
        {
            let mut guard = lock(&self.bus);
            let bus = &mut *guard;
            for transfer in bus.pending.iter_mut() {
                if !transfer.active || transfer.callback.is_none() {
                    continue;
                }
                let state = &mut bus.devices[transfer.device].1;
                let outcome = if transfer.cancel_requested {
                    Some((TransferStatus::Cancelled, Vec::new()))
                } else if !state.plugged {
                    Some((TransferStatus::NoDevice, Vec::new()))
                } else {
                    state.completions.pop_front()
                };
                if let Some((status, mut data)) = outcome {
                    data.truncate(transfer.length);
                    if let Some(callback) = transfer.callback.take() {
                        ready.push((transfer.id, transfer.length, status, data, callback));
                    }
                }
            }
        }

        if ready.is_empty() {
            std::thread::sleep(timeout.min(IDLE_SLEEP));
            return Ok(());
        }

        // Callbacks run with the bus unlocked so they may call back in.
        for (id, length, status, data, mut callback) in ready {
            let action = callback(&Completion {
                status,
                data: &data,
                requested: length,
            });
            let mut bus = lock(&self.bus);
            if let Some(transfer) = bus.pending.iter_mut().find(|t| t.id == id) {
                match action {
                    TransferAction::Resubmit if status != TransferStatus::Cancelled => {
                        transfer.callback = Some(callback);
                    }
                    _ => transfer.active = false,
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockDevice
// ---------------------------------------------------------------------------

/// Scripting and inspection handle for one device on a [`MockUsb`] bus.
#[derive(Clone)]
pub struct MockDevice {
    bus: Arc<Mutex<Bus>>,
    index: usize,
}

impl MockDevice {
    fn with_state<R>(&self, f: impl FnOnce(&mut DeviceState) -> R) -> R {
        let mut bus = lock(&self.bus);
        f(&mut bus.devices[self.index].1)
    }

    /// The descriptor enumeration reports for this device.
    pub fn info(&self) -> DeviceInfo {
        lock(&self.bus).devices[self.index].0.clone()
    }

    /// Remove the device from the bus. Open handles start failing with
    /// [`Error::NoDevice`] and in-flight transfers complete with
    /// [`TransferStatus::NoDevice`].
    pub fn unplug(&self) {
        self.with_state(|s| s.plugged = false);
    }

    /// Report a kernel driver as bound to the device's interface.
    pub fn set_kernel_driver_active(&self, active: bool) {
        self.with_state(|s| s.kernel_driver_active = active);
    }

    /// Make `UsbContext::open` fail for this device.
    pub fn fail_open(&self) {
        self.with_state(|s| s.fail_open = true);
    }

    /// Make `claim_interface` fail.
    pub fn fail_claim(&self) {
        self.with_state(|s| s.fail_claim = true);
    }

    /// Make `clear_halt` fail on `endpoint`.
    pub fn fail_clear_halt(&self, endpoint: u8) {
        self.with_state(|s| s.fail_clear_halt.push(endpoint));
    }

    /// Script the outcome of the next control write.
    pub fn push_control_outcome(&self, outcome: WriteOutcome) {
        self.with_state(|s| s.control_outcomes.push_back(outcome));
    }

    /// Script the outcome of the next bulk-out write.
    pub fn push_bulk_out_outcome(&self, outcome: WriteOutcome) {
        self.with_state(|s| s.bulk_out_outcomes.push_back(outcome));
    }

    /// Queue data for the next synchronous bulk-in read on `endpoint`.
    pub fn queue_bulk_in(&self, endpoint: u8, data: &[u8]) {
        self.with_state(|s| {
            s.bulk_in
                .entry(endpoint)
                .or_default()
                .push_back(data.to_vec())
        });
    }

    /// Queue one completion for the device's asynchronous transfer.
    pub fn queue_completion(&self, status: TransferStatus, data: &[u8]) {
        self.with_state(|s| s.completions.push_back((status, data.to_vec())));
    }

    /// Number of scripted completions not yet delivered.
    pub fn pending_completions(&self) -> usize {
        self.with_state(|s| s.completions.len())
    }

    /// Everything the driver did to this device, in order.
    pub fn events(&self) -> Vec<MockEvent> {
        self.with_state(|s| s.events.clone())
    }

    /// Payloads of every bulk-out write to `endpoint`.
    pub fn bulk_out_log(&self, endpoint: u8) -> Vec<Vec<u8>> {
        self.with_state(|s| {
            s.events
                .iter()
                .filter_map(|e| match e {
                    MockEvent::BulkOut { endpoint: ep, data } if *ep == endpoint => {
                        Some(data.clone())
                    }
                    _ => None,
                })
                .collect()
        })
    }

    /// Every control write as `(value, data)`.
    pub fn control_log(&self) -> Vec<(u16, Vec<u8>)> {
        self.with_state(|s| {
            s.events
                .iter()
                .filter_map(|e| match e {
                    MockEvent::Control { value, data, .. } => Some((*value, data.clone())),
                    _ => None,
                })
                .collect()
        })
    }

    /// Forget everything logged so far.
    pub fn clear_events(&self) {
        self.with_state(|s| s.events.clear());
    }
}

// ---------------------------------------------------------------------------
// MockHandle
// ---------------------------------------------------------------------------

struct MockHandle {
    bus: Arc<Mutex<Bus>>,
    index: usize,
}

impl MockHandle {
    /// Run `f` on the device state, logging `event` first. Fails when the
    /// device has been unplugged.
    fn op<R>(&self, event: MockEvent, f: impl FnOnce(&mut DeviceState) -> Result<R>) -> Result<R> {
        let mut bus = lock(&self.bus);
        let state = &mut bus.devices[self.index].1;
        if !state.plugged {
            return Err(Error::NoDevice);
        }
        state.events.push(event);
        f(state)
    }
}

fn apply_outcome(outcome: Option<WriteOutcome>, len: usize) -> Result<usize> {
    match outcome.unwrap_or(WriteOutcome::Ok) {
        WriteOutcome::Ok => Ok(len),
        WriteOutcome::Short(n) => Ok(n.min(len)),
        WriteOutcome::Fail => Err(Error::Transport("scripted write failure".into())),
    }
}

impl UsbHandle for MockHandle {
    fn kernel_driver_active(&self, _interface: u8) -> Result<bool> {
        let bus = lock(&self.bus);
        Ok(bus.devices[self.index].1.kernel_driver_active)
    }

    fn detach_kernel_driver(&self, interface: u8) -> Result<()> {
        self.op(MockEvent::DetachKernelDriver(interface), |s| {
            s.kernel_driver_active = false;
            Ok(())
        })
    }

    fn attach_kernel_driver(&self, interface: u8) -> Result<()> {
        self.op(MockEvent::AttachKernelDriver(interface), |s| {
            s.kernel_driver_active = true;
            Ok(())
        })
    }

    fn set_active_configuration(&self, config: u8) -> Result<()> {
        self.op(MockEvent::SetConfiguration(config), |_| Ok(()))
    }

    fn claim_interface(&self, interface: u8) -> Result<()> {
        self.op(MockEvent::ClaimInterface(interface), |s| {
            if s.fail_claim {
                Err(Error::Transport("scripted claim failure".into()))
            } else {
                Ok(())
            }
        })
    }

    fn release_interface(&self, interface: u8) -> Result<()> {
        self.op(MockEvent::ReleaseInterface(interface), |_| Ok(()))
    }

    fn set_alternate_setting(&self, interface: u8, setting: u8) -> Result<()> {
        self.op(MockEvent::SetAlternateSetting(interface, setting), |_| Ok(()))
    }

    fn clear_halt(&self, endpoint: u8) -> Result<()> {
        self.op(MockEvent::ClearHalt(endpoint), |s| {
            if s.fail_clear_halt.contains(&endpoint) {
                Err(Error::Transport(format!("scripted halt failure on {endpoint:#04x}")))
            } else {
                Ok(())
            }
        })
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize> {
        let event = MockEvent::Control {
            request_type,
            request,
            value,
            index,
            data: data.to_vec(),
        };
        self.op(event, |s| apply_outcome(s.control_outcomes.pop_front(), data.len()))
    }

    fn write_bulk(&self, endpoint: u8, data: &[u8], _timeout: Duration) -> Result<usize> {
        let event = MockEvent::BulkOut {
            endpoint,
            data: data.to_vec(),
        };
        self.op(event, |s| apply_outcome(s.bulk_out_outcomes.pop_front(), data.len()))
    }

    fn read_bulk(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        _timeout: Option<Duration>,
    ) -> Result<usize> {
        let event = MockEvent::BulkIn {
            endpoint,
            length: buf.len(),
        };
        self.op(event, |s| {
            let data = s
                .bulk_in
                .get_mut(&endpoint)
                .and_then(|q| q.pop_front())
                .ok_or(Error::Timeout)?;
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            Ok(n)
        })
    }

    fn submit_bulk_in(
        &self,
        endpoint: u8,
        length: usize,
        _timeout: Option<Duration>,
        callback: CompletionCallback,
    ) -> Result<TransferId> {
        let mut bus = lock(&self.bus);
        let state = &mut bus.devices[self.index].1;
        if !state.plugged {
            return Err(Error::NoDevice);
        }
        state.events.push(MockEvent::Submit { endpoint, length });
        bus.next_transfer += 1;
        let id = TransferId(bus.next_transfer);
        bus.pending.push(PendingTransfer {
            id,
            device: self.index,
            length,
            callback: Some(callback),
            active: true,
            cancel_requested: false,
        });
        Ok(id)
    }

    fn cancel_transfer(&self, id: TransferId) -> Result<()> {
        let mut bus = lock(&self.bus);
        bus.devices[self.index].1.events.push(MockEvent::Cancel);
        match bus.pending.iter_mut().find(|t| t.id == id) {
            Some(transfer) => {
                transfer.cancel_requested = true;
                Ok(())
            }
            None => Err(Error::Transport(format!("unknown transfer {}", id.0))),
        }
    }

    fn free_transfer(&self, id: TransferId) -> Result<()> {
        let mut bus = lock(&self.bus);
        bus.devices[self.index].1.events.push(MockEvent::Free);
        let before = bus.pending.len();
        bus.pending.retain(|t| t.id != id);
        if bus.pending.len() == before {
            return Err(Error::Transport(format!("unknown transfer {}", id.0)));
        }
        Ok(())
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        let mut bus = lock(&self.bus);
        bus.devices[self.index].1.events.push(MockEvent::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perseus_core::UsbAddress;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn perseus(port: u8) -> DeviceInfo {
        DeviceInfo {
            vendor_id: 0x04B4,
            product_id: 0x325C,
            location: UsbAddress::new(1, port),
            device_address: port + 10,
            interface_number: 0,
        }
    }

    #[test]
    fn list_filters_by_vendor_product_and_plug_state() {
        let usb = MockUsb::new();
        let a = usb.add_device(perseus(1));
        usb.add_device(DeviceInfo {
            product_id: 0x1234,
            ..perseus(2)
        });
        assert_eq!(usb.list_devices(0x04B4, &[0x325C]).unwrap().len(), 1);
        a.unplug();
        assert!(usb.list_devices(0x04B4, &[0x325C]).unwrap().is_empty());
    }

    #[test]
    fn writes_are_logged_and_scripted() {
        let usb = MockUsb::new();
        let dev = usb.add_device(perseus(1));
        let handle = usb.open(&dev.info()).unwrap();

        dev.push_bulk_out_outcome(WriteOutcome::Short(1));
        assert_eq!(handle.write_bulk(0x01, &[0x04, 0x30], Duration::ZERO).unwrap(), 1);
        assert_eq!(handle.write_bulk(0x01, &[0x02], Duration::ZERO).unwrap(), 1);
        dev.push_control_outcome(WriteOutcome::Fail);
        assert!(handle
            .write_control(0x40, 0xA0, 0xE600, 0, &[1], Duration::ZERO)
            .is_err());

        assert_eq!(dev.bulk_out_log(0x01), vec![vec![0x04, 0x30], vec![0x02]]);
        assert_eq!(dev.control_log(), vec![(0xE600, vec![1])]);
    }

    #[test]
    fn read_bulk_returns_queued_then_times_out() {
        let usb = MockUsb::new();
        let dev = usb.add_device(perseus(1));
        let handle = usb.open(&dev.info()).unwrap();
        dev.queue_bulk_in(0x81, &[0x02, 0x01]);

        let mut buf = [0u8; 2];
        assert_eq!(handle.read_bulk(0x81, &mut buf, None).unwrap(), 2);
        assert_eq!(buf, [0x02, 0x01]);
        assert!(matches!(
            handle.read_bulk(0x81, &mut buf, None),
            Err(Error::Timeout)
        ));
    }

    #[test]
    fn async_transfer_resubmits_until_released() {
        let usb = MockUsb::new();
        let dev = usb.add_device(perseus(1));
        let handle = usb.open(&dev.info()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let id = handle
            .submit_bulk_in(
                0x82,
                4,
                None,
                Box::new(move |c| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    if c.is_full() {
                        TransferAction::Resubmit
                    } else {
                        TransferAction::Release
                    }
                }),
            )
            .unwrap();

        dev.queue_completion(TransferStatus::Completed, &[1, 2, 3, 4]);
        dev.queue_completion(TransferStatus::Stall, &[]);
        dev.queue_completion(TransferStatus::Completed, &[5, 6, 7, 8]);
        for _ in 0..4 {
            usb.handle_events(Duration::from_millis(1)).unwrap();
        }

        // The stall released the transfer, so the third completion is never taken.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(dev.pending_completions(), 1);
        handle.free_transfer(id).unwrap();
        assert_eq!(usb.allocated_transfers(), 0);
    }

    #[test]
    fn cancel_delivers_cancelled_status() {
        let usb = MockUsb::new();
        let dev = usb.add_device(perseus(1));
        let handle = usb.open(&dev.info()).unwrap();
        let status = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&status);
        let id = handle
            .submit_bulk_in(
                0x82,
                4,
                None,
                Box::new(move |c| {
                    *seen.lock().unwrap() = Some(c.status);
                    TransferAction::Resubmit
                }),
            )
            .unwrap();
        handle.cancel_transfer(id).unwrap();
        handle.cancel_transfer(id).unwrap();
        usb.handle_events(Duration::from_millis(1)).unwrap();
        assert_eq!(*status.lock().unwrap(), Some(TransferStatus::Cancelled));
    }

    #[test]
    fn unplugged_device_fails_operations() {
        let usb = MockUsb::new();
        let dev = usb.add_device(perseus(1));
        let handle = usb.open(&dev.info()).unwrap();
        dev.unplug();
        assert!(matches!(handle.clear_halt(0x01), Err(Error::NoDevice)));
        assert!(matches!(usb.open(&dev.info()), Err(Error::NoDevice)));
    }

    #[test]
    fn dropping_handle_logs_close() {
        let usb = MockUsb::new();
        let dev = usb.add_device(perseus(1));
        drop(usb.open(&dev.info()).unwrap());
        assert_eq!(dev.events(), vec![MockEvent::Opened, MockEvent::Closed]);
    }
}
