//! Discovery of attached units and the shared event pump.
//!
//! A [`Registry`] owns the USB context, the [`Unit`]s found on it and the
//! single event-pump thread that services asynchronous transfers for all of
//! them. It also remembers which firmware image was uploaded on which
//! bus/port so a re-enumeration after a USB reset can pick the units back up
//! without rebooting them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use perseus_core::error::{Error, Result};
use perseus_core::transport::{UsbAddress, UsbContext};
use thread_priority::{set_current_thread_priority, ThreadPriority};
use tracing::{debug, info, warn};

use crate::builder::RegistryBuilder;
use crate::commands::{PRODUCT_ID, PRODUCT_ID_BLANK_EEPROM, VENDOR_ID};
use crate::firmware::FirmwareImage;
use crate::unit::{Unit, UnitConfig};

/// Default cap on the number of units a registry manages.
pub const MAX_UNITS: usize = 8;

// ---------------------------------------------------------------------------
// FirmwareAssociations
// ---------------------------------------------------------------------------

/// Firmware uploaded per bus/port, shared between a registry and its units.
#[derive(Debug, Clone, Default)]
pub struct FirmwareAssociations {
    map: Arc<Mutex<HashMap<UsbAddress, Arc<FirmwareImage>>>>,
}

impl FirmwareAssociations {
    fn lock(&self) -> MutexGuard<'_, HashMap<UsbAddress, Arc<FirmwareImage>>> {
        match self.map.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn record(&self, location: UsbAddress, image: Arc<FirmwareImage>) {
        self.lock().insert(location, image);
    }

    pub fn get(&self, location: UsbAddress) -> Option<Arc<FirmwareImage>> {
        self.lock().get(&location).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// ---------------------------------------------------------------------------
// EventPump
// ---------------------------------------------------------------------------

/// Background thread calling [`UsbContext::handle_events`] until stopped.
///
/// Completion callbacks of every asynchronous transfer run on this thread.
pub(crate) struct EventPump {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EventPump {
    pub(crate) fn start(context: Arc<dyn UsbContext>, poll: Duration) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("perseus-event-pump".into())
            .spawn(move || {
                if let Err(e) = set_current_thread_priority(ThreadPriority::Max) {
                    debug!(error = ?e, "unable to raise event pump priority");
                }
                info!("event pump started");
                while !flag.load(Ordering::Acquire) {
                    if let Err(e) = context.handle_events(poll) {
                        warn!(error = %e, "event handling failed");
                        std::thread::sleep(poll.min(Duration::from_millis(10)));
                    }
                }
                info!("event pump terminating");
            })?;
        Ok(EventPump {
            stop,
            thread: Some(thread),
        })
    }

    /// Signal the thread and wait for it to exit.
    pub(crate) fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("event pump thread panicked");
            }
        }
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The attached Perseus units and the machinery shared between them.
///
/// ```no_run
/// use perseus::Registry;
/// use perseus_transport::RusbContext;
///
/// # fn main() -> perseus_core::Result<()> {
/// let mut registry = Registry::builder().build(RusbContext::new()?);
/// let found = registry.enumerate()?;
/// println!("{found} unit(s)");
/// registry.stop();
/// # Ok(())
/// # }
/// ```
pub struct Registry {
    context: Arc<dyn UsbContext>,
    unit_config: UnitConfig,
    max_units: usize,
    poll_interval: Duration,
    units: Vec<Unit>,
    associations: FirmwareAssociations,
    pump: Option<EventPump>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub(crate) fn new(
        context: Arc<dyn UsbContext>,
        unit_config: UnitConfig,
        max_units: usize,
        poll_interval: Duration,
    ) -> Self {
        Registry {
            context,
            unit_config,
            max_units,
            poll_interval,
            units: Vec::new(),
            associations: FirmwareAssociations::default(),
            pump: None,
        }
    }

    /// Scan the bus and replace the unit list with what is found.
    ///
    /// The event pump starts with the first successful discovery.
    pub fn enumerate(&mut self) -> Result<usize> {
        self.units.clear();

        let mut found = self
            .context
            .list_devices(VENDOR_ID, &[PRODUCT_ID, PRODUCT_ID_BLANK_EEPROM])?;
        if found.len() > self.max_units {
            warn!(
                found = found.len(),
                max = self.max_units,
                "maximum number of Perseus units reached, ignoring others"
            );
            found.truncate(self.max_units);
        }

        for info in found {
            let unit = Unit::new(
                Arc::clone(&self.context),
                info,
                self.unit_config.clone(),
                self.associations.clone(),
            );
            if unit.has_blank_eeprom() {
                warn!(location = %unit.location(), "unit reports a blank EEPROM");
            }
            debug!(location = %unit.location(), "unit discovered");
            self.units.push(unit);
        }

        if !self.units.is_empty() && self.pump.is_none() {
            self.pump = Some(EventPump::start(
                Arc::clone(&self.context),
                self.poll_interval,
            )?);
        }
        info!(count = self.units.len(), "enumeration complete");
        Ok(self.units.len())
    }

    /// Enumerate again and mark every unit whose bus/port had firmware
    /// uploaded as already booted. Returns how many units were picked up.
    pub fn reinitialize(&mut self) -> Result<usize> {
        self.enumerate()?;
        let mut restored = 0;
        for unit in &mut self.units {
            if let Some(image) = self.associations.get(unit.location()) {
                warn!(
                    location = %unit.location(),
                    firmware = %image.kind(),
                    "reminding firmware loaded"
                );
                unit.assume_firmware(image);
                restored += 1;
            }
        }
        Ok(restored)
    }

    /// Close every unit and stop the event pump.
    pub fn stop(&mut self) {
        info!("stopping Perseus registry");
        self.units.clear();
        if let Some(pump) = self.pump.take() {
            debug!("waiting for event pump to stop");
            pump.stop();
        }
    }

    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    pub fn units_mut(&mut self) -> &mut [Unit] {
        &mut self.units
    }

    pub fn unit(&self, index: usize) -> Option<&Unit> {
        self.units.get(index)
    }

    pub fn unit_mut(&mut self, index: usize) -> Option<&mut Unit> {
        self.units.get_mut(index)
    }

    /// The unit plugged into `location`, if any.
    pub fn unit_at(&mut self, location: UsbAddress) -> Result<&mut Unit> {
        self.units
            .iter_mut()
            .find(|u| u.location() == location)
            .ok_or(Error::NoDevice)
    }

    pub fn associations(&self) -> &FirmwareAssociations {
        &self.associations
    }

    /// The event pump thread is running.
    pub fn is_pumping(&self) -> bool {
        self.pump.is_some()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::FirmwareKind;
    use perseus_core::DeviceInfo;
    use perseus_test_harness::{MockEvent, MockUsb};

    fn perseus(port: u8, product_id: u16) -> DeviceInfo {
        DeviceInfo {
            vendor_id: VENDOR_ID,
            product_id,
            location: UsbAddress::new(2, port),
            device_address: port + 4,
            interface_number: 0,
        }
    }

    fn registry(usb: &MockUsb) -> Registry {
        Registry::builder()
            .poll_interval(Duration::from_millis(5))
            .build(usb.clone())
    }

    #[test]
    fn enumerate_filters_and_starts_pump() {
        let usb = MockUsb::new();
        usb.add_device(perseus(1, PRODUCT_ID));
        usb.add_device(perseus(2, PRODUCT_ID_BLANK_EEPROM));
        usb.add_device(DeviceInfo {
            vendor_id: 0x1234,
            ..perseus(3, PRODUCT_ID)
        });

        let mut reg = registry(&usb);
        assert!(!reg.is_pumping());
        assert_eq!(reg.enumerate().unwrap(), 2);
        assert!(reg.is_pumping());
        assert!(!reg.units()[0].has_blank_eeprom());
        assert!(reg.units()[1].has_blank_eeprom());
        reg.stop();
        assert!(!reg.is_pumping());
        assert!(reg.units().is_empty());
    }

    #[test]
    fn enumerate_without_units_leaves_pump_stopped() {
        let usb = MockUsb::new();
        let mut reg = registry(&usb);
        assert_eq!(reg.enumerate().unwrap(), 0);
        assert!(!reg.is_pumping());
    }

    #[test]
    fn enumerate_caps_unit_count() {
        let usb = MockUsb::new();
        for port in 1..=10 {
            usb.add_device(perseus(port, PRODUCT_ID));
        }
        let mut reg = Registry::builder()
            .max_units(3)
            .poll_interval(Duration::from_millis(5))
            .build(usb.clone());
        assert_eq!(reg.enumerate().unwrap(), 3);
    }

    #[test]
    fn reinitialize_restores_recorded_firmware() {
        let usb = MockUsb::new();
        let first = usb.add_device(perseus(1, PRODUCT_ID));
        let second = usb.add_device(perseus(2, PRODUCT_ID));
        let mut reg = registry(&usb);
        reg.enumerate().unwrap();

        let narrow = Arc::new(FirmwareImage::new(FirmwareKind::Narrowband, Vec::new()));
        let wide = Arc::new(FirmwareImage::new(FirmwareKind::Wideband, Vec::new()));
        for (port, image) in [(1, &narrow), (2, &wide)] {
            let unit = reg.unit_at(UsbAddress::new(2, port)).unwrap();
            unit.open().unwrap();
            unit.load_firmware(Arc::clone(image)).unwrap();
        }
        assert_eq!(reg.associations().len(), 2);

        // A third receiver shows up on a port nothing was uploaded to.
        let third = usb.add_device(perseus(3, PRODUCT_ID));
        first.clear_events();
        second.clear_events();
        assert_eq!(reg.reinitialize().unwrap(), 2);

        let find = |reg: &Registry, port: u8| {
            reg.units()
                .iter()
                .find(|u| u.location() == UsbAddress::new(2, port))
                .map(|u| (u.is_firmware_loaded(), u.firmware().cloned()))
        };
        assert_eq!(reg.units().len(), 3);
        let (loaded, image) = find(&reg, 1).unwrap();
        assert!(loaded);
        assert!(Arc::ptr_eq(&image.unwrap(), &narrow));
        let (loaded, image) = find(&reg, 2).unwrap();
        assert!(loaded);
        assert!(Arc::ptr_eq(&image.unwrap(), &wide));
        let (loaded, image) = find(&reg, 3).unwrap();
        assert!(!loaded);
        assert!(image.is_none());

        // Nothing was uploaded again, and the new unit was left alone.
        for dev in [&first, &second, &third] {
            assert!(!dev
                .events()
                .iter()
                .any(|e| matches!(e, MockEvent::Control { .. })));
        }
        assert!(third.events().is_empty());

        // With one recorded unit gone only the other is picked up.
        second.unplug();
        assert_eq!(reg.reinitialize().unwrap(), 1);
        assert_eq!(reg.units().len(), 2);
        assert!(find(&reg, 2).is_none());
        assert!(!find(&reg, 3).unwrap().0);
    }

    #[test]
    fn enumerate_closes_previous_units() {
        let usb = MockUsb::new();
        let dev = usb.add_device(perseus(1, PRODUCT_ID));
        let mut reg = registry(&usb);
        reg.enumerate().unwrap();
        reg.unit_mut(0).unwrap().open().unwrap();

        reg.enumerate().unwrap();
        assert!(dev.events().contains(&MockEvent::Closed));
        assert!(!reg.units()[0].is_open());
    }

    #[test]
    fn unit_at_unknown_location() {
        let usb = MockUsb::new();
        let mut reg = registry(&usb);
        assert!(matches!(
            reg.unit_at(UsbAddress::new(9, 9)),
            Err(Error::NoDevice)
        ));
    }

    #[test]
    fn associations_are_shared_between_clones() {
        let a = FirmwareAssociations::default();
        let b = a.clone();
        assert!(b.is_empty());
        a.record(
            UsbAddress::new(1, 1),
            Arc::new(FirmwareImage::new(FirmwareKind::Wideband, Vec::new())),
        );
        assert_eq!(b.len(), 1);
        assert_eq!(
            b.get(UsbAddress::new(1, 1)).map(|f| f.kind()),
            Some(FirmwareKind::Wideband)
        );
    }
}
