//! RegistryBuilder -- fluent builder for constructing [`Registry`] instances.
//!
//! Separates configuration from construction so that callers can set
//! timeouts, the event-pump cadence and the resource directory before the
//! USB context is handed over.
//!
//! # Example
//!
//! ```no_run
//! use perseus::builder::RegistryBuilder;
//! use perseus_transport::RusbContext;
//! use std::time::Duration;
//!
//! # fn main() -> perseus_core::Result<()> {
//! let mut registry = RegistryBuilder::new()
//!     .command_timeout(Duration::from_millis(500))
//!     .max_units(2)
//!     .build(RusbContext::new()?);
//! registry.enumerate()?;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use perseus_core::transport::UsbContext;

use crate::frontend::ADC_CLOCK_HZ;
use crate::registry::{Registry, MAX_UNITS};
use crate::resources::Resources;
use crate::unit::UnitConfig;

/// Fluent builder for [`Registry`].
#[derive(Debug, Clone)]
pub struct RegistryBuilder {
    command_timeout: Duration,
    poll_interval: Duration,
    stop_poll_interval: Duration,
    stop_timeout: Duration,
    max_units: usize,
    resource_dir: PathBuf,
    adc_clock_hz: f64,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    pub fn new() -> Self {
        RegistryBuilder {
            command_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            stop_poll_interval: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(5),
            max_units: MAX_UNITS,
            resource_dir: PathBuf::from("."),
            adc_clock_hz: ADC_CLOCK_HZ,
        }
    }

    /// Timeout for control, bitstream and command transfers (default: 1 s).
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// How long each event-pump iteration waits for USB events
    /// (default: 1 s). Also bounds how long stopping the pump takes.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Polling period while waiting for a cancelled stream to complete
    /// (default: 100 ms).
    pub fn stop_poll_interval(mut self, interval: Duration) -> Self {
        self.stop_poll_interval = interval;
        self
    }

    /// Give up waiting for a cancelled stream after this long (default: 5 s).
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Maximum number of units to manage (default: 8).
    pub fn max_units(mut self, n: usize) -> Self {
        self.max_units = n;
        self
    }

    /// Directory holding the firmware `.hex` and bitstream `.sbs` files.
    pub fn resource_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.resource_dir = dir.as_ref().to_path_buf();
        self
    }

    /// ADC sample clock in Hz (default: 80 MHz).
    pub fn adc_clock_hz(mut self, hz: f64) -> Self {
        self.adc_clock_hz = hz;
        self
    }

    /// Settings every unit of the registry is created with.
    pub fn unit_config(&self) -> UnitConfig {
        UnitConfig {
            command_timeout: self.command_timeout,
            stop_poll_interval: self.stop_poll_interval,
            stop_timeout: self.stop_timeout,
            adc_clock_hz: self.adc_clock_hz,
        }
    }

    /// Resource lookup for the configured directory.
    pub fn resources(&self) -> Resources {
        Resources::new(&self.resource_dir)
    }

    /// Build a [`Registry`] on `context`.
    ///
    /// Pass a `MockUsb` from `perseus-test-harness` for testing, or a
    /// `RusbContext` from `perseus-transport` for hardware.
    pub fn build<C: UsbContext + 'static>(self, context: C) -> Registry {
        self.build_shared(Arc::new(context))
    }

    /// Build on a context the caller keeps a reference to.
    pub fn build_shared(self, context: Arc<dyn UsbContext>) -> Registry {
        Registry::new(
            context,
            self.unit_config(),
            self.max_units,
            self.poll_interval,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RegistryBuilder::new().unit_config();
        assert_eq!(config, UnitConfig::default());
        assert_eq!(RegistryBuilder::default().max_units, 8);
        assert_eq!(RegistryBuilder::new().poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn overrides_reach_unit_config() {
        let builder = RegistryBuilder::new()
            .command_timeout(Duration::from_millis(250))
            .stop_poll_interval(Duration::from_millis(10))
            .stop_timeout(Duration::from_secs(1))
            .adc_clock_hz(60e6);
        let config = builder.unit_config();
        assert_eq!(config.command_timeout, Duration::from_millis(250));
        assert_eq!(config.stop_poll_interval, Duration::from_millis(10));
        assert_eq!(config.stop_timeout, Duration::from_secs(1));
        assert_eq!(config.adc_clock_hz, 60e6);
    }

    #[test]
    fn resource_dir_flows_to_resources() {
        let resources = RegistryBuilder::new().resource_dir("/opt/perseus").resources();
        assert_eq!(resources.dir(), Path::new("/opt/perseus"));
    }
}
