//! One physical Perseus receiver: session lifecycle, front-end control and
//! sample streaming.
//!
//! A [`Unit`] is created by the [`Registry`](crate::registry::Registry) for
//! every matching USB device. Bring-up follows the hardware's order:
//!
//! 1. [`open`](Unit::open) claims the interface and clears endpoint halts.
//! 2. [`load_firmware`](Unit::load_firmware) boots the FX2.
//! 3. [`read_eeprom`](Unit::read_eeprom) identifies the unit.
//! 4. [`load_bitstream`](Unit::load_bitstream) configures the FPGA.
//! 5. Front-end setters, then [`start_async_input`](Unit::start_async_input).
//!
//! Front-end and streaming operations are guarded: when the unit is not
//! ready for them they log a warning and return `Ok(false)` without touching
//! the hardware. Hardware failures return `Err` and leave the session open
//! with its previous register state.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use perseus_core::error::{Error, Result};
use perseus_core::helpers::{format_freq_mhz, hex_bytes};
use perseus_core::transport::{DeviceInfo, TransferId, UsbAddress, UsbContext, UsbHandle};
use tracing::{debug, error, info, warn};

use crate::bitstream::{self, BitstreamVariant};
use crate::commands::{
    self, CONFIGURATION, EP_CMD, EP_DATA_IN, EP_STATUS, PRODUCT_ID_BLANK_EEPROM, SIO_REPLY_LEN,
};
use crate::eeprom::{self, EepromInfo};
use crate::firmware::{self, FirmwareImage};
use crate::frontend::{check_frequency, Attenuator, FrontEndState, PortE, ADC_CLOCK_HZ};
use crate::registry::FirmwareAssociations;
use crate::streaming::{
    channel_callback, completion_handler, SampleCallback, SampleReceiver, StreamShared,
    StreamState, StreamStats, DEFAULT_BYTES_PER_SAMPLE,
};

// ---------------------------------------------------------------------------
// UnitConfig
// ---------------------------------------------------------------------------

/// Per-unit timing and clock settings, filled in by
/// [`RegistryBuilder`](crate::builder::RegistryBuilder).
#[derive(Debug, Clone, PartialEq)]
pub struct UnitConfig {
    /// Timeout of every synchronous command transfer.
    pub command_timeout: Duration,
    /// How often `stop_async_input` checks for the final completion.
    pub stop_poll_interval: Duration,
    /// Upper bound on that wait.
    pub stop_timeout: Duration,
    pub adc_clock_hz: f64,
}

impl Default for UnitConfig {
    fn default() -> Self {
        UnitConfig {
            command_timeout: Duration::from_secs(1),
            stop_poll_interval: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(5),
            adc_clock_hz: ADC_CLOCK_HZ,
        }
    }
}

struct ActiveStream {
    id: TransferId,
    shared: Arc<StreamShared>,
    started: Instant,
    bytes_per_sample: usize,
}

impl ActiveStream {
    fn stats(&self, until: Instant) -> StreamStats {
        StreamStats {
            bytes: self.shared.bytes(),
            buffers: self.shared.buffers(),
            short_buffers: self.shared.short_buffers(),
            elapsed: until.saturating_duration_since(self.started),
            bytes_per_sample: self.bytes_per_sample,
        }
    }
}

// ---------------------------------------------------------------------------
// Unit
// ---------------------------------------------------------------------------

/// Session with one Perseus receiver.
pub struct Unit {
    context: Arc<dyn UsbContext>,
    info: DeviceInfo,
    config: UnitConfig,
    associations: FirmwareAssociations,
    handle: Option<Box<dyn UsbHandle>>,
    kernel_driver_detached: bool,
    firmware_loaded: bool,
    firmware: Option<Arc<FirmwareImage>>,
    bitstream: Option<BitstreamVariant>,
    eeprom: Option<EepromInfo>,
    preproduction: bool,
    front_end: FrontEndState,
    stream: Option<ActiveStream>,
    last_stats: Option<StreamStats>,
}

impl Unit {
    pub(crate) fn new(
        context: Arc<dyn UsbContext>,
        info: DeviceInfo,
        config: UnitConfig,
        associations: FirmwareAssociations,
    ) -> Self {
        Unit {
            context,
            info,
            config,
            associations,
            handle: None,
            kernel_driver_detached: false,
            firmware_loaded: false,
            firmware: None,
            bitstream: None,
            eeprom: None,
            preproduction: false,
            front_end: FrontEndState::default(),
            stream: None,
            last_stats: None,
        }
    }

    // -- accessors --------------------------------------------------------

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Bus and port the unit is plugged into.
    pub fn location(&self) -> UsbAddress {
        self.info.location
    }

    /// The unit enumerated with the blank-EEPROM product ID.
    pub fn has_blank_eeprom(&self) -> bool {
        self.info.product_id == PRODUCT_ID_BLANK_EEPROM
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn is_firmware_loaded(&self) -> bool {
        self.firmware_loaded
    }

    pub fn is_preproduction(&self) -> bool {
        self.preproduction
    }

    pub fn firmware(&self) -> Option<&Arc<FirmwareImage>> {
        self.firmware.as_ref()
    }

    pub fn bitstream(&self) -> Option<BitstreamVariant> {
        self.bitstream
    }

    pub fn eeprom(&self) -> Option<&EepromInfo> {
        self.eeprom.as_ref()
    }

    pub fn front_end(&self) -> &FrontEndState {
        &self.front_end
    }

    pub fn config(&self) -> &UnitConfig {
        &self.config
    }

    /// Serial number once the EEPROM was read, bus/port before that.
    pub fn label(&self) -> String {
        match &self.eeprom {
            Some(id) => id.serial(),
            None => self.info.location.to_string(),
        }
    }

    fn handle(&self) -> Result<&dyn UsbHandle> {
        self.handle.as_deref().ok_or(Error::NotOpen)
    }

    fn wideband(&self) -> bool {
        self.firmware.as_ref().is_some_and(|fw| fw.kind().is_wideband())
    }

    // -- lifecycle --------------------------------------------------------

    /// Open the device and prepare its interface.
    ///
    /// Configuration, claim and alternate-setting failures are logged and
    /// skipped. The firmware is considered usable only when the halt on all
    /// three endpoints clears.
    pub fn open(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        let handle = self.context.open(&self.info)?;
        let loc = self.info.location;
        info!(
            product = format_args!("0x{:04X}", self.info.product_id),
            vendor = format_args!("0x{:04X}", self.info.vendor_id),
            bus = loc.bus,
            address = self.info.device_address,
            port = loc.port,
            "found device"
        );

        let iface = self.info.interface_number;
        self.kernel_driver_detached = false;
        let bound = self.context.supports_detach_kernel_driver()
            && handle.kernel_driver_active(iface).unwrap_or(false);
        if bound {
            match handle.detach_kernel_driver(iface) {
                Ok(()) => self.kernel_driver_detached = true,
                Err(e) => warn!(interface = iface, error = %e, "unable to detach kernel driver"),
            }
        }

        if let Err(e) = handle.set_active_configuration(CONFIGURATION) {
            error!(config = CONFIGURATION, error = %e, "unable to set configuration");
        }
        if let Err(e) = handle.claim_interface(iface) {
            error!(interface = iface, error = %e, "unable to claim interface");
        }
        if let Err(e) = handle.set_alternate_setting(iface, 0) {
            error!(interface = iface, error = %e, "unable to select alternate setting 0/0");
        }

        let mut halts_cleared = true;
        for endpoint in [EP_CMD, EP_STATUS, EP_DATA_IN] {
            if let Err(e) = handle.clear_halt(endpoint) {
                error!(endpoint = format_args!("0x{endpoint:02X}"), error = %e, "unable to clear halt");
                halts_cleared = false;
            }
        }
        self.firmware_loaded = halts_cleared;
        self.handle = Some(handle);
        Ok(())
    }

    /// Stop any stream, hand the interface back and drop the handle.
    pub fn close(&mut self) {
        if self.handle.is_none() {
            return;
        }
        if self.stream.is_some() {
            if let Err(e) = self.stop_async_input() {
                warn!(serial = %self.label(), error = %e, "stream did not stop cleanly");
            }
        }
        if let Some(handle) = self.handle.take() {
            let iface = self.info.interface_number;
            if self.kernel_driver_detached {
                if let Err(e) = handle.attach_kernel_driver(iface) {
                    warn!(interface = iface, error = %e, "unable to reattach kernel driver");
                }
                self.kernel_driver_detached = false;
            }
            if let Err(e) = handle.release_interface(iface) {
                warn!(interface = iface, error = %e, "unable to release interface");
            }
        }
        self.stream = None;
        debug!(serial = %self.label(), "unit closed");
    }

    // -- firmware, identity, FPGA -----------------------------------------

    /// Download `image` into the FX2 and remember it for this bus/port.
    ///
    /// Any previous FPGA configuration is lost with the reboot.
    pub fn load_firmware(&mut self, image: Arc<FirmwareImage>) -> Result<()> {
        let handle = self.handle()?;
        firmware::upload(handle, &image, self.config.command_timeout)?;
        self.associations.record(self.info.location, Arc::clone(&image));
        info!(serial = %self.label(), firmware = %image.kind(), "firmware loaded");
        self.firmware = Some(image);
        self.firmware_loaded = true;
        self.bitstream = None;
        Ok(())
    }

    /// Mark `image` as already running on the unit, without any transfer.
    pub fn assume_firmware(&mut self, image: Arc<FirmwareImage>) {
        debug!(serial = %self.label(), firmware = %image.kind(), "firmware assumed loaded");
        self.firmware = Some(image);
        self.firmware_loaded = true;
    }

    /// Read the identity block. Flags the unit pre-production when the
    /// product code is not the production one.
    pub fn read_eeprom(&mut self) -> Result<&EepromInfo> {
        let handle = self.handle()?;
        if !self.firmware_loaded {
            return Err(Error::Precondition("a firmware must be loaded first".into()));
        }
        let id = eeprom::read(handle, self.config.command_timeout)?;
        if id.is_preproduction() {
            self.preproduction = true;
            debug!(serial = %id.serial(), "pre-production unit found");
        }
        Ok(self.eeprom.insert(id))
    }

    /// Configure the FPGA with `variant`, streaming its stored bitstream
    /// from `source`.
    pub fn load_bitstream<R: Read>(&mut self, variant: BitstreamVariant, source: R) -> Result<()> {
        let handle = self.handle()?;
        let firmware = self.firmware.as_ref().ok_or_else(|| {
            Error::Precondition("a firmware must be set before loading the FPGA".into())
        })?;
        if firmware.kind() != variant.firmware() {
            return Err(Error::Precondition(format!(
                "bitstream {variant} needs {} firmware, {} is loaded",
                variant.firmware(),
                firmware.kind()
            )));
        }
        bitstream::upload(handle, variant, source, self.config.command_timeout)?;
        self.bitstream = Some(variant);
        Ok(())
    }

    /// [`load_bitstream`](Self::load_bitstream) from a file.
    pub fn load_bitstream_file(&mut self, variant: BitstreamVariant, path: &Path) -> Result<()> {
        let file = std::fs::File::open(path).map_err(|e| {
            Error::Io(std::io::Error::new(e.kind(), format!("{}: {e}", path.display())))
        })?;
        self.load_bitstream(variant, std::io::BufReader::new(file))
    }

    // -- guarded front-end operations -------------------------------------

    fn ready(&self, operation: &str, needs_fpga: bool) -> bool {
        let reason = if self.handle.is_none() {
            "device not open"
        } else if !self.firmware_loaded {
            "firmware not loaded"
        } else if needs_fpga && self.bitstream.is_none() {
            "FPGA not configured"
        } else {
            return true;
        };
        warn!(serial = %self.label(), operation, reason, "operation skipped");
        false
    }

    fn send_command(&self, data: &[u8]) -> Result<()> {
        let handle = self.handle()?;
        let written = handle.write_bulk(EP_CMD, data, self.config.command_timeout)?;
        if written != data.len() {
            return Err(Error::ShortTransfer {
                expected: data.len(),
                actual: written,
            });
        }
        Ok(())
    }

    fn write_port_e(&mut self, value: PortE) -> Result<()> {
        self.send_command(&value.command())?;
        debug!(serial = %self.label(), port_e = format_args!("0x{:02X}", value.value()), "port E written");
        self.front_end.port_e = value;
        Ok(())
    }

    /// Send the current serial-IO state and discard the status read-back.
    fn write_sio(&self) -> Result<()> {
        let cmd = self
            .front_end
            .sio
            .command(self.wideband(), self.config.adc_clock_hz);
        self.send_command(&cmd)?;
        let mut status = [0u8; SIO_REPLY_LEN];
        let n = self
            .handle()?
            .read_bulk(EP_STATUS, &mut status, Some(self.config.command_timeout))?;
        debug!(sent = %hex_bytes(&cmd), status = %hex_bytes(&status[..n]), "serial IO");
        Ok(())
    }

    /// Set the input attenuator. Pre-production units are always run at
    /// 30 dB.
    pub fn set_attenuator(&mut self, attenuator: Attenuator) -> Result<bool> {
        info!(serial = %self.label(), attenuation = %attenuator, "setting attenuator");
        if !self.ready("set attenuator", false) {
            return Ok(false);
        }
        let attenuator = if self.preproduction {
            warn!(serial = %self.label(), "pre-production unit, attenuator forced to 30 dB");
            Attenuator::Db30
        } else {
            attenuator
        };
        let next = self.front_end.port_e.with_attenuator(attenuator);
        self.write_port_e(next)?;
        Ok(true)
    }

    /// Enable or disable ADC dither and the preamplifier.
    pub fn set_adc(&mut self, dither: bool, preamp: bool) -> Result<bool> {
        info!(serial = %self.label(), dither, preamp, "setting ADC");
        if !self.ready("set ADC", true) {
            return Ok(false);
        }
        let previous = self.front_end.sio;
        self.front_end.sio.dither = dither;
        self.front_end.sio.preamp = preamp;
        if let Err(e) = self.write_sio() {
            self.front_end.sio = previous;
            return Err(e);
        }
        Ok(true)
    }

    /// Tune the digital down-converter to `freq_hz`.
    ///
    /// With `preselector` the smallest low-pass band above the frequency is
    /// switched in, otherwise the wideband path. The filter is only written
    /// when it changes.
    pub fn set_ddc_center_frequency(&mut self, freq_hz: f64, preselector: bool) -> Result<bool> {
        info!(serial = %self.label(), freq = %format_freq_mhz(freq_hz), preselector, "setting DDC center frequency");
        if !self.ready("set DDC center frequency", true) {
            return Ok(false);
        }
        check_frequency(freq_hz, self.config.adc_clock_hz)?;
        let filter = FrontEndState::select_filter(freq_hz, preselector)?;

        let previous = self.front_end.sio;
        self.front_end.sio.frequency_hz = freq_hz;
        if let Err(e) = self.write_sio() {
            self.front_end.sio = previous;
            return Err(e);
        }

        if self.front_end.filter != Some(filter) {
            let next = self.front_end.port_e.with_filter(filter);
            self.write_port_e(next)?;
            self.front_end.filter = Some(filter);
            debug!(serial = %self.label(), filter = %filter, "preselector changed");
        }
        Ok(true)
    }

    /// Toggle the FPGA sample FIFO without starting the async pipeline.
    pub fn set_fifo(&mut self, enabled: bool) -> Result<bool> {
        if !self.ready("set FIFO", true) {
            return Ok(false);
        }
        let previous = self.front_end.sio;
        self.front_end.sio.fifo_enabled = enabled;
        if let Err(e) = self.write_sio() {
            self.front_end.sio = previous;
            return Err(e);
        }
        Ok(true)
    }

    /// Put the unit into its low-power state.
    pub fn shutdown(&self) -> Result<()> {
        self.send_command(&commands::shutdown())?;
        info!(serial = %self.label(), "unit shut down");
        Ok(())
    }

    /// Blocking read of up to `len` bytes from the data endpoint. Waits
    /// without a timeout.
    pub fn read_input_blocking(&self, len: usize) -> Result<Bytes> {
        let handle = self.handle()?;
        let mut buf = vec![0u8; len];
        let n = handle.read_bulk(EP_DATA_IN, &mut buf, None)?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    // -- streaming --------------------------------------------------------

    /// Start streaming `buffer_size`-byte sample buffers to `callback`.
    ///
    /// The callback runs on the event-pump thread and must return quickly.
    pub fn start_async_input(&mut self, buffer_size: usize, callback: SampleCallback) -> Result<bool> {
        info!(serial = %self.label(), buffer_size, "starting async input");
        if !self.ready("start async input", true) {
            return Ok(false);
        }
        if self.stream.is_some() {
            warn!(serial = %self.label(), "async input already started");
            return Ok(false);
        }
        if buffer_size == 0 {
            return Err(Error::Configuration("buffer size must be non-zero".into()));
        }

        let shared = StreamShared::armed();
        let handler = completion_handler(Arc::clone(&shared), callback);
        let id = self.handle()?.submit_bulk_in(EP_DATA_IN, buffer_size, None, handler)?;
        let bytes_per_sample = self
            .bitstream
            .map(|v| v.bytes_per_sample() * v.components_per_sample())
            .unwrap_or(DEFAULT_BYTES_PER_SAMPLE);
        self.stream = Some(ActiveStream {
            id,
            shared,
            started: Instant::now(),
            bytes_per_sample,
        });

        let previous = self.front_end.sio;
        self.front_end.sio.fifo_enabled = true;
        if let Err(e) = self.write_sio() {
            self.front_end.sio = previous;
            warn!(serial = %self.label(), error = %e, "FIFO enabling failed");
        }
        Ok(true)
    }

    /// [`start_async_input`](Self::start_async_input) feeding a bounded
    /// channel. Returns `None` when the start was skipped.
    pub fn start_async_input_channel(
        &mut self,
        buffer_size: usize,
        capacity: usize,
    ) -> Result<Option<SampleReceiver>> {
        let (callback, receiver) = channel_callback(capacity);
        if self.start_async_input(buffer_size, callback)? {
            Ok(Some(receiver))
        } else {
            Ok(None)
        }
    }

    fn cancel_and_wait(&self, stream: &ActiveStream) -> Result<()> {
        let handle = self.handle()?;
        if stream.shared.request_cancel() && !stream.shared.is_complete() {
            if let Err(e) = handle.cancel_transfer(stream.id) {
                error!(serial = %self.label(), error = %e, "input transfer cancel failed");
            }
        }
        let deadline = Instant::now() + self.config.stop_timeout;
        while !stream.shared.is_complete() {
            if Instant::now() >= deadline {
                error!(serial = %self.label(), "input transfer did not complete after cancel");
                return Err(Error::Timeout);
            }
            std::thread::sleep(self.config.stop_poll_interval);
        }
        Ok(())
    }

    /// Cancel the input transfer, wait for its final completion, free it
    /// and disable the FIFO.
    pub fn stop_async_input(&mut self) -> Result<bool> {
        info!(serial = %self.label(), "stopping async input");
        if !self.ready("stop async input", true) {
            return Ok(false);
        }
        let Some(stream) = self.stream.take() else {
            warn!(serial = %self.label(), "async input not started");
            return Ok(false);
        };
        if let Err(e) = self.cancel_and_wait(&stream) {
            self.stream = Some(stream);
            return Err(e);
        }

        let stats = stream.stats(Instant::now());
        info!(
            serial = %self.label(),
            elapsed_s = stats.elapsed.as_secs_f64(),
            kilo_samples = stats.kilo_samples(),
            rate_ksps = stats.rate_ksps(),
            "{stats}"
        );
        if let Err(e) = self.handle()?.free_transfer(stream.id) {
            warn!(serial = %self.label(), error = %e, "input transfer free failed");
        }
        stream.shared.set_state(StreamState::Idle);
        self.last_stats = Some(stats);

        self.front_end.sio.fifo_enabled = false;
        if let Err(e) = self.write_sio() {
            error!(serial = %self.label(), error = %e, "FPGA FIFO disabling failed");
        }
        Ok(true)
    }

    pub fn stream_state(&self) -> StreamState {
        self.stream
            .as_ref()
            .map_or(StreamState::Idle, |s| s.shared.state())
    }

    /// A transfer is allocated and has not reached its final completion.
    pub fn is_streaming(&self) -> bool {
        self.stream.as_ref().is_some_and(|s| !s.shared.is_complete())
    }

    /// Statistics of the running stream, or of the last one stopped.
    pub fn stream_stats(&self) -> Option<StreamStats> {
        match &self.stream {
            Some(stream) => Some(stream.stats(Instant::now())),
            None => self.last_stats,
        }
    }
}

impl Drop for Unit {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unit")
            .field("location", &self.info.location)
            .field("open", &self.is_open())
            .field("firmware_loaded", &self.firmware_loaded)
            .field("bitstream", &self.bitstream)
            .field("stream", &self.stream_state())
            .finish()
    }
}
