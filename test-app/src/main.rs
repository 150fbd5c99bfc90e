// Perseus test application -- CLI tool for exercising the driver against
// real hardware or a scripted mock bus.
//
// Usage:
//   perseus-test-app list
//   perseus-test-app --resources /usr/share/perseus info
//   perseus-test-app --resources /usr/share/perseus record --rate 192000 \
//       --freq 7074000 --seconds 10 --output capture.iq
//   perseus-test-app --mock record --seconds 1
//   perseus-test-app variants
//
// Set RUST_LOG=perseus=debug for per-transfer detail.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use perseus::bitstream::BitstreamVariant;
use perseus::commands::{EP_STATUS, PRODUCT_ID, VENDOR_ID};
use perseus::{Attenuator, FirmwareImage, FirmwareKind, Registry, RegistryBuilder, Unit};
use perseus_core::{format_freq_mhz, format_sample_rate, DeviceInfo, TransferStatus, UsbAddress};
use perseus_test_harness::{MockDevice, MockUsb};
use perseus_transport::RusbContext;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Perseus test application -- exercises the receiver from the command line.
#[derive(Parser)]
#[command(name = "perseus-test-app", version, about)]
struct Cli {
    /// Directory holding the firmware `.hex` and bitstream `.sbs` files.
    #[arg(long, default_value = ".")]
    resources: PathBuf,

    /// Index of the unit to use when several are attached.
    #[arg(long, default_value_t = 0)]
    unit: usize,

    /// Command timeout in milliseconds.
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,

    /// Use a scripted mock bus with one unit instead of real USB.
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List attached units.
    List,

    /// Boot a unit and print its EEPROM identity.
    Info,

    /// Print the bitstream variant table.
    Variants,

    /// Boot a unit, tune it and record raw samples.
    Record {
        /// Output sample rate in S/s (selects the bitstream).
        #[arg(long, default_value_t = 192_000)]
        rate: u32,

        /// DDC center frequency in Hz.
        #[arg(long, default_value_t = 7_074_000.0)]
        freq: f64,

        /// Attenuation in dB: 0, 10, 20 or 30.
        #[arg(long, default_value_t = 0)]
        attenuator: u8,

        /// Enable ADC dither.
        #[arg(long)]
        dither: bool,

        /// Enable the preamplifier.
        #[arg(long)]
        preamp: bool,

        /// Bypass the preselector filters.
        #[arg(long)]
        no_preselector: bool,

        /// Capture duration in seconds.
        #[arg(long, default_value_t = 5.0)]
        seconds: f64,

        /// Where to write raw samples. Discarded when omitted.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Put a unit into its low-power state.
    Shutdown,
}

// ---------------------------------------------------------------------------
// Mock bus
// ---------------------------------------------------------------------------

const MOCK_IDENTITY: [u8; 14] = [
    0x06, 0x00, 0x30, 0x39, 0x80, 0x14, 0x01, 0x02, 0x0C, 0x0C, 0x0B, 0x0B, 0x0A, 0x0A,
];

fn mock_bus() -> (MockUsb, MockDevice) {
    let usb = MockUsb::new();
    let dev = usb.add_device(DeviceInfo {
        vendor_id: VENDOR_ID,
        product_id: PRODUCT_ID,
        location: UsbAddress::new(1, 1),
        device_address: 2,
        interface_number: 0,
    });
    (usb, dev)
}

/// Script the replies a healthy unit gives during bring-up.
fn script_bring_up(dev: &MockDevice) {
    dev.queue_bulk_in(EP_STATUS, &MOCK_IDENTITY);
    dev.queue_bulk_in(EP_STATUS, &[0x02, 0x01]);
}

fn script_stream(dev: &MockDevice, variant: BitstreamVariant, seconds: f64) {
    // attenuator needs no reply; ADC, DDC, FIFO on and FIFO off each read one.
    for _ in 0..4 {
        dev.queue_bulk_in(EP_STATUS, &[0; 6]);
    }
    let buffer = vec![0u8; variant.buffer_length()];
    let per_second = variant.sample_rate() as f64 * variant.bytes_per_sample() as f64
        * variant.components_per_sample() as f64
        / buffer.len() as f64;
    let count = (per_second * seconds).ceil().clamp(1.0, 10_000.0) as usize;
    for _ in 0..count {
        dev.queue_completion(TransferStatus::Completed, &buffer);
    }
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

fn builder(cli: &Cli) -> RegistryBuilder {
    RegistryBuilder::new()
        .resource_dir(&cli.resources)
        .command_timeout(Duration::from_millis(cli.timeout_ms))
}

fn open_registry(cli: &Cli) -> Result<(Registry, Option<MockDevice>)> {
    let (mut registry, mock) = if cli.mock {
        let (usb, dev) = mock_bus();
        let registry = builder(cli)
            .poll_interval(Duration::from_millis(10))
            .build(usb);
        (registry, Some(dev))
    } else {
        let context = RusbContext::new().context("unable to initialise libusb")?;
        (builder(cli).build(context), None)
    };
    let found = registry.enumerate().context("enumeration failed")?;
    info!(found, "units enumerated");
    Ok((registry, mock))
}

fn firmware_for(cli: &Cli, kind: FirmwareKind) -> Result<Arc<FirmwareImage>> {
    if cli.mock {
        return Ok(Arc::new(FirmwareImage::new(kind, Vec::new())));
    }
    let image = builder(cli)
        .resources()
        .load_firmware(kind)
        .with_context(|| format!("loading {kind} firmware"))?;
    Ok(Arc::new(image))
}

/// Open the selected unit, boot its firmware and read the EEPROM.
fn boot<'a>(cli: &Cli, registry: &'a mut Registry, kind: FirmwareKind) -> Result<&'a mut Unit> {
    let firmware = firmware_for(cli, kind)?;
    let Some(unit) = registry.unit_mut(cli.unit) else {
        bail!("no unit #{} attached", cli.unit);
    };
    unit.open().context("open failed")?;
    if !unit.is_firmware_loaded() {
        bail!("endpoint halts could not be cleared on {}", unit.location());
    }
    unit.load_firmware(firmware).context("firmware upload failed")?;
    unit.read_eeprom().context("EEPROM read failed")?;
    Ok(unit)
}

fn configure_fpga(cli: &Cli, unit: &mut Unit, variant: BitstreamVariant) -> Result<()> {
    if cli.mock {
        unit.load_bitstream(variant, std::io::empty())?;
    } else {
        let path = builder(cli).resources().bitstream_path(variant);
        unit.load_bitstream_file(variant, &path)
            .with_context(|| format!("configuring FPGA from {}", path.display()))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_list(registry: &Registry) -> Result<()> {
    if registry.units().is_empty() {
        println!("No Perseus units found.");
        return Ok(());
    }
    for (i, unit) in registry.units().iter().enumerate() {
        let dev = unit.info();
        let note = if unit.has_blank_eeprom() { " (blank EEPROM)" } else { "" };
        println!(
            "#{i}  {}  product 0x{:04X}  address {}{note}",
            unit.location(),
            dev.product_id,
            dev.device_address
        );
    }
    Ok(())
}

fn cmd_info(cli: &Cli, registry: &mut Registry) -> Result<()> {
    let unit = boot(cli, registry, FirmwareKind::Narrowband)?;
    if let Some(id) = unit.eeprom() {
        print!("{}", id.describe());
    }
    if unit.is_preproduction() {
        println!("Pre-production unit: attenuator is fixed at 30 dB.");
    }
    Ok(())
}

fn cmd_variants() -> Result<()> {
    println!(
        "{:<10} {:>12} {:>6} {:>9} {:>8} {:>9}",
        "name", "rate", "decim", "firmware", "frame", "buffer"
    );
    for v in BitstreamVariant::ALL {
        println!(
            "{:<10} {:>12} {:>6} {:>9} {:>8} {:>9}",
            v.name(),
            format_sample_rate(v.sample_rate()),
            v.decimation(),
            v.firmware().to_string(),
            v.frame_length(),
            v.buffer_length()
        );
    }
    Ok(())
}

struct RecordArgs<'a> {
    rate: u32,
    freq: f64,
    attenuator: u8,
    dither: bool,
    preamp: bool,
    preselector: bool,
    seconds: f64,
    output: Option<&'a PathBuf>,
}

fn cmd_record(
    cli: &Cli,
    registry: &mut Registry,
    mock: Option<&MockDevice>,
    args: RecordArgs<'_>,
) -> Result<()> {
    let Some(variant) = BitstreamVariant::from_sample_rate(args.rate) else {
        bail!("no bitstream for {}", format_sample_rate(args.rate));
    };
    let Some(attenuator) = Attenuator::from_db(args.attenuator) else {
        bail!("attenuation must be 0, 10, 20 or 30 dB");
    };
    if let Some(dev) = mock {
        script_stream(dev, variant, args.seconds);
    }

    let unit = boot(cli, registry, variant.firmware())?;
    configure_fpga(cli, unit, variant)?;
    unit.set_attenuator(attenuator)?;
    unit.set_adc(args.dither, args.preamp)?;
    if !variant.firmware().is_wideband() {
        unit.set_ddc_center_frequency(args.freq, args.preselector)?;
        println!(
            "Tuned to {} ({}, {})",
            format_freq_mhz(args.freq),
            unit.front_end().filter.map_or("no filter".to_string(), |f| f.to_string()),
            unit.front_end().attenuator()
        );
    }

    let mut sink: Option<BufWriter<File>> = match args.output {
        Some(path) => Some(BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => None,
    };

    let Some(mut rx) = unit.start_async_input_channel(variant.buffer_length(), 64)? else {
        bail!("streaming could not be started");
    };
    println!(
        "Recording {} for {:.1} s...",
        format_sample_rate(variant.sample_rate()),
        args.seconds
    );

    let deadline = Instant::now() + Duration::from_secs_f64(args.seconds.max(0.0));
    while Instant::now() < deadline && unit.is_streaming() {
        match rx.try_recv() {
            Some(buffer) => {
                if let Some(out) = sink.as_mut() {
                    out.write_all(&buffer.data)?;
                }
            }
            None => std::thread::sleep(Duration::from_millis(5)),
        }
    }

    unit.stop_async_input()?;
    while let Some(buffer) = rx.try_recv() {
        if let Some(out) = sink.as_mut() {
            out.write_all(&buffer.data)?;
        }
    }
    if let Some(mut out) = sink {
        out.flush()?;
    }
    if let Some(stats) = unit.stream_stats() {
        println!("{stats}");
    }
    if rx.dropped() > 0 {
        println!("{} buffers dropped", rx.dropped());
    }
    Ok(())
}

fn cmd_shutdown(cli: &Cli, registry: &mut Registry) -> Result<()> {
    let unit = boot(cli, registry, FirmwareKind::Narrowband)?;
    unit.shutdown()?;
    println!("Unit {} shut down.", unit.label());
    Ok(())
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if matches!(cli.command, Command::Variants) {
        return cmd_variants();
    }

    let (mut registry, mock) = open_registry(&cli)?;
    if matches!(cli.command, Command::Info | Command::Shutdown | Command::Record { .. }) {
        if let Some(dev) = &mock {
            script_bring_up(dev);
        }
    }

    let result = match &cli.command {
        Command::List => cmd_list(&registry),
        Command::Info => cmd_info(&cli, &mut registry),
        Command::Variants => cmd_variants(),
        Command::Record {
            rate,
            freq,
            attenuator,
            dither,
            preamp,
            no_preselector,
            seconds,
            output,
        } => cmd_record(
            &cli,
            &mut registry,
            mock.as_ref(),
            RecordArgs {
                rate: *rate,
                freq: *freq,
                attenuator: *attenuator,
                dither: *dither,
                preamp: *preamp,
                preselector: !*no_preselector,
                seconds: *seconds,
                output: output.as_ref(),
            },
        ),
        Command::Shutdown => cmd_shutdown(&cli, &mut registry),
    };

    registry.stop();
    result
}
