//! USB driver for the Microtelecom Perseus software-defined receiver.
//!
//! This crate brings a Perseus from power-up to streaming samples:
//!
//! - **Registry** ([`registry`]) -- finds attached units, runs the shared
//!   event-pump thread and remembers which firmware each bus/port booted.
//! - **Unit** ([`unit`]) -- one receiver's session: open/close, firmware,
//!   FPGA configuration, front-end settings and streaming.
//! - **Firmware** ([`firmware`]) -- parses `.hex` boot images for the FX2
//!   and uploads them with vendor control requests.
//! - **Bitstream** ([`bitstream`]) -- the FPGA variants, the keystream that
//!   decodes stored `.sbs` files, and the upload protocol.
//! - **Front end** ([`frontend`]) -- attenuator, preselector and the DDC
//!   serial-IO register model.
//! - **Streaming** ([`streaming`]) -- the asynchronous input pipeline and its
//!   channel adapter.
//! - **RegistryBuilder** ([`builder`]) -- timeouts, limits and resources.
//!
//! # Example
//!
//! ```
//! use perseus::frontend::{phase_accumulator, PreselectorFilter, ADC_CLOCK_HZ};
//! use perseus::bitstream::BitstreamVariant;
//!
//! assert_eq!(phase_accumulator(1_000_000.0, ADC_CLOCK_HZ), 53_687_091);
//! assert_eq!(PreselectorFilter::find(7_074_000.0), Some(PreselectorFilter::Lp8m5));
//! assert_eq!(BitstreamVariant::Ddc192k.buffer_length(), 8160);
//! ```

pub mod bitstream;
pub mod builder;
pub mod commands;
pub mod eeprom;
pub mod firmware;
pub mod frontend;
pub mod registry;
pub mod resources;
pub mod streaming;
pub mod unit;

pub use bitstream::BitstreamVariant;
pub use builder::RegistryBuilder;
pub use eeprom::EepromInfo;
pub use firmware::{FirmwareImage, FirmwareKind};
pub use frontend::{Attenuator, PreselectorFilter};
pub use registry::Registry;
pub use resources::Resources;
pub use streaming::{SampleBuffer, SampleReceiver, StreamState, StreamStats};
pub use unit::{Unit, UnitConfig};
