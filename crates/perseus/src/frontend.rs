//! Front-end register model: attenuator, preselector and serial-IO control.
//!
//! Two registers drive the analog front end and the FPGA:
//!
//! - **Port E** of the FX2, written with `[0x04, value]`. Bits 4-5 select
//!   the attenuator, bits 0-3 the preselector band.
//! - The **serial-IO** control word sent to the FPGA with the phase
//!   accumulator: FIFO enable, ADC dither, ADC preamp.
//!
//! Everything here is pure state. The unit session decides when to commit
//! it to the device and rolls back on failure.

use perseus_core::error::{Error, Result};

use crate::commands;

/// Nominal ADC sampling clock.
pub const ADC_CLOCK_HZ: f64 = 80_000_000.0;

// ---------------------------------------------------------------
// Attenuator
// ---------------------------------------------------------------

/// Input attenuator setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Attenuator {
    #[default]
    Db0,
    Db10,
    Db20,
    Db30,
}

impl Attenuator {
    /// Port E bits owned by the attenuator.
    pub const MASK: u8 = 0x30;
    const SHIFT: u8 = 4;

    /// All settings, lowest attenuation first.
    pub const ALL: [Attenuator; 4] = [
        Attenuator::Db0,
        Attenuator::Db10,
        Attenuator::Db20,
        Attenuator::Db30,
    ];

    /// Two-bit attenuator code.
    pub fn code(self) -> u8 {
        match self {
            Attenuator::Db0 => 0,
            Attenuator::Db10 => 1,
            Attenuator::Db20 => 2,
            Attenuator::Db30 => 3,
        }
    }

    /// Attenuation in dB.
    pub fn db(self) -> u8 {
        self.code() * 10
    }

    /// Look up the setting for an attenuation in dB (0, 10, 20 or 30).
    pub fn from_db(db: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.db() == db)
    }

    /// The code shifted into its port E position.
    pub fn masked_value(self) -> u8 {
        (self.code() << Self::SHIFT) & Self::MASK
    }

    fn from_code(code: u8) -> Self {
        match code & 0x03 {
            0 => Attenuator::Db0,
            1 => Attenuator::Db10,
            2 => Attenuator::Db20,
            _ => Attenuator::Db30,
        }
    }
}

impl std::fmt::Display for Attenuator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} dB", self.db())
    }
}

// ---------------------------------------------------------------
// Preselector
// ---------------------------------------------------------------

/// Preselector band: ten low-pass filters and the wideband bypass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreselectorFilter {
    Lp1m7,
    Lp2m1,
    Lp3m0,
    Lp4m2,
    Lp6m0,
    Lp8m5,
    Lp12m,
    Lp17m,
    Lp24m,
    Lp32m,
    /// No band filtering.
    Wideband,
}

impl PreselectorFilter {
    /// Port E bits owned by the preselector.
    pub const MASK: u8 = 0x0F;

    /// The low-pass bands, lowest cutoff first.
    pub const BANDS: [PreselectorFilter; 10] = [
        PreselectorFilter::Lp1m7,
        PreselectorFilter::Lp2m1,
        PreselectorFilter::Lp3m0,
        PreselectorFilter::Lp4m2,
        PreselectorFilter::Lp6m0,
        PreselectorFilter::Lp8m5,
        PreselectorFilter::Lp12m,
        PreselectorFilter::Lp17m,
        PreselectorFilter::Lp24m,
        PreselectorFilter::Lp32m,
    ];

    /// Filter select code (0-9, wideband 10).
    pub fn code(self) -> u8 {
        match self {
            PreselectorFilter::Lp1m7 => 0,
            PreselectorFilter::Lp2m1 => 1,
            PreselectorFilter::Lp3m0 => 2,
            PreselectorFilter::Lp4m2 => 3,
            PreselectorFilter::Lp6m0 => 4,
            PreselectorFilter::Lp8m5 => 5,
            PreselectorFilter::Lp12m => 6,
            PreselectorFilter::Lp17m => 7,
            PreselectorFilter::Lp24m => 8,
            PreselectorFilter::Lp32m => 9,
            PreselectorFilter::Wideband => 10,
        }
    }

    /// Upper cutoff, or `None` for the wideband bypass.
    pub fn cutoff_hz(self) -> Option<f64> {
        let hz = match self {
            PreselectorFilter::Lp1m7 => 1_700_000.0,
            PreselectorFilter::Lp2m1 => 2_100_000.0,
            PreselectorFilter::Lp3m0 => 3_000_000.0,
            PreselectorFilter::Lp4m2 => 4_200_000.0,
            PreselectorFilter::Lp6m0 => 6_000_000.0,
            PreselectorFilter::Lp8m5 => 8_500_000.0,
            PreselectorFilter::Lp12m => 12_000_000.0,
            PreselectorFilter::Lp17m => 17_000_000.0,
            PreselectorFilter::Lp24m => 24_000_000.0,
            PreselectorFilter::Lp32m => 32_000_000.0,
            PreselectorFilter::Wideband => return None,
        };
        Some(hz)
    }

    /// The band with the smallest cutoff strictly above `freq_hz`.
    pub fn find(freq_hz: f64) -> Option<Self> {
        Self::BANDS
            .into_iter()
            .find(|band| band.cutoff_hz().is_some_and(|cutoff| freq_hz < cutoff))
    }

    /// The code in its port E position.
    pub fn masked_value(self) -> u8 {
        self.code() & Self::MASK
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            10 => Some(PreselectorFilter::Wideband),
            c => Self::BANDS.get(c as usize).copied(),
        }
    }
}

impl std::fmt::Display for PreselectorFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.cutoff_hz() {
            Some(hz) => write!(f, "LPF {} MHz", hz / 1_000_000.0),
            None => write!(f, "wideband"),
        }
    }
}

// ---------------------------------------------------------------
// Port E register
// ---------------------------------------------------------------

/// The FX2 port E byte shared by attenuator and preselector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortE(u8);

impl PortE {
    pub fn new(value: u8) -> Self {
        PortE(value)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Register with the attenuator field replaced.
    pub fn with_attenuator(self, att: Attenuator) -> Self {
        PortE((self.0 & !Attenuator::MASK) | att.masked_value())
    }

    /// Register with the preselector field replaced.
    pub fn with_filter(self, filter: PreselectorFilter) -> Self {
        PortE((self.0 & !PreselectorFilter::MASK) | filter.masked_value())
    }

    pub fn attenuator(self) -> Attenuator {
        Attenuator::from_code((self.0 & Attenuator::MASK) >> Attenuator::SHIFT)
    }

    /// Decoded preselector field; `None` for codes 11-15.
    pub fn filter(self) -> Option<PreselectorFilter> {
        PreselectorFilter::from_code(self.0 & PreselectorFilter::MASK)
    }

    /// The `[0x04, value]` command committing this register.
    pub fn command(self) -> Vec<u8> {
        commands::port_e(self.0)
    }
}

// ---------------------------------------------------------------
// Frequency
// ---------------------------------------------------------------

/// Reject frequencies outside `[0, adc_clock / 2)`.
pub fn check_frequency(freq_hz: f64, adc_clock_hz: f64) -> Result<()> {
    if freq_hz.is_finite() && freq_hz >= 0.0 && freq_hz < adc_clock_hz / 2.0 {
        Ok(())
    } else {
        Err(Error::FrequencyOutOfRange(freq_hz))
    }
}

/// DDC phase accumulator increment for `freq_hz`:
/// `round(f / clock * 2^32)`, truncated to 32 bits.
pub fn phase_accumulator(freq_hz: f64, adc_clock_hz: f64) -> u32 {
    let acc = (freq_hz / adc_clock_hz * 4_294_967_296.0).round();
    (acc as u64 & 0xFFFF_FFFF) as u32
}

/// Frequency programmed by a phase accumulator value.
pub fn frequency_from_accumulator(acc: u32, adc_clock_hz: f64) -> f64 {
    acc as f64 * adc_clock_hz / 4_294_967_296.0
}

// ---------------------------------------------------------------
// Serial IO control
// ---------------------------------------------------------------

/// State carried by the serial-IO command.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SioControl {
    pub fifo_enabled: bool,
    pub dither: bool,
    pub preamp: bool,
    pub frequency_hz: f64,
}

impl SioControl {
    pub const FIFO_ENABLE: u8 = 0x01;
    pub const DITHER: u8 = 0x02;
    pub const PREAMP: u8 = 0x04;

    /// Control byte from the three flags.
    pub fn control_byte(&self) -> u8 {
        let mut ctl = 0;
        if self.fifo_enabled {
            ctl |= Self::FIFO_ENABLE;
        }
        if self.dither {
            ctl |= Self::DITHER;
        }
        if self.preamp {
            ctl |= Self::PREAMP;
        }
        ctl
    }

    /// The serial-IO command. Wideband firmware takes no accumulator.
    pub fn command(&self, wideband: bool, adc_clock_hz: f64) -> Vec<u8> {
        let acc = if wideband {
            None
        } else {
            Some(phase_accumulator(self.frequency_hz, adc_clock_hz))
        };
        commands::sio(self.control_byte(), acc)
    }
}

// ---------------------------------------------------------------
// Front-end state
// ---------------------------------------------------------------

/// Everything the unit has committed to the front end.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrontEndState {
    /// Last port E value written successfully.
    pub port_e: PortE,
    /// Preselector band in use, `None` until one is selected.
    pub filter: Option<PreselectorFilter>,
    pub sio: SioControl,
}

impl FrontEndState {
    pub fn attenuator(&self) -> Attenuator {
        self.port_e.attenuator()
    }

    /// Band that `set_ddc_center_frequency` would select.
    ///
    /// Wideband when the preselector is disabled; otherwise the automatic
    /// choice for `freq_hz`, failing above the highest cutoff.
    pub fn select_filter(freq_hz: f64, preselector: bool) -> Result<PreselectorFilter> {
        if !preselector {
            return Ok(PreselectorFilter::Wideband);
        }
        PreselectorFilter::find(freq_hz).ok_or(Error::NoPreselectorFilter(freq_hz))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attenuator_codes() {
        assert_eq!(Attenuator::Db0.masked_value(), 0x00);
        assert_eq!(Attenuator::Db10.masked_value(), 0x10);
        assert_eq!(Attenuator::Db20.masked_value(), 0x20);
        assert_eq!(Attenuator::Db30.masked_value(), 0x30);
        assert_eq!(Attenuator::from_db(20), Some(Attenuator::Db20));
        assert_eq!(Attenuator::from_db(15), None);
        assert_eq!(Attenuator::Db30.to_string(), "30 dB");
    }

    #[test]
    fn masks_are_disjoint() {
        assert_eq!(Attenuator::MASK & PreselectorFilter::MASK, 0);
    }

    #[test]
    fn fields_never_collide() {
        for att in Attenuator::ALL {
            for filter in PreselectorFilter::BANDS
                .into_iter()
                .chain([PreselectorFilter::Wideband])
            {
                let a = PortE::default().with_attenuator(att).with_filter(filter);
                let b = PortE::default().with_filter(filter).with_attenuator(att);
                assert_eq!(a, b);
                assert_eq!(a.attenuator(), att);
                assert_eq!(a.filter(), Some(filter));
            }
        }
    }

    #[test]
    fn field_update_keeps_other_bits() {
        let reg = PortE::new(0xC0).with_attenuator(Attenuator::Db20).with_filter(PreselectorFilter::Lp6m0);
        assert_eq!(reg.value(), 0xC0 | 0x20 | 0x04);
        let reg = reg.with_attenuator(Attenuator::Db0);
        assert_eq!(reg.value(), 0xC0 | 0x04);
        assert_eq!(reg.command(), vec![0x04, 0xC4]);
    }

    #[test]
    fn find_filter_picks_smallest_cutoff_above() {
        assert_eq!(PreselectorFilter::find(0.0), Some(PreselectorFilter::Lp1m7));
        assert_eq!(PreselectorFilter::find(1_000_000.0), Some(PreselectorFilter::Lp1m7));
        assert_eq!(PreselectorFilter::find(7_050_000.0), Some(PreselectorFilter::Lp8m5));
        assert_eq!(PreselectorFilter::find(14_200_000.0), Some(PreselectorFilter::Lp17m));
        assert_eq!(PreselectorFilter::find(31_999_999.0), Some(PreselectorFilter::Lp32m));
    }

    #[test]
    fn find_filter_at_cutoff_takes_next_band() {
        assert_eq!(PreselectorFilter::find(1_700_000.0), Some(PreselectorFilter::Lp2m1));
        assert_eq!(PreselectorFilter::find(12_000_000.0), Some(PreselectorFilter::Lp17m));
    }

    #[test]
    fn find_filter_fails_from_32_mhz() {
        assert_eq!(PreselectorFilter::find(32_000_000.0), None);
        assert_eq!(PreselectorFilter::find(39_000_000.0), None);
        assert!(matches!(
            FrontEndState::select_filter(35_000_000.0, true),
            Err(Error::NoPreselectorFilter(_))
        ));
        assert_eq!(
            FrontEndState::select_filter(35_000_000.0, false).unwrap(),
            PreselectorFilter::Wideband
        );
    }

    #[test]
    fn frequency_range() {
        assert!(check_frequency(0.0, ADC_CLOCK_HZ).is_ok());
        assert!(check_frequency(39_999_999.0, ADC_CLOCK_HZ).is_ok());
        assert!(matches!(
            check_frequency(40_000_000.0, ADC_CLOCK_HZ),
            Err(Error::FrequencyOutOfRange(_))
        ));
        assert!(check_frequency(-1.0, ADC_CLOCK_HZ).is_err());
        assert!(check_frequency(f64::NAN, ADC_CLOCK_HZ).is_err());
    }

    #[test]
    fn phase_accumulator_one_mhz() {
        assert_eq!(phase_accumulator(1_000_000.0, ADC_CLOCK_HZ), 53_687_091);
        assert_eq!(phase_accumulator(0.0, ADC_CLOCK_HZ), 0);
    }

    #[test]
    fn accumulator_inverse_within_one_lsb() {
        let lsb = ADC_CLOCK_HZ / 4_294_967_296.0;
        for f in [1_000_000.0, 7_074_000.0, 14_200_123.5, 39_999_999.0] {
            let back = frequency_from_accumulator(phase_accumulator(f, ADC_CLOCK_HZ), ADC_CLOCK_HZ);
            assert!((back - f).abs() <= lsb, "{f} -> {back}");
        }
    }

    #[test]
    fn sio_control_byte_and_command() {
        let mut sio = SioControl {
            frequency_hz: 1_000_000.0,
            ..SioControl::default()
        };
        assert_eq!(sio.control_byte(), 0);
        sio.fifo_enabled = true;
        sio.preamp = true;
        assert_eq!(sio.control_byte(), 0x05);
        assert_eq!(
            sio.command(false, ADC_CLOCK_HZ),
            vec![0x03, 0x05, 0x33, 0x33, 0x33, 0x03]
        );
        assert_eq!(sio.command(true, ADC_CLOCK_HZ), vec![0x03, 0x05, 0, 0, 0]);
    }

    #[test]
    fn filter_display() {
        assert_eq!(PreselectorFilter::Lp8m5.to_string(), "LPF 8.5 MHz");
        assert_eq!(PreselectorFilter::Wideband.to_string(), "wideband");
    }
}
