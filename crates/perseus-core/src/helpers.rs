//! Formatting helpers shared by the driver and its command-line tool.

/// Format a frequency in hertz as a MHz string with six decimal places.
///
/// # Example
///
/// ```
/// use perseus_core::format_freq_mhz;
///
/// assert_eq!(format_freq_mhz(7_074_000.0), "7.074000 MHz");
/// assert_eq!(format_freq_mhz(0.0), "0.000000 MHz");
/// ```
pub fn format_freq_mhz(freq_hz: f64) -> String {
    let mhz = freq_hz / 1_000_000.0;
    format!("{mhz:.6} MHz")
}

/// Format a sample rate in samples per second.
///
/// Rates of one megasample or more use `MS/s`, everything else `kS/s`.
///
/// ```
/// use perseus_core::format_sample_rate;
///
/// assert_eq!(format_sample_rate(192_000), "192 kS/s");
/// assert_eq!(format_sample_rate(6_553_600), "6.5536 MS/s");
/// ```
pub fn format_sample_rate(rate: u32) -> String {
    if rate >= 1_000_000 {
        let ms = rate as f64 / 1_000_000.0;
        format!("{ms} MS/s")
    } else {
        let ks = rate as f64 / 1_000.0;
        format!("{ks} kS/s")
    }
}

/// Render bytes as space-separated uppercase hex, e.g. `"81 B2 25"`.
pub fn hex_bytes(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_freq_mhz_hf() {
        assert_eq!(format_freq_mhz(14_074_000.0), "14.074000 MHz");
        assert_eq!(format_freq_mhz(1_840_000.0), "1.840000 MHz");
    }

    #[test]
    fn format_freq_mhz_fractional_hz() {
        assert_eq!(format_freq_mhz(10_000_000.5), "10.000001 MHz");
    }

    #[test]
    fn format_sample_rate_kilo() {
        assert_eq!(format_sample_rate(48_000), "48 kS/s");
        assert_eq!(format_sample_rate(95_000), "95 kS/s");
        assert_eq!(format_sample_rate(125_000), "125 kS/s");
    }

    #[test]
    fn format_sample_rate_mega() {
        assert_eq!(format_sample_rate(1_000_000), "1 MS/s");
        assert_eq!(format_sample_rate(2_000_000), "2 MS/s");
    }

    #[test]
    fn hex_bytes_format() {
        assert_eq!(hex_bytes(&[0x81, 0xB2, 0x25, 0xAA]), "81 B2 25 AA");
        assert_eq!(hex_bytes(&[]), "");
        assert_eq!(hex_bytes(&[0x0A]), "0A");
    }
}
