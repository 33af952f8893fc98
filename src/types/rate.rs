use std::{fmt::Display, str::FromStr};

type ParseError = Box<dyn std::error::Error + Sync + Send>;

const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

/// Parse a size such as `10.00MiB`, `~ 1.5GiB` or `512KB` into bytes.
fn parse_bytes(s: &str) -> Result<f64, ParseError> {
    let s = s.trim().trim_start_matches('~').trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let num: f64 = num.parse()?;

    let multiplier = match unit.trim() {
        "" | "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        unit => return Err(Box::from(format!("Unknown size unit '{unit}'"))),
    };

    Ok(num * multiplier)
}

/// Format bytes with binary units and one decimal, e.g. `1.2 MiB`.
fn format_bytes(bytes: f64, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    write!(f, "{value:.1} {}", UNITS[unit])
}

/// An amount of data, as announced by the download tool.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct ByteSize(f64);

impl ByteSize {
    pub fn from_bytes(bytes: u64) -> Self {
        Self(bytes as f64)
    }
}

impl FromStr for ByteSize {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(parse_bytes(s)?))
    }
}

impl Display for ByteSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_bytes(self.0, f)
    }
}

/// A transfer speed in bytes per second.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct TransferRate(f64);

impl TransferRate {
    /// Build from a bitrate expressed in kbit/s, as printed by ffmpeg.
    pub fn from_kbits_per_sec(kbits: f64) -> Self {
        Self(kbits * 1000.0 / 8.0)
    }
}

impl FromStr for TransferRate {
    type Err = ParseError;

    /// Parse `1.23MiB/s`. `Unknown B/s` and other placeholders are errors.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let size = s
            .trim()
            .strip_suffix("/s")
            .ok_or_else(|| ParseError::from("Transfer rate does not end with '/s'"))?;
        Ok(Self(parse_bytes(size)?))
    }
}

impl Display for TransferRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_bytes(self.0, f)?;
        f.write_str("/s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_are_humanized_with_one_decimal() {
        let rate: TransferRate = "1.23MiB/s".parse().unwrap();
        assert_eq!(rate.to_string(), "1.2 MiB/s");

        let rate: TransferRate = "512.00KiB/s".parse().unwrap();
        assert_eq!(rate.to_string(), "512.0 KiB/s");

        let rate: TransferRate = "900B/s".parse().unwrap();
        assert_eq!(rate.to_string(), "900.0 B/s");
    }

    #[test]
    fn unknown_rates_are_rejected() {
        assert!("Unknown B/s".parse::<TransferRate>().is_err());
        assert!("1.23MiB".parse::<TransferRate>().is_err());
        assert!("fast/s".parse::<TransferRate>().is_err());
    }

    #[test]
    fn ffmpeg_bitrates_are_converted_to_bytes() {
        let rate = TransferRate::from_kbits_per_sec(8192.0);
        assert_eq!(rate.to_string(), "1000.0 KiB/s");
    }

    #[test]
    fn approximate_sizes_are_accepted() {
        let size: ByteSize = "~ 10.00MiB".parse().unwrap();
        assert_eq!(size, ByteSize::from_bytes(10 * 1024 * 1024));
        assert_eq!(size.to_string(), "10.0 MiB");

        let size: ByteSize = "1.5GB".parse().unwrap();
        assert_eq!(size, ByteSize::from_bytes(1_500_000_000));
    }
}
