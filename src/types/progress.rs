use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

/// Completion ratio of a transfer, in the `0..=1` range with two decimals.
///
/// Persisted as a decimal string (`"0"`, `"0.42"`, `"1"`).
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Progress(f64);

impl Progress {
    pub const DONE: Progress = Progress(1.0);

    /// Build from a ratio, clamping to `0..=1` and rounding to two decimals.
    pub fn from_ratio(ratio: f64) -> Self {
        let ratio = if ratio.is_finite() { ratio } else { 0.0 };
        Self((ratio.clamp(0.0, 1.0) * 100.0).round() / 100.0)
    }
}

impl FromStr for Progress {
    type Err = Box<dyn std::error::Error + Sync + Send>;

    /// Parse a percentage as printed by the download tool, e.g. `"42.3%"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let num = s.trim().trim_end_matches('%').trim();
        let percent: f64 = num.parse()?;
        if !percent.is_finite() {
            return Err(Box::from("Percentage is not a finite number"));
        }
        Ok(Self::from_ratio(percent / 100.0))
    }
}

impl Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Progress> for String {
    fn from(p: Progress) -> Self {
        p.to_string()
    }
}

impl TryFrom<String> for Progress {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.trim()
            .parse::<f64>()
            .map(Self::from_ratio)
            .map_err(|e| format!("invalid progress '{s}': {e}"))
    }
}
