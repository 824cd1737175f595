//! Aggregation timeframes

use crate::error::ChartError;
use serde::{Deserialize, Serialize};
use services_common::{MILLIS_PER_DAY, MILLIS_PER_HOUR, MILLIS_PER_MIN, MILLIS_PER_SEC};
use std::fmt;
use std::str::FromStr;

/// Fixed-width bar duration
///
/// Buckets are aligned to epoch multiples of the duration, never to a
/// trading session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    /// 1 minute bars
    #[serde(rename = "1m")]
    M1,
    /// 5 minute bars
    #[serde(rename = "5m")]
    M5,
    /// 15 minute bars
    #[serde(rename = "15m")]
    M15,
    /// 30 minute bars
    #[serde(rename = "30m")]
    M30,
    /// 1 hour bars
    #[serde(rename = "1h")]
    H1,
    /// 4 hour bars
    #[serde(rename = "4h")]
    H4,
    /// Daily bars
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    /// Every supported timeframe, shortest first
    pub const ALL: [Self; 7] = [
        Self::M1,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H4,
        Self::D1,
    ];

    /// Duration in milliseconds
    #[must_use]
    pub const fn duration_ms(&self) -> i64 {
        match self {
            Self::M1 => MILLIS_PER_MIN,
            Self::M5 => 5 * MILLIS_PER_MIN,
            Self::M15 => 15 * MILLIS_PER_MIN,
            Self::M30 => 30 * MILLIS_PER_MIN,
            Self::H1 => MILLIS_PER_HOUR,
            Self::H4 => 4 * MILLIS_PER_HOUR,
            Self::D1 => MILLIS_PER_DAY,
        }
    }

    /// Stable numeric code (duration in seconds) used in persisted records
    #[must_use]
    pub const fn code(&self) -> u32 {
        // SAFETY: largest duration (1 day) in seconds fits in u32
        (self.duration_ms() / MILLIS_PER_SEC) as u32
    }

    /// Reverse of [`Timeframe::code`]
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|tf| tf.code() == code)
    }

    /// Short label such as `1m` or `4h`
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }
}

impl FromStr for Timeframe {
    type Err = ChartError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|tf| {
                tf.label() == normalized
                    || format!("{tf:?}").eq_ignore_ascii_case(&normalized)
            })
            .ok_or_else(|| ChartError::InvalidRequest(format!("Unknown timeframe: {s}")))
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
