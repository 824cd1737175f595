//! Bucket keys and epoch-aligned bucketing

use crate::candle::Tick;
use crate::timeframe::Timeframe;
use serde::{Deserialize, Serialize};
use services_common::{Symbol, TimestampMs};
use std::fmt;

/// Earliest timestamp whose bucket start and end are representable
pub const MIN_BUCKETED_MS: i64 = i64::MIN + Timeframe::D1.duration_ms();

/// Latest timestamp whose bucket start and end are representable
pub const MAX_BUCKETED_MS: i64 = i64::MAX - Timeframe::D1.duration_ms();

/// Start of the bucket owning `timestamp`
///
/// Pure integer arithmetic on epoch milliseconds. `rem_euclid` keeps
/// pre-epoch timestamps aligned to the same grid. Saturates outside
/// `MIN_BUCKETED_MS..=MAX_BUCKETED_MS`; ticks out there are rejected by
/// `Tick::validate`.
#[must_use]
pub fn bucket_start(timestamp: TimestampMs, timeframe: Timeframe) -> TimestampMs {
    let ts = timestamp.as_millis();
    TimestampMs::from_millis(ts.saturating_sub(ts.rem_euclid(timeframe.duration_ms())))
}

/// One (symbol, timeframe) series; the unit of serialization in the engine
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    /// Instrument
    pub symbol: Symbol,
    /// Bar width
    pub timeframe: Timeframe,
}

impl SeriesKey {
    /// Create a series key
    #[must_use]
    pub const fn new(symbol: Symbol, timeframe: Timeframe) -> Self {
        Self { symbol, timeframe }
    }

    /// Key of the bucket starting at `start` within this series
    #[must_use]
    pub fn bucket(&self, start: TimestampMs) -> BucketKey {
        BucketKey {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            start,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.symbol, self.timeframe)
    }
}

/// (symbol, timeframe, bucket start): identifies exactly one candlestick
///
/// Field order matters: the derived `Ord` sorts by series then start,
/// which range queries over ordered maps rely on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    /// Instrument
    pub symbol: Symbol,
    /// Bar width
    pub timeframe: Timeframe,
    /// Inclusive bucket start
    pub start: TimestampMs,
}

impl BucketKey {
    /// Key of the bucket a tick falls into for `timeframe`
    #[must_use]
    pub fn for_tick(tick: &Tick, timeframe: Timeframe) -> Self {
        Self {
            symbol: tick.symbol.clone(),
            timeframe,
            start: bucket_start(tick.timestamp, timeframe),
        }
    }

    /// Exclusive bucket end
    #[must_use]
    pub fn end(&self) -> TimestampMs {
        TimestampMs::from_millis(
            self.start
                .as_millis()
                .saturating_add(self.timeframe.duration_ms()),
        )
    }

    /// Series this bucket belongs to
    #[must_use]
    pub fn series(&self) -> SeriesKey {
        SeriesKey::new(self.symbol.clone(), self.timeframe)
    }

    /// True if `timestamp` falls inside `[start, end)`
    #[must_use]
    pub fn contains(&self, timestamp: TimestampMs) -> bool {
        timestamp >= self.start && timestamp < self.end()
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.symbol, self.timeframe, self.start.as_millis())
    }
}
