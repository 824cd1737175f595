//! Ticks, candlesticks and the per-bucket accumulator

use crate::bucket::{BucketKey, MAX_BUCKETED_MS, MIN_BUCKETED_MS, bucket_start};
use crate::error::{ChartError, ChartResult};
use crate::timeframe::Timeframe;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use services_common::{Px, Qty, Symbol, TimestampMs};

/// Raw trade as delivered by the ingestion source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    /// Instrument
    pub symbol: Symbol,
    /// Exchange timestamp
    pub timestamp: TimestampMs,
    /// Trade price
    pub price: Px,
    /// Trade size
    pub volume: Qty,
    /// Exchange trade id, used to discard redelivered trades within a bucket
    pub trade_id: Option<u64>,
}

impl Tick {
    /// Create a tick without a trade id
    #[must_use]
    pub const fn new(symbol: Symbol, timestamp: TimestampMs, price: Px, volume: Qty) -> Self {
        Self {
            symbol,
            timestamp,
            price,
            volume,
            trade_id: None,
        }
    }

    /// Attach an exchange trade id
    #[must_use]
    pub const fn with_trade_id(mut self, trade_id: u64) -> Self {
        self.trade_id = Some(trade_id);
        self
    }

    /// Reject ticks no bar should ever contain
    pub fn validate(&self) -> ChartResult<()> {
        if !(MIN_BUCKETED_MS..=MAX_BUCKETED_MS).contains(&self.timestamp.as_millis()) {
            return Err(ChartError::InvalidRequest(format!(
                "Timestamp {} out of range for {}",
                self.timestamp.as_millis(),
                self.symbol
            )));
        }
        if !self.price.is_positive() {
            return Err(ChartError::InvalidRequest(format!(
                "Non-positive price {} for {}",
                self.price, self.symbol
            )));
        }
        if self.volume.is_negative() {
            return Err(ChartError::InvalidRequest(format!(
                "Negative volume {} for {}",
                self.volume, self.symbol
            )));
        }
        Ok(())
    }
}

/// OHLCV bar for one bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candlestick {
    /// Bucket this bar covers
    pub key: BucketKey,
    /// Price of the first folded tick
    pub open: Px,
    /// Highest folded price
    pub high: Px,
    /// Lowest folded price
    pub low: Px,
    /// Price of the most recently folded tick
    pub close: Px,
    /// Sum of folded volumes
    pub volume: Qty,
    /// Number of folded ticks
    pub tick_count: u64,
}

impl Candlestick {
    /// Single-tick bar
    fn from_first_tick(key: BucketKey, tick: &Tick) -> Self {
        Self {
            key,
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.volume,
            tick_count: 1,
        }
    }

    /// Instrument
    #[must_use]
    pub const fn symbol(&self) -> &Symbol {
        &self.key.symbol
    }

    /// Bar width
    #[must_use]
    pub const fn timeframe(&self) -> Timeframe {
        self.key.timeframe
    }

    /// Bucket start
    #[must_use]
    pub const fn start(&self) -> TimestampMs {
        self.key.start
    }

    /// True if the OHLC fields describe a possible bar
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.tick_count > 0
            && self.low <= self.high
            && (self.low..=self.high).contains(&self.open)
            && (self.low..=self.high).contains(&self.close)
            && !self.volume.is_negative()
    }
}

/// Result of folding one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOutcome {
    /// Tick changed the bar
    Applied,
    /// Tick carried a trade id already folded into this bucket
    Duplicate,
}

/// In-progress candlestick for one bucket
///
/// Exactly one owner mutates an accumulator. Once sealed it refuses further
/// folds; a fold after seal means rollover detection upstream is broken.
#[derive(Debug)]
pub struct BarAccumulator {
    candle: Candlestick,
    seen_trades: FxHashSet<u64>,
    sealed: bool,
}

impl BarAccumulator {
    /// Open a bucket with its first tick
    #[must_use]
    pub fn open(key: BucketKey, first: &Tick) -> Self {
        let mut seen_trades = FxHashSet::default();
        if let Some(id) = first.trade_id {
            seen_trades.insert(id);
        }
        Self {
            candle: Candlestick::from_first_tick(key, first),
            seen_trades,
            sealed: false,
        }
    }

    /// Bucket owned by this accumulator
    #[must_use]
    pub const fn key(&self) -> &BucketKey {
        &self.candle.key
    }

    /// Current (unsealed) state of the bar
    #[must_use]
    pub const fn snapshot(&self) -> &Candlestick {
        &self.candle
    }

    /// True once [`BarAccumulator::seal`] has been called
    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Fold a tick into the bar
    ///
    /// Close follows arrival order, not tick timestamps.
    pub fn fold(&mut self, tick: &Tick) -> ChartResult<FoldOutcome> {
        if self.sealed {
            return Err(ChartError::Logic(format!(
                "fold into sealed bucket {}",
                self.candle.key
            )));
        }
        let key = &self.candle.key;
        if tick.symbol != key.symbol || bucket_start(tick.timestamp, key.timeframe) != key.start {
            return Err(ChartError::Logic(format!(
                "tick {}@{} routed to bucket {}",
                tick.symbol,
                tick.timestamp.as_millis(),
                key
            )));
        }
        if let Some(id) = tick.trade_id {
            if !self.seen_trades.insert(id) {
                return Ok(FoldOutcome::Duplicate);
            }
        }

        let bar = &mut self.candle;
        bar.high = bar.high.max(tick.price);
        bar.low = bar.low.min(tick.price);
        bar.close = tick.price;
        bar.volume = bar.volume.saturating_add(tick.volume);
        bar.tick_count += 1;
        Ok(FoldOutcome::Applied)
    }

    /// Seal the bar and return its final value
    pub fn seal(&mut self) -> ChartResult<Candlestick> {
        if self.sealed {
            return Err(ChartError::Logic(format!(
                "bucket {} sealed twice",
                self.candle.key
            )));
        }
        self.sealed = true;
        self.seen_trades = FxHashSet::default();
        Ok(self.candle.clone())
    }
}
