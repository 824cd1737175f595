//! Aggregation engine: per-series bucket state machine
//!
//! Each (symbol, timeframe) series owns one slot behind its own mutex, so
//! ticks for one series are folded one at a time while different series
//! proceed in parallel. Sealed bars leave the engine over an unbounded
//! channel; the send happens under the slot lock, which is what keeps bars
//! of one series in bucket order downstream.

use crate::bucket::{BucketKey, SeriesKey};
use crate::candle::{BarAccumulator, Candlestick, FoldOutcome, Tick};
use crate::config::EngineConfig;
use crate::error::{ChartError, ChartResult};
use crate::events::{EngineEvent, EventSink};
use crate::metrics::{ChartMetrics, SealCause};
use crate::timeframe::Timeframe;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use services_common::TimestampMs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace};

/// What happens to open buckets on shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Drop open buckets unsealed
    Discard,
    /// Seal open buckets and hand them to persistence
    FlushOpen,
}

/// Observable phase of one series
///
/// Finalizing (seal plus handoff) happens entirely under the slot lock and
/// is never observed from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesPhase {
    /// No open bucket
    NoActiveBucket,
    /// One bucket open
    Accumulating {
        /// Start of the open bucket
        bucket_start: TimestampMs,
    },
}

/// Per-tick accounting across all configured timeframes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Series the tick was folded into
    pub folded: usize,
    /// Series that had already seen the tick's trade id
    pub duplicates: usize,
    /// Series where the tick was late
    pub dropped_late: usize,
    /// Buckets sealed by this tick
    pub sealed: usize,
}

#[derive(Debug)]
enum SeriesState {
    NoActiveBucket,
    Accumulating {
        acc: BarAccumulator,
        last_tick_at: Instant,
    },
}

#[derive(Debug)]
struct SeriesSlot {
    state: SeriesState,
    last_sealed: Option<TimestampMs>,
}

impl SeriesSlot {
    const fn new() -> Self {
        Self {
            state: SeriesState::NoActiveBucket,
            last_sealed: None,
        }
    }

    fn open_start(&self) -> Option<TimestampMs> {
        match &self.state {
            SeriesState::Accumulating { acc, .. } => Some(acc.key().start),
            SeriesState::NoActiveBucket => None,
        }
    }

    fn open(&mut self, key: BucketKey, tick: &Tick, now: Instant) {
        self.state = SeriesState::Accumulating {
            acc: BarAccumulator::open(key, tick),
            last_tick_at: now,
        };
    }

    /// Seal the open bucket, if any, leaving no active bucket
    fn seal_open(&mut self) -> ChartResult<Option<Candlestick>> {
        match std::mem::replace(&mut self.state, SeriesState::NoActiveBucket) {
            SeriesState::NoActiveBucket => Ok(None),
            SeriesState::Accumulating { mut acc, .. } => {
                let bar = acc.seal()?;
                self.last_sealed = Some(bar.key.start);
                Ok(Some(bar))
            }
        }
    }

    fn idle_since(&self) -> Option<Instant> {
        match &self.state {
            SeriesState::Accumulating { last_tick_at, .. } => Some(*last_tick_at),
            SeriesState::NoActiveBucket => None,
        }
    }
}

/// Turns ticks into sealed, strictly ordered bars per series
pub struct AggregationEngine {
    timeframes: Vec<Timeframe>,
    lateness: Duration,
    slots: DashMap<SeriesKey, Arc<Mutex<SeriesSlot>>>,
    sealed_tx: RwLock<Option<mpsc::UnboundedSender<Candlestick>>>,
    shutting_down: AtomicBool,
    metrics: Arc<ChartMetrics>,
    events: EventSink,
}

impl std::fmt::Debug for AggregationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregationEngine")
            .field("timeframes", &self.timeframes)
            .field("lateness", &self.lateness)
            .field("series", &self.slots.len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl AggregationEngine {
    /// Create an engine handing sealed bars to `sealed_tx`
    #[must_use]
    pub fn new(
        config: &EngineConfig,
        sealed_tx: mpsc::UnboundedSender<Candlestick>,
        metrics: Arc<ChartMetrics>,
        events: EventSink,
    ) -> Self {
        Self {
            timeframes: config.timeframes.clone(),
            lateness: config.lateness_tolerance(),
            slots: DashMap::new(),
            sealed_tx: RwLock::new(Some(sealed_tx)),
            shutting_down: AtomicBool::new(false),
            metrics,
            events,
        }
    }

    /// Timeframes aggregated for every symbol
    #[must_use]
    pub fn timeframes(&self) -> &[Timeframe] {
        &self.timeframes
    }

    /// True once shutdown has begun
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn slot(&self, series: &SeriesKey) -> Arc<Mutex<SeriesSlot>> {
        if let Some(slot) = self.slots.get(series) {
            return Arc::clone(slot.value());
        }
        Arc::clone(
            self.slots
                .entry(series.clone())
                .or_insert_with(|| Arc::new(Mutex::new(SeriesSlot::new())))
                .value(),
        )
    }

    fn hand_off(&self, bar: Candlestick, cause: SealCause) -> ChartResult<()> {
        let key = bar.key.clone();
        let sent = match self.sealed_tx.read().as_ref() {
            Some(tx) => tx.send(bar).is_ok(),
            None => false,
        };
        if !sent {
            return Err(ChartError::EngineShuttingDown);
        }
        self.metrics.record_sealed(cause);
        debug!(
            symbol = %key.symbol,
            timeframe = %key.timeframe,
            bucket_start = key.start.as_millis(),
            ?cause,
            "Bucket sealed"
        );
        Ok(())
    }

    fn drop_late(&self, tick: &Tick, key: &BucketKey, current: TimestampMs) {
        self.metrics.record_late_tick();
        self.events.emit(EngineEvent::DroppedLateTick {
            symbol: key.symbol.clone(),
            timeframe: key.timeframe,
            tick_timestamp: tick.timestamp,
            tick_bucket: key.start,
            current_bucket: current,
        });
        trace!(
            symbol = %key.symbol,
            timeframe = %key.timeframe,
            bucket_start = key.start.as_millis(),
            current_bucket = current.as_millis(),
            "Late tick dropped"
        );
    }

    /// Fold one tick into every configured timeframe
    ///
    /// A tick for a bucket newer than the open one seals the open bucket
    /// first. A tick for an older bucket is dropped and signalled, never
    /// folded. Errors: `InvalidRequest` for a malformed tick,
    /// `EngineShuttingDown` after shutdown began, `Logic` on an internal
    /// invariant violation.
    pub fn ingest(&self, tick: &Tick) -> ChartResult<IngestReport> {
        if self.is_shutting_down() {
            return Err(ChartError::EngineShuttingDown);
        }
        tick.validate()?;

        let now = Instant::now();
        let mut report = IngestReport::default();
        for &timeframe in &self.timeframes {
            let series = SeriesKey::new(tick.symbol.clone(), timeframe);
            let key = BucketKey::for_tick(tick, timeframe);
            let slot = self.slot(&series);
            let mut slot = slot.lock();
            if self.is_shutting_down() {
                return Err(ChartError::EngineShuttingDown);
            }
            self.apply(&mut slot, key, tick, now, &mut report)?;
        }

        if report.folded > 0 {
            self.metrics.record_tick();
        }
        Ok(report)
    }

    fn apply(
        &self,
        slot: &mut SeriesSlot,
        key: BucketKey,
        tick: &Tick,
        now: Instant,
        report: &mut IngestReport,
    ) -> ChartResult<()> {
        match slot.open_start() {
            Some(open) if key.start == open => {
                if let SeriesState::Accumulating { acc, last_tick_at } = &mut slot.state {
                    match acc.fold(tick)? {
                        FoldOutcome::Applied => {
                            *last_tick_at = now;
                            report.folded += 1;
                        }
                        FoldOutcome::Duplicate => {
                            self.metrics.record_duplicate_tick();
                            report.duplicates += 1;
                        }
                    }
                }
            }
            Some(open) if key.start < open => {
                self.drop_late(tick, &key, open);
                report.dropped_late += 1;
            }
            Some(_) => {
                if let Some(bar) = slot.seal_open()? {
                    self.hand_off(bar, SealCause::Rollover)?;
                    report.sealed += 1;
                }
                slot.open(key, tick, now);
                report.folded += 1;
            }
            None => match slot.last_sealed {
                Some(sealed) if key.start <= sealed => {
                    self.drop_late(tick, &key, sealed);
                    report.dropped_late += 1;
                }
                _ => {
                    slot.open(key, tick, now);
                    report.folded += 1;
                }
            },
        }
        Ok(())
    }

    fn all_slots(&self) -> Vec<Arc<Mutex<SeriesSlot>>> {
        self.slots.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Seal every bucket that has seen no tick for the lateness tolerance
    pub fn sweep_idle(&self, now: Instant) -> ChartResult<usize> {
        let mut sealed = 0;
        for slot in self.all_slots() {
            let mut slot = slot.lock();
            let idle = slot
                .idle_since()
                .is_some_and(|last| now.saturating_duration_since(last) >= self.lateness);
            if !idle {
                continue;
            }
            if let Some(bar) = slot.seal_open()? {
                self.hand_off(bar, SealCause::Sweep)?;
                sealed += 1;
            }
        }
        if sealed > 0 {
            debug!(sealed, "Idle sweep sealed buckets");
        }
        Ok(sealed)
    }

    /// Refuse new ticks, settle open buckets, then close the handoff channel
    ///
    /// Returns the number of open buckets sealed (`FlushOpen`) or discarded
    /// (`Discard`).
    pub fn begin_shutdown(&self, mode: ShutdownMode) -> ChartResult<usize> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }

        let mut settled = 0;
        for slot in self.all_slots() {
            let mut slot = slot.lock();
            match mode {
                ShutdownMode::FlushOpen => {
                    if let Some(bar) = slot.seal_open()? {
                        self.hand_off(bar, SealCause::Shutdown)?;
                        settled += 1;
                    }
                }
                ShutdownMode::Discard => {
                    if slot.open_start().is_some() {
                        slot.state = SeriesState::NoActiveBucket;
                        settled += 1;
                    }
                }
            }
        }

        self.sealed_tx.write().take();
        info!(?mode, settled, "Aggregation engine stopped");
        Ok(settled)
    }

    /// Phase of one series, `None` if it never saw a tick
    #[must_use]
    pub fn phase(&self, series: &SeriesKey) -> Option<SeriesPhase> {
        let slot = Arc::clone(self.slots.get(series)?.value());
        let phase = match slot.lock().open_start() {
            Some(bucket_start) => SeriesPhase::Accumulating { bucket_start },
            None => SeriesPhase::NoActiveBucket,
        };
        Some(phase)
    }

    /// Current state of the open bar of one series
    #[must_use]
    pub fn open_bar(&self, series: &SeriesKey) -> Option<Candlestick> {
        let slot = Arc::clone(self.slots.get(series)?.value());
        let slot = slot.lock();
        match &slot.state {
            SeriesState::Accumulating { acc, .. } => Some(acc.snapshot().clone()),
            SeriesState::NoActiveBucket => None,
        }
    }

    /// Series seen so far
    #[must_use]
    pub fn series_count(&self) -> usize {
        self.slots.len()
    }

    /// Run the idle sweep every `interval` until `shutdown` flips
    ///
    /// A `Logic` error ends the task with that error.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<ChartResult<()>> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match engine.sweep_idle(Instant::now()) {
                            Ok(_) | Err(ChartError::EngineShuttingDown) => {}
                            Err(e) => {
                                error!(error = %e, "Idle sweep failed");
                                if e.is_fatal() {
                                    return Err(e);
                                }
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Idle sweeper stopped");
            Ok(())
        })
    }
}
