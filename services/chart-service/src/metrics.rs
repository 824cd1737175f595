//! Prometheus counters for one chart service instance
//!
//! Each instance owns its own `Registry`; nothing is registered globally so
//! several services (or tests) can run in one process.

use crate::error::ChartResult;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

/// Why a bucket was sealed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealCause {
    /// A tick for a later bucket arrived
    Rollover,
    /// Lateness tolerance elapsed with no tick
    Sweep,
    /// Engine flushed open buckets on shutdown
    Shutdown,
}

impl SealCause {
    const fn label(self) -> &'static str {
        match self {
            Self::Rollover => "rollover",
            Self::Sweep => "sweep",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Counters shared by the engine, pipeline and hub
pub struct ChartMetrics {
    registry: Registry,
    ticks_ingested: IntCounter,
    ticks_duplicate: IntCounter,
    ticks_dropped_late: IntCounter,
    bars_sealed: IntCounterVec,
    bars_inserted: IntCounter,
    bars_duplicate: IntCounter,
    storage_retries: IntCounter,
    persistence_failures: IntCounter,
    bars_published: IntCounter,
    bars_delivered: IntCounter,
    bars_evicted: IntCounter,
    bars_rejected: IntCounter,
    subscriber_overruns: IntCounter,
    sessions_opened: IntCounter,
    sessions_closed: IntCounter,
    active_sessions: IntGauge,
}

/// Point-in-time copy of every counter
#[allow(missing_docs)] // fields mirror the counter names
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub ticks_ingested: u64,
    pub ticks_duplicate: u64,
    pub ticks_dropped_late: u64,
    pub bars_sealed_rollover: u64,
    pub bars_sealed_sweep: u64,
    pub bars_sealed_shutdown: u64,
    pub bars_inserted: u64,
    pub bars_duplicate: u64,
    pub storage_retries: u64,
    pub persistence_failures: u64,
    pub bars_published: u64,
    pub bars_delivered: u64,
    pub bars_evicted: u64,
    pub bars_rejected: u64,
    pub subscriber_overruns: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub active_sessions: i64,
}

fn counter(registry: &Registry, name: &str, help: &str) -> ChartResult<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace("chart"))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl ChartMetrics {
    /// Create and register all counters
    pub fn new() -> ChartResult<Self> {
        let registry = Registry::new();
        let bars_sealed = IntCounterVec::new(
            Opts::new("bars_sealed_total", "Bars sealed, by cause").namespace("chart"),
            &["cause"],
        )?;
        registry.register(Box::new(bars_sealed.clone()))?;
        let active_sessions = IntGauge::with_opts(
            Opts::new("active_sessions", "Currently registered sessions").namespace("chart"),
        )?;
        registry.register(Box::new(active_sessions.clone()))?;

        Ok(Self {
            ticks_ingested: counter(&registry, "ticks_ingested_total", "Ticks folded")?,
            ticks_duplicate: counter(
                &registry,
                "ticks_duplicate_total",
                "Redelivered ticks ignored",
            )?,
            ticks_dropped_late: counter(
                &registry,
                "ticks_dropped_late_total",
                "Ticks for already rolled-over buckets",
            )?,
            bars_sealed,
            bars_inserted: counter(&registry, "bars_inserted_total", "Bars newly persisted")?,
            bars_duplicate: counter(
                &registry,
                "bars_duplicate_total",
                "Bars already present in storage",
            )?,
            storage_retries: counter(&registry, "storage_retries_total", "Storage retries")?,
            persistence_failures: counter(
                &registry,
                "persistence_failures_total",
                "Bars dropped after the retry budget",
            )?,
            bars_published: counter(&registry, "bars_published_total", "Bars fanned out")?,
            bars_delivered: counter(
                &registry,
                "bars_delivered_total",
                "Bars enqueued on a session",
            )?,
            bars_evicted: counter(
                &registry,
                "bars_evicted_total",
                "Bars evicted by drop-oldest",
            )?,
            bars_rejected: counter(
                &registry,
                "bars_rejected_total",
                "Bars refused by a full disconnect-slow session",
            )?,
            subscriber_overruns: counter(
                &registry,
                "subscriber_overruns_total",
                "Sessions closed for overrun",
            )?,
            sessions_opened: counter(&registry, "sessions_opened_total", "Sessions registered")?,
            sessions_closed: counter(&registry, "sessions_closed_total", "Sessions closed")?,
            active_sessions,
            registry,
        })
    }

    /// Tick folded into a bar
    pub fn record_tick(&self) {
        self.ticks_ingested.inc();
    }

    /// Redelivered tick ignored
    pub fn record_duplicate_tick(&self) {
        self.ticks_duplicate.inc();
    }

    /// Tick dropped as late
    pub fn record_late_tick(&self) {
        self.ticks_dropped_late.inc();
    }

    /// Bucket sealed
    pub fn record_sealed(&self, cause: SealCause) {
        self.bars_sealed.with_label_values(&[cause.label()]).inc();
    }

    /// Bar newly persisted
    pub fn record_inserted(&self) {
        self.bars_inserted.inc();
    }

    /// Bar already in storage
    pub fn record_duplicate_bar(&self) {
        self.bars_duplicate.inc();
    }

    /// Storage call retried
    pub fn record_retry(&self) {
        self.storage_retries.inc();
    }

    /// Bar dropped after the retry budget
    pub fn record_persistence_failure(&self) {
        self.persistence_failures.inc();
    }

    /// Bar handed to the hub
    pub fn record_published(&self) {
        self.bars_published.inc();
    }

    /// Bar enqueued on one session
    pub fn record_delivered(&self) {
        self.bars_delivered.inc();
    }

    /// Queue head evicted
    pub fn record_evicted(&self) {
        self.bars_evicted.inc();
    }

    /// Bar refused by a full session
    pub fn record_rejected(&self) {
        self.bars_rejected.inc();
    }

    /// Session closed for overrun
    pub fn record_overrun(&self) {
        self.subscriber_overruns.inc();
    }

    /// Session registered
    pub fn record_session_opened(&self) {
        self.sessions_opened.inc();
        self.active_sessions.inc();
    }

    /// Session closed
    pub fn record_session_closed(&self) {
        self.sessions_closed.inc();
        self.active_sessions.dec();
    }

    /// Copy every counter
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let sealed = |cause: SealCause| self.bars_sealed.with_label_values(&[cause.label()]).get();
        MetricsSnapshot {
            ticks_ingested: self.ticks_ingested.get(),
            ticks_duplicate: self.ticks_duplicate.get(),
            ticks_dropped_late: self.ticks_dropped_late.get(),
            bars_sealed_rollover: sealed(SealCause::Rollover),
            bars_sealed_sweep: sealed(SealCause::Sweep),
            bars_sealed_shutdown: sealed(SealCause::Shutdown),
            bars_inserted: self.bars_inserted.get(),
            bars_duplicate: self.bars_duplicate.get(),
            storage_retries: self.storage_retries.get(),
            persistence_failures: self.persistence_failures.get(),
            bars_published: self.bars_published.get(),
            bars_delivered: self.bars_delivered.get(),
            bars_evicted: self.bars_evicted.get(),
            bars_rejected: self.bars_rejected.get(),
            subscriber_overruns: self.subscriber_overruns.get(),
            sessions_opened: self.sessions_opened.get(),
            sessions_closed: self.sessions_closed.get(),
            active_sessions: self.active_sessions.get(),
        }
    }

    /// Render in the Prometheus text exposition format
    pub fn render(&self) -> ChartResult<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl std::fmt::Debug for ChartMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChartMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
