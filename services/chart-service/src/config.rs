//! Configuration for the chart service

use crate::error::{ChartError, ChartResult};
use crate::session::BackpressurePolicy;
use crate::timeframe::Timeframe;
use serde::{Deserialize, Serialize};
use services_common::BYTES_PER_MB;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment prefix for overrides, e.g. `CHART__ENGINE__LATENESS_TOLERANCE_MS`
pub const ENV_PREFIX: &str = "CHART";

/// Chart service configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChartConfig {
    /// Aggregation engine configuration
    pub engine: EngineConfig,
    /// Persistence configuration
    pub persistence: PersistenceConfig,
    /// Subscription configuration
    pub subscriptions: SubscriptionConfig,
}

/// Aggregation engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Timeframes aggregated for every symbol
    pub timeframes: Vec<Timeframe>,
    /// Idle time after the last tick before an open bucket is sealed
    pub lateness_tolerance_ms: u64,
    /// Period of the idle-bucket sweep
    pub sweep_interval_ms: u64,
    /// Number of ingest workers
    pub ingest_workers: usize,
    /// Bounded queue length per ingest worker
    pub ingest_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeframes: vec![Timeframe::M1, Timeframe::M5],
            lateness_tolerance_ms: 5_000,
            sweep_interval_ms: 1_000,
            ingest_workers: 4,
            ingest_queue_capacity: 10_000,
        }
    }
}

impl EngineConfig {
    /// Lateness tolerance as a duration
    #[must_use]
    pub const fn lateness_tolerance(&self) -> Duration {
        Duration::from_millis(self.lateness_tolerance_ms)
    }

    /// Sweep interval as a duration
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-process map, lost on restart
    #[default]
    Memory,
    /// Segmented on-disk journal
    Journal,
}

/// Persistence configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Backend used for finalized bars
    pub backend: StoreBackend,
    /// Journal directory, required for the journal backend
    pub journal_dir: Option<PathBuf>,
    /// Segment rotation threshold
    pub segment_size_bytes: u64,
    /// Retry policy for storage failures
    pub retry: RetryConfig,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            journal_dir: None,
            segment_size_bytes: 64 * BYTES_PER_MB,
            retry: RetryConfig::default(),
        }
    }
}

/// Bounded exponential backoff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_backoff_ms: u64,
    /// Delay cap
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 50,
            max_backoff_ms: 5_000,
        }
    }
}

/// Subscription configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Bounded queue length per session
    pub queue_capacity: usize,
    /// Policy applied when a session queue is full
    pub backpressure: BackpressurePolicy,
    /// How long a queue may stay full under `disconnect_slow`
    pub overrun_grace_ms: u64,
    /// Upper bound on symbols per subscribe call
    pub max_symbols_per_subscription: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1_024,
            backpressure: BackpressurePolicy::DropOldest,
            overrun_grace_ms: 2_000,
            max_symbols_per_subscription: 100,
        }
    }
}

impl SubscriptionConfig {
    /// Overrun grace period as a duration
    #[must_use]
    pub const fn overrun_grace(&self) -> Duration {
        Duration::from_millis(self.overrun_grace_ms)
    }
}

impl ChartConfig {
    /// Load configuration from an optional TOML file plus `CHART__*` overrides
    pub fn load(path: Option<&Path>) -> ChartResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with
    pub fn validate(&self) -> ChartResult<()> {
        let engine = &self.engine;
        if engine.timeframes.is_empty() {
            return Err(invalid("engine.timeframes must not be empty"));
        }
        let mut sorted = engine.timeframes.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != engine.timeframes.len() {
            return Err(invalid("engine.timeframes contains duplicates"));
        }
        if engine.lateness_tolerance_ms == 0 || engine.sweep_interval_ms == 0 {
            return Err(invalid(
                "engine.lateness_tolerance_ms and engine.sweep_interval_ms must be positive",
            ));
        }
        if engine.ingest_workers == 0 || engine.ingest_queue_capacity == 0 {
            return Err(invalid(
                "engine.ingest_workers and engine.ingest_queue_capacity must be positive",
            ));
        }

        let persistence = &self.persistence;
        if persistence.backend == StoreBackend::Journal && persistence.journal_dir.is_none() {
            return Err(invalid("persistence.journal_dir is required for the journal backend"));
        }
        if persistence.segment_size_bytes < 4_096 {
            return Err(invalid("persistence.segment_size_bytes must be at least 4096"));
        }
        let retry = &persistence.retry;
        if retry.max_attempts == 0 {
            return Err(invalid("persistence.retry.max_attempts must be positive"));
        }
        if retry.max_backoff_ms < retry.initial_backoff_ms {
            return Err(invalid(
                "persistence.retry.max_backoff_ms must not be below initial_backoff_ms",
            ));
        }

        let subs = &self.subscriptions;
        if subs.queue_capacity == 0 || subs.max_symbols_per_subscription == 0 {
            return Err(invalid(
                "subscriptions.queue_capacity and max_symbols_per_subscription must be positive",
            ));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> ChartError {
    ChartError::Config(msg.to_string())
}
