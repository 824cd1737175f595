//! Deduplicating gateway in front of the bar store

use super::{CandleStore, InsertOutcome};
use crate::bucket::{BucketKey, SeriesKey};
use crate::candle::Candlestick;
use crate::error::{ChartError, ChartResult};
use crate::metrics::ChartMetrics;
use services_common::TimestampMs;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Gateway that validates bars, delegates to the backend and counts outcomes
///
/// `AlreadyExists` is an expected answer (restart, replay or a redundant
/// ingestion path), not a failure.
#[derive(Clone)]
pub struct DedupStore {
    store: Arc<dyn CandleStore>,
    metrics: Arc<ChartMetrics>,
}

impl std::fmt::Debug for DedupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupStore")
            .field("backend", &self.store.backend_name())
            .finish()
    }
}

impl DedupStore {
    /// Wrap a backend
    #[must_use]
    pub fn new(store: Arc<dyn CandleStore>, metrics: Arc<ChartMetrics>) -> Self {
        Self { store, metrics }
    }

    /// Persist a sealed bar unless its key is already stored
    #[instrument(skip_all, fields(key = %bar.key))]
    pub async fn insert_if_new(&self, bar: &Candlestick) -> ChartResult<InsertOutcome> {
        if !bar.is_consistent() {
            return Err(ChartError::Logic(format!(
                "inconsistent bar {}: o={} h={} l={} c={} n={}",
                bar.key, bar.open, bar.high, bar.low, bar.close, bar.tick_count
            )));
        }

        match self.store.insert_if_new(bar).await {
            Ok(InsertOutcome::Inserted) => {
                self.metrics.record_inserted();
                debug!("Bar persisted");
                Ok(InsertOutcome::Inserted)
            }
            Ok(InsertOutcome::AlreadyExists) => {
                self.metrics.record_duplicate_bar();
                debug!("Bar already persisted");
                Ok(InsertOutcome::AlreadyExists)
            }
            Err(e) => {
                warn!(backend = self.store.backend_name(), error = %e, "Bar insert failed");
                Err(e)
            }
        }
    }

    /// True if the bar for `key` is already stored
    pub async fn exists(&self, key: &BucketKey) -> ChartResult<bool> {
        self.store.exists(key).await
    }

    /// Stored bars of one series in `[from, to)`
    pub async fn query_range(
        &self,
        series: &SeriesKey,
        from: TimestampMs,
        to: TimestampMs,
    ) -> ChartResult<Vec<Candlestick>> {
        self.store.query_range(series, from, to).await
    }

    /// Probe the backend
    pub async fn health_check(&self) -> ChartResult<()> {
        self.store.health_check().await
    }

    /// Backend name
    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }
}
