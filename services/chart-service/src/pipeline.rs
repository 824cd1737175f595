//! Persist-then-publish pipeline for sealed bars
//!
//! A dispatcher routes each sealed bar to a worker task owned by its
//! series. Workers persist bars one at a time, so a series publishes in
//! the order its bars were sealed, and a series stuck in retries never
//! delays another.

use crate::bucket::SeriesKey;
use crate::candle::Candlestick;
use crate::config::RetryConfig;
use crate::error::{ChartError, ChartResult};
use crate::events::{EngineEvent, EventSink};
use crate::hub::SubscriptionHub;
use crate::metrics::ChartMetrics;
use crate::storage::{DedupStore, InsertOutcome};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, warn};

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_backoff: Duration,
    /// Delay cap
    pub max_backoff: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based)
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1_u32 << exp)
            .min(self.max_backoff)
    }
}

/// Final outcome counts of a pipeline run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    /// Bars inserted and published
    pub published: u64,
    /// Bars already stored, not published
    pub duplicates: u64,
    /// Bars dropped after the retry budget
    pub failed: u64,
}

impl PipelineSummary {
    fn merge(&mut self, other: Self) {
        self.published += other.published;
        self.duplicates += other.duplicates;
        self.failed += other.failed;
    }
}

#[derive(Clone)]
struct Worker {
    store: DedupStore,
    hub: SubscriptionHub,
    retry: RetryPolicy,
    metrics: Arc<ChartMetrics>,
    events: EventSink,
}

impl Worker {
    async fn run(
        self,
        series: SeriesKey,
        mut rx: mpsc::UnboundedReceiver<Candlestick>,
    ) -> ChartResult<PipelineSummary> {
        let mut summary = PipelineSummary::default();
        while let Some(bar) = rx.recv().await {
            match self.persist(&bar).await? {
                Some(InsertOutcome::Inserted) => {
                    self.hub.publish(&bar);
                    summary.published += 1;
                }
                Some(InsertOutcome::AlreadyExists) => summary.duplicates += 1,
                None => summary.failed += 1,
            }
        }
        debug!(%series, ?summary, "Persistence worker finished");
        Ok(summary)
    }

    /// `None` once the retry budget is spent; `Err` only for fatal errors
    async fn persist(&self, bar: &Candlestick) -> ChartResult<Option<InsertOutcome>> {
        let mut attempt = 1;
        loop {
            let err = match self.store.insert_if_new(bar).await {
                Ok(outcome) => return Ok(Some(outcome)),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => e,
            };

            if err.is_retryable() && attempt < self.retry.max_attempts {
                let delay = self.retry.backoff(attempt);
                self.metrics.record_retry();
                warn!(
                    key = %bar.key,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Storage unavailable, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            let failure = ChartError::PersistenceFailed {
                key: bar.key.clone(),
                attempts: attempt,
                reason: err.to_string(),
            };
            error!(error = %failure, "Dropping sealed bar");
            self.metrics.record_persistence_failure();
            self.events.emit(EngineEvent::PersistenceFailed {
                key: bar.key.clone(),
                attempts: attempt,
                reason: err.to_string(),
            });
            return Ok(None);
        }
    }
}

/// Handle to the running pipeline
#[derive(Debug)]
pub struct PersistencePipeline {
    dispatcher: JoinHandle<ChartResult<PipelineSummary>>,
}

impl PersistencePipeline {
    /// Start consuming sealed bars from `sealed_rx`
    ///
    /// The pipeline runs until every sender of `sealed_rx` is dropped and all
    /// queued bars are settled.
    #[must_use]
    pub fn spawn(
        sealed_rx: mpsc::UnboundedReceiver<Candlestick>,
        store: DedupStore,
        hub: SubscriptionHub,
        retry: RetryPolicy,
        metrics: Arc<ChartMetrics>,
        events: EventSink,
    ) -> Self {
        let worker = Worker {
            store,
            hub,
            retry,
            metrics,
            events,
        };
        Self {
            dispatcher: tokio::spawn(dispatch(sealed_rx, worker)),
        }
    }

    /// Wait for the pipeline to drain
    pub async fn join(self) -> ChartResult<PipelineSummary> {
        self.dispatcher
            .await
            .map_err(|e| ChartError::Logic(format!("persistence dispatcher panicked: {e}")))?
    }
}

async fn dispatch(
    mut sealed_rx: mpsc::UnboundedReceiver<Candlestick>,
    worker: Worker,
) -> ChartResult<PipelineSummary> {
    let mut routes: FxHashMap<SeriesKey, mpsc::UnboundedSender<Candlestick>> =
        FxHashMap::default();
    let mut workers = JoinSet::new();

    while let Some(bar) = sealed_rx.recv().await {
        let series = bar.key.series();
        let tx = routes.entry(series.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            workers.spawn(worker.clone().run(series, rx));
            tx
        });
        if let Err(mpsc::error::SendError(bar)) = tx.send(bar) {
            // worker already exited on a fatal error; surfaced by join below
            error!(key = %bar.key, "Persistence worker gone, bar dropped");
        }
    }

    drop(routes);
    let mut summary = PipelineSummary::default();
    let mut fatal = None;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(part)) => summary.merge(part),
            Ok(Err(e)) => {
                error!(error = %e, "Persistence worker failed");
                fatal.get_or_insert(e);
            }
            Err(e) => {
                fatal.get_or_insert(ChartError::Logic(format!("persistence worker panicked: {e}")));
            }
        }
    }
    match fatal {
        Some(e) => Err(e),
        None => Ok(summary),
    }
}
