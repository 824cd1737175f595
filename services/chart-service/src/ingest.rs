//! Tick ingestion worker pool
//!
//! Ticks are routed by symbol hash, so all ticks of one symbol reach the
//! same worker in arrival order while different symbols fold in parallel.

use crate::candle::Tick;
use crate::engine::{AggregationEngine, IngestReport};
use crate::error::{ChartError, ChartResult};
use futures::{Stream, StreamExt};
use rustc_hash::FxHasher;
use services_common::Symbol;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Totals over one router lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Ticks received by workers
    pub ticks: u64,
    /// Per-series folds
    pub folded: u64,
    /// Per-series redelivered ticks ignored
    pub duplicates: u64,
    /// Per-series late drops
    pub dropped_late: u64,
    /// Buckets sealed by rollover
    pub sealed: u64,
    /// Ticks the engine refused
    pub rejected: u64,
}

impl IngestSummary {
    fn add(&mut self, report: IngestReport) {
        self.folded += report.folded as u64;
        self.duplicates += report.duplicates as u64;
        self.dropped_late += report.dropped_late as u64;
        self.sealed += report.sealed as u64;
    }

    fn merge(&mut self, other: Self) {
        self.ticks += other.ticks;
        self.folded += other.folded;
        self.duplicates += other.duplicates;
        self.dropped_late += other.dropped_late;
        self.sealed += other.sealed;
        self.rejected += other.rejected;
    }
}

/// Worker index for `symbol` in a pool of `workers`
#[must_use]
pub fn worker_for(symbol: &Symbol, workers: usize) -> usize {
    let mut hasher = FxHasher::default();
    symbol.hash(&mut hasher);
    // SAFETY: remainder is below `workers`, which is a usize
    (hasher.finish() % workers.max(1) as u64) as usize
}

/// Pool of ingest workers with per-symbol affinity
#[derive(Debug)]
pub struct TickRouter {
    senders: Vec<mpsc::Sender<Tick>>,
    workers: JoinSet<ChartResult<IngestSummary>>,
}

impl TickRouter {
    /// Start `workers` workers, each with a queue of `capacity` ticks
    #[must_use]
    pub fn spawn(engine: Arc<AggregationEngine>, workers: usize, capacity: usize) -> Self {
        let workers_count = workers.max(1);
        let mut senders = Vec::with_capacity(workers_count);
        let mut pool = JoinSet::new();
        for worker_id in 0..workers_count {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            senders.push(tx);
            pool.spawn(run_worker(worker_id, Arc::clone(&engine), rx));
        }
        debug!(workers = workers_count, capacity, "Tick router started");
        Self {
            senders,
            workers: pool,
        }
    }

    /// Queue one tick, waiting while its worker's queue is full
    ///
    /// Fails with `EngineShuttingDown` once the worker has stopped.
    pub async fn route(&self, tick: Tick) -> ChartResult<()> {
        let index = worker_for(&tick.symbol, self.senders.len());
        let sender = self
            .senders
            .get(index)
            .ok_or_else(|| ChartError::Logic(format!("no ingest worker {index}")))?;
        sender
            .send(tick)
            .await
            .map_err(|_| ChartError::EngineShuttingDown)
    }

    /// Drain `ticks` through the pool, then stop the workers
    pub async fn run<S>(self, ticks: S) -> ChartResult<IngestSummary>
    where
        S: Stream<Item = Tick>,
    {
        let mut ticks = std::pin::pin!(ticks);
        while let Some(tick) = ticks.next().await {
            if self.route(tick).await.is_err() {
                warn!("Ingest worker stopped, no longer routing ticks");
                break;
            }
        }
        self.finish().await
    }

    /// Close the queues and wait for workers to drain them
    ///
    /// Returns the first fatal worker error, if any.
    pub async fn finish(mut self) -> ChartResult<IngestSummary> {
        self.senders.clear();
        let mut summary = IngestSummary::default();
        let mut fatal = None;
        while let Some(joined) = self.workers.join_next().await {
            match joined {
                Ok(Ok(part)) => summary.merge(part),
                Ok(Err(e)) => {
                    fatal.get_or_insert(e);
                }
                Err(e) => {
                    fatal.get_or_insert(ChartError::Logic(format!("ingest worker panicked: {e}")));
                }
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }
        info!(
            ticks = summary.ticks,
            sealed = summary.sealed,
            dropped_late = summary.dropped_late,
            rejected = summary.rejected,
            "Ingestion finished"
        );
        Ok(summary)
    }
}

async fn run_worker(
    worker_id: usize,
    engine: Arc<AggregationEngine>,
    mut rx: mpsc::Receiver<Tick>,
) -> ChartResult<IngestSummary> {
    let mut summary = IngestSummary::default();
    while let Some(tick) = rx.recv().await {
        summary.ticks += 1;
        match engine.ingest(&tick) {
            Ok(report) => summary.add(report),
            Err(e) if e.is_fatal() => {
                error!(worker_id, error = %e, "Invariant violated during ingestion");
                return Err(e);
            }
            Err(ChartError::EngineShuttingDown) => {
                summary.rejected += 1;
                break;
            }
            Err(e) => {
                summary.rejected += 1;
                warn!(worker_id, symbol = %tick.symbol, error = %e, "Tick rejected");
            }
        }
    }
    Ok(summary)
}
