//! Chart service facade
//!
//! Owns one engine, store, hub and pipeline. Nothing here is global: each
//! `ChartService` is an independent instance with its own registry and
//! explicit shutdown.

use crate::bucket::{BucketKey, SeriesKey};
use crate::candle::{Candlestick, Tick};
use crate::config::ChartConfig;
use crate::engine::{AggregationEngine, IngestReport, ShutdownMode};
use crate::error::{ChartError, ChartResult};
use crate::events::{EngineEvent, EventSink, log_events};
use crate::hub::SubscriptionHub;
use crate::ingest::TickRouter;
use crate::metrics::{ChartMetrics, MetricsSnapshot};
use crate::pipeline::{PersistencePipeline, PipelineSummary, RetryPolicy};
use crate::session::{SubscriberSession, SubscriptionFilter};
use crate::storage::{CandleStore, DedupStore, open_store};
use crate::timeframe::Timeframe;
use parking_lot::Mutex;
use services_common::{Symbol, TimestampMs};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Outcome of [`ChartService::shutdown`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownSummary {
    /// Open buckets sealed or discarded
    pub open_buckets: usize,
    /// Persistence totals
    pub pipeline: PipelineSummary,
}

/// Candlestick aggregation and streaming service
pub struct ChartService {
    config: ChartConfig,
    engine: Arc<AggregationEngine>,
    store: DedupStore,
    hub: SubscriptionHub,
    metrics: Arc<ChartMetrics>,
    events: EventSink,
    pipeline: Mutex<Option<PersistencePipeline>>,
    sweeper: Mutex<Option<JoinHandle<ChartResult<()>>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for ChartService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChartService")
            .field("engine", &self.engine)
            .field("store", &self.store)
            .field("sessions", &self.hub.session_count())
            .finish()
    }
}

impl ChartService {
    /// Open the configured store and start the service
    pub async fn start(config: ChartConfig) -> ChartResult<Self> {
        config.validate()?;
        let store = open_store(&config.persistence)?;
        store.health_check().await?;
        Self::with_store(config, store)
    }

    /// Start the service on an already opened store
    ///
    /// Must be called within a Tokio runtime.
    pub fn with_store(config: ChartConfig, store: Arc<dyn CandleStore>) -> ChartResult<Self> {
        config.validate()?;
        let metrics = Arc::new(ChartMetrics::new()?);
        let events = EventSink::default();
        tokio::spawn(log_events(events.subscribe()));

        let store = DedupStore::new(store, Arc::clone(&metrics));
        let hub = SubscriptionHub::new(&config.subscriptions, Arc::clone(&metrics), events.clone());
        let (sealed_tx, sealed_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(AggregationEngine::new(
            &config.engine,
            sealed_tx,
            Arc::clone(&metrics),
            events.clone(),
        ));
        let pipeline = PersistencePipeline::spawn(
            sealed_rx,
            store.clone(),
            hub.clone(),
            RetryPolicy::from(&config.persistence.retry),
            Arc::clone(&metrics),
            events.clone(),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = engine.spawn_sweeper(config.engine.sweep_interval(), shutdown_rx);

        info!(
            backend = store.backend_name(),
            timeframes = ?config.engine.timeframes,
            lateness_ms = config.engine.lateness_tolerance_ms,
            "Chart service started"
        );

        Ok(Self {
            config,
            engine,
            store,
            hub,
            metrics,
            events,
            pipeline: Mutex::new(Some(pipeline)),
            sweeper: Mutex::new(Some(sweeper)),
            shutdown_tx,
        })
    }

    /// Effective configuration
    #[must_use]
    pub const fn config(&self) -> &ChartConfig {
        &self.config
    }

    /// Aggregation engine
    #[must_use]
    pub const fn engine(&self) -> &Arc<AggregationEngine> {
        &self.engine
    }

    /// Fold one tick on the calling task
    pub fn ingest(&self, tick: &Tick) -> ChartResult<IngestReport> {
        self.engine.ingest(tick)
    }

    /// Worker pool feeding this service's engine
    #[must_use]
    pub fn tick_router(&self) -> TickRouter {
        TickRouter::spawn(
            Arc::clone(&self.engine),
            self.config.engine.ingest_workers,
            self.config.engine.ingest_queue_capacity,
        )
    }

    /// Stream finalized bars for `symbols` on `timeframe`
    ///
    /// Live only: bars persisted before the call are not replayed; use
    /// [`ChartService::history`] for backfill.
    pub fn subscribe<I, S>(&self, symbols: I, timeframe: Timeframe) -> ChartResult<SubscriberSession>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.engine.is_shutting_down() {
            return Err(ChartError::EngineShuttingDown);
        }
        let symbols = symbols
            .into_iter()
            .map(|s| Symbol::new(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        if symbols.is_empty() {
            return Err(ChartError::InvalidRequest("symbol list is empty".into()));
        }
        let max = self.config.subscriptions.max_symbols_per_subscription;
        if symbols.len() > max {
            return Err(ChartError::InvalidRequest(format!(
                "{} symbols requested, at most {max} allowed",
                symbols.len()
            )));
        }
        if !self.engine.timeframes().contains(&timeframe) {
            return Err(ChartError::InvalidRequest(format!(
                "timeframe {timeframe} is not aggregated"
            )));
        }

        let session = self
            .hub
            .register(SubscriptionFilter::for_timeframe(symbols, timeframe))?;
        info!(session_id = session.id(), %timeframe, "Subscribed");
        Ok(session)
    }

    /// Persisted bars of one series with `from <= start < to`
    pub async fn history(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        from: TimestampMs,
        to: TimestampMs,
    ) -> ChartResult<Vec<Candlestick>> {
        let series = SeriesKey::new(symbol.clone(), timeframe);
        self.store.query_range(&series, from, to).await
    }

    /// True if the bar for `key` is persisted
    pub async fn exists(&self, key: &BucketKey) -> ChartResult<bool> {
        self.store.exists(key).await
    }

    /// Listen for engine signals
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Counter snapshot
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Counters in Prometheus text format
    pub fn metrics_text(&self) -> ChartResult<String> {
        self.metrics.render()
    }

    /// Registered sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.hub.session_count()
    }

    /// Stop ingestion, settle open buckets, drain persistence, close sessions
    ///
    /// Sessions are closed only after the pipeline has published every
    /// persisted bar, so subscribers see the flushed bars before the end of
    /// their stream. Calling it again is a no-op.
    pub async fn shutdown(&self, mode: ShutdownMode) -> ChartResult<ShutdownSummary> {
        let open_buckets = self.engine.begin_shutdown(mode)?;
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);

        let sweeper = self.sweeper.lock().take();
        if let Some(handle) = sweeper {
            match handle.await {
                Ok(result) => result?,
                Err(e) => warn!(error = %e, "Idle sweeper did not stop cleanly"),
            }
        }

        let pipeline = self.pipeline.lock().take();
        let pipeline = match pipeline {
            Some(pipeline) => pipeline.join().await?,
            None => PipelineSummary::default(),
        };

        self.hub.close_all();
        info!(open_buckets, ?pipeline, "Chart service stopped");
        Ok(ShutdownSummary {
            open_buckets,
            pipeline,
        })
    }
}
