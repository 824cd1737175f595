//! Candlestick aggregation and streaming
//!
//! Raw trades are folded into fixed-width OHLCV bars per (symbol,
//! timeframe), each finalized bar is persisted exactly once, and newly
//! persisted bars are fanned out to any number of subscribers with
//! independent bounded queues.
//!
//! Data flow:
//! `Tick -> TickRouter -> AggregationEngine -> PersistencePipeline ->
//! DedupStore -> SubscriptionHub -> SubscriberSession`

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod bucket;
pub mod candle;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod hub;
pub mod ingest;
pub mod metrics;
pub mod pipeline;
pub mod service;
pub mod session;
pub mod storage;
pub mod timeframe;
pub mod wire;

pub use bucket::{BucketKey, SeriesKey, bucket_start};
pub use candle::{BarAccumulator, Candlestick, FoldOutcome, Tick};
pub use config::{ChartConfig, StoreBackend};
pub use engine::{AggregationEngine, IngestReport, SeriesPhase, ShutdownMode};
pub use error::{ChartError, ChartResult};
pub use events::{EngineEvent, EventSink};
pub use hub::SubscriptionHub;
pub use ingest::{IngestSummary, TickRouter};
pub use metrics::{ChartMetrics, MetricsSnapshot};
pub use pipeline::{PersistencePipeline, PipelineSummary, RetryPolicy};
pub use service::{ChartService, ShutdownSummary};
pub use session::{
    BackpressurePolicy, CloseReason, SessionState, StreamEnd, SubscribeResponse,
    SubscriberSession, SubscriptionFilter,
};
pub use storage::{CandleStore, DedupStore, InsertOutcome, JournalStore, MemoryStore};
pub use timeframe::Timeframe;
