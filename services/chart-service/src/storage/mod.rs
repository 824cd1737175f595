//! Persistent storage for finalized bars
//!
//! The uniqueness of (symbol, timeframe, bucket start) is enforced by the
//! backend inside `insert_if_new`, never by a separate read before write.

pub mod dedup;
pub mod journal;
pub mod memory;
pub mod segment;

pub use dedup::DedupStore;
pub use journal::JournalStore;
pub use memory::MemoryStore;

use crate::bucket::{BucketKey, SeriesKey};
use crate::candle::Candlestick;
use crate::config::{PersistenceConfig, StoreBackend};
use crate::error::{ChartError, ChartResult};
use async_trait::async_trait;
use services_common::TimestampMs;
use std::sync::Arc;

/// Result of an idempotent insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// This call persisted the bar
    Inserted,
    /// A bar with the same key was already stored; nothing written
    AlreadyExists,
}

/// Keyed bar store with an insert-if-absent contract
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Persist `bar` unless its key is already present
    ///
    /// Atomic per key: of any number of concurrent calls for one key,
    /// exactly one returns `Inserted`.
    async fn insert_if_new(&self, bar: &Candlestick) -> ChartResult<InsertOutcome>;

    /// True if a bar with this key is stored
    async fn exists(&self, key: &BucketKey) -> ChartResult<bool>;

    /// Stored bars of one series with `from <= start < to`, oldest first
    async fn query_range(
        &self,
        series: &SeriesKey,
        from: TimestampMs,
        to: TimestampMs,
    ) -> ChartResult<Vec<Candlestick>>;

    /// Fail with `StorageUnavailable` if the backend cannot serve requests
    async fn health_check(&self) -> ChartResult<()>;

    /// Short backend name for logs
    fn backend_name(&self) -> &'static str;
}

/// Build the backend selected in configuration
pub fn open_store(config: &PersistenceConfig) -> ChartResult<Arc<dyn CandleStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Journal => {
            let dir = config.journal_dir.as_deref().ok_or_else(|| {
                ChartError::Config("journal backend requires persistence.journal_dir".into())
            })?;
            Ok(Arc::new(JournalStore::open(dir, config.segment_size_bytes)?))
        }
    }
}
