//! In-process bar store

use super::{CandleStore, InsertOutcome};
use crate::bucket::{BucketKey, SeriesKey};
use crate::candle::Candlestick;
use crate::error::ChartResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use services_common::TimestampMs;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

/// Ordered map of bars; contents are lost on restart
#[derive(Debug, Default)]
pub struct MemoryStore {
    bars: Mutex<BTreeMap<BucketKey, Candlestick>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored bars
    #[must_use]
    pub fn len(&self) -> usize {
        self.bars.lock().len()
    }

    /// True if nothing is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bars.lock().is_empty()
    }
}

#[async_trait]
impl CandleStore for MemoryStore {
    async fn insert_if_new(&self, bar: &Candlestick) -> ChartResult<InsertOutcome> {
        match self.bars.lock().entry(bar.key.clone()) {
            Entry::Occupied(_) => Ok(InsertOutcome::AlreadyExists),
            Entry::Vacant(slot) => {
                slot.insert(bar.clone());
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn exists(&self, key: &BucketKey) -> ChartResult<bool> {
        Ok(self.bars.lock().contains_key(key))
    }

    async fn query_range(
        &self,
        series: &SeriesKey,
        from: TimestampMs,
        to: TimestampMs,
    ) -> ChartResult<Vec<Candlestick>> {
        if from >= to {
            return Ok(Vec::new());
        }
        let bars = self.bars.lock();
        Ok(bars
            .range(series.bucket(from)..series.bucket(to))
            .map(|(_, bar)| bar.clone())
            .collect())
    }

    async fn health_check(&self) -> ChartResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
