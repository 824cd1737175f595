//! Shared fixtures for chart-service tests

#![allow(dead_code)]

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chart_service::storage::{CandleStore, InsertOutcome, MemoryStore};
use chart_service::{
    BucketKey, Candlestick, ChartConfig, ChartError, ChartResult, ChartService, SeriesKey,
    StreamEnd, SubscribeResponse, SubscriberSession, Tick, Timeframe,
};
use services_common::{Px, Qty, Symbol, TimestampMs};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

/// How long a test waits for a bar before giving up
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn symbol(raw: &str) -> Symbol {
    Symbol::new(raw).expect("valid test symbol")
}

pub fn tick(sym: &str, ts: i64, price: &str, volume: &str) -> Tick {
    Tick::new(
        symbol(sym),
        TimestampMs::from_millis(ts),
        price.parse().expect("valid price"),
        volume.parse().expect("valid volume"),
    )
}

pub fn px(raw: &str) -> Px {
    raw.parse().expect("valid price")
}

pub fn qty(raw: &str) -> Qty {
    raw.parse().expect("valid quantity")
}

/// Single-tick bar at `start`
pub fn bar(sym: &str, timeframe: Timeframe, start: i64, price: &str) -> Candlestick {
    let price = px(price);
    Candlestick {
        key: SeriesKey::new(symbol(sym), timeframe).bucket(TimestampMs::from_millis(start)),
        open: price,
        high: price,
        low: price,
        close: price,
        volume: Qty::from_units(1),
        tick_count: 1,
    }
}

/// Defaults tuned for fast tests: 1m only, short retries
pub fn test_config() -> ChartConfig {
    let mut config = ChartConfig::default();
    config.engine.timeframes = vec![Timeframe::M1];
    config.engine.ingest_workers = 2;
    config.persistence.retry.initial_backoff_ms = 1;
    config.persistence.retry.max_backoff_ms = 4;
    config
}

pub fn memory_service(config: ChartConfig) -> Result<ChartService> {
    Ok(ChartService::with_store(config, Arc::new(MemoryStore::new()))?)
}

/// Next bar, failing the test if none arrives in time
pub async fn recv_within(session: &SubscriberSession) -> Result<SubscribeResponse> {
    tokio::time::timeout(RECV_TIMEOUT, session.recv())
        .await
        .map_err(|_| anyhow!("no bar within {RECV_TIMEOUT:?}"))?
        .map_err(|end: StreamEnd| anyhow!("stream ended early: {end}"))
}

/// Stream end, failing the test if a bar arrives instead
pub async fn end_within(session: &SubscriberSession) -> Result<StreamEnd> {
    match tokio::time::timeout(RECV_TIMEOUT, session.recv()).await {
        Ok(Err(end)) => Ok(end),
        Ok(Ok(item)) => Err(anyhow!("unexpected bar {}", item.bar.key)),
        Err(_) => Err(anyhow!("stream did not end within {RECV_TIMEOUT:?}")),
    }
}

/// Store that fails inserts for one symbol, a fixed number of times or forever
pub struct FlakyStore {
    inner: MemoryStore,
    failing_symbol: Symbol,
    failures_left: AtomicU32,
    insert_calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new(failing_symbol: &str, failures: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            failing_symbol: symbol(failing_symbol),
            failures_left: AtomicU32::new(failures),
            insert_calls: AtomicUsize::new(0),
        }
    }

    pub fn always_failing(failing_symbol: &str) -> Self {
        Self::new(failing_symbol, u32::MAX)
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CandleStore for FlakyStore {
    async fn insert_if_new(&self, bar: &Candlestick) -> ChartResult<InsertOutcome> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if bar.key.symbol == self.failing_symbol {
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failing {
                return Err(ChartError::StorageUnavailable("injected failure".into()));
            }
        }
        self.inner.insert_if_new(bar).await
    }

    async fn exists(&self, key: &BucketKey) -> ChartResult<bool> {
        self.inner.exists(key).await
    }

    async fn query_range(
        &self,
        series: &SeriesKey,
        from: TimestampMs,
        to: TimestampMs,
    ) -> ChartResult<Vec<Candlestick>> {
        self.inner.query_range(series, from, to).await
    }

    async fn health_check(&self) -> ChartResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}
