//! Full service scenarios: ingest, persist, publish, shut down

use crate::support::{
    FlakyStore, RECV_TIMEOUT, end_within, memory_service, px, qty, recv_within, symbol,
    test_config, tick,
};
use anyhow::{Result, anyhow};
use chart_service::{
    ChartConfig, ChartError, ChartService, CloseReason, EngineEvent, MemoryStore, ShutdownMode,
    StoreBackend, Tick, Timeframe,
};
use services_common::TimestampMs;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Wait for the first event accepted by `pick`
async fn wait_for_event<T>(
    events: &mut broadcast::Receiver<EngineEvent>,
    mut pick: impl FnMut(EngineEvent) -> Option<T>,
) -> Result<T> {
    tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(event) {
                        return Ok(found);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => return Err(anyhow!("event channel closed: {e}")),
            }
        }
    })
    .await
    .map_err(|_| anyhow!("no matching event within {RECV_TIMEOUT:?}"))?
}

fn btc_scenario() -> Vec<Tick> {
    vec![
        tick("BTCUSD", 0, "100", "1"),
        tick("BTCUSD", 30_000, "102", "1"),
        tick("BTCUSD", 61_000, "105", "1"),
    ]
}

#[tokio::test]
async fn test_single_bar_scenario_through_service() -> Result<()> {
    let service = memory_service(test_config())?;
    let session = service.subscribe(["BTCUSD"], Timeframe::M1)?;

    for t in btc_scenario() {
        service.ingest(&t)?;
    }

    let item = recv_within(&session).await?;
    let bar = item.bar;
    assert_eq!(bar.key.start, TimestampMs::from_millis(0));
    assert_eq!(bar.open, px("100"));
    assert_eq!(bar.high, px("102"));
    assert_eq!(bar.low, px("100"));
    assert_eq!(bar.close, px("102"));
    assert_eq!(bar.volume, qty("2"));
    assert_eq!(bar.tick_count, 2);
    assert!(service.exists(&bar.key).await?);

    let summary = service.shutdown(ShutdownMode::Discard).await?;
    assert_eq!(summary.open_buckets, 1);
    assert_eq!(summary.pipeline.published, 1);
    assert_eq!(end_within(&session).await?.reason, CloseReason::EngineShutdown);
    Ok(())
}

fn journal_config(dir: &std::path::Path) -> ChartConfig {
    let mut config = test_config();
    config.persistence.backend = StoreBackend::Journal;
    config.persistence.journal_dir = Some(dir.to_path_buf());
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_redelivery_publishes_nothing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let ticks = [
        tick("BTCUSD", 0, "100", "1"),
        tick("BTCUSD", 61_000, "101", "1"),
        tick("BTCUSD", 125_000, "102", "1"),
    ];

    let first = ChartService::start(journal_config(dir.path())).await?;
    for t in &ticks {
        first.ingest(t)?;
    }
    let summary = first.shutdown(ShutdownMode::Discard).await?;
    assert_eq!(summary.pipeline.published, 2);
    drop(first);

    let second = ChartService::start(journal_config(dir.path())).await?;
    let session = second.subscribe(["BTCUSD"], Timeframe::M1)?;
    for t in &ticks {
        second.ingest(t)?;
    }
    let summary = second.shutdown(ShutdownMode::Discard).await?;
    assert_eq!(summary.pipeline.published, 0);
    assert_eq!(summary.pipeline.duplicates, 2);
    assert_eq!(end_within(&session).await?.reason, CloseReason::EngineShutdown);

    let history = second
        .history(
            &symbol("BTCUSD"),
            Timeframe::M1,
            TimestampMs::from_millis(0),
            TimestampMs::from_millis(180_000),
        )
        .await?;
    let starts: Vec<i64> = history.iter().map(|b| b.key.start.as_millis()).collect();
    assert_eq!(starts, vec![0, 60_000]);
    Ok(())
}

#[tokio::test]
async fn test_late_tick_is_signalled_once() -> Result<()> {
    let service = memory_service(test_config())?;
    let mut events = service.events();

    service.ingest(&tick("BTCUSD", 0, "100", "1"))?;
    service.ingest(&tick("BTCUSD", 61_000, "101", "1"))?;
    let report = service.ingest(&tick("BTCUSD", 30_000, "1", "50"))?;
    assert_eq!(report.dropped_late, 1);
    assert_eq!(report.folded, 0);

    let mut late = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::DroppedLateTick {
            tick_bucket,
            current_bucket,
            ..
        } = event
        {
            late.push((tick_bucket.as_millis(), current_bucket.as_millis()));
        }
    }
    assert_eq!(late, vec![(0, 60_000)]);
    assert_eq!(service.metrics().ticks_dropped_late, 1);

    service.shutdown(ShutdownMode::Discard).await?;
    let history = service
        .history(
            &symbol("BTCUSD"),
            Timeframe::M1,
            TimestampMs::from_millis(0),
            TimestampMs::from_millis(60_000),
        )
        .await?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].low, px("100"));
    assert_eq!(history[0].volume, qty("1"));
    Ok(())
}

#[tokio::test]
async fn test_transient_storage_failure_is_retried() -> Result<()> {
    let store = Arc::new(FlakyStore::new("BTCUSD", 2));
    let service = ChartService::with_store(test_config(), store.clone())?;
    let session = service.subscribe(["BTCUSD"], Timeframe::M1)?;

    service.ingest(&tick("BTCUSD", 0, "100", "1"))?;
    service.ingest(&tick("BTCUSD", 60_000, "101", "1"))?;

    let item = recv_within(&session).await?;
    assert_eq!(item.bar.key.start, TimestampMs::from_millis(0));
    assert_eq!(store.insert_calls(), 3);
    assert_eq!(service.metrics().storage_retries, 2);
    assert_eq!(service.metrics().persistence_failures, 0);

    service.shutdown(ShutdownMode::Discard).await?;
    Ok(())
}

#[tokio::test]
async fn test_exhausted_retries_drop_bar_without_stalling_other_series() -> Result<()> {
    let mut config = test_config();
    config.persistence.retry.max_attempts = 3;
    let store = Arc::new(FlakyStore::always_failing("ETHUSD"));
    let service = ChartService::with_store(config, store.clone())?;
    let mut events = service.events();
    let session = service.subscribe(["BTCUSD", "ETHUSD"], Timeframe::M1)?;

    service.ingest(&tick("ETHUSD", 0, "10", "1"))?;
    service.ingest(&tick("BTCUSD", 0, "100", "1"))?;
    service.ingest(&tick("ETHUSD", 60_000, "11", "1"))?;
    service.ingest(&tick("BTCUSD", 60_000, "101", "1"))?;

    let item = recv_within(&session).await?;
    assert_eq!(item.symbol, symbol("BTCUSD"));

    let (key, attempts) = wait_for_event(&mut events, |event| match event {
        EngineEvent::PersistenceFailed { key, attempts, .. } => Some((key, attempts)),
        _ => None,
    })
    .await?;
    assert_eq!(key.symbol, symbol("ETHUSD"));
    assert_eq!(attempts, 3);

    let summary = service.shutdown(ShutdownMode::Discard).await?;
    assert_eq!(summary.pipeline.published, 1);
    assert_eq!(summary.pipeline.failed, 1);
    assert_eq!(service.metrics().persistence_failures, 1);
    assert!(!service.exists(&key).await?);
    assert_eq!(end_within(&session).await?.reason, CloseReason::EngineShutdown);
    Ok(())
}

#[tokio::test]
async fn test_flush_shutdown_delivers_open_bar_then_ends_stream() -> Result<()> {
    let service = memory_service(test_config())?;
    let session = service.subscribe(["BTCUSD"], Timeframe::M1)?;

    service.ingest(&tick("BTCUSD", 0, "100", "1"))?;
    service.ingest(&tick("BTCUSD", 10_000, "99", "3"))?;

    let summary = service.shutdown(ShutdownMode::FlushOpen).await?;
    assert_eq!(summary.open_buckets, 1);
    assert_eq!(summary.pipeline.published, 1);
    assert_eq!(service.metrics().bars_sealed_shutdown, 1);

    let item = recv_within(&session).await?;
    assert_eq!(item.bar.close, px("99"));
    assert_eq!(item.bar.volume, qty("4"));
    assert_eq!(end_within(&session).await?.reason, CloseReason::EngineShutdown);

    assert!(matches!(
        service.subscribe(["BTCUSD"], Timeframe::M1),
        Err(ChartError::EngineShuttingDown)
    ));
    assert!(matches!(
        service.ingest(&tick("BTCUSD", 70_000, "100", "1")),
        Err(ChartError::EngineShuttingDown)
    ));

    let again = service.shutdown(ShutdownMode::FlushOpen).await?;
    assert_eq!(again.open_buckets, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_idle_bucket_is_sealed_by_sweep() -> Result<()> {
    let mut config = test_config();
    config.engine.lateness_tolerance_ms = 2_000;
    config.engine.sweep_interval_ms = 500;
    let service = ChartService::with_store(config, Arc::new(MemoryStore::new()))?;
    let session = service.subscribe(["BTCUSD"], Timeframe::M1)?;

    service.ingest(&tick("BTCUSD", 0, "100", "1"))?;
    assert!(session.try_recv().is_none());

    tokio::time::advance(Duration::from_millis(2_500)).await;
    let item = recv_within(&session).await?;
    assert_eq!(item.bar.key.start, TimestampMs::from_millis(0));
    assert_eq!(service.metrics().bars_sealed_sweep, 1);

    // the swept bucket is closed; a straggler for it is late
    let report = service.ingest(&tick("BTCUSD", 5_000, "100", "1"))?;
    assert_eq!(report.dropped_late, 1);

    service.shutdown(ShutdownMode::Discard).await?;
    Ok(())
}

#[rstest::rstest]
#[case::unknown_timeframe(vec!["BTCUSD"], Timeframe::H1)]
#[case::empty(Vec::new(), Timeframe::M1)]
#[case::bad_symbol(vec![""], Timeframe::M1)]
#[tokio::test]
async fn test_invalid_subscriptions_rejected(
    #[case] symbols: Vec<&'static str>,
    #[case] timeframe: Timeframe,
) -> Result<()> {
    let service = memory_service(test_config())?;
    assert!(matches!(
        service.subscribe(symbols, timeframe),
        Err(ChartError::InvalidRequest(_))
    ));
    assert_eq!(service.session_count(), 0);
    service.shutdown(ShutdownMode::Discard).await?;
    Ok(())
}
