//! Session filtering, backpressure and lifecycle

use crate::support::{bar, end_within, recv_within, symbol};
use anyhow::Result;
use chart_service::config::SubscriptionConfig;
use chart_service::{
    BackpressurePolicy, ChartError, ChartMetrics, CloseReason, EngineEvent, EventSink, SessionState,
    SubscriptionFilter, SubscriptionHub, Timeframe,
};
use futures::StreamExt;
use rstest::*;
use std::sync::Arc;

struct HubFixture {
    hub: SubscriptionHub,
    metrics: Arc<ChartMetrics>,
    events: EventSink,
}

fn hub_with(capacity: usize, backpressure: BackpressurePolicy, grace_ms: u64) -> HubFixture {
    let config = SubscriptionConfig {
        queue_capacity: capacity,
        backpressure,
        overrun_grace_ms: grace_ms,
        ..SubscriptionConfig::default()
    };
    let metrics = Arc::new(ChartMetrics::new().expect("metrics registry"));
    let events = EventSink::new(64);
    HubFixture {
        hub: SubscriptionHub::new(&config, Arc::clone(&metrics), events.clone()),
        metrics,
        events,
    }
}

#[fixture]
fn drop_oldest_hub() -> HubFixture {
    hub_with(3, BackpressurePolicy::DropOldest, 0)
}

fn btc_1m() -> SubscriptionFilter {
    SubscriptionFilter::for_timeframe([symbol("BTCUSD")], Timeframe::M1)
}

#[rstest]
#[tokio::test]
async fn test_filter_excludes_other_symbols_and_timeframes(
    drop_oldest_hub: HubFixture,
) -> Result<()> {
    let HubFixture { hub, .. } = drop_oldest_hub;
    let session = hub.register(btc_1m())?;

    hub.publish(&bar("ETHUSD", Timeframe::M1, 0, "10"));
    hub.publish(&bar("BTCUSD", Timeframe::M5, 0, "100"));
    hub.publish(&bar("BTCUSD", Timeframe::M1, 0, "100"));

    let item = recv_within(&session).await?;
    assert_eq!(item.symbol, symbol("BTCUSD"));
    assert_eq!(item.bar.key.timeframe, Timeframe::M1);
    assert!(session.try_recv().is_none());
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_drop_oldest_bounds_queue_and_evicts_head(drop_oldest_hub: HubFixture) -> Result<()> {
    let HubFixture { hub, metrics, .. } = drop_oldest_hub;
    let session = hub.register(btc_1m())?;

    for i in 0..10 {
        hub.publish(&bar("BTCUSD", Timeframe::M1, i * 60_000, "100"));
        assert!(session.queued() <= 3);
    }
    assert_eq!(session.state(), SessionState::Backpressured);

    let mut starts = Vec::new();
    while let Some(item) = session.try_recv() {
        starts.push(item?.bar.key.start.as_millis());
    }
    assert_eq!(starts, vec![420_000, 480_000, 540_000]);
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(metrics.snapshot().bars_evicted, 7);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_slow_subscriber_does_not_affect_others(drop_oldest_hub: HubFixture) -> Result<()> {
    let HubFixture { hub, .. } = drop_oldest_hub;
    let slow = hub.register(btc_1m())?;
    let fast = hub.register(btc_1m())?;

    for i in 0..6 {
        hub.publish(&bar("BTCUSD", Timeframe::M1, i * 60_000, "100"));
        let item = recv_within(&fast).await?;
        assert_eq!(item.bar.key.start.as_millis(), i * 60_000);
    }
    assert_eq!(slow.queued(), 3);
    Ok(())
}

#[tokio::test]
async fn test_disconnect_slow_ends_stream_with_overrun() -> Result<()> {
    let HubFixture { hub, metrics, events } = hub_with(2, BackpressurePolicy::DisconnectSlow, 0);
    let mut signals = events.subscribe();
    let session = hub.register(btc_1m())?;
    let session_id = session.id();

    for i in 0..3 {
        hub.publish(&bar("BTCUSD", Timeframe::M1, i * 60_000, "100"));
    }

    let end = end_within(&session).await?;
    assert_eq!(end.reason, CloseReason::Overrun);
    assert_eq!(end.session_id, session_id);
    assert!(matches!(
        end.into_error(),
        Some(ChartError::SubscriberOverrun { session_id: id }) if id == session_id
    ));
    assert_eq!(hub.session_count(), 0);
    assert_eq!(metrics.snapshot().subscriber_overruns, 1);

    let mut saw_overrun = false;
    while let Ok(event) = signals.try_recv() {
        if event == (EngineEvent::SubscriberOverrun { session_id }) {
            saw_overrun = true;
        }
    }
    assert!(saw_overrun);
    Ok(())
}

#[tokio::test]
async fn test_disconnect_slow_rejects_within_grace() -> Result<()> {
    let HubFixture { hub, metrics, .. } = hub_with(1, BackpressurePolicy::DisconnectSlow, 60_000);
    let session = hub.register(btc_1m())?;

    for i in 0..4 {
        hub.publish(&bar("BTCUSD", Timeframe::M1, i * 60_000, "100"));
    }
    assert_eq!(hub.session_count(), 1);
    assert_eq!(metrics.snapshot().bars_rejected, 3);

    let item = recv_within(&session).await?;
    assert_eq!(item.bar.key.start.as_millis(), 0);
    assert_eq!(session.state(), SessionState::Active);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_unsubscribe_flushes_then_stream_ends(drop_oldest_hub: HubFixture) -> Result<()> {
    let HubFixture { hub, .. } = drop_oldest_hub;
    let session = hub.register(btc_1m())?;

    hub.publish(&bar("BTCUSD", Timeframe::M1, 0, "100"));
    hub.publish(&bar("BTCUSD", Timeframe::M1, 60_000, "100"));
    session.unsubscribe();
    assert_eq!(session.state(), SessionState::Draining);
    hub.publish(&bar("BTCUSD", Timeframe::M1, 120_000, "100"));

    let items: Vec<_> = session.into_stream().collect().await;
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(Result::is_ok));
    assert_eq!(hub.session_count(), 0);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_close_all_ends_streams_with_shutdown(drop_oldest_hub: HubFixture) -> Result<()> {
    let HubFixture { hub, .. } = drop_oldest_hub;
    let session = hub.register(btc_1m())?;
    hub.publish(&bar("BTCUSD", Timeframe::M1, 0, "100"));
    hub.close_all();

    let mut stream = Box::pin(session.into_stream());
    assert!(matches!(stream.next().await, Some(Ok(_))));
    let end = stream.next().await.and_then(Result::err).map(|e| e.reason);
    assert_eq!(end, Some(CloseReason::EngineShutdown));
    assert!(stream.next().await.is_none());
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_dropping_stream_unregisters(drop_oldest_hub: HubFixture) -> Result<()> {
    let HubFixture { hub, metrics, .. } = drop_oldest_hub;
    let stream = hub.register(btc_1m())?.into_stream();
    assert_eq!(hub.session_count(), 1);
    drop(stream);
    assert_eq!(hub.session_count(), 0);
    assert_eq!(metrics.snapshot().active_sessions, 0);
    Ok(())
}

#[tokio::test]
async fn test_empty_filter_rejected() {
    let HubFixture { hub, .. } = hub_with(3, BackpressurePolicy::DropOldest, 0);
    let empty = SubscriptionFilter::new(Vec::new(), [Timeframe::M1]);
    assert!(hub.register(empty).is_err());
}
