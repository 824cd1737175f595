//! Bucketing and fold-order behavior

use crate::support::{symbol, tick};
use anyhow::Result;
use chart_service::wire::parse_tick_line;
use chart_service::{
    AggregationEngine, BarAccumulator, BucketKey, Candlestick, ChartError, ChartMetrics,
    EventSink, FoldOutcome, SeriesKey, SeriesPhase, ShutdownMode, Tick, TickRouter, Timeframe,
    bucket_start, config::EngineConfig,
};
use proptest::prelude::*;
use rstest::*;
use services_common::{Px, Qty, TimestampMs};
use std::sync::Arc;
use tokio::sync::mpsc;

fn fold_all(ticks: &[Tick]) -> Candlestick {
    let mut acc = BarAccumulator::open(BucketKey::for_tick(&ticks[0], Timeframe::M1), &ticks[0]);
    for t in &ticks[1..] {
        acc.fold(t).expect("same bucket");
    }
    acc.seal().expect("first seal")
}

fn engine(timeframes: Vec<Timeframe>) -> (AggregationEngine, mpsc::UnboundedReceiver<Candlestick>) {
    let config = EngineConfig {
        timeframes,
        ..EngineConfig::default()
    };
    let (tx, rx) = mpsc::unbounded_channel();
    let metrics = Arc::new(ChartMetrics::new().expect("metrics registry"));
    (AggregationEngine::new(&config, tx, metrics, EventSink::default()), rx)
}

#[rstest]
#[case(Timeframe::M1, 0, 0)]
#[case(Timeframe::M1, 59_999, 0)]
#[case(Timeframe::M1, 60_000, 60_000)]
#[case(Timeframe::M5, 299_999, 0)]
#[case(Timeframe::M5, 300_001, 300_000)]
#[case(Timeframe::H1, 7_199_999, 3_600_000)]
#[case(Timeframe::D1, 86_400_000 + 5, 86_400_000)]
#[case(Timeframe::M1, -1, -60_000)]
fn test_bucket_start_alignment(#[case] tf: Timeframe, #[case] ts: i64, #[case] expected: i64) {
    assert_eq!(
        bucket_start(TimestampMs::from_millis(ts), tf),
        TimestampMs::from_millis(expected)
    );
}

#[rstest]
#[tokio::test]
async fn test_btcusd_scenario_single_bar_on_rollover() -> Result<()> {
    let (engine, mut rx) = engine(vec![Timeframe::M1]);

    engine.ingest(&tick("BTCUSD", 0, "100", "1"))?;
    engine.ingest(&tick("BTCUSD", 30_000, "102", "1"))?;
    assert!(rx.try_recv().is_err(), "no bar before rollover");

    engine.ingest(&tick("BTCUSD", 61_000, "105", "1"))?;
    let bar = rx.try_recv()?;
    assert_eq!(bar.key.start, TimestampMs::from_millis(0));
    assert_eq!(bar.key.end(), TimestampMs::from_millis(60_000));
    assert_eq!(bar.open, Px::from_units(100));
    assert_eq!(bar.close, Px::from_units(102));
    assert_eq!(bar.high, Px::from_units(102));
    assert_eq!(bar.low, Px::from_units(100));
    assert_eq!(bar.volume, Qty::from_units(2));
    assert!(rx.try_recv().is_err(), "exactly one bar");
    Ok(())
}

#[test]
fn test_close_is_order_sensitive() {
    let a = tick("BTCUSD", 10_000, "101", "1");
    let b = tick("BTCUSD", 20_000, "99", "1");

    let ab = fold_all(&[a.clone(), b.clone()]);
    let ba = fold_all(&[b, a]);

    assert_eq!(ab.high, ba.high);
    assert_eq!(ab.low, ba.low);
    assert_eq!(ab.volume, ba.volume);
    assert_eq!(ab.close, Px::from_units(99));
    assert_eq!(ba.close, Px::from_units(101));
    assert_ne!(ab.open, ba.open);
}

#[test]
fn test_redelivered_tick_with_trade_id_is_idempotent() {
    let t = tick("BTCUSD", 1_000, "100", "2").with_trade_id(42);
    let mut acc = BarAccumulator::open(BucketKey::for_tick(&t, Timeframe::M1), &t);
    assert_eq!(acc.fold(&t).ok(), Some(FoldOutcome::Duplicate));
    assert_eq!(acc.snapshot().volume, Qty::from_units(2));
    assert_eq!(acc.snapshot().tick_count, 1);
}

#[tokio::test]
async fn test_duplicate_ticks_counted_per_series() -> Result<()> {
    let (engine, _rx) = engine(vec![Timeframe::M1, Timeframe::M5]);
    let t = tick("ETHUSD", 0, "10", "1").with_trade_id(1);
    engine.ingest(&t)?;
    let report = engine.ingest(&t)?;
    assert_eq!(report.duplicates, 2);
    assert_eq!(report.folded, 0);
    Ok(())
}

#[tokio::test]
async fn test_published_order_is_strictly_increasing_per_series() -> Result<()> {
    let (engine, mut rx) = engine(vec![Timeframe::M1]);
    // out-of-order within buckets, plus late stragglers
    let stream = [
        (0, "1"),
        (59_000, "2"),
        (1_000, "3"),
        (65_000, "4"),
        (30_000, "5"),
        (130_000, "6"),
        (121_000, "7"),
        (61_000, "8"),
        (200_000, "9"),
    ];
    for (ts, price) in stream {
        engine.ingest(&tick("BTCUSD", ts, price, "1"))?;
    }
    engine.begin_shutdown(ShutdownMode::FlushOpen)?;

    let mut starts = Vec::new();
    while let Some(bar) = rx.recv().await {
        starts.push(bar.key.start.as_millis());
    }
    assert_eq!(starts, vec![0, 60_000, 120_000, 180_000]);
    Ok(())
}

#[tokio::test]
async fn test_symbols_never_share_buckets() -> Result<()> {
    let (engine, mut rx) = engine(vec![Timeframe::M1]);
    engine.ingest(&tick("BTCUSD", 0, "100", "1"))?;
    engine.ingest(&tick("ETHUSD", 70_000, "10", "1"))?;
    assert!(rx.try_recv().is_err(), "ETHUSD tick must not roll BTCUSD");

    engine.ingest(&tick("BTCUSD", 70_000, "101", "1"))?;
    assert_eq!(rx.try_recv()?.key.symbol, symbol("BTCUSD"));
    Ok(())
}

fn same_bucket_ticks() -> impl Strategy<Value = Vec<(i64, i64, i64)>> {
    prop::collection::vec((0_i64..60_000, 1_i64..1_000_000, 0_i64..1_000), 1..40)
}

proptest! {
    #[test]
    fn prop_fold_order_only_affects_open_and_close(ticks in same_bucket_ticks()) {
        let ticks: Vec<Tick> = ticks
            .iter()
            .map(|&(ts, price, vol)| Tick::new(
                symbol("BTCUSD"),
                TimestampMs::from_millis(ts),
                Px::from_i64(price),
                Qty::from_i64(vol),
            ))
            .collect();
        let mut reversed = ticks.clone();
        reversed.reverse();

        let forward = fold_all(&ticks);
        let backward = fold_all(&reversed);

        prop_assert_eq!(forward.high, backward.high);
        prop_assert_eq!(forward.low, backward.low);
        prop_assert_eq!(forward.volume, backward.volume);
        prop_assert_eq!(forward.tick_count, ticks.len() as u64);
        prop_assert_eq!(forward.close, ticks[ticks.len() - 1].price);
        prop_assert_eq!(backward.close, ticks[0].price);
        prop_assert!(forward.is_consistent());
    }

    #[test]
    fn prop_bucket_contains_its_timestamp(ts in -1_000_000_000_000_i64..4_000_000_000_000) {
        for tf in Timeframe::ALL {
            let start = bucket_start(TimestampMs::from_millis(ts), tf).as_millis();
            prop_assert!(start <= ts);
            prop_assert!(ts < start + tf.duration_ms());
            prop_assert_eq!(start.rem_euclid(tf.duration_ms()), 0);
        }
    }
}

fn tick_line(ts: i64) -> String {
    format!(r#"{{"symbol":"BTCUSD","timestamp_msec":{ts},"price":"100","volume":"1"}}"#)
}

#[rstest]
#[case::min(i64::MIN)]
#[case::max(i64::MAX)]
#[tokio::test]
async fn test_out_of_range_timestamp_never_opens_a_bucket(#[case] ts: i64) -> Result<()> {
    assert!(matches!(
        parse_tick_line(&tick_line(ts)),
        Err(ChartError::InvalidRequest(_))
    ));

    let (engine, _rx) = engine(vec![Timeframe::M1, Timeframe::D1]);
    let extreme = Tick {
        timestamp: TimestampMs::from_millis(ts),
        ..tick("BTCUSD", 0, "100", "1")
    };
    assert!(matches!(
        engine.ingest(&extreme),
        Err(ChartError::InvalidRequest(_))
    ));

    // the series is untouched, so a real tick opens normally
    let report = engine.ingest(&parse_tick_line(&tick_line(60_000))?)?;
    assert_eq!(report.folded, 2);
    assert_eq!(report.dropped_late, 0);
    let series = SeriesKey::new(symbol("BTCUSD"), Timeframe::M1);
    assert_eq!(
        engine.phase(&series),
        Some(SeriesPhase::Accumulating {
            bucket_start: TimestampMs::from_millis(60_000)
        })
    );
    Ok(())
}

#[tokio::test]
async fn test_router_survives_out_of_range_ticks() -> Result<()> {
    let (engine, mut rx) = engine(vec![Timeframe::M1]);
    let at = |ts: i64| Tick {
        timestamp: TimestampMs::from_millis(ts),
        ..tick("BTCUSD", 0, "100", "1")
    };
    let ticks = vec![at(0), at(i64::MIN), at(i64::MAX), at(61_000)];

    let summary = TickRouter::spawn(Arc::new(engine), 2, 8)
        .run(futures::stream::iter(ticks))
        .await?;
    assert_eq!(summary.ticks, 4);
    assert_eq!(summary.rejected, 2);
    assert_eq!(summary.dropped_late, 0);
    assert_eq!(rx.try_recv()?.key.start, TimestampMs::from_millis(0));
    Ok(())
}
