//! Reconciliation and indicator runs against the Parquet store.

use chrono::{Duration, NaiveDate};
use std::sync::Arc;
use tempfile::TempDir;
use tidemark_core::data::{daily_rows, StaticSource};
use tidemark_core::domain::{datasets, Clock, FixedClock, ReconcileStatus};
use tidemark_core::indicators::{CalculatorRegistry, IndicatorPipeline};
use tidemark_core::reconcile::{ReconcileController, ReconcileOptions, ReconcileSettings};
use tidemark_core::store::{
    ParquetStore, RecordFilter, RecordQuery, SinkRegistry, SinkResolver, TimeSeriesStore,
};
use tidemark_core::upsert::UpsertEngine;

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
}

/// Consecutive calendar days ending today. The vendor double has no calendar.
fn days(n: i64) -> Vec<NaiveDate> {
    (0..n).rev().map(|i| today() - Duration::days(i)).collect()
}

struct Setup {
    _dir: TempDir,
    source: Arc<StaticSource>,
    bars: Arc<ParquetStore>,
    sinks: Arc<SinkRegistry>,
    engine: UpsertEngine,
}

async fn setup() -> Setup {
    let dir = TempDir::new().unwrap();
    let bars = Arc::new(ParquetStore::new(dir.path().join("stock_daily")));
    let indicators = Arc::new(ParquetStore::new(dir.path().join("indicators")));
    let sinks = SinkRegistry::builder()
        .target(datasets::DAILY_BARS, "primary", "stock_daily", "", bars.clone())
        .target(datasets::INDICATORS, "primary", "indicators", "", indicators)
        .build()
        .unwrap();
    sinks.bootstrap().await.unwrap();
    let clock: Arc<dyn Clock> = Arc::new(FixedClock::at_date(today()));
    Setup {
        _dir: dir,
        source: Arc::new(StaticSource::new("replay")),
        bars,
        sinks: Arc::new(sinks),
        engine: UpsertEngine::new(clock),
    }
}

fn controller(s: &Setup) -> ReconcileController {
    ReconcileController::new(
        s.source.clone(),
        s.sinks.resolve(datasets::DAILY_BARS, None).unwrap(),
        s.engine.clone(),
        ReconcileSettings {
            refresh_batch_size: 3,
            ..ReconcileSettings::default()
        },
    )
}

#[tokio::test]
async fn refresh_then_incremental_on_parquet() {
    let s = setup().await;
    let closes: Vec<_> = days(12).into_iter().map(|d| (d, 20.0)).collect();
    s.source.set_daily("600519", daily_rows("600519", &closes));
    let controller = controller(&s);

    let first = controller
        .reconcile("600519", &ReconcileOptions::default().lookback(5))
        .await
        .unwrap();
    assert_eq!(first.status, ReconcileStatus::FullRefresh);
    assert_eq!(first.modified, 12);
    assert_eq!(
        s.bars.count(&RecordFilter::entity("600519")).await.unwrap(),
        12
    );
    let meta = s.bars.get_meta("600519").unwrap();
    assert_eq!(meta.row_count, 12);

    let second = controller
        .reconcile("600519", &ReconcileOptions::default().lookback(5))
        .await
        .unwrap();
    assert_eq!(second.status, ReconcileStatus::Incremental);
    assert_eq!(second.modified, 5);
    assert_eq!(
        s.bars.count(&RecordFilter::entity("600519")).await.unwrap(),
        12
    );
}

#[tokio::test]
async fn macd_recompute_is_deterministic_on_parquet() {
    let s = setup().await;
    let closes: Vec<_> = days(40)
        .into_iter()
        .enumerate()
        .map(|(i, d)| (d, 100.0 + (i as f64 * 0.4).sin() * 5.0))
        .collect();
    s.source.set_daily("X", daily_rows("X", &closes));
    controller(&s)
        .reconcile("X", &ReconcileOptions::default())
        .await
        .unwrap();

    let pipeline = IndicatorPipeline::new(
        Arc::new(CalculatorRegistry::with_builtins()),
        s.sinks.clone(),
        s.engine.clone(),
    );
    let start = Some(today() - Duration::days(30));
    let first = pipeline
        .compute_and_store("MACD", start, Some(today()), Some("X"), None)
        .await
        .unwrap();
    let before = pipeline
        .fetch_series("MACD", Some("X"), None, None, None, None)
        .await
        .unwrap();

    let second = pipeline
        .compute_and_store("MACD", start, Some(today()), Some("X"), None)
        .await
        .unwrap();
    let after = pipeline
        .fetch_series("MACD", Some("X"), None, None, None, None)
        .await
        .unwrap();

    assert_eq!(first.points, 31);
    assert_eq!(second.modified(), 0);
    assert_eq!(before, after);
    let mut stamps: Vec<_> = after.points.iter().map(|p| p.timestamp).collect();
    stamps.dedup();
    assert_eq!(stamps.len(), 31);

    let sink = s.sinks.resolve(datasets::INDICATORS, None).unwrap();
    let stored = sink
        .store
        .find(&RecordQuery::new(RecordFilter::entity("X")))
        .await
        .unwrap();
    assert!(stored.iter().all(|r| r.field("dif").is_some() && r.field("dea").is_some()));
}
