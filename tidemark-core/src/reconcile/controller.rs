//! Reconciliation controller for daily bars.

use super::detect::detect_anomalies;
use crate::data::{Normalizer, NormalizeSpec, SourceAdapter};
use crate::domain::{
    BatchFailure, BatchOutcome, Clock, ReconcileStatus, ReconciliationReport, TimeSeriesRecord,
};
use crate::error::{CoreError, CoreResult};
use crate::store::{stamp_fresh, RecordFilter, RecordQuery, SinkHandle, StageId};
use crate::upsert::{validate_batch, UpsertEngine};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

pub const MIN_LOOKBACK: usize = 1;
pub const MAX_LOOKBACK: usize = 60;
/// Lower bound on the calendar-day fetch window, covers holidays.
pub const MIN_BUFFER_DAYS: i64 = 21;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileSettings {
    pub default_threshold: f64,
    pub default_lookback: usize,
    pub full_history_start: NaiveDate,
    pub refresh_batch_size: usize,
    pub max_concurrency: usize,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            default_threshold: 0.005,
            default_lookback: 7,
            full_history_start: NaiveDate::from_ymd_opt(1990, 1, 1).unwrap_or_default(),
            refresh_batch_size: 1000,
            max_concurrency: 4,
        }
    }
}

/// Per-call overrides; `None` falls back to `ReconcileSettings`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileOptions {
    pub lookback_trading_days: Option<usize>,
    pub threshold: Option<f64>,
    pub full_history_start: Option<NaiveDate>,
}

impl ReconcileOptions {
    pub fn lookback(mut self, days: usize) -> Self {
        self.lookback_trading_days = Some(days);
        self
    }

    pub fn threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn history_start(mut self, start: NaiveDate) -> Self {
        self.full_history_start = Some(start);
        self
    }
}

struct Resolved {
    lookback: usize,
    threshold: f64,
    history_start: NaiveDate,
    today: NaiveDate,
}

/// Compares a lookback window of fresh vendor bars with storage and decides
/// between an incremental upsert and a staged full refresh.
///
/// Cheap to clone; batch runs hand one clone to each worker task.
#[derive(Clone)]
pub struct ReconcileController {
    source: Arc<dyn SourceAdapter>,
    sink: SinkHandle,
    engine: UpsertEngine,
    normalizer: Arc<Normalizer>,
    settings: Arc<ReconcileSettings>,
}

impl ReconcileController {
    pub fn new(
        source: Arc<dyn SourceAdapter>,
        sink: SinkHandle,
        engine: UpsertEngine,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            source,
            sink,
            engine,
            normalizer: Arc::new(Normalizer::new(NormalizeSpec::daily_bars())),
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &ReconcileSettings {
        &self.settings
    }

    fn clock(&self) -> &Arc<dyn Clock> {
        self.engine.clock()
    }

    fn resolve(&self, options: &ReconcileOptions) -> CoreResult<Resolved> {
        let lookback = options
            .lookback_trading_days
            .unwrap_or(self.settings.default_lookback);
        if !(MIN_LOOKBACK..=MAX_LOOKBACK).contains(&lookback) {
            return Err(CoreError::InvalidArgument(format!(
                "lookback_trading_days must be within {MIN_LOOKBACK}..={MAX_LOOKBACK}, got {lookback}"
            )));
        }
        let threshold = options.threshold.unwrap_or(self.settings.default_threshold);
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(CoreError::InvalidArgument(format!(
                "threshold must be a non-negative number, got {threshold}"
            )));
        }
        let today = self.clock().today();
        let history_start = options
            .full_history_start
            .unwrap_or(self.settings.full_history_start);
        if history_start > today {
            return Err(CoreError::InvalidArgument(format!(
                "full_history_start {history_start} is after today {today}"
            )));
        }
        Ok(Resolved {
            lookback,
            threshold,
            history_start,
            today,
        })
    }

    fn normalize(&self, code: &str, rows: &[crate::data::RawRow]) -> Vec<TimeSeriesRecord> {
        self.normalizer.normalize(code, self.source.name(), rows)
    }

    /// Reconcile one code.
    pub async fn reconcile(
        &self,
        code: &str,
        options: &ReconcileOptions,
    ) -> CoreResult<ReconciliationReport> {
        let Resolved {
            lookback,
            threshold,
            history_start,
            today,
        } = self.resolve(options)?;

        let buffer_days = ((lookback as i64) * 3).max(MIN_BUFFER_DAYS);
        let window_start = today - Duration::days(buffer_days);
        let rows = self.source.fetch(code, window_start, today).await?;
        let fetched = self.normalize(code, &rows);
        if fetched.is_empty() {
            info!(code, "no vendor data in reconciliation window");
            return Ok(ReconciliationReport::no_data(code, lookback));
        }

        let recent = &fetched[fetched.len().saturating_sub(lookback)..];
        let first = recent[0].timestamp;
        let spec = self.normalizer.spec();
        let query = RecordQuery::new(
            RecordFilter::entity(code)
                .metric_key(&spec.metric_key)
                .granularity(&spec.granularity)
                .since(Some(first)),
        );
        let stored: BTreeMap<NaiveDate, TimeSeriesRecord> = self
            .sink
            .store
            .find(&query)
            .await?
            .into_iter()
            .map(|r| (r.date(), r))
            .collect();

        let detection = detect_anomalies(recent, &stored, threshold);

        if !detection.is_clean() {
            warn!(
                code,
                anomalies = ?detection.anomalies,
                missing_dates = ?detection.missing_dates,
                "stored history diverged from vendor; running full refresh"
            );
            let inserted = self.full_refresh(code, history_start, today).await?;
            info!(code, inserted, "full refresh complete");
            return Ok(ReconciliationReport {
                code: code.to_string(),
                lookback_trading_days: lookback,
                status: ReconcileStatus::FullRefresh,
                modified: inserted,
                anomalies: detection.anomalies,
                missing_dates: detection.missing_dates,
            });
        }

        let summary = self
            .engine
            .upsert_many(self.sink.store.as_ref(), recent.to_vec())
            .await?;
        info!(code, written = summary.written(), changed = summary.modified, "incremental reconcile");
        Ok(ReconciliationReport {
            code: code.to_string(),
            lookback_trading_days: lookback,
            status: ReconcileStatus::Incremental,
            modified: summary.written(),
            anomalies: Vec::new(),
            missing_dates: Vec::new(),
        })
    }

    /// Replace the code's entire stored history with `[start, end]` from the vendor.
    ///
    /// Rows are staged in fixed-size batches and swapped in by one commit, so
    /// readers never see the code without history. Any failure discards the
    /// stage and leaves the previous rows in place.
    async fn full_refresh(&self, code: &str, start: NaiveDate, end: NaiveDate) -> CoreResult<usize> {
        let rows = self.source.fetch(code, start, end).await?;
        let mut records = self.normalize(code, &rows);
        validate_batch(&records)?;
        if records.is_empty() {
            warn!(code, "full refresh fetched no rows; clearing stored history");
        }
        stamp_fresh(&mut records, self.clock().now());

        let store = self.sink.store.as_ref();
        let stage = StageId::generate();
        let batch_size = self.settings.refresh_batch_size.max(1);
        // An empty history still opens the stage so the commit clears the code.
        let batches: Vec<Vec<TimeSeriesRecord>> = if records.is_empty() {
            vec![Vec::new()]
        } else {
            records.chunks(batch_size).map(<[_]>::to_vec).collect()
        };
        for batch in batches {
            if let Err(e) = store.stage(code, &stage, batch).await {
                self.abandon_stage(code, &stage).await;
                return Err(e.into());
            }
        }
        match store.commit_stage(code, &stage).await {
            Ok(committed) => Ok(committed),
            Err(e) => {
                self.abandon_stage(code, &stage).await;
                Err(e.into())
            }
        }
    }

    async fn abandon_stage(&self, code: &str, stage: &StageId) {
        if let Err(e) = self.sink.store.discard_stage(code, stage).await {
            warn!(code, stage = %stage, error = %e, "failed to discard staged refresh");
        }
    }

    /// Reconcile many codes on a bounded worker pool.
    ///
    /// A failing code becomes an `ERROR` entry; the other codes still run.
    /// Duplicate codes are reconciled once.
    pub async fn reconcile_batch(
        &self,
        codes: &[String],
        options: &ReconcileOptions,
    ) -> BTreeMap<String, BatchOutcome> {
        let unique: BTreeSet<String> = codes.iter().cloned().collect();
        let permits = Arc::new(Semaphore::new(self.settings.max_concurrency.max(1)));
        let mut workers = JoinSet::new();

        for code in unique.iter().cloned() {
            let controller = self.clone();
            let options = options.clone();
            let permits = permits.clone();
            workers.spawn(async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => match controller.reconcile(&code, &options).await {
                        Ok(report) => BatchOutcome::Completed(report),
                        Err(e) => {
                            error!(code = %code, error = %e, "reconciliation failed");
                            BatchOutcome::Failed(BatchFailure::new(&code, e.to_string()))
                        }
                    },
                    Err(e) => BatchOutcome::Failed(BatchFailure::new(&code, e.to_string())),
                };
                (code, outcome)
            });
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((code, outcome)) => {
                    results.insert(code, outcome);
                }
                Err(e) => error!(error = %e, "reconciliation worker aborted"),
            }
        }
        // A panicked worker loses its code; report it rather than drop it.
        for code in unique {
            results.entry(code.clone()).or_insert_with(|| {
                BatchOutcome::Failed(BatchFailure::new(code, "reconciliation worker aborted"))
            });
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{daily_rows, SourceError, StaticSource};
    use crate::domain::{datasets, FixedClock, NaturalKey};
    use crate::store::{MemoryStore, SinkRegistry, SinkResolver, TimeSeriesStore};
    use chrono::Weekday;
    use chrono::Datelike;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    /// The last `n` weekdays up to and including `today()`.
    fn business_days(n: usize) -> Vec<NaiveDate> {
        let mut days = Vec::new();
        let mut d = today();
        while days.len() < n {
            if !matches!(d.weekday(), Weekday::Sat | Weekday::Sun) {
                days.push(d);
            }
            d -= Duration::days(1);
        }
        days.reverse();
        days
    }

    struct Fixture {
        source: Arc<StaticSource>,
        store: Arc<MemoryStore>,
        controller: ReconcileController,
    }

    fn fixture() -> Fixture {
        let source = Arc::new(StaticSource::new("replay"));
        let store = Arc::new(MemoryStore::new());
        let registry = SinkRegistry::builder()
            .target(datasets::DAILY_BARS, "primary", "stock_daily", "", store.clone())
            .build()
            .unwrap();
        let sink = registry.resolve(datasets::DAILY_BARS, None).unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::at_date(today()));
        let controller = ReconcileController::new(
            source.clone(),
            sink,
            UpsertEngine::new(clock),
            ReconcileSettings::default(),
        );
        Fixture {
            source,
            store,
            controller,
        }
    }

    fn key(code: &str, day: NaiveDate) -> NaturalKey {
        NaturalKey {
            entity_id: code.to_string(),
            metric_key: "daily_bars".to_string(),
            granularity: "1d".to_string(),
            timestamp: day.and_hms_opt(0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn empty_vendor_window_is_no_data() {
        let fx = fixture();
        let report = fx.controller.reconcile("X", &ReconcileOptions::default()).await.unwrap();
        assert_eq!(report.status, ReconcileStatus::NoData);
        assert_eq!(report.modified, 0);
        assert_eq!(report.lookback_trading_days, 7);
    }

    #[tokio::test]
    async fn first_run_fills_history_via_full_refresh() {
        let fx = fixture();
        let days = business_days(10);
        let rows: Vec<_> = days.iter().map(|d| (*d, 10.0)).collect();
        fx.source.set_daily("X", daily_rows("X", &rows));

        let report = fx
            .controller
            .reconcile("X", &ReconcileOptions::default().lookback(5))
            .await
            .unwrap();
        assert_eq!(report.status, ReconcileStatus::FullRefresh);
        assert_eq!(report.missing_dates.len(), 5);
        assert_eq!(report.modified, 10);
        assert_eq!(fx.store.len(), 10);
    }

    #[tokio::test]
    async fn empty_history_refresh_clears_the_code() {
        let fx = fixture();
        let day = today();
        fx.store.put(
            TimeSeriesRecord::new("X", "daily_bars", "1d", day.and_hms_opt(0, 0, 0).unwrap())
                .with_field("close", 10.0),
        );
        fx.source.set_daily("X", daily_rows("X", &[(day, 10.0)]));

        let start = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2000, 12, 31).unwrap();
        let committed = fx.controller.full_refresh("X", start, end).await.unwrap();
        assert_eq!(committed, 0);
        assert!(fx.store.is_empty());
        assert_eq!(fx.store.pending_stages(), 0);
    }

    #[tokio::test]
    async fn lookback_out_of_range_is_rejected() {
        let fx = fixture();
        for bad in [0, 61] {
            let err = fx
                .controller
                .reconcile("X", &ReconcileOptions::default().lookback(bad))
                .await
                .unwrap_err();
            assert!(matches!(err, CoreError::InvalidArgument(_)));
        }
        let err = fx
            .controller
            .reconcile("X", &ReconcileOptions::default().threshold(-0.1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
        let err = fx
            .controller
            .reconcile(
                "X",
                &ReconcileOptions::default().history_start(today() + Duration::days(1)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
        assert_eq!(fx.source.calls(), 0);
    }

    #[tokio::test]
    async fn vendor_failure_leaves_store_untouched() {
        let fx = fixture();
        let days = business_days(10);
        let rows: Vec<_> = days.iter().map(|d| (*d, 10.0)).collect();
        fx.source.set_daily("X", daily_rows("X", &rows));
        fx.controller
            .reconcile("X", &ReconcileOptions::default().lookback(5))
            .await
            .unwrap();

        // Drop one stored date so the next run wants a refresh, then break the vendor.
        fx.store.remove(&key("X", days[8]));
        let before = fx.store.len();
        fx.source
            .fail_with("X", SourceError::NetworkUnreachable("down".into()));
        let err = fx
            .controller
            .reconcile("X", &ReconcileOptions::default().lookback(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::SourceUnavailable(_)));
        assert_eq!(fx.store.len(), before);
        assert_eq!(fx.store.pending_stages(), 0);
    }

    #[tokio::test]
    async fn batch_isolates_failures() {
        let fx = fixture();
        let days = business_days(10);
        let rows: Vec<_> = days.iter().map(|d| (*d, 10.0)).collect();
        fx.source.set_daily("B", daily_rows("B", &rows));
        fx.source
            .fail_with("A", SourceError::NetworkUnreachable("down".into()));

        let codes = vec!["A".to_string(), "B".to_string(), "B".to_string()];
        let results = fx
            .controller
            .reconcile_batch(&codes, &ReconcileOptions::default().lookback(5))
            .await;
        assert_eq!(results.len(), 2);
        assert_eq!(results["A"].status(), ReconcileStatus::Error);
        match &results["A"] {
            BatchOutcome::Failed(f) => assert!(f.detail.contains("down")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(results["B"].status(), ReconcileStatus::FullRefresh);
        assert_eq!(
            fx.store.count(&RecordFilter::entity("B")).await.unwrap(),
            10
        );
    }
}
