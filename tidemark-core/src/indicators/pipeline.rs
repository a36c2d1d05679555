//! Indicator pipeline: bars in, derived series out, persisted through the upsert engine.
//!
//! Bars are read from the `daily_bars` sink; points are written to the
//! `indicators` sink keyed by `(target, indicator key, granularity, timestamp)`.

use super::{Calculator, CalculatorRegistry, PriceBar, SeriesPoint};
use crate::domain::{
    datasets, granularity, IndicatorDefinition, IndicatorParams, TimeSeriesRecord, WriteSummary,
};
use crate::error::{CoreError, CoreResult};
use crate::store::{RecordFilter, RecordQuery, SinkResolver, SortOrder};
use crate::upsert::UpsertEngine;
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of one `compute_and_store` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComputeOutcome {
    pub key: String,
    pub target: String,
    /// Points that survived timestamp normalization and deduplication.
    pub points: usize,
    pub summary: WriteSummary,
}

impl ComputeOutcome {
    /// Keys inserted or changed by this run.
    pub fn modified(&self) -> usize {
        self.summary.upserted + self.summary.modified
    }
}

/// Per-target results of `compute_batch`. Failed targets do not stop the batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ComputeBatch {
    pub outcomes: BTreeMap<String, ComputeOutcome>,
    pub errors: BTreeMap<String, String>,
}

impl ComputeBatch {
    pub fn inserted(&self) -> usize {
        self.outcomes.values().map(|o| o.summary.upserted).sum()
    }

    pub fn updated(&self) -> usize {
        self.outcomes.values().map(|o| o.summary.modified).sum()
    }
}

/// One stored indicator point as returned by `fetch_series`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorValue {
    pub timestamp: NaiveDateTime,
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extras: BTreeMap<String, f64>,
}

impl IndicatorValue {
    fn from_record(record: &TimeSeriesRecord) -> Self {
        let extras = record
            .fields
            .iter()
            .filter(|(name, _)| name.as_str() != VALUE_FIELD)
            .filter_map(|(name, v)| v.map(|v| (name.clone(), v)))
            .collect();
        Self {
            timestamp: record.timestamp,
            value: record.field(VALUE_FIELD),
            extras,
        }
    }
}

/// A stored series with its definition metadata, ascending by timestamp.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorSeries {
    pub key: String,
    pub name: String,
    pub description: String,
    pub entity_id: String,
    pub points: Vec<IndicatorValue>,
}

/// One page of stored indicator records, newest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorPage {
    pub total: usize,
    pub data: Vec<TimeSeriesRecord>,
}

/// Filter for `IndicatorPipeline::query`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesQuery {
    pub key: String,
    pub symbol: Option<String>,
    pub granularity: Option<String>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub tags: Vec<String>,
    pub limit: Option<usize>,
    pub skip: usize,
}

impl SeriesQuery {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    pub fn symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn granularity(mut self, granularity: impl Into<String>) -> Self {
        self.granularity = Some(granularity.into());
        self
    }

    pub fn between(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn page(mut self, skip: usize, limit: Option<usize>) -> Self {
        self.skip = skip;
        self.limit = limit;
        self
    }
}

const VALUE_FIELD: &str = "value";
const GRANULARITY_PARAM: &str = "granularity";

fn day_start(day: Option<NaiveDate>) -> Option<NaiveDateTime> {
    day.and_then(|d| d.and_hms_opt(0, 0, 0))
}

fn day_end(day: Option<NaiveDate>) -> Option<NaiveDateTime> {
    day.and_then(|d| d.and_hms_milli_opt(23, 59, 59, 999))
}

pub struct IndicatorPipeline {
    registry: Arc<CalculatorRegistry>,
    sinks: Arc<dyn SinkResolver>,
    engine: UpsertEngine,
}

impl IndicatorPipeline {
    pub fn new(
        registry: Arc<CalculatorRegistry>,
        sinks: Arc<dyn SinkResolver>,
        engine: UpsertEngine,
    ) -> Self {
        Self {
            registry,
            sinks,
            engine,
        }
    }

    pub fn registry(&self) -> &Arc<CalculatorRegistry> {
        &self.registry
    }

    /// Pick the entity the series is computed for.
    ///
    /// An explicit target that differs from the definition's default is only
    /// accepted when the definition allows overrides.
    fn resolve_target(definition: &IndicatorDefinition, target: Option<&str>) -> CoreResult<String> {
        let requested = target.map(str::trim).filter(|t| !t.is_empty());
        let default = definition.default_target.trim();
        match requested {
            Some(t) if !definition.allow_target_override && !default.is_empty() && t != default => {
                Err(CoreError::TargetOverrideNotAllowed {
                    key: definition.key.clone(),
                    target: t.to_string(),
                })
            }
            Some(t) => Ok(t.to_string()),
            None if !default.is_empty() => Ok(default.to_string()),
            None => Err(CoreError::InvalidArgument(format!(
                "indicator '{}' has no default target; a target is required",
                definition.key
            ))),
        }
    }

    async fn load_bars(
        &self,
        target: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> CoreResult<Vec<PriceBar>> {
        let sink = self.sinks.resolve(datasets::DAILY_BARS, None)?;
        let query = RecordQuery::new(
            RecordFilter::entity(target)
                .metric_key(datasets::DAILY_BARS)
                .granularity(granularity::DAILY)
                .since(day_start(start))
                .until(day_end(end)),
        );
        let records = sink.store.find(&query).await?;
        let bars: Vec<PriceBar> = records.iter().filter_map(PriceBar::from_record).collect();
        if bars.len() < records.len() {
            debug!(target = %target, skipped = records.len() - bars.len(), "bars without close skipped");
        }
        Ok(bars)
    }

    /// Compute a series without storing it.
    pub async fn run(
        &self,
        key: &str,
        target: Option<&str>,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        params: Option<&IndicatorParams>,
    ) -> CoreResult<Vec<SeriesPoint>> {
        let calculator = self.registry.get(key)?;
        let target = Self::resolve_target(calculator.definition(), target)?;
        let params = merged_params(calculator.as_ref(), params);
        let bars = self.load_bars(&target, start, end).await?;
        calculator.compute(&target, &bars, &params)
    }

    /// Compute the indicator over `[start, end]` and upsert every point.
    ///
    /// Re-running over unchanged bars rewrites the same keys with the same
    /// values, so the stored series never gains duplicate timestamps.
    pub async fn compute_and_store(
        &self,
        key: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        target: Option<&str>,
        params: Option<&IndicatorParams>,
    ) -> CoreResult<ComputeOutcome> {
        let calculator = self.registry.get(key)?;
        let definition = calculator.definition();
        let target = Self::resolve_target(definition, target)?;
        let params = merged_params(calculator.as_ref(), params);

        let bars = self.load_bars(&target, start, end).await?;
        let points = calculator.compute(&target, &bars, &params)?;
        let records = to_records(definition, &target, &params, points);
        let count = records.len();

        let sink = self.sinks.resolve(datasets::INDICATORS, None)?;
        let summary = self.engine.upsert_many(sink.store.as_ref(), records).await?;
        info!(
            key = %definition.key,
            target = %target,
            bars = bars.len(),
            points = count,
            inserted = summary.upserted,
            updated = summary.modified,
            "indicator computed"
        );
        Ok(ComputeOutcome {
            key: definition.key.clone(),
            target,
            points: count,
            summary,
        })
    }

    /// `compute_and_store` for each target; one target's failure is recorded
    /// and the rest still run.
    pub async fn compute_batch(
        &self,
        key: &str,
        targets: &[String],
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        params: Option<&IndicatorParams>,
    ) -> ComputeBatch {
        let mut batch = ComputeBatch::default();
        for target in targets {
            match self
                .compute_and_store(key, start, end, Some(target), params)
                .await
            {
                Ok(outcome) => {
                    batch.outcomes.insert(target.clone(), outcome);
                }
                Err(e) => {
                    warn!(key, target = %target, error = %e, "indicator computation failed");
                    batch.errors.insert(target.clone(), e.to_string());
                }
            }
        }
        batch
    }

    /// Stored points for one series, ascending, at most `limit` of them.
    ///
    /// The entity is `symbol`, else `target`, else the definition's default target.
    pub async fn fetch_series(
        &self,
        key: &str,
        symbol: Option<&str>,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        target: Option<&str>,
        limit: Option<usize>,
    ) -> CoreResult<IndicatorSeries> {
        let calculator = self.registry.get(key)?;
        let definition = calculator.definition();
        let entity = match symbol.map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => s.to_string(),
            None => Self::resolve_target(definition, target)?,
        };
        let sink = self.sinks.resolve(datasets::INDICATORS, None)?;
        let query = RecordQuery::new(
            RecordFilter::entity(&entity)
                .metric_key(definition.key.to_lowercase())
                .since(day_start(start))
                .until(day_end(end)),
        )
        .limit(limit);
        let records = sink.store.find(&query).await?;
        Ok(IndicatorSeries {
            key: definition.key.clone(),
            name: definition.name.clone(),
            description: definition.description.clone(),
            entity_id: entity,
            points: records.iter().map(IndicatorValue::from_record).collect(),
        })
    }

    /// Paged query over stored points of one indicator, newest first.
    pub async fn query(&self, request: &SeriesQuery) -> CoreResult<IndicatorPage> {
        let key = request.key.trim();
        if key.is_empty() {
            return Err(CoreError::InvalidArgument("indicator key is required".into()));
        }
        let mut filter = RecordFilter::new()
            .metric_key(key.to_lowercase())
            .since(day_start(request.start))
            .until(day_end(request.end));
        if let Some(symbol) = &request.symbol {
            filter = filter.entity_in(vec![symbol.clone()]);
        }
        if let Some(granularity) = &request.granularity {
            filter = filter.granularity(granularity.to_lowercase());
        }
        if !request.tags.is_empty() {
            filter = filter.tags_any(request.tags.clone());
        }

        let sink = self.sinks.resolve(datasets::INDICATORS, None)?;
        let total = sink.store.count(&filter).await?;
        let query = RecordQuery::new(filter)
            .order(SortOrder::Descending)
            .skip(request.skip)
            .limit(request.limit);
        let data = sink.store.find(&query).await?;
        Ok(IndicatorPage { total, data })
    }
}

fn merged_params(calculator: &dyn Calculator, params: Option<&IndicatorParams>) -> IndicatorParams {
    let defaults = &calculator.definition().default_params;
    match params {
        Some(p) => p.merged_over(defaults),
        None => defaults.clone(),
    }
}

/// Normalize computed points into indicator records.
///
/// Points without a timestamp, or with neither a value nor extras, are
/// dropped. Duplicate timestamps keep the last point; output is ascending.
fn to_records(
    definition: &IndicatorDefinition,
    target: &str,
    params: &IndicatorParams,
    points: Vec<SeriesPoint>,
) -> Vec<TimeSeriesRecord> {
    let metric_key = definition.key.to_lowercase();
    let granularity = params
        .get_str(GRANULARITY_PARAM)
        .map(|g| g.trim().to_lowercase())
        .filter(|g| !g.is_empty())
        .unwrap_or_else(|| granularity::DAILY.to_string());
    let params_json = serde_json::to_value(params).unwrap_or(serde_json::Value::Null);

    let mut by_ts: BTreeMap<NaiveDateTime, SeriesPoint> = BTreeMap::new();
    for point in points {
        if point.value.is_none() && point.extras.is_empty() {
            continue;
        }
        if let Some(ts) = point.utc_naive() {
            by_ts.insert(ts, point);
        }
    }

    by_ts
        .into_iter()
        .map(|(ts, point)| {
            let mut record = TimeSeriesRecord::new(target, &metric_key, &granularity, ts)
                .with_provider(&definition.source_label)
                .with_payload("params", params_json.clone());
            record.fields.insert(VALUE_FIELD.to_string(), point.value);
            for (name, v) in point.extras {
                record.fields.insert(name, Some(v));
            }
            record
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FixedClock;
    use crate::indicators::Ma;
    use crate::store::{MemoryStore, SinkRegistry, TimeSeriesStore};
    use chrono::{DateTime, Duration};

    fn day(n: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            + Duration::days(n)
    }

    struct Fixture {
        bars: Arc<MemoryStore>,
        indicators: Arc<MemoryStore>,
        pipeline: IndicatorPipeline,
    }

    fn fixture(closes: &[f64]) -> Fixture {
        let bars = Arc::new(MemoryStore::new());
        let indicators = Arc::new(MemoryStore::new());
        for (i, close) in closes.iter().enumerate() {
            bars.put(
                TimeSeriesRecord::new("X", datasets::DAILY_BARS, granularity::DAILY, day(i as i64))
                    .with_field("close", *close),
            );
        }
        let sinks = SinkRegistry::builder()
            .target(datasets::DAILY_BARS, "primary", "stock_daily", "", bars.clone())
            .target(datasets::INDICATORS, "primary", "indicators", "", indicators.clone())
            .build()
            .unwrap();
        let clock = Arc::new(FixedClock::new(day(100)));
        let pipeline = IndicatorPipeline::new(
            Arc::new(CalculatorRegistry::with_builtins()),
            Arc::new(sinks),
            UpsertEngine::new(clock),
        );
        Fixture {
            bars,
            indicators,
            pipeline,
        }
    }

    #[tokio::test]
    async fn compute_and_store_writes_one_record_per_bar() {
        let fx = fixture(&[10.0, 11.0, 12.0]);
        let params = IndicatorParams::new().with("window", 2);
        let outcome = fx
            .pipeline
            .compute_and_store("ma", None, None, Some("X"), Some(&params))
            .await
            .unwrap();
        assert_eq!(outcome.key, "MA");
        assert_eq!(outcome.target, "X");
        assert_eq!(outcome.modified(), 3);
        assert_eq!(fx.indicators.len(), 3);

        let series = fx
            .pipeline
            .fetch_series("MA", Some("X"), None, None, None, None)
            .await
            .unwrap();
        let values: Vec<_> = series.points.iter().map(|p| p.value.unwrap()).collect();
        assert_eq!(values, vec![10.0, 10.5, 11.5]);
        assert_eq!(series.name, "Moving Average");
    }

    #[tokio::test]
    async fn recompute_is_a_noop() {
        let fx = fixture(&[10.0, 11.0, 12.0, 13.0]);
        fx.pipeline
            .compute_and_store("MACD", None, None, Some("X"), None)
            .await
            .unwrap();
        let again = fx
            .pipeline
            .compute_and_store("MACD", None, None, Some("X"), None)
            .await
            .unwrap();
        assert_eq!(again.modified(), 0);
        assert_eq!(again.summary.matched, 4);
        assert_eq!(fx.indicators.len(), 4);
    }

    #[tokio::test]
    async fn window_bounds_limit_bars() {
        let fx = fixture(&[10.0, 11.0, 12.0, 13.0]);
        let start = day(1).date();
        let end = day(2).date();
        let outcome = fx
            .pipeline
            .compute_and_store("MA", Some(start), Some(end), Some("X"), None)
            .await
            .unwrap();
        assert_eq!(outcome.points, 2);
    }

    #[tokio::test]
    async fn missing_target_without_default_is_rejected() {
        let fx = fixture(&[10.0]);
        let err = fx
            .pipeline
            .compute_and_store("MA", None, None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn locked_target_rejects_override() {
        let fx = fixture(&[10.0, 11.0]);
        let def = IndicatorDefinition::new("MOM_X", "momentum on X")
            .default_target("X")
            .allow_target_override(false);
        fx.pipeline.registry().define_custom(def, "momentum_v1").unwrap();

        let err = fx
            .pipeline
            .compute_and_store("mom_x", None, None, Some("Y"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::TargetOverrideNotAllowed { .. }));

        let outcome = fx
            .pipeline
            .compute_and_store("mom_x", None, None, None, None)
            .await
            .unwrap();
        assert_eq!(outcome.target, "X");
        let stored = fx.indicators.find(&RecordQuery::new(RecordFilter::entity("X"))).await.unwrap();
        assert!(stored.iter().all(|r| r.provider == "custom" && r.metric_key == "mom_x"));
    }

    #[tokio::test]
    async fn query_pages_newest_first() {
        let fx = fixture(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        fx.pipeline
            .compute_and_store("MA", None, None, Some("X"), None)
            .await
            .unwrap();
        let page = fx
            .pipeline
            .query(&SeriesQuery::new("ma").symbol("X").page(1, Some(2)))
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        let stamps: Vec<_> = page.data.iter().map(|r| r.timestamp).collect();
        assert_eq!(stamps, vec![day(3), day(2)]);
    }

    #[tokio::test]
    async fn batch_collects_per_target_errors() {
        let fx = fixture(&[1.0, 2.0]);
        let targets = vec!["X".to_string(), "EMPTY".to_string()];
        let batch = fx
            .pipeline
            .compute_batch("NOPE", &targets, None, None, None)
            .await;
        assert_eq!(batch.errors.len(), 2);

        let batch = fx.pipeline.compute_batch("MA", &targets, None, None, None).await;
        assert!(batch.errors.is_empty());
        assert_eq!(batch.inserted(), 2);
        assert_eq!(batch.outcomes["EMPTY"].points, 0);
        assert_eq!(fx.bars.len(), 2);
    }

    #[test]
    fn points_are_normalized_before_storage() {
        let def = Ma::new().definition().clone();
        let ts = |s: &str| Some(DateTime::parse_from_rfc3339(s).unwrap());
        let points = vec![
            SeriesPoint { timestamp: ts("2024-01-02T08:00:00+08:00"), value: Some(1.0), extras: BTreeMap::new() },
            SeriesPoint { timestamp: None, value: Some(9.0), extras: BTreeMap::new() },
            SeriesPoint { timestamp: ts("2024-01-01T00:00:00Z"), value: None, extras: BTreeMap::new() },
            SeriesPoint { timestamp: ts("2024-01-02T00:00:00Z"), value: Some(2.0), extras: BTreeMap::new() },
        ];
        let records = to_records(&def, "X", &IndicatorParams::new(), points);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp, day(1));
        assert_eq!(records[0].field("value"), Some(2.0));
        assert_eq!(records[0].provider, "builtin");
    }
}
