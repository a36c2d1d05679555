//! The assembled pipeline: sinks, upsert engine, reconciler and indicators
//! behind one handle.
//!
//! `Pipeline::bootstrap` does all one-time setup (config validation, store
//! construction and bootstrap, calculator registration). Nothing is lazily
//! initialised afterwards.

use crate::config::{ConfigError, PipelineConfig, StorageBackend};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tidemark_core::data::{iter_quarters, NormalizeSpec, Normalizer, RawRow, SourceAdapter};
use tidemark_core::domain::{
    datasets, BatchOutcome, Clock, IndicatorDefinition, IndicatorParams, ReconciliationReport,
    SystemClock, TimeSeriesRecord, WriteSummary,
};
use tidemark_core::indicators::{
    CalculatorRegistry, ComputeBatch, ComputeOutcome, IndicatorPage, IndicatorPipeline,
    IndicatorSeries, SeriesQuery,
};
use tidemark_core::reconcile::{ReconcileController, ReconcileOptions};
use tidemark_core::store::{
    MemoryStore, ParquetStore, SinkDescription, SinkRegistry, SinkResolver, TimeSeriesStore,
};
use tidemark_core::upsert::{prepare_ingest, UpsertEngine};
use tidemark_core::{CoreError, CoreResult};
use tracing::info;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

pub struct Pipeline {
    config: PipelineConfig,
    source: Arc<dyn SourceAdapter>,
    sinks: Arc<SinkRegistry>,
    engine: UpsertEngine,
    reconciler: ReconcileController,
    indicators: IndicatorPipeline,
}

impl Pipeline {
    /// Validate `config`, build and bootstrap every sink, register calculators.
    pub async fn bootstrap(
        config: PipelineConfig,
        source: Arc<dyn SourceAdapter>,
    ) -> Result<Self, PipelineError> {
        Self::bootstrap_with_clock(config, source, Arc::new(SystemClock)).await
    }

    pub async fn bootstrap_with_clock(
        config: PipelineConfig,
        source: Arc<dyn SourceAdapter>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let sinks = Arc::new(build_sinks(&config)?);
        sinks.bootstrap().await?;

        let registry = Arc::new(CalculatorRegistry::with_builtins());
        for custom in &config.indicators.custom {
            registry.define_custom(custom.definition(), &custom.impl_ref)?;
        }

        let engine = UpsertEngine::new(clock);
        let reconciler = ReconcileController::new(
            source.clone(),
            sinks.resolve(datasets::DAILY_BARS, None)?,
            engine.clone(),
            config.reconcile.settings(),
        );
        let indicators = IndicatorPipeline::new(registry, sinks.clone(), engine.clone());

        info!(
            source = source.name(),
            backend = ?config.storage.backend,
            indicators = indicators.registry().keys().len(),
            "pipeline ready"
        );
        Ok(Self {
            config,
            source,
            sinks,
            engine,
            reconciler,
            indicators,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // ── Ingestion ────────────────────────────────────────────────────

    /// Upsert caller-supplied records into `dataset`'s default target.
    pub async fn ingest(
        &self,
        dataset: &str,
        provider: &str,
        records: Vec<TimeSeriesRecord>,
    ) -> CoreResult<WriteSummary> {
        self.ingest_into(dataset, None, provider, records).await
    }

    /// `ingest` with an explicit sink target.
    pub async fn ingest_into(
        &self,
        dataset: &str,
        target: Option<&str>,
        provider: &str,
        records: Vec<TimeSeriesRecord>,
    ) -> CoreResult<WriteSummary> {
        let sink = self.sinks.resolve(dataset, target)?;
        let records = prepare_ingest(dataset, provider, records);
        let summary = self.engine.upsert_many(sink.store.as_ref(), records).await?;
        info!(
            dataset,
            target = %sink.target,
            total = summary.total,
            inserted = summary.upserted,
            updated = summary.modified,
            "ingested"
        );
        Ok(summary)
    }

    /// Fetch daily bars from the vendor and upsert them.
    pub async fn ingest_daily_bars(
        &self,
        code: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> CoreResult<WriteSummary> {
        check_range(start, end)?;
        let rows = self.source.fetch(code, start, end).await?;
        self.store_rows(datasets::DAILY_BARS, code, NormalizeSpec::daily_bars(), &rows)
            .await
    }

    /// Fetch minute bars from the vendor and upsert them.
    pub async fn ingest_minute_bars(
        &self,
        code: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> CoreResult<WriteSummary> {
        check_range(start, end)?;
        let rows = self.source.fetch_intraday(code, start, end).await?;
        self.store_rows(datasets::MINUTE_BARS, code, NormalizeSpec::minute_bars(), &rows)
            .await
    }

    /// Fetch every fiscal quarter touching `[start, end]` and upsert it.
    /// Quarters the vendor has nothing for are skipped.
    pub async fn ingest_fundamentals(
        &self,
        code: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> CoreResult<WriteSummary> {
        check_range(start, end)?;
        let mut summary = WriteSummary::default();
        for (year, quarter) in iter_quarters(start, end) {
            let rows = self.source.fetch_fundamentals(code, year, quarter).await?;
            if rows.is_empty() {
                continue;
            }
            let spec = NormalizeSpec::fundamentals(year, quarter);
            summary.absorb(
                self.store_rows(datasets::FUNDAMENTALS, code, spec, &rows)
                    .await?,
            );
        }
        Ok(summary)
    }

    async fn store_rows(
        &self,
        dataset: &str,
        code: &str,
        spec: NormalizeSpec,
        rows: &[RawRow],
    ) -> CoreResult<WriteSummary> {
        let records = Normalizer::new(spec).normalize(code, self.source.name(), rows);
        if records.len() < rows.len() {
            info!(
                code,
                dataset,
                dropped = rows.len() - records.len(),
                "vendor rows dropped during normalization"
            );
        }
        self.ingest(dataset, self.source.name(), records).await
    }

    // ── Reconciliation ───────────────────────────────────────────────

    pub async fn reconcile(
        &self,
        code: &str,
        options: &ReconcileOptions,
    ) -> CoreResult<ReconciliationReport> {
        self.reconciler.reconcile(code, options).await
    }

    pub async fn reconcile_batch(
        &self,
        codes: &[String],
        options: &ReconcileOptions,
    ) -> BTreeMap<String, BatchOutcome> {
        self.reconciler.reconcile_batch(codes, options).await
    }

    // ── Indicators ───────────────────────────────────────────────────

    pub async fn compute_indicator(
        &self,
        key: &str,
        target: Option<&str>,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        params: Option<&IndicatorParams>,
    ) -> CoreResult<ComputeOutcome> {
        self.indicators
            .compute_and_store(key, start, end, target, params)
            .await
    }

    pub async fn compute_indicator_batch(
        &self,
        key: &str,
        targets: &[String],
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        params: Option<&IndicatorParams>,
    ) -> ComputeBatch {
        self.indicators
            .compute_batch(key, targets, start, end, params)
            .await
    }

    pub async fn query_indicator(&self, query: &SeriesQuery) -> CoreResult<IndicatorPage> {
        self.indicators.query(query).await
    }

    pub async fn fetch_series(
        &self,
        key: &str,
        symbol: Option<&str>,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        target: Option<&str>,
        limit: Option<usize>,
    ) -> CoreResult<IndicatorSeries> {
        self.indicators
            .fetch_series(key, symbol, start, end, target, limit)
            .await
    }

    /// Register a custom indicator backed by a catalog implementation.
    pub fn define_indicator(
        &self,
        definition: IndicatorDefinition,
        impl_ref: &str,
    ) -> CoreResult<IndicatorDefinition> {
        let calculator = self
            .indicators
            .registry()
            .define_custom(definition, impl_ref)?;
        Ok(calculator.definition().clone())
    }

    pub fn list_indicators(&self) -> Vec<IndicatorDefinition> {
        self.indicators.registry().list()
    }

    // ── Sinks ────────────────────────────────────────────────────────

    pub fn describe_sinks(&self) -> Vec<SinkDescription> {
        self.sinks.describe()
    }

    pub fn sinks(&self) -> &Arc<SinkRegistry> {
        &self.sinks
    }
}

fn check_range(start: NaiveDate, end: NaiveDate) -> CoreResult<()> {
    if start > end {
        return Err(CoreError::InvalidArgument(format!(
            "start {start} is after end {end}"
        )));
    }
    Ok(())
}

/// One store per `(dataset, target)` from the resolved sink layout.
fn build_sinks(config: &PipelineConfig) -> CoreResult<SinkRegistry> {
    let mut builder = SinkRegistry::builder();
    for (dataset, sink) in config.resolved_sinks() {
        for (alias, target) in &sink.targets {
            let store: Arc<dyn TimeSeriesStore> = match config.storage.backend {
                StorageBackend::Memory => Arc::new(MemoryStore::new()),
                StorageBackend::Parquet => {
                    Arc::new(ParquetStore::new(config.storage.root.join(target.collection.trim())))
                }
            };
            builder = builder.target(
                &dataset,
                alias,
                &target.collection,
                &target.description,
                store,
            );
        }
        builder = builder.default_target(&dataset, &sink.default_target);
    }
    builder.build()
}
