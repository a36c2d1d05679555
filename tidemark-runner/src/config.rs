//! Pipeline configuration loaded from TOML.
//!
//! Every section has defaults, so an empty file is a valid configuration.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tidemark_core::domain::{datasets, IndicatorDefinition, IndicatorParams};
use tidemark_core::reconcile::{ReconcileSettings, MAX_LOOKBACK, MIN_LOOKBACK};

pub const DEFAULT_LOG_FILTER: &str = "tidemark_core=info,tidemark_runner=info";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub reconcile: ReconcileConfig,
    pub storage: StorageConfig,
    /// Per-dataset sink layout; datasets left out keep their default layout.
    pub sinks: BTreeMap<String, SinkConfig>,
    pub indicators: IndicatorsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub anomaly_threshold: f64,
    pub default_lookback: usize,
    pub full_history_start: NaiveDate,
    pub refresh_batch_size: usize,
    pub max_concurrency: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        let settings = ReconcileSettings::default();
        Self {
            anomaly_threshold: settings.default_threshold,
            default_lookback: settings.default_lookback,
            full_history_start: settings.full_history_start,
            refresh_batch_size: settings.refresh_batch_size,
            max_concurrency: settings.max_concurrency,
        }
    }
}

impl ReconcileConfig {
    pub fn settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            default_threshold: self.anomaly_threshold,
            default_lookback: self.default_lookback,
            full_history_start: self.full_history_start,
            refresh_batch_size: self.refresh_batch_size,
            max_concurrency: self.max_concurrency,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Parquet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Parquet root; each collection gets its own subdirectory.
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            root: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkConfig {
    pub default_target: String,
    pub targets: BTreeMap<String, TargetConfig>,
}

impl SinkConfig {
    /// A single `primary` target writing to `collection`.
    pub fn primary(collection: &str, description: &str) -> Self {
        let mut targets = BTreeMap::new();
        targets.insert(
            PRIMARY.to_string(),
            TargetConfig {
                collection: collection.to_string(),
                description: description.to_string(),
            },
        );
        Self {
            default_target: PRIMARY.to_string(),
            targets,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub collection: String,
    #[serde(default)]
    pub description: String,
}

const PRIMARY: &str = "primary";

/// Built-in layout used for every dataset the config does not mention.
pub fn default_sinks() -> BTreeMap<String, SinkConfig> {
    [
        (datasets::DAILY_BARS, "stock_daily", "Daily OHLCV bars"),
        (datasets::MINUTE_BARS, "stock_minute", "Intraday minute bars"),
        (datasets::FUNDAMENTALS, "stock_fundamentals", "Quarterly fundamentals"),
        (datasets::INDICATORS, "indicators", "Derived indicator series"),
        ("qlib_bars", "qlib_bars", "Bars exported for research tooling"),
    ]
    .into_iter()
    .map(|(dataset, collection, description)| {
        (dataset.to_string(), SinkConfig::primary(collection, description))
    })
    .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorsConfig {
    pub custom: Vec<CustomIndicatorConfig>,
}

/// One `[[indicators.custom]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomIndicatorConfig {
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub impl_ref: String,
    #[serde(default)]
    pub default_target: String,
    #[serde(default)]
    pub default_params: IndicatorParams,
    #[serde(default = "default_true")]
    pub allow_target_override: bool,
    #[serde(default)]
    pub source_label: String,
}

fn default_true() -> bool {
    true
}

impl CustomIndicatorConfig {
    pub fn definition(&self) -> IndicatorDefinition {
        let name = if self.name.trim().is_empty() {
            self.key.clone()
        } else {
            self.name.clone()
        };
        IndicatorDefinition::new(&self.key, name)
            .describe(&self.description)
            .default_target(&self.default_target)
            .default_params(self.default_params.clone())
            .allow_target_override(self.allow_target_override)
            .source_label(&self.source_label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl PipelineConfig {
    /// Load a configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse a configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Serialize the configuration to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(format!("serialize: {e}")))
    }

    /// The `[logging]` filter, or the default when left blank.
    pub fn log_filter(&self) -> &str {
        match self.logging.filter.trim() {
            "" => DEFAULT_LOG_FILTER,
            filter => filter,
        }
    }

    /// Configured sinks layered over the default layout.
    pub fn resolved_sinks(&self) -> BTreeMap<String, SinkConfig> {
        let mut sinks = default_sinks();
        sinks.extend(self.sinks.iter().map(|(k, v)| (k.clone(), v.clone())));
        sinks
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        let r = &self.reconcile;
        if !r.anomaly_threshold.is_finite() || r.anomaly_threshold < 0.0 {
            problems.push(format!(
                "reconcile.anomaly_threshold must be >= 0, got {}",
                r.anomaly_threshold
            ));
        }
        if !(MIN_LOOKBACK..=MAX_LOOKBACK).contains(&r.default_lookback) {
            problems.push(format!(
                "reconcile.default_lookback must be within {MIN_LOOKBACK}..={MAX_LOOKBACK}, got {}",
                r.default_lookback
            ));
        }
        if r.refresh_batch_size == 0 {
            problems.push("reconcile.refresh_batch_size must be > 0".to_string());
        }
        if r.max_concurrency == 0 {
            problems.push("reconcile.max_concurrency must be > 0".to_string());
        }
        for (dataset, sink) in &self.sinks {
            if sink.targets.is_empty() {
                problems.push(format!("sinks.{dataset} declares no targets"));
            } else if !sink.targets.contains_key(&sink.default_target) {
                problems.push(format!(
                    "sinks.{dataset}.default_target '{}' is not among its targets",
                    sink.default_target
                ));
            }
            for (alias, target) in &sink.targets {
                if target.collection.trim().is_empty() {
                    problems.push(format!("sinks.{dataset}.targets.{alias} has a blank collection"));
                }
            }
        }
        // Each store owns its collection directory; two stores sharing one clobber each other.
        let mut owners: BTreeMap<String, String> = BTreeMap::new();
        for (dataset, sink) in self.resolved_sinks() {
            for (alias, target) in &sink.targets {
                let collection = target.collection.trim();
                if collection.is_empty() {
                    continue;
                }
                if !is_plain_collection(collection) {
                    problems.push(format!(
                        "sinks.{dataset}.targets.{alias}.collection '{collection}' must be a plain name"
                    ));
                }
                let owner = format!("{dataset}.{alias}");
                if let Some(first) = owners.get(collection) {
                    problems.push(format!(
                        "sinks.{owner} reuses collection '{collection}' already owned by sinks.{first}"
                    ));
                } else {
                    owners.insert(collection.to_string(), owner);
                }
            }
        }
        for custom in &self.indicators.custom {
            if custom.key.trim().is_empty() || custom.impl_ref.trim().is_empty() {
                problems.push("indicators.custom entries need a key and an impl_ref".to_string());
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems.join("; ")))
        }
    }
}

/// A single directory component: no separators, no `.`/`..`, not absolute.
fn is_plain_collection(name: &str) -> bool {
    !name.contains(['/', '\\']) && name != "." && name != ".." && !Path::new(name).is_absolute()
}
