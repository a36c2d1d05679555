//! Sink resolution: `(dataset, target alias)` → concrete store handle.
//!
//! The registry is assembled and bootstrapped once at startup. Resolving a
//! dataset without a target picks the dataset's default target.

use super::{MemoryStore, TimeSeriesStore};
use crate::error::{CoreError, CoreResult};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// A resolved storage handle for one logical collection.
#[derive(Clone)]
pub struct SinkHandle {
    pub dataset: String,
    pub target: String,
    pub collection: String,
    pub description: String,
    pub store: Arc<dyn TimeSeriesStore>,
}

impl std::fmt::Debug for SinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkHandle")
            .field("dataset", &self.dataset)
            .field("target", &self.target)
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

pub trait SinkResolver: Send + Sync {
    fn resolve(&self, dataset: &str, target: Option<&str>) -> CoreResult<SinkHandle>;
}

/// One row of `SinkRegistry::describe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkDescription {
    pub dataset: String,
    pub target: String,
    pub collection: String,
    pub description: String,
    pub is_default: bool,
}

struct TargetEntry {
    collection: String,
    description: String,
    store: Arc<dyn TimeSeriesStore>,
}

struct DatasetEntry {
    default_target: String,
    targets: BTreeMap<String, TargetEntry>,
}

pub struct SinkRegistry {
    datasets: BTreeMap<String, DatasetEntry>,
}

impl SinkRegistry {
    pub fn builder() -> SinkRegistryBuilder {
        SinkRegistryBuilder::default()
    }

    /// Every dataset backed by a fresh `MemoryStore` under a `primary` target.
    pub fn in_memory(datasets: &[&str]) -> CoreResult<Self> {
        let mut builder = Self::builder();
        for dataset in datasets {
            builder = builder.target(
                dataset,
                "primary",
                *dataset,
                "in-memory",
                Arc::new(MemoryStore::new()),
            );
        }
        builder.build()
    }

    /// Run `bootstrap` on every distinct store. Call once before serving.
    pub async fn bootstrap(&self) -> CoreResult<()> {
        for (dataset, entry) in &self.datasets {
            for (alias, target) in &entry.targets {
                target.store.bootstrap().await?;
                info!(dataset = %dataset, target = %alias, collection = %target.collection, "sink ready");
            }
        }
        Ok(())
    }

    pub fn describe(&self) -> Vec<SinkDescription> {
        self.datasets
            .iter()
            .flat_map(|(dataset, entry)| {
                entry.targets.iter().map(move |(alias, target)| SinkDescription {
                    dataset: dataset.clone(),
                    target: alias.clone(),
                    collection: target.collection.clone(),
                    description: target.description.clone(),
                    is_default: *alias == entry.default_target,
                })
            })
            .collect()
    }

    pub fn datasets(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }
}

impl SinkResolver for SinkRegistry {
    fn resolve(&self, dataset: &str, target: Option<&str>) -> CoreResult<SinkHandle> {
        let entry = self.datasets.get(dataset).ok_or_else(|| CoreError::UnknownSink {
            dataset: dataset.to_string(),
            target: target.unwrap_or("<default>").to_string(),
            available: join_keys(self.datasets.keys()),
        })?;
        let alias = target.unwrap_or(&entry.default_target);
        let found = entry.targets.get(alias).ok_or_else(|| CoreError::UnknownSink {
            dataset: dataset.to_string(),
            target: alias.to_string(),
            available: join_keys(entry.targets.keys()),
        })?;
        Ok(SinkHandle {
            dataset: dataset.to_string(),
            target: alias.to_string(),
            collection: found.collection.clone(),
            description: found.description.clone(),
            store: found.store.clone(),
        })
    }
}

fn join_keys<'a>(keys: impl Iterator<Item = &'a String>) -> String {
    keys.map(String::as_str).collect::<Vec<_>>().join(", ")
}

#[derive(Default)]
pub struct SinkRegistryBuilder {
    datasets: BTreeMap<String, DatasetEntry>,
    errors: Vec<String>,
}

impl SinkRegistryBuilder {
    /// Register a target. The first target of a dataset becomes its default.
    pub fn target(
        mut self,
        dataset: &str,
        alias: &str,
        collection: &str,
        description: &str,
        store: Arc<dyn TimeSeriesStore>,
    ) -> Self {
        let entry = self
            .datasets
            .entry(dataset.to_string())
            .or_insert_with(|| DatasetEntry {
                default_target: alias.to_string(),
                targets: BTreeMap::new(),
            });
        let previous = entry.targets.insert(
            alias.to_string(),
            TargetEntry {
                collection: collection.to_string(),
                description: description.to_string(),
                store,
            },
        );
        if previous.is_some() {
            self.errors
                .push(format!("dataset '{dataset}' declares target '{alias}' twice"));
        }
        self
    }

    pub fn default_target(mut self, dataset: &str, alias: &str) -> Self {
        match self.datasets.get_mut(dataset) {
            Some(entry) => entry.default_target = alias.to_string(),
            None => self
                .errors
                .push(format!("default target set for undeclared dataset '{dataset}'")),
        }
        self
    }

    pub fn build(self) -> CoreResult<SinkRegistry> {
        let mut errors = self.errors;
        for (dataset, entry) in &self.datasets {
            if !entry.targets.contains_key(&entry.default_target) {
                errors.push(format!(
                    "dataset '{dataset}' default target '{}' is not declared",
                    entry.default_target
                ));
            }
        }
        if !errors.is_empty() {
            return Err(CoreError::InvalidArgument(errors.join("; ")));
        }
        Ok(SinkRegistry {
            datasets: self.datasets,
        })
    }
}
