//! Tidemark Runner: configuration, bootstrap and the pipeline facade.
//!
//! This crate builds on `tidemark-core` to provide:
//! - TOML configuration with defaults for every section
//! - Tracing subscriber setup
//! - `Pipeline`: one-time bootstrap and the operation surface (ingest,
//!   reconcile, indicators, sink layout)
//! - A CSV replay source implementing the vendor adapter contract

pub mod config;
pub mod csv_source;
pub mod pipeline;
pub mod telemetry;

pub use config::{ConfigError, PipelineConfig, StorageBackend};
pub use csv_source::CsvSource;
pub use pipeline::{Pipeline, PipelineError};
pub use telemetry::{init_from_config, init_tracing};
