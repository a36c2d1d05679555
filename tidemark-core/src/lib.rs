//! Tidemark Core: market time-series ingestion, reconciliation and derived indicators.
//!
//! This crate contains:
//! - Domain types (time-series records, natural keys, write summaries, reports)
//! - Source adapter contract and a session-scoped adapter wrapper
//! - Normalizer shared by ingestion and reconciliation
//! - Storage abstraction with in-memory and Parquet backends, plus the sink registry
//! - Idempotent natural-key upsert engine
//! - Reconciliation controller (windowed anomaly detection, staged full refresh)
//! - Indicator calculators, calculator registry and the indicator pipeline

pub mod data;
pub mod domain;
pub mod error;
pub mod indicators;
pub mod reconcile;
pub mod store;
pub mod upsert;

pub use error::{CoreError, CoreResult};
