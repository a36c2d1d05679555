//! Core error type.
//!
//! Every public operation in this crate returns `CoreError`. Adapter and
//! storage failures keep their own enums (`SourceError`, `StoreError`) and are
//! folded in through `#[from]`, so callers can tell a vendor outage from a
//! storage outage without string matching.

use crate::data::provider::SourceError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed batch; raised before any record of the batch is written.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("source unavailable: {0}")]
    SourceUnavailable(#[from] SourceError),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] StoreError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown indicator '{0}'")]
    UnknownIndicator(String),

    #[error("indicator '{0}' is already registered")]
    DuplicateIndicator(String),

    #[error("unknown implementation reference '{0}'")]
    UnknownImplementation(String),

    #[error("indicator '{key}' does not allow target override (requested '{target}')")]
    TargetOverrideNotAllowed { key: String, target: String },

    #[error("no sink for dataset '{dataset}' target '{target}' (available: {available})")]
    UnknownSink {
        dataset: String,
        target: String,
        available: String,
    },

    #[error("calculation failed for '{key}': {detail}")]
    Calculation { key: String, detail: String },
}

pub type CoreResult<T> = Result<T, CoreError>;
