//! Reconciliation results.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStatus {
    NoData,
    Incremental,
    FullRefresh,
    Error,
}

/// A stored-vs-fetched divergence on one field of one date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub date: NaiveDate,
    pub field: String,
    pub old: Option<f64>,
    pub new: Option<f64>,
    /// Relative error; `None` when one side is null or the stored value is ~0.
    pub error: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub code: String,
    pub lookback_trading_days: usize,
    pub status: ReconcileStatus,
    pub modified: usize,
    pub anomalies: Vec<Anomaly>,
    pub missing_dates: Vec<NaiveDate>,
}

impl ReconciliationReport {
    pub fn no_data(code: impl Into<String>, lookback_trading_days: usize) -> Self {
        Self {
            code: code.into(),
            lookback_trading_days,
            status: ReconcileStatus::NoData,
            modified: 0,
            anomalies: Vec::new(),
            missing_dates: Vec::new(),
        }
    }
}

/// Per-code failure in a batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub code: String,
    pub status: ReconcileStatus,
    pub detail: String,
}

impl BatchFailure {
    pub fn new(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            status: ReconcileStatus::Error,
            detail: detail.into(),
        }
    }
}

/// One entry of a batch reconciliation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchOutcome {
    Completed(ReconciliationReport),
    Failed(BatchFailure),
}

impl BatchOutcome {
    pub fn status(&self) -> ReconcileStatus {
        match self {
            BatchOutcome::Completed(report) => report.status,
            BatchOutcome::Failed(failure) => failure.status,
        }
    }

    pub fn report(&self) -> Option<&ReconciliationReport> {
        match self {
            BatchOutcome::Completed(report) => Some(report),
            BatchOutcome::Failed(_) => None,
        }
    }
}
