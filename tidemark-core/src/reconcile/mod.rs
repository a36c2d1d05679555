//! Reconciliation of stored daily bars against the vendor's current view.
//!
//! Each call re-enters a fresh state machine:
//! `NO_DATA` (vendor returned nothing), `INCREMENTAL` (recent window agrees
//! with storage, upsert it), `FULL_REFRESH` (a restatement or a gap was seen,
//! replace the whole history), `ERROR` (batch runs only).

pub mod controller;
pub mod detect;

pub use controller::{
    ReconcileController, ReconcileOptions, ReconcileSettings, MAX_LOOKBACK, MIN_BUFFER_DAYS,
    MIN_LOOKBACK,
};
pub use detect::{check_field, detect_anomalies, Detection, KEY_FIELDS, ZERO_TOLERANCE};
