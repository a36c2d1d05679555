//! Property tests for write-path invariants.
//!
//! Uses proptest to verify:
//! 1. Normalizer output is strictly ascending with one record per timestamp
//! 2. Duplicate vendor rows keep the last occurrence
//! 3. Upserting the same batch twice inserts nothing the second time
//! 4. Anomaly detection never flags a window compared with itself

use chrono::{Duration, NaiveDate};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use tidemark_core::data::{daily_rows, NormalizeSpec, Normalizer};
use tidemark_core::domain::FixedClock;
use tidemark_core::reconcile::detect_anomalies;
use tidemark_core::store::{MemoryStore, RecordFilter, TimeSeriesStore};
use tidemark_core::upsert::UpsertEngine;

// ── Strategies (proptest) ────────────────────────────────────────────

fn arb_close() -> impl Strategy<Value = f64> {
    (1.0..500.0_f64).prop_map(|p| (p * 100.0).round() / 100.0)
}

/// Day offsets (with repeats) and closes, in arbitrary order.
fn arb_rows() -> impl Strategy<Value = Vec<(u32, f64)>> {
    prop::collection::vec((0..30u32, arb_close()), 0..40)
}

fn to_dated(rows: &[(u32, f64)]) -> Vec<(NaiveDate, f64)> {
    let base = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    rows.iter()
        .map(|(d, c)| (base + Duration::days(*d as i64), *c))
        .collect()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// ── 1 & 2. Normalizer ordering and dedup ─────────────────────────────

proptest! {
    #[test]
    fn normalized_rows_are_sorted_and_unique(rows in arb_rows()) {
        let dated = to_dated(&rows);
        let records = Normalizer::new(NormalizeSpec::daily_bars())
            .normalize("X", "replay", &daily_rows("X", &dated));

        for pair in records.windows(2) {
            prop_assert!(pair[0].timestamp < pair[1].timestamp);
        }

        let mut last: BTreeMap<NaiveDate, f64> = BTreeMap::new();
        for (day, close) in &dated {
            last.insert(*day, *close);
        }
        prop_assert_eq!(records.len(), last.len());
        for record in &records {
            prop_assert_eq!(record.field("close"), Some(last[&record.date()]));
        }
    }
}

// ── 3. Upsert idempotence ────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn second_identical_upsert_inserts_nothing(rows in arb_rows()) {
        let records = Normalizer::new(NormalizeSpec::daily_bars())
            .normalize("X", "replay", &daily_rows("X", &to_dated(&rows)));
        let store = MemoryStore::new();
        let clock = Arc::new(FixedClock::at_date(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()));
        let engine = UpsertEngine::new(clock);

        let rt = runtime();
        let (first, second, count) = rt.block_on(async {
            let first = engine.upsert_many(&store, records.clone()).await.unwrap();
            let second = engine.upsert_many(&store, records.clone()).await.unwrap();
            let count = store.count(&RecordFilter::entity("X")).await.unwrap();
            (first, second, count)
        });

        prop_assert_eq!(first.upserted, records.len());
        prop_assert_eq!(second.upserted, 0);
        prop_assert_eq!(second.modified, 0);
        prop_assert_eq!(second.matched, records.len());
        prop_assert_eq!(count, records.len());
    }
}

// ── 4. Self-comparison is clean ──────────────────────────────────────

proptest! {
    #[test]
    fn identical_window_has_no_anomalies(
        rows in arb_rows(),
        threshold in 0.0..0.1_f64,
    ) {
        let records = Normalizer::new(NormalizeSpec::daily_bars())
            .normalize("X", "replay", &daily_rows("X", &to_dated(&rows)));
        let stored = records.iter().map(|r| (r.date(), r.clone())).collect();
        let detection = detect_anomalies(&records, &stored, threshold);
        prop_assert!(detection.is_clean());
    }
}
