//! Write accounting shared by every ingestion and compute call.

use serde::{Deserialize, Serialize};

/// What a single natural-key upsert did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    /// The key was new.
    Inserted,
    /// The key existed and its content changed.
    Updated,
    /// The key existed and its content was already identical.
    Unchanged,
}

/// `{total, matched, modified, upserted}` for one write call.
///
/// - `matched`: keys that already existed, changed or not.
/// - `modified`: matched keys whose stored content differed after the write.
///   Refreshing `updated_at` alone never counts.
/// - `upserted`: brand-new keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteSummary {
    pub total: usize,
    pub matched: usize,
    pub modified: usize,
    pub upserted: usize,
}

impl WriteSummary {
    pub fn from_outcomes(outcomes: &[UpsertOutcome]) -> Self {
        let mut summary = Self::default();
        for outcome in outcomes {
            summary.record(*outcome);
        }
        summary
    }

    pub fn record(&mut self, outcome: UpsertOutcome) {
        self.total += 1;
        match outcome {
            UpsertOutcome::Inserted => self.upserted += 1,
            UpsertOutcome::Updated => {
                self.matched += 1;
                self.modified += 1;
            }
            UpsertOutcome::Unchanged => self.matched += 1,
        }
    }

    pub fn absorb(&mut self, other: WriteSummary) {
        self.total += other.total;
        self.matched += other.matched;
        self.modified += other.modified;
        self.upserted += other.upserted;
    }

    /// Rows that now hold the written values (matched + upserted).
    pub fn written(&self) -> usize {
        self.matched + self.upserted
    }

    /// Nothing new and nothing changed.
    pub fn is_noop(&self) -> bool {
        self.modified == 0 && self.upserted == 0
    }
}
