use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::parser::LogicalRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    DuplicateIgnored,
}

/// Final count check against the total the source (or caller) announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Verification {
    Complete { found: u64 },
    Incomplete { found: u64, expected: u64 },
    /// No expected total was known; the count could not be checked.
    Unverified { found: u64 },
}

impl Verification {
    pub fn is_complete(&self) -> bool {
        matches!(self, Verification::Complete { .. })
    }

    pub fn found(&self) -> u64 {
        match *self {
            Verification::Complete { found }
            | Verification::Incomplete { found, .. }
            | Verification::Unverified { found } => found,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Verification::Complete { .. } => "complete",
            Verification::Incomplete { .. } => "incomplete",
            Verification::Unverified { .. } => "unverified",
        }
    }
}

/// Every finalized identifier, with the page its record was first served on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageSet {
    ids: BTreeMap<String, u64>,
}

impl CoverageSet {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains_key(id)
    }

    pub fn first_page(&self, id: &str) -> Option<u64> {
        self.ids.get(id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.ids.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Admits finalized records exactly once. Admissions made since the last
/// `commit_page` can be undone as a unit.
#[derive(Debug, Clone, Default)]
pub struct CoverageTracker {
    set: CoverageSet,
    duplicates: u64,
    journal: Vec<String>,
    journal_duplicates: u64,
}

impl CoverageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(set: CoverageSet, duplicates: u64) -> Self {
        Self {
            set,
            duplicates,
            ..Self::default()
        }
    }

    pub fn record(&mut self, record: &LogicalRecord) -> Admission {
        if self.set.contains(record.id()) {
            debug!(id = record.id(), page = record.first_page(), "duplicate record ignored");
            self.duplicates += 1;
            self.journal_duplicates += 1;
            return Admission::DuplicateIgnored;
        }
        self.set.ids.insert(record.id().to_string(), record.first_page());
        self.journal.push(record.id().to_string());
        Admission::Accepted
    }

    /// Make admissions since the previous commit permanent.
    pub fn commit_page(&mut self) {
        self.journal.clear();
        self.journal_duplicates = 0;
    }

    /// Undo admissions since the previous commit.
    pub fn rollback_page(&mut self) {
        for id in self.journal.drain(..) {
            self.set.ids.remove(&id);
        }
        self.duplicates -= self.journal_duplicates;
        self.journal_duplicates = 0;
    }

    pub fn contains(&self, id: &str) -> bool {
        self.set.contains(id)
    }

    pub fn first_page(&self, id: &str) -> Option<u64> {
        self.set.first_page(id)
    }

    pub fn len(&self) -> u64 {
        self.set.len() as u64
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn snapshot(&self) -> CoverageSet {
        self.set.clone()
    }

    /// Reports a mismatch; never retries anything itself.
    pub fn verify(&self, expected_total: Option<u64>) -> Verification {
        let found = self.len();
        match expected_total {
            Some(expected) if expected == found => Verification::Complete { found },
            Some(expected) => Verification::Incomplete { found, expected },
            None => Verification::Unverified { found },
        }
    }
}
