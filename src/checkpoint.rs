use serde::{Deserialize, Serialize};

use crate::coverage::CoverageSet;
use crate::error::ExtractError;
use crate::parser::datasets::Pagination;
use crate::parser::{DatasetSpec, LogicalRecord};

/// Everything needed to continue an extraction at the next unfetched page
/// without losing or repeating a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionCheckpoint {
    pub dataset: String,
    pub page_size: usize,
    pub last_committed_page: Option<u64>,
    /// Next request position for cursor-paginated datasets.
    pub cursor: Option<String>,
    pub pending: Option<LogicalRecord>,
    pub coverage: CoverageSet,
    pub duplicates: u64,
    #[serde(default)]
    pub anomalies: u64,
    #[serde(default)]
    pub overlap_rows_skipped: u64,
    pub expected_total: Option<u64>,
    #[serde(default)]
    pub stalled_pages: u32,
}

impl ExtractionCheckpoint {
    pub fn start(spec: &DatasetSpec, page_size: usize) -> Self {
        Self {
            dataset: spec.name.to_string(),
            page_size,
            last_committed_page: None,
            cursor: None,
            pending: None,
            coverage: CoverageSet::default(),
            duplicates: 0,
            anomalies: 0,
            overlap_rows_skipped: 0,
            expected_total: None,
            stalled_pages: 0,
        }
    }

    pub fn next_page(&self) -> u64 {
        self.last_committed_page.map_or(0, |p| p + 1)
    }

    pub fn to_json(&self) -> Result<String, ExtractError> {
        serde_json::to_string(self).map_err(|e| ExtractError::Store(e.to_string()))
    }

    /// Unparseable payloads (negative page index, missing fields, ...) are corrupt.
    pub fn from_json(payload: &str) -> Result<Self, ExtractError> {
        serde_json::from_str(payload)
            .map_err(|e| ExtractError::ResumeStateCorrupt(format!("unreadable checkpoint: {e}")))
    }

    /// Internal consistency checks run before a controller is rebuilt from this snapshot.
    pub fn validate(&self, spec: &DatasetSpec, page_size: usize) -> Result<(), ExtractError> {
        let corrupt = |msg: String| Err(ExtractError::ResumeStateCorrupt(msg));

        if self.dataset != spec.name {
            return corrupt(format!("checkpoint is for '{}', not '{}'", self.dataset, spec.name));
        }
        if self.page_size == 0 || self.page_size != page_size {
            return corrupt(format!(
                "checkpoint page size {} does not match configured {}",
                self.page_size, page_size
            ));
        }

        let Some(last) = self.last_committed_page else {
            if self.pending.is_some() || !self.coverage.is_empty() || self.duplicates > 0 {
                return corrupt("records present but no page committed".to_string());
            }
            return Ok(());
        };

        if let Some((id, page)) = self.coverage.iter().find(|(_, page)| *page > last) {
            return corrupt(format!("record {id} from page {page} beyond committed page {last}"));
        }

        if let Some(pending) = &self.pending {
            if pending.id().is_empty() {
                return corrupt("pending record has no identifier".to_string());
            }
            if pending.first_page() > pending.last_page() || pending.last_page() > last {
                return corrupt(format!(
                    "pending record {} spans pages {}..{} past committed page {last}",
                    pending.id(),
                    pending.first_page(),
                    pending.last_page()
                ));
            }
            if self.coverage.contains(pending.id()) {
                return corrupt(format!("pending record {} is already finalized", pending.id()));
            }
        }

        if matches!(spec.pagination, Pagination::Cursor { .. }) && self.cursor.is_none() {
            return corrupt("cursor-paginated checkpoint without a cursor".to_string());
        }

        Ok(())
    }
}

/// Where committed checkpoints go. Written after every page, discarded on completion.
pub trait CheckpointStore: Send {
    fn save(&mut self, checkpoint: &ExtractionCheckpoint) -> Result<(), ExtractError>;
    fn discard(&mut self, dataset: &str) -> Result<(), ExtractError>;
}

/// Keeps every saved snapshot in memory, in order.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryCheckpoints {
    pub saved: Vec<ExtractionCheckpoint>,
    pub discarded: bool,
}

#[cfg(test)]
impl CheckpointStore for MemoryCheckpoints {
    fn save(&mut self, checkpoint: &ExtractionCheckpoint) -> Result<(), ExtractError> {
        self.saved.push(checkpoint.clone());
        Ok(())
    }

    fn discard(&mut self, _dataset: &str) -> Result<(), ExtractError> {
        self.discarded = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::CoverageTracker;
    use crate::parser::datasets::{LEGAL_ENTITIES, WATER_SYSTEMS};
    use crate::parser::RawRow;

    fn record(id: &str, page: u64) -> LogicalRecord {
        LogicalRecord::open(id.to_string(), &RawRow::default(), page)
    }

    fn committed(last: u64) -> ExtractionCheckpoint {
        let mut cp = ExtractionCheckpoint::start(&WATER_SYSTEMS, 2);
        let mut t = CoverageTracker::new();
        t.record(&record("A", 0));
        cp.coverage = t.snapshot();
        cp.pending = Some(record("B", last));
        cp.last_committed_page = Some(last);
        cp
    }

    #[test]
    fn fresh_and_committed_are_valid() {
        assert!(ExtractionCheckpoint::start(&WATER_SYSTEMS, 2)
            .validate(&WATER_SYSTEMS, 2)
            .is_ok());
        let cp = committed(1);
        assert!(cp.validate(&WATER_SYSTEMS, 2).is_ok());
        assert_eq!(cp.next_page(), 2);
    }

    #[test]
    fn negative_page_index_is_corrupt() {
        let mut value = serde_json::to_value(committed(1)).unwrap();
        value["last_committed_page"] = serde_json::json!(-1);
        let err = ExtractionCheckpoint::from_json(&value.to_string()).unwrap_err();
        assert!(matches!(err, ExtractError::ResumeStateCorrupt(_)));
    }

    #[test]
    fn inconsistent_snapshots_are_rejected() {
        let mut wrong_size = committed(1);
        wrong_size.page_size = 5;
        let mut finalized_pending = committed(1);
        finalized_pending.pending = Some(record("A", 1));
        let mut pending_ahead = committed(1);
        pending_ahead.pending = Some(record("B", 4));
        let mut nothing_committed = committed(1);
        nothing_committed.last_committed_page = None;

        for cp in [wrong_size, finalized_pending, pending_ahead, nothing_committed] {
            assert!(matches!(
                cp.validate(&WATER_SYSTEMS, 2),
                Err(ExtractError::ResumeStateCorrupt(_))
            ));
        }
        assert!(committed(1).validate(&LEGAL_ENTITIES, 2).is_err());
    }

    #[test]
    fn json_round_trip_keeps_pending() {
        let cp = committed(3);
        let back = ExtractionCheckpoint::from_json(&cp.to_json().unwrap()).unwrap();
        assert_eq!(back, cp);
    }
}
