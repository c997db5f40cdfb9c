use serde::{Deserialize, Serialize};
use tracing::debug;

use super::datasets::DatasetSpec;
use super::rows::{RawRow, RecordKind};

/// A fully assembled entity. The identifier never changes once assigned;
/// fields only change while the record is pending in the assembler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalRecord {
    id: String,
    fields: Vec<(String, String)>,
    first_page: u64,
    last_page: u64,
    #[serde(default)]
    fragments: u32,
    /// Continuable cells of the most recently merged fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_fragment: Option<Vec<(String, String)>>,
}

impl LogicalRecord {
    pub(crate) fn open(id: String, row: &RawRow, page: u64) -> Self {
        Self {
            id,
            fields: row.cells().to_vec(),
            first_page: page,
            last_page: page,
            fragments: 0,
            last_fragment: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(f, _)| f == field)
            .map(|(_, v)| v.as_str())
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    pub fn first_page(&self) -> u64 {
        self.first_page
    }

    pub fn last_page(&self) -> u64 {
        self.last_page
    }

    /// Continuation fragments merged into this record so far.
    pub fn fragments(&self) -> u32 {
        self.fragments
    }

    /// True when `row` carries exactly the continuation last merged into this record.
    pub fn repeats_last_fragment(&self, spec: &DatasetSpec, row: &RawRow) -> bool {
        self.last_fragment
            .as_ref()
            .is_some_and(|last| *last == continued_cells(spec, row))
    }

    pub(crate) fn set_field(&mut self, field: &str, value: String) {
        match self.fields.iter_mut().find(|(f, _)| f == field) {
            Some((_, v)) => *v = value,
            None => self.fields.push((field.to_string(), value)),
        }
    }

    /// Continuable fields are concatenated in row order; everything else keeps
    /// its first value. No length bound is applied here.
    fn merge(&mut self, spec: &DatasetSpec, row: &RawRow, page: u64) {
        for (field, value) in row.cells() {
            if value.is_empty() || !spec.is_continuable(field) {
                continue;
            }
            match self.fields.iter_mut().find(|(f, _)| f == field) {
                Some((_, current)) if current.is_empty() => *current = value.clone(),
                Some((_, current)) => {
                    current.push_str(spec.separator);
                    current.push_str(value);
                }
                None => self.fields.push((field.clone(), value.clone())),
            }
        }
        self.fragments += 1;
        self.last_page = self.last_page.max(page);
        self.last_fragment = Some(continued_cells(spec, row));
    }
}

fn continued_cells(spec: &DatasetSpec, row: &RawRow) -> Vec<(String, String)> {
    row.cells()
        .iter()
        .filter(|(field, value)| !value.is_empty() && spec.is_continuable(field))
        .cloned()
        .collect()
}

/// Folds classified rows into logical records, holding at most one pending
/// record, which may carry across a page boundary.
#[derive(Debug, Clone)]
pub struct RecordAssembler {
    spec: &'static DatasetSpec,
    pending: Option<LogicalRecord>,
}

impl RecordAssembler {
    pub fn new(spec: &'static DatasetSpec) -> Self {
        Self { spec, pending: None }
    }

    /// Rebuild from a checkpointed pending buffer.
    pub fn with_pending(spec: &'static DatasetSpec, pending: Option<LogicalRecord>) -> Self {
        Self { spec, pending }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending(&self) -> Option<&LogicalRecord> {
        self.pending.as_ref()
    }

    /// Returns the previously pending record, finalized, when `row` opens a new one.
    pub fn accept(&mut self, kind: RecordKind, row: &RawRow, page: u64) -> Option<LogicalRecord> {
        match kind {
            RecordKind::NewRecord => {
                let id = self.spec.record_id(row)?;
                let finished = self.pending.take().map(|r| self.finalize(r));
                self.pending = Some(LogicalRecord::open(id, row, page));
                finished
            }
            RecordKind::ContinuationFragment => {
                match self.pending.as_mut() {
                    Some(record) => record.merge(self.spec, row, page),
                    None => debug!("continuation fragment with nothing pending, ignored"),
                }
                None
            }
            RecordKind::Noise => None,
        }
    }

    /// End of data: finalize whatever is pending.
    pub fn finish(&mut self) -> Option<LogicalRecord> {
        self.pending.take().map(|r| self.finalize(r))
    }

    fn finalize(&self, mut record: LogicalRecord) -> LogicalRecord {
        if let Some(derive) = self.spec.derive {
            derive(&mut record);
        }
        record
    }
}
