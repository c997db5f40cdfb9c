use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::datasets::DatasetSpec;

static NBSP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"&nbsp;?").unwrap());
static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s{2,}").unwrap());

/// One row of a fetched page: column name → raw text, in column order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRow {
    cells: Vec<(String, String)>,
}

impl RawRow {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut row = RawRow::default();
        for (k, v) in pairs {
            row.push(k, v);
        }
        row
    }

    pub fn push(&mut self, column: impl Into<String>, value: impl Into<String>) {
        self.cells.push((column.into(), value.into()));
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v.as_str())
    }

    pub fn cells(&self) -> &[(String, String)] {
        &self.cells
    }

    fn is_blank(&self) -> bool {
        self.cells.iter().all(|(_, v)| v.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    NewRecord,
    ContinuationFragment,
    Noise,
}

/// Row shapes that fall back to `Noise` but shouldn't occur in a healthy page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassificationAnomaly {
    /// Continuation text with no record open to receive it.
    OrphanFragment { text: String },
    /// Key fields empty yet non-continuable fields carry data.
    KeylessRow { text: String },
}

impl std::fmt::Display for ClassificationAnomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClassificationAnomaly::OrphanFragment { text } => {
                write!(f, "continuation fragment with no pending record: {text:?}")
            }
            ClassificationAnomaly::KeylessRow { text } => {
                write!(f, "row without key carrying non-continuable data: {text:?}")
            }
        }
    }
}

/// Structural shape of a row, independent of assembler state.
enum Shape {
    Keyed,
    Header,
    Continuation,
    Keyless,
    Blank,
}

fn shape(spec: &DatasetSpec, row: &RawRow) -> Shape {
    if row.is_blank() {
        return Shape::Blank;
    }
    if spec.record_id(row).is_some() {
        let echoes_header = spec
            .key_fields
            .iter()
            .all(|k| row.get(k).is_some_and(|v| v.eq_ignore_ascii_case(k)));
        return if echoes_header { Shape::Header } else { Shape::Keyed };
    }
    let has_continuable = spec
        .continuable
        .iter()
        .any(|f| row.get(f).is_some_and(|v| !v.is_empty()));
    if has_continuable {
        return Shape::Continuation;
    }
    Shape::Keyless
}

/// NewRecord when key fields are present, ContinuationFragment when only
/// continuable fields are present and a record is pending, Noise otherwise.
pub fn classify(spec: &DatasetSpec, row: &RawRow, has_pending: bool) -> RecordKind {
    match shape(spec, row) {
        Shape::Keyed => RecordKind::NewRecord,
        Shape::Continuation if has_pending => RecordKind::ContinuationFragment,
        _ => RecordKind::Noise,
    }
}

/// Explains a `Noise` classification that indicates unexpected input.
/// Headers and blank separators are expected noise and yield `None`.
pub fn anomaly(spec: &DatasetSpec, row: &RawRow, has_pending: bool) -> Option<ClassificationAnomaly> {
    match shape(spec, row) {
        Shape::Continuation if !has_pending => Some(ClassificationAnomaly::OrphanFragment {
            text: row_text(row),
        }),
        Shape::Keyless => Some(ClassificationAnomaly::KeylessRow { text: row_text(row) }),
        _ => None,
    }
}

fn row_text(row: &RawRow) -> String {
    row.cells
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(c, v)| format!("{c}={v}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Strip HTML space entities and `" ;"` artefacts, collapse runs of whitespace.
pub fn clean_cell(raw: &str) -> String {
    let s = NBSP_RE.replace_all(raw, " ");
    let s = s.replace(" ;", " ");
    WS_RE.replace_all(s.trim(), " ").to_string()
}
