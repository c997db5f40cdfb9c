use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use super::assembler::LogicalRecord;
use super::rows::{clean_cell, RawRow};

static FEDERAL_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^([A-Z]{2})(\d+)").unwrap());

/// How consecutive result pages are requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pagination {
    /// Page N starts at row `N * page_size`.
    Offset,
    /// Page N+1 starts at the last value of `field` seen on page N, passed as
    /// query parameter `param`. The source re-serves that boundary row.
    Cursor {
        field: &'static str,
        param: &'static str,
        start: &'static str,
    },
}

/// Declares one extractable dataset: how positional cells map to columns,
/// which columns identify a record and which ones may continue on later rows.
pub struct DatasetSpec {
    pub name: &'static str,
    /// (cell position, column name), in output order.
    pub columns: &'static [(usize, &'static str)],
    pub key_fields: &'static [&'static str],
    pub continuable: &'static [&'static str],
    pub separator: &'static str,
    pub pagination: Pagination,
    /// Results page, relative to the server base URL. `{offset}`, `{page}`
    /// and `{size}` are substituted per request.
    pub page_url: &'static str,
    /// Derived fields, applied once when a record is finalized.
    pub derive: Option<fn(&mut LogicalRecord)>,
}

impl fmt::Debug for DatasetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetSpec")
            .field("name", &self.name)
            .field("key_fields", &self.key_fields)
            .field("continuable", &self.continuable)
            .field("pagination", &self.pagination)
            .finish()
    }
}

impl DatasetSpec {
    /// Natural key of a row: the key field values joined with `|`.
    /// `None` when every key field is empty.
    pub fn record_id(&self, row: &RawRow) -> Option<String> {
        let parts: Vec<&str> = self
            .key_fields
            .iter()
            .map(|k| row.get(k).unwrap_or(""))
            .collect();
        if parts.iter().all(|p| p.is_empty()) {
            return None;
        }
        Some(parts.join("|"))
    }

    pub fn is_continuable(&self, field: &str) -> bool {
        self.continuable.contains(&field)
    }

    /// Build a named row from positional cells. Missing positions become empty.
    pub fn row_from_cells(&self, cells: &[String]) -> RawRow {
        let mut row = RawRow::default();
        for (pos, name) in self.columns {
            let value = cells.get(*pos).map(|c| clean_cell(c)).unwrap_or_default();
            row.push(*name, value);
        }
        row
    }

    pub fn cursor_field(&self) -> Option<&'static str> {
        match self.pagination {
            Pagination::Cursor { field, .. } => Some(field),
            Pagination::Offset => None,
        }
    }
}

// ── Datasets ──

pub static WATER_SYSTEMS: DatasetSpec = DatasetSpec {
    name: "water_systems",
    columns: &[
        (0, "Activity Status"),
        (1, "Water System No."),
        (2, "Name"),
        (3, "Federal Primary Source"),
        (4, "Federal Type"),
        (5, "State Type"),
        (6, "Population"),
        (7, "Principal County Served"),
    ],
    key_fields: &["Water System No."],
    continuable: &["Name"],
    separator: " ",
    pagination: Pagination::Offset,
    page_url: "ibs0100e.jsp?DOREQUEST=GETDATA&START_ROW={offset}&MAX_ROWS={size}",
    derive: None,
};

pub static LEGAL_ENTITIES: DatasetSpec = DatasetSpec {
    name: "legal_entities",
    columns: &[
        (0, "Individual Name"),
        (1, "Status"),
        (2, "Organization"),
        (3, "Mail Stop"),
        (9, "Federal ID"),
    ],
    key_fields: &["Individual Name", "Federal ID"],
    continuable: &["Organization", "Mail Stop"],
    separator: " ",
    pagination: Pagination::Cursor {
        field: "Individual Name",
        param: "Field1",
        start: "0",
    },
    page_url: "lem0100e.jsp?DOREQUEST=GETDATA&ListBox1=IN&MAX_ROWS={size}",
    derive: Some(derive_legal_entity),
};

pub static DEFICIENCY_TYPES: DatasetSpec = DatasetSpec {
    name: "deficiency_types",
    columns: &[
        (0, "Type Code"),
        (1, "Default Severity Code"),
        (2, "Default Category Code"),
        (3, "Description"),
    ],
    key_fields: &["Type Code"],
    continuable: &["Description"],
    separator: " ",
    pagination: Pagination::Offset,
    page_url: "deftyp0100e.jsp?DOREQUEST=GETDATA&START_ROW={offset}&MAX_ROWS={size}",
    derive: None,
};

pub static ALL: &[&DatasetSpec] = &[&WATER_SYSTEMS, &LEGAL_ENTITIES, &DEFICIENCY_TYPES];

pub fn lookup(name: &str) -> Option<&'static DatasetSpec> {
    let wanted = name.trim().replace('-', "_").to_ascii_lowercase();
    ALL.iter().copied().find(|s| s.name == wanted)
}

/// "LAST, FIRST MIDDLE" → Last Name / First Name; "MS123" → State Code / ID Number.
fn derive_legal_entity(record: &mut LogicalRecord) {
    let name = record.get("Individual Name").unwrap_or("").to_string();
    let (last, first) = match name.split_once(',') {
        Some((last, first)) => (last.trim().to_string(), first.trim().to_string()),
        None => (name.trim().to_string(), String::new()),
    };
    record.set_field("Last Name", last);
    record.set_field("First Name", first);

    let federal_id = record.get("Federal ID").unwrap_or("").to_string();
    let (state, number) = match FEDERAL_ID_RE.captures(&federal_id) {
        Some(caps) => (caps[1].to_string(), caps[2].trim_start_matches('0').to_string()),
        None => (String::new(), String::new()),
    };
    let number = if number.is_empty() && !state.is_empty() { "0".to_string() } else { number };
    record.set_field("State Code", state);
    record.set_field("ID Number", number);
}
