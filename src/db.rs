use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};

use crate::checkpoint::{CheckpointStore, ExtractionCheckpoint};
use crate::coverage::Verification;
use crate::error::ExtractError;
use crate::parser::LogicalRecord;
use crate::scraper::RunSummary;
use crate::sink::OutputSink;

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let conn = Connection::open(path).with_context(|| format!("opening {}", path.display()))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS checkpoints (
            dataset    TEXT PRIMARY KEY,
            next_page  INTEGER NOT NULL,
            payload    TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS records (
            dataset      TEXT NOT NULL,
            record_id    TEXT NOT NULL,
            first_page   INTEGER NOT NULL,
            last_page    INTEGER NOT NULL,
            payload      TEXT NOT NULL,
            extracted_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (dataset, record_id)
        );

        CREATE TABLE IF NOT EXISTS runs (
            id           INTEGER PRIMARY KEY,
            dataset      TEXT NOT NULL,
            pages        INTEGER NOT NULL,
            accepted     INTEGER NOT NULL,
            duplicates   INTEGER NOT NULL,
            anomalies    INTEGER NOT NULL,
            overlap      INTEGER NOT NULL,
            excluded     INTEGER NOT NULL DEFAULT 0,
            found        INTEGER NOT NULL,
            expected     INTEGER,
            outcome      TEXT NOT NULL CHECK(outcome IN ('complete','incomplete','unverified')),
            stop         TEXT NOT NULL,
            finished_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_runs_dataset ON runs(dataset);
        ",
    )?;
    Ok(())
}

// ── Checkpoints ──

pub fn save_checkpoint(conn: &Connection, checkpoint: &ExtractionCheckpoint) -> Result<()> {
    let payload = checkpoint.to_json()?;
    conn.execute(
        "INSERT OR REPLACE INTO checkpoints (dataset, next_page, payload, updated_at)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            checkpoint.dataset,
            checkpoint.next_page() as i64,
            payload,
            chrono::Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn load_checkpoint(conn: &Connection, dataset: &str) -> Result<Option<ExtractionCheckpoint>> {
    let payload: Option<String> = conn
        .query_row(
            "SELECT payload FROM checkpoints WHERE dataset = ?1",
            [dataset],
            |r| r.get(0),
        )
        .optional()?;
    match payload {
        Some(p) => Ok(Some(ExtractionCheckpoint::from_json(&p)?)),
        None => Ok(None),
    }
}

pub fn delete_checkpoint(conn: &Connection, dataset: &str) -> Result<bool> {
    let n = conn.execute("DELETE FROM checkpoints WHERE dataset = ?1", [dataset])?;
    Ok(n > 0)
}

// ── Records ──

/// Idempotent on (dataset, record_id): re-delivered records are ignored.
pub fn insert_records(conn: &Connection, dataset: &str, records: &[LogicalRecord]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO records (dataset, record_id, first_page, last_page, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for r in records {
            count += stmt.execute(rusqlite::params![
                dataset,
                r.id(),
                r.first_page() as i64,
                r.last_page() as i64,
                serde_json::to_string(r)?,
            ])?;
        }
    }
    tx.commit()?;
    Ok(count)
}

/// Drops stored records for a dataset before a fresh run.
pub fn clear_records(conn: &Connection, dataset: &str) -> Result<usize> {
    Ok(conn.execute("DELETE FROM records WHERE dataset = ?1", [dataset])?)
}

pub fn fetch_records(conn: &Connection, dataset: &str) -> Result<Vec<LogicalRecord>> {
    let mut stmt = conn.prepare(
        "SELECT payload FROM records WHERE dataset = ?1 ORDER BY first_page, rowid",
    )?;
    let payloads = stmt
        .query_map([dataset], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    payloads
        .iter()
        .map(|p| serde_json::from_str(p).context("decoding stored record"))
        .collect()
}

// ── Runs ──

pub fn insert_run(conn: &Connection, summary: &RunSummary) -> Result<()> {
    let expected = match summary.verification {
        Verification::Complete { found } => Some(found as i64),
        Verification::Incomplete { expected, .. } => Some(expected as i64),
        Verification::Unverified { .. } => None,
    };
    let stop = serde_json::to_value(summary.stop)?;
    conn.execute(
        "INSERT INTO runs (dataset, pages, accepted, duplicates, anomalies, overlap, excluded, found, expected, outcome, stop)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        rusqlite::params![
            summary.dataset,
            summary.pages_committed as i64,
            summary.records_accepted as i64,
            summary.duplicates_ignored as i64,
            summary.anomalies as i64,
            summary.overlap_rows_skipped as i64,
            summary.records_excluded as i64,
            summary.verification.found() as i64,
            expected,
            summary.verification.label(),
            stop.as_str(),
        ],
    )?;
    Ok(())
}

pub struct DatasetStats {
    pub dataset: String,
    pub records: usize,
    /// Next page to fetch when a checkpoint is pending.
    pub resume_at: Option<u64>,
    pub last_outcome: Option<String>,
    pub last_finished: Option<String>,
}

pub fn get_stats(conn: &Connection, datasets: &[&str]) -> Result<Vec<DatasetStats>> {
    datasets
        .iter()
        .map(|&dataset| {
            let records: usize = conn.query_row(
                "SELECT COUNT(*) FROM records WHERE dataset = ?1",
                [dataset],
                |r| r.get(0),
            )?;
            let resume_at: Option<i64> = conn
                .query_row(
                    "SELECT next_page FROM checkpoints WHERE dataset = ?1",
                    [dataset],
                    |r| r.get(0),
                )
                .optional()?;
            let last: Option<(String, String)> = conn
                .query_row(
                    "SELECT outcome, finished_at FROM runs WHERE dataset = ?1 ORDER BY id DESC LIMIT 1",
                    [dataset],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            let (last_outcome, last_finished) = last.unzip();
            Ok(DatasetStats {
                dataset: dataset.to_string(),
                records,
                resume_at: resume_at.map(|p| p as u64),
                last_outcome,
                last_finished,
            })
        })
        .collect()
}

// ── Store ──

/// One dataset's SQLite output: records, checkpoint and run history.
pub struct SqliteStore {
    conn: Connection,
    dataset: String,
}

impl SqliteStore {
    pub fn new(conn: Connection, dataset: impl Into<String>) -> Self {
        Self {
            conn,
            dataset: dataset.into(),
        }
    }
}

impl OutputSink for SqliteStore {
    fn accept(&mut self, records: &[LogicalRecord]) -> Result<(), ExtractError> {
        insert_records(&self.conn, &self.dataset, records)
            .map(|_| ())
            .map_err(|e| ExtractError::Sink(format!("{e:#}")))
    }

    fn finish(&mut self, summary: &RunSummary) -> Result<(), ExtractError> {
        insert_run(&self.conn, summary).map_err(|e| ExtractError::Sink(format!("{e:#}")))
    }
}

impl CheckpointStore for SqliteStore {
    fn save(&mut self, checkpoint: &ExtractionCheckpoint) -> Result<(), ExtractError> {
        save_checkpoint(&self.conn, checkpoint).map_err(|e| ExtractError::Store(format!("{e:#}")))
    }

    fn discard(&mut self, dataset: &str) -> Result<(), ExtractError> {
        delete_checkpoint(&self.conn, dataset)
            .map(|_| ())
            .map_err(|e| ExtractError::Store(format!("{e:#}")))
    }
}
