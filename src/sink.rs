use regex::Regex;
use tracing::info;

use crate::error::ExtractError;
use crate::parser::LogicalRecord;
use crate::scraper::RunSummary;

/// Receives accepted records one committed page at a time, then the run summary.
pub trait OutputSink: Send {
    fn accept(&mut self, records: &[LogicalRecord]) -> Result<(), ExtractError>;

    fn finish(&mut self, _summary: &RunSummary) -> Result<(), ExtractError> {
        Ok(())
    }

    /// Records accepted so far but deliberately not written.
    fn excluded(&self) -> u64 {
        0
    }
}

/// Collects everything in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemorySink {
    pub records: Vec<LogicalRecord>,
    pub summary: Option<RunSummary>,
}

#[cfg(test)]
impl OutputSink for MemorySink {
    fn accept(&mut self, records: &[LogicalRecord]) -> Result<(), ExtractError> {
        self.records.extend_from_slice(records);
        Ok(())
    }

    fn finish(&mut self, summary: &RunSummary) -> Result<(), ExtractError> {
        self.summary = Some(summary.clone());
        Ok(())
    }
}

/// Drops records whose `field` matches any pattern before they reach `inner`.
/// Coverage is unaffected: excluded records were still extracted.
pub struct ExclusionFilter<S> {
    inner: S,
    field: String,
    patterns: Vec<Regex>,
    excluded: u64,
}

impl<S: OutputSink> ExclusionFilter<S> {
    pub fn new(inner: S, field: impl Into<String>, patterns: &[String]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            inner,
            field: field.into(),
            patterns,
            excluded: 0,
        })
    }

    #[cfg(test)]
    pub fn into_inner(self) -> S {
        self.inner
    }

    fn is_excluded(&self, record: &LogicalRecord) -> bool {
        let value = record.get(&self.field).unwrap_or("");
        self.patterns.iter().any(|p| p.is_match(value))
    }
}

impl<S: OutputSink> OutputSink for ExclusionFilter<S> {
    fn accept(&mut self, records: &[LogicalRecord]) -> Result<(), ExtractError> {
        if self.patterns.is_empty() {
            return self.inner.accept(records);
        }
        let kept: Vec<LogicalRecord> = records
            .iter()
            .filter(|r| !self.is_excluded(r))
            .cloned()
            .collect();
        self.excluded += (records.len() - kept.len()) as u64;
        self.inner.accept(&kept)
    }

    fn finish(&mut self, summary: &RunSummary) -> Result<(), ExtractError> {
        if self.excluded > 0 {
            info!("Excluded {} records matching {} pattern(s)", self.excluded, self.patterns.len());
        }
        self.inner.finish(summary)
    }

    fn excluded(&self) -> u64 {
        self.excluded + self.inner.excluded()
    }
}
