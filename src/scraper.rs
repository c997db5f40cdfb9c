use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointStore, ExtractionCheckpoint};
use crate::coverage::{Admission, CoverageTracker, Verification};
use crate::error::{ExtractError, TransportError};
use crate::fetch::{PageFetcher, PageRequest, PageResult};
use crate::parser::datasets::Pagination;
use crate::parser::rows::{anomaly, classify};
use crate::parser::{DatasetSpec, LogicalRecord, RecordAssembler, RecordKind};
use crate::progress::{PageProgress, ProgressReporter};
use crate::sink::OutputSink;

const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF_MS: u64 = 2000;
const FETCH_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per page, first try included.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub fetch_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RETRIES + 1,
            base_backoff: Duration::from_millis(BASE_BACKOFF_MS),
            fetch_timeout: Duration::from_millis(FETCH_TIMEOUT_MS),
        }
    }
}

impl RetryPolicy {
    /// Doubles after every failed attempt (1-based).
    fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub page_size: usize,
    pub retry: RetryPolicy,
    /// Overrides any total the source reports.
    pub expected_total: Option<u64>,
    pub max_pages: Option<u64>,
    /// Consecutive full pages without a new record before giving up. 0 disables.
    pub max_stalled_pages: u32,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            page_size: 1000,
            retry: RetryPolicy::default(),
            expected_total: None,
            max_pages: None,
            max_stalled_pages: 2,
        }
    }
}

/// Cooperative cancellation, honoured between page fetches.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Fetching,
    Classifying,
    Committing,
    Done,
    Failed,
}

impl ControllerState {
    fn name(self) -> &'static str {
        match self {
            ControllerState::Idle => "idle",
            ControllerState::Fetching => "fetching",
            ControllerState::Classifying => "classifying",
            ControllerState::Committing => "committing",
            ControllerState::Done => "done",
            ControllerState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndOfData,
    Stalled,
    PageLimit,
}

/// Outcome of a finished run. Verification always travels with the data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub dataset: String,
    pub pages_committed: u64,
    pub records_accepted: u64,
    pub duplicates_ignored: u64,
    pub anomalies: u64,
    pub overlap_rows_skipped: u64,
    /// Accepted but withheld from output by the sink's exclusion patterns.
    pub records_excluded: u64,
    pub verification: Verification,
    pub stop: StopReason,
}

/// What to do with continuation rows after a re-served leading record.
enum Skip {
    /// The record was finalized on an earlier page: drop all its fragments.
    All,
    /// The record is still pending: drop the fragments it already merged.
    Merged(u32),
}

/// A page, classified and assembled against staged state, not yet committed.
struct PageWork {
    finalized: Vec<LogicalRecord>,
    assembler: RecordAssembler,
    cursor: Option<String>,
    anomalies: u64,
    overlap_skipped: u64,
    fresh_rows: u64,
    end_of_data: bool,
}

/// Drives one dataset page by page, strictly in order, through
/// Idle → Fetching → Classifying → Committing → (Fetching | Done | Failed).
pub struct PaginationController<F> {
    spec: &'static DatasetSpec,
    fetcher: F,
    options: ControllerOptions,
    cancel: CancelFlag,
    state: ControllerState,
    last_committed: Option<u64>,
    cursor: Option<String>,
    assembler: RecordAssembler,
    coverage: CoverageTracker,
    anomalies: u64,
    overlap_skipped: u64,
    expected_total: Option<u64>,
    stalled_pages: u32,
}

impl<F: PageFetcher> PaginationController<F> {
    pub fn new(spec: &'static DatasetSpec, fetcher: F, options: ControllerOptions) -> Self {
        let cursor = match spec.pagination {
            Pagination::Cursor { start, .. } => Some(start.to_string()),
            Pagination::Offset => None,
        };
        Self {
            spec,
            fetcher,
            expected_total: options.expected_total,
            options,
            cancel: CancelFlag::default(),
            state: ControllerState::Idle,
            last_committed: None,
            cursor,
            assembler: RecordAssembler::new(spec),
            coverage: CoverageTracker::new(),
            anomalies: 0,
            overlap_skipped: 0,
            stalled_pages: 0,
        }
    }

    /// Rebuild a controller that continues at the page after the checkpoint.
    pub fn resume(
        spec: &'static DatasetSpec,
        fetcher: F,
        options: ControllerOptions,
        checkpoint: ExtractionCheckpoint,
    ) -> Result<Self, ExtractError> {
        checkpoint.validate(spec, options.page_size)?;
        info!(
            dataset = spec.name,
            next_page = checkpoint.next_page(),
            records = checkpoint.coverage.len(),
            "Resuming from checkpoint"
        );
        let mut controller = Self::new(spec, fetcher, options);
        controller.last_committed = checkpoint.last_committed_page;
        if checkpoint.cursor.is_some() {
            controller.cursor = checkpoint.cursor;
        }
        controller.assembler = RecordAssembler::with_pending(spec, checkpoint.pending);
        controller.coverage = CoverageTracker::from_snapshot(checkpoint.coverage, checkpoint.duplicates);
        controller.anomalies = checkpoint.anomalies;
        controller.overlap_skipped = checkpoint.overlap_rows_skipped;
        controller.expected_total = controller.expected_total.or(checkpoint.expected_total);
        controller.stalled_pages = checkpoint.stalled_pages;
        Ok(controller)
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn into_fetcher(self) -> F {
        self.fetcher
    }

    /// Snapshot as of the last committed page.
    pub fn checkpoint(&self) -> ExtractionCheckpoint {
        ExtractionCheckpoint {
            dataset: self.spec.name.to_string(),
            page_size: self.options.page_size,
            last_committed_page: self.last_committed,
            cursor: self.cursor.clone(),
            pending: self.assembler.pending().cloned(),
            coverage: self.coverage.snapshot(),
            duplicates: self.coverage.duplicates(),
            anomalies: self.anomalies,
            overlap_rows_skipped: self.overlap_skipped,
            expected_total: self.expected_total,
            stalled_pages: self.stalled_pages,
        }
    }

    fn next_page(&self) -> u64 {
        self.last_committed.map_or(0, |p| p + 1)
    }

    fn next_request(&self) -> PageRequest {
        let index = self.next_page();
        PageRequest {
            index,
            offset: index * self.options.page_size as u64,
            page_size: self.options.page_size,
            cursor: self.cursor.clone(),
        }
    }

    fn progress_counters(&self) -> PageProgress {
        PageProgress {
            pages_committed: self.next_page(),
            records_accepted: self.coverage.len(),
            duplicates_ignored: self.coverage.duplicates(),
        }
    }

    /// Extract until end of data. On error the controller is `Failed` and
    /// `checkpoint()` still describes the last committed page.
    pub async fn run<S, P, C>(
        &mut self,
        sink: &mut S,
        progress: &mut P,
        store: &mut C,
    ) -> Result<RunSummary, ExtractError>
    where
        S: OutputSink,
        P: ProgressReporter,
        C: CheckpointStore,
    {
        if self.state != ControllerState::Idle {
            return Err(ExtractError::NotIdle(self.state.name()));
        }
        progress.begin(self.spec.name, self.expected_total);

        let result = self.run_pages(sink, progress, store).await;
        let stop = match result {
            Ok(stop) => stop,
            Err(e) => {
                self.state = ControllerState::Failed;
                warn!(dataset = self.spec.name, "Extraction halted: {}", e);
                return Err(e);
            }
        };

        match self.finish(stop, sink, progress, store) {
            Ok(summary) => {
                self.state = ControllerState::Done;
                Ok(summary)
            }
            Err(e) => {
                self.state = ControllerState::Failed;
                Err(e)
            }
        }
    }

    async fn run_pages<S, P, C>(
        &mut self,
        sink: &mut S,
        progress: &mut P,
        store: &mut C,
    ) -> Result<StopReason, ExtractError>
    where
        S: OutputSink,
        P: ProgressReporter,
        C: CheckpointStore,
    {
        loop {
            let request = self.next_request();
            if self.cancel.is_cancelled() {
                info!(dataset = self.spec.name, page = request.index, "Cancelled");
                return Err(ExtractError::Cancelled { page: request.index });
            }
            if self.options.max_pages.is_some_and(|max| request.index >= max) {
                warn!(dataset = self.spec.name, "Page limit {} reached", request.index);
                return Ok(StopReason::PageLimit);
            }

            self.state = ControllerState::Fetching;
            let page = self.fetch_with_retry(&request).await?;
            if self.expected_total.is_none() {
                if let Some(total) = page.total_rows {
                    info!(dataset = self.spec.name, total, "Source reports total row count");
                    self.expected_total = Some(total);
                    progress.expected_total(total);
                }
            }

            self.state = ControllerState::Classifying;
            let work = self.process_page(request.index, &page);

            self.state = ControllerState::Committing;
            let end_of_data = work.end_of_data;
            self.commit(request.index, work, sink, store)?;
            progress.page_committed(self.progress_counters());

            if end_of_data {
                return Ok(StopReason::EndOfData);
            }
            if self.options.max_stalled_pages > 0 && self.stalled_pages >= self.options.max_stalled_pages {
                warn!(
                    dataset = self.spec.name,
                    "{} consecutive pages brought nothing new, stopping", self.stalled_pages
                );
                return Ok(StopReason::Stalled);
            }
        }
    }

    async fn fetch_with_retry(&mut self, request: &PageRequest) -> Result<PageResult, ExtractError> {
        let policy = self.options.retry.clone();
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(policy.fetch_timeout, self.fetcher.fetch_page(request)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(policy.fetch_timeout)),
            };
            let err = match result {
                Ok(page) => return Ok(page),
                Err(e) => e,
            };
            if !err.is_retryable() || attempt >= max_attempts {
                return Err(ExtractError::TransportExhausted {
                    page: request.index,
                    attempts: attempt,
                    source: err,
                });
            }
            let backoff = policy.backoff(attempt);
            warn!(
                "Page {} of {} failed (attempt {}/{}): {}, backing off {:.1}s",
                request.index,
                self.spec.name,
                attempt,
                max_attempts,
                err,
                backoff.as_secs_f64()
            );
            tokio::time::sleep(backoff).await;
            if self.cancel.is_cancelled() {
                return Err(ExtractError::Cancelled { page: request.index });
            }
            attempt += 1;
        }
    }

    /// Classify and assemble a page against staged copies of the assembler.
    /// Leading rows the source re-served from earlier pages are dropped here.
    fn process_page(&self, index: u64, page: &PageResult) -> PageWork {
        let spec = self.spec;
        let mut assembler = self.assembler.clone();
        let mut work = PageWork {
            finalized: Vec::new(),
            assembler: RecordAssembler::new(spec),
            cursor: self.cursor.clone(),
            anomalies: 0,
            overlap_skipped: 0,
            fresh_rows: 0,
            end_of_data: page.is_last_page
                || page.rows.is_empty()
                || page.rows.len() < self.options.page_size,
        };
        let mut leading = true;
        let mut skip: Option<Skip> = None;

        for row in &page.rows {
            let kind = classify(spec, row, assembler.has_pending() || skip.is_some());
            let id = match kind {
                RecordKind::NewRecord => spec.record_id(row),
                _ => None,
            };

            if let (Some(field), Some(_)) = (spec.cursor_field(), &id) {
                if let Some(value) = row.get(field).filter(|v| !v.is_empty()) {
                    work.cursor = Some(value.to_string());
                }
            }

            if leading {
                match (&kind, &id) {
                    (RecordKind::NewRecord, Some(id)) => {
                        if self.coverage.first_page(id).is_some_and(|p| p < index) {
                            info!(dataset = spec.name, page = index, id = %id, "Overlap repeat skipped");
                            work.overlap_skipped += 1;
                            skip = Some(Skip::All);
                            continue;
                        }
                        if let Some(pending) = assembler.pending().filter(|p| p.id() == id.as_str() && p.first_page() < index) {
                            info!(dataset = spec.name, page = index, id = %id, "Re-served pending record skipped");
                            work.overlap_skipped += 1;
                            skip = Some(Skip::Merged(pending.fragments()));
                            continue;
                        }
                        leading = false;
                        skip = None;
                    }
                    (RecordKind::ContinuationFragment, _) => match &mut skip {
                        Some(Skip::All) => {
                            work.overlap_skipped += 1;
                            continue;
                        }
                        Some(Skip::Merged(left)) if *left > 0 => {
                            *left -= 1;
                            work.overlap_skipped += 1;
                            continue;
                        }
                        None if assembler
                            .pending()
                            .is_some_and(|p| p.last_page() < index && p.repeats_last_fragment(spec, row)) =>
                        {
                            info!(dataset = spec.name, page = index, "Re-served continuation skipped");
                            work.overlap_skipped += 1;
                            continue;
                        }
                        _ => {}
                    },
                    _ => {}
                }
            }

            match (&kind, &id) {
                (RecordKind::NewRecord, Some(id)) if !self.coverage.contains(id) => work.fresh_rows += 1,
                (RecordKind::Noise, _) => {
                    if let Some(a) = anomaly(spec, row, assembler.has_pending()) {
                        warn!(dataset = spec.name, page = index, "Classification anomaly: {}", a);
                        work.anomalies += 1;
                    }
                }
                _ => {}
            }

            work.finalized.extend(assembler.accept(kind, row, index));
        }

        work.assembler = assembler;
        work
    }

    /// Admit finalized records, hand them to the sink, then advance the
    /// checkpoint. A sink failure leaves the previous commit untouched.
    fn commit<S, C>(&mut self, index: u64, work: PageWork, sink: &mut S, store: &mut C) -> Result<(), ExtractError>
    where
        S: OutputSink,
        C: CheckpointStore,
    {
        let mut accepted = Vec::with_capacity(work.finalized.len());
        for record in work.finalized {
            if self.coverage.record(&record) == Admission::Accepted {
                accepted.push(record);
            }
        }
        if let Err(e) = sink.accept(&accepted) {
            self.coverage.rollback_page();
            return Err(e);
        }
        self.coverage.commit_page();

        self.assembler = work.assembler;
        self.last_committed = Some(index);
        self.cursor = work.cursor;
        self.anomalies += work.anomalies;
        self.overlap_skipped += work.overlap_skipped;
        self.stalled_pages = if work.end_of_data || work.fresh_rows > 0 {
            0
        } else {
            self.stalled_pages + 1
        };

        store.save(&self.checkpoint())?;
        debug!(
            dataset = self.spec.name,
            page = index,
            accepted = accepted.len(),
            total = self.coverage.len(),
            "Page committed"
        );
        Ok(())
    }

    /// Flush the pending record, verify, and discard the checkpoint. A page
    /// limit stops short of the data's end, so the pending record stays
    /// buffered and the checkpoint is kept for a later resume.
    fn finish<S, P, C>(
        &mut self,
        stop: StopReason,
        sink: &mut S,
        progress: &mut P,
        store: &mut C,
    ) -> Result<RunSummary, ExtractError>
    where
        S: OutputSink,
        P: ProgressReporter,
        C: CheckpointStore,
    {
        let resumable = stop == StopReason::PageLimit;
        if !resumable {
            let mut assembler = self.assembler.clone();
            if let Some(record) = assembler.finish() {
                if self.coverage.record(&record) == Admission::Accepted {
                    if let Err(e) = sink.accept(std::slice::from_ref(&record)) {
                        self.coverage.rollback_page();
                        return Err(e);
                    }
                }
                self.coverage.commit_page();
            }
            self.assembler = assembler;
        }

        let verification = self.coverage.verify(self.expected_total);
        match verification {
            Verification::Complete { found } => {
                info!(dataset = self.spec.name, found, "Coverage verified")
            }
            Verification::Incomplete { found, expected } => {
                warn!(dataset = self.spec.name, found, expected, "Coverage mismatch")
            }
            Verification::Unverified { found } => {
                warn!(dataset = self.spec.name, found, "No expected total, coverage unverified")
            }
        }

        let summary = RunSummary {
            dataset: self.spec.name.to_string(),
            pages_committed: self.next_page(),
            records_accepted: self.coverage.len(),
            duplicates_ignored: self.coverage.duplicates(),
            anomalies: self.anomalies,
            overlap_rows_skipped: self.overlap_skipped,
            records_excluded: sink.excluded(),
            verification,
            stop,
        };
        sink.finish(&summary)?;
        if resumable {
            info!(
                dataset = self.spec.name,
                next_page = self.next_page(),
                "Checkpoint kept, resume to continue"
            );
        } else {
            store.discard(self.spec.name)?;
            info!(dataset = self.spec.name, "Checkpoint discarded");
        }
        progress.finish(&summary);
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use async_trait::async_trait;

    use super::*;
    use crate::checkpoint::MemoryCheckpoints;
    use crate::fetch::testing::{page, ScriptedFetcher};
    use crate::parser::datasets::{LEGAL_ENTITIES, WATER_SYSTEMS};
    use crate::parser::RawRow;
    use crate::progress::NullProgress;
    use crate::sink::MemorySink;

    fn new(id: &str, name: &str) -> RawRow {
        RawRow::from_pairs([("Activity Status", "A"), ("Water System No.", id), ("Name", name)])
    }

    fn frag(name: &str) -> RawRow {
        RawRow::from_pairs([("Activity Status", ""), ("Water System No.", ""), ("Name", name)])
    }

    fn options(page_size: usize) -> ControllerOptions {
        ControllerOptions {
            page_size,
            retry: RetryPolicy {
                max_attempts: 3,
                base_backoff: Duration::from_millis(1),
                fetch_timeout: Duration::from_secs(5),
            },
            ..ControllerOptions::default()
        }
    }

    async fn run_all(
        pages: Vec<PageResult>,
        page_size: usize,
    ) -> (Result<RunSummary, ExtractError>, MemorySink, MemoryCheckpoints) {
        let mut controller = PaginationController::new(&WATER_SYSTEMS, ScriptedFetcher::new(pages), options(page_size));
        let mut sink = MemorySink::default();
        let mut store = MemoryCheckpoints::default();
        let result = controller.run(&mut sink, &mut NullProgress, &mut store).await;
        (result, sink, store)
    }

    fn ids(sink: &MemorySink) -> Vec<&str> {
        sink.records.iter().map(|r| r.id()).collect()
    }

    #[tokio::test]
    async fn continuation_across_rows_and_last_page() {
        let pages = vec![
            page(vec![new("A", "ALPHA"), frag("WATER")], false),
            page(vec![new("B", "BRAVO"), new("C", "CHARLIE")], true),
        ];
        let (result, sink, store) = run_all(pages, 2).await;
        let summary = result.unwrap();
        assert_eq!(ids(&sink), ["A", "B", "C"]);
        assert_eq!(sink.records[0].get("Name"), Some("ALPHA WATER"));
        assert_eq!(summary.records_accepted, 3);
        assert_eq!(summary.stop, StopReason::EndOfData);
        assert!(store.discarded);
        assert_eq!(sink.summary.as_ref(), Some(&summary));
    }

    #[tokio::test]
    async fn fragment_at_top_of_next_page_merges_into_carried_record() {
        let pages = vec![
            page(vec![new("A", "ALPHA"), new("B", "BRAVO")], false),
            page(vec![frag("CREEK"), new("C", "CHARLIE")], false),
            page(vec![], true),
        ];
        let (result, sink, _) = run_all(pages, 2).await;
        result.unwrap();
        assert_eq!(sink.records[1].get("Name"), Some("BRAVO CREEK"));
        assert_eq!((sink.records[1].first_page(), sink.records[1].last_page()), (0, 1));
    }

    #[tokio::test]
    async fn re_served_boundary_record_is_dropped() {
        let pages = vec![
            page(vec![new("A", "A"), new("B", "B"), new("C", "C")], false),
            page(vec![new("C", "C"), new("D", "D")], true),
        ];
        let (result, sink, _) = run_all(pages, 3).await;
        let summary = result.unwrap();
        assert_eq!(ids(&sink), ["A", "B", "C", "D"]);
        assert_eq!(summary.duplicates_ignored, 0);
        assert_eq!(summary.overlap_rows_skipped, 1);
    }

    #[tokio::test]
    async fn drift_skips_finalized_and_pending_repeats() {
        let pages = vec![
            page(vec![new("A", "A"), new("B", "BAY"), new("C", "COVE")], false),
            page(vec![new("B", "BAY"), new("C", "COVE"), new("D", "DELL")], true),
        ];
        let (result, sink, _) = run_all(pages, 3).await;
        let summary = result.unwrap();
        assert_eq!(ids(&sink), ["A", "B", "C", "D"]);
        assert_eq!(summary.overlap_rows_skipped, 2);
        assert_eq!(sink.records[2].get("Name"), Some("COVE"));
    }

    #[tokio::test]
    async fn re_served_fragments_merge_once() {
        let pages = vec![
            page(vec![new("A", "A"), new("B", "BIG"), frag("BEAR")], false),
            page(vec![new("B", "BIG"), frag("BEAR"), frag("LAKE"), new("C", "C")], true),
        ];
        let (result, sink, _) = run_all(pages, 3).await;
        result.unwrap();
        assert_eq!(ids(&sink), ["A", "B", "C"]);
        assert_eq!(sink.records[1].get("Name"), Some("BIG BEAR LAKE"));
    }

    #[tokio::test]
    async fn full_page_overlap_never_duplicates() {
        let pages = vec![
            page(vec![new("A", "A"), new("B", "B")], false),
            page(vec![new("A", "A"), new("B", "B")], false),
            page(vec![new("C", "C")], true),
        ];
        let (result, sink, _) = run_all(pages, 2).await;
        let summary = result.unwrap();
        assert_eq!(ids(&sink), ["A", "B", "C"]);
        assert_eq!(summary.duplicates_ignored, 0);
    }

    #[tokio::test]
    async fn mid_page_duplicate_is_ignored() {
        let pages = vec![
            page(vec![new("A", "A"), new("B", "B")], false),
            page(vec![new("C", "C"), new("A", "A"), new("D", "D")], true),
        ];
        let (result, sink, _) = run_all(pages, 2).await;
        let summary = result.unwrap();
        assert_eq!(ids(&sink), ["A", "B", "C", "D"]);
        assert_eq!(summary.duplicates_ignored, 1);
    }

    #[tokio::test]
    async fn retries_then_matches_clean_run() {
        let pages = vec![
            page(vec![new("A", "A"), new("B", "B")], false),
            page(vec![new("C", "C"), frag("CITY")], false),
            page(vec![new("D", "D"), new("E", "E")], false),
            page(vec![new("F", "F")], true),
        ];
        let (clean, clean_sink, _) = run_all(pages.clone(), 2).await;

        let fetcher = ScriptedFetcher::new(pages).fail(2, 2);
        let mut controller = PaginationController::new(&WATER_SYSTEMS, fetcher, options(2));
        let mut sink = MemorySink::default();
        let mut store = MemoryCheckpoints::default();
        let flaky = controller.run(&mut sink, &mut NullProgress, &mut store).await;

        assert_eq!(flaky.unwrap(), clean.unwrap());
        assert_eq!(sink.records, clean_sink.records);
        let committed: Vec<Option<u64>> = store.saved.iter().map(|c| c.last_committed_page).collect();
        assert_eq!(committed, [Some(0), Some(1), Some(2), Some(3)]);
        let page2_requests = controller
            .into_fetcher()
            .requests
            .iter()
            .filter(|r| r.index == 2)
            .count();
        assert_eq!(page2_requests, 3);
    }

    #[tokio::test]
    async fn exhausted_retries_keep_checkpoint() {
        let pages = vec![
            page(vec![new("A", "A"), new("B", "B")], false),
            page(vec![new("C", "C"), new("D", "D")], false),
            page(vec![new("E", "E")], true),
        ];
        let fetcher = ScriptedFetcher::new(pages).fail(2, 3);
        let mut controller = PaginationController::new(&WATER_SYSTEMS, fetcher, options(2));
        let mut store = MemoryCheckpoints::default();
        let err = controller
            .run(&mut MemorySink::default(), &mut NullProgress, &mut store)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::TransportExhausted { page: 2, attempts: 3, .. }));
        assert_eq!(controller.state(), ControllerState::Failed);
        let cp = controller.checkpoint();
        assert_eq!(cp.last_committed_page, Some(1));
        assert_eq!(cp.pending.as_ref().map(|r| r.id()), Some("D"));
        assert_eq!(store.saved.last(), Some(&cp));
        assert!(!store.discarded);
    }

    #[tokio::test]
    async fn resume_from_any_page_matches_uninterrupted() {
        let pages = vec![
            page(vec![new("A", "A"), frag("A2"), new("B", "B")], false),
            page(vec![frag("B2"), frag("B3"), new("C", "C")], false),
            page(vec![new("C", "C"), new("D", "D"), frag("D2")], false),
            page(vec![frag("D3"), new("E", "E"), new("F", "F")], false),
            page(vec![new("G", "G")], true),
        ];
        let (clean, clean_sink, _) = run_all(pages.clone(), 3).await;
        let clean = clean.unwrap();

        for k in 0..pages.len() as u64 - 1 {
            let failing = ScriptedFetcher::new(pages.clone()).fail(k + 1, 3);
            let mut first = PaginationController::new(&WATER_SYSTEMS, failing, options(3));
            let mut sink = MemorySink::default();
            let mut store = MemoryCheckpoints::default();
            assert!(first.run(&mut sink, &mut NullProgress, &mut store).await.is_err());
            let cp = store.saved.last().cloned().unwrap();
            assert_eq!(cp.last_committed_page, Some(k));

            let mut resumed = PaginationController::resume(
                &WATER_SYSTEMS,
                ScriptedFetcher::new(pages.clone()),
                options(3),
                cp,
            )
            .unwrap();
            let summary = resumed.run(&mut sink, &mut NullProgress, &mut store).await.unwrap();

            assert_eq!(summary.records_accepted, clean.records_accepted, "resume after page {k}");
            assert_eq!(sink.records, clean_sink.records, "resume after page {k}");
            let unique: BTreeSet<&str> = sink.records.iter().map(|r| r.id()).collect();
            assert_eq!(unique.len(), sink.records.len());
        }
    }

    #[tokio::test]
    async fn corrupt_checkpoint_refuses_resume() {
        let mut cp = ExtractionCheckpoint::start(&WATER_SYSTEMS, 2);
        cp.pending = Some(crate::parser::LogicalRecord::open("X".into(), &new("X", "X"), 3));
        let result = PaginationController::resume(&WATER_SYSTEMS, ScriptedFetcher::default(), options(2), cp);
        assert!(matches!(result, Err(ExtractError::ResumeStateCorrupt(_))));
    }

    #[tokio::test]
    async fn source_total_feeds_verification() {
        let mut pages = vec![
            page(vec![new("A", "A"), new("B", "B")], false),
            page(vec![new("C", "C")], true),
        ];
        pages[0].total_rows = Some(4);
        let (result, _, _) = run_all(pages, 2).await;
        assert_eq!(
            result.unwrap().verification,
            Verification::Incomplete { found: 3, expected: 4 }
        );
    }

    #[tokio::test]
    async fn caller_total_wins_over_source() {
        let mut pages = vec![page(vec![new("A", "A")], true)];
        pages[0].total_rows = Some(9);
        let mut opts = options(2);
        opts.expected_total = Some(1);
        let mut controller = PaginationController::new(&WATER_SYSTEMS, ScriptedFetcher::new(pages), opts);
        let summary = controller
            .run(&mut MemorySink::default(), &mut NullProgress, &mut MemoryCheckpoints::default())
            .await
            .unwrap();
        assert!(summary.verification.is_complete());
    }

    #[tokio::test]
    async fn orphan_fragment_is_logged_and_skipped() {
        let pages = vec![page(vec![frag("STRAY"), new("A", "A")], true)];
        let (result, sink, _) = run_all(pages, 2).await;
        let summary = result.unwrap();
        assert_eq!(summary.anomalies, 1);
        assert_eq!(ids(&sink), ["A"]);
        assert_eq!(sink.records[0].get("Name"), Some("A"));
    }

    #[tokio::test]
    async fn stalled_source_stops() {
        let same = page(vec![new("A", "A"), new("B", "B")], false);
        let pages = vec![same.clone(), same.clone(), same.clone(), same];
        let (result, sink, _) = run_all(pages, 2).await;
        let summary = result.unwrap();
        assert_eq!(summary.stop, StopReason::Stalled);
        assert_eq!(summary.pages_committed, 3);
        assert_eq!(ids(&sink), ["A", "B"]);
    }

    #[tokio::test]
    async fn page_limit_keeps_checkpoint_and_pending_record() {
        let pages = vec![
            page(vec![new("A", "A"), new("B", "BIG")], false),
            page(vec![frag("BEAR"), new("C", "C")], true),
        ];
        let mut opts = options(2);
        opts.max_pages = Some(1);
        let mut controller = PaginationController::new(&WATER_SYSTEMS, ScriptedFetcher::new(pages.clone()), opts);
        let mut sink = MemorySink::default();
        let mut store = MemoryCheckpoints::default();
        let summary = controller.run(&mut sink, &mut NullProgress, &mut store).await.unwrap();
        assert_eq!(summary.stop, StopReason::PageLimit);
        assert_eq!(ids(&sink), ["A"]);
        assert!(!store.discarded);
        let cp = store.saved.last().cloned().unwrap();
        assert_eq!(cp.last_committed_page, Some(0));
        assert_eq!(cp.pending.as_ref().and_then(|r| r.get("Name")), Some("BIG"));

        let mut resumed =
            PaginationController::resume(&WATER_SYSTEMS, ScriptedFetcher::new(pages), options(2), cp).unwrap();
        let summary = resumed.run(&mut sink, &mut NullProgress, &mut store).await.unwrap();
        assert_eq!(summary.stop, StopReason::EndOfData);
        assert_eq!(ids(&sink), ["A", "B", "C"]);
        assert_eq!(sink.records[1].get("Name"), Some("BIG BEAR"));
        assert!(store.discarded);
    }

    #[tokio::test]
    async fn re_served_trailing_fragment_merges_once() {
        let pages = vec![
            page(vec![new("A", "A"), new("B", "BIG"), frag("BEAR")], false),
            page(vec![frag("BEAR"), new("C", "C")], true),
        ];
        let (result, sink, _) = run_all(pages, 3).await;
        let summary = result.unwrap();
        assert_eq!(ids(&sink), ["A", "B", "C"]);
        assert_eq!(sink.records[1].get("Name"), Some("BIG BEAR"));
        assert_eq!(summary.overlap_rows_skipped, 1);
    }

    #[tokio::test]
    async fn new_continuation_after_page_break_still_merges() {
        let pages = vec![
            page(vec![new("A", "A"), new("B", "BIG"), frag("BEAR")], false),
            page(vec![frag("LAKE"), new("C", "C")], true),
        ];
        let (result, sink, _) = run_all(pages, 3).await;
        let summary = result.unwrap();
        assert_eq!(sink.records[1].get("Name"), Some("BIG BEAR LAKE"));
        assert_eq!(summary.overlap_rows_skipped, 0);
    }

    struct CancelAfter {
        pages: u64,
        flag: CancelFlag,
    }

    impl ProgressReporter for CancelAfter {
        fn page_committed(&mut self, p: PageProgress) {
            if p.pages_committed >= self.pages {
                self.flag.cancel();
            }
        }
    }

    #[tokio::test]
    async fn cancellation_between_pages() {
        let pages = vec![
            page(vec![new("A", "A"), new("B", "B")], false),
            page(vec![new("C", "C"), new("D", "D")], false),
            page(vec![], true),
        ];
        let flag = CancelFlag::default();
        let mut controller = PaginationController::new(&WATER_SYSTEMS, ScriptedFetcher::new(pages), options(2))
            .with_cancel(flag.clone());
        let mut progress = CancelAfter { pages: 1, flag };
        let err = controller
            .run(&mut MemorySink::default(), &mut progress, &mut MemoryCheckpoints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Cancelled { page: 1 }));
        assert_eq!(controller.checkpoint().last_committed_page, Some(0));
    }

    struct FailSecond {
        calls: u32,
    }

    impl OutputSink for FailSecond {
        fn accept(&mut self, _records: &[LogicalRecord]) -> Result<(), ExtractError> {
            self.calls += 1;
            if self.calls == 2 {
                return Err(ExtractError::Sink("disk full".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn sink_failure_leaves_previous_commit() {
        let pages = vec![
            page(vec![new("A", "A"), new("B", "B")], false),
            page(vec![new("C", "C"), new("D", "D")], false),
            page(vec![], true),
        ];
        let mut controller = PaginationController::new(&WATER_SYSTEMS, ScriptedFetcher::new(pages), options(2));
        let err = controller
            .run(&mut FailSecond { calls: 0 }, &mut NullProgress, &mut MemoryCheckpoints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Sink(_)));
        let cp = controller.checkpoint();
        assert_eq!(cp.last_committed_page, Some(0));
        assert!(!cp.coverage.contains("B"));
        assert_eq!(cp.pending.as_ref().map(|r| r.id()), Some("B"));
    }

    #[tokio::test]
    async fn finished_controller_cannot_rerun() {
        let mut controller = PaginationController::new(
            &WATER_SYSTEMS,
            ScriptedFetcher::new(vec![page(vec![], true)]),
            options(2),
        );
        let mut store = MemoryCheckpoints::default();
        controller.run(&mut MemorySink::default(), &mut NullProgress, &mut store).await.unwrap();
        assert_eq!(controller.state(), ControllerState::Done);
        let again = controller.run(&mut MemorySink::default(), &mut NullProgress, &mut store).await;
        assert!(matches!(again, Err(ExtractError::NotIdle("done"))));
    }

    #[tokio::test]
    async fn cursor_pagination_requests_from_last_name() {
        let entity = |name: &str, id: &str| {
            RawRow::from_pairs([("Individual Name", name), ("Status", "IN"), ("Federal ID", id)])
        };
        let pages = vec![
            page(vec![entity("ADAMS, AL", "MS1"), entity("BAKER, BO", "MS2")], false),
            page(vec![entity("BAKER, BO", "MS2"), entity("CRUZ, CY", "MS3")], false),
            page(vec![entity("CRUZ, CY", "MS3")], false),
        ];
        let mut controller = PaginationController::new(&LEGAL_ENTITIES, ScriptedFetcher::new(pages), options(2));
        let mut sink = MemorySink::default();
        controller
            .run(&mut sink, &mut NullProgress, &mut MemoryCheckpoints::default())
            .await
            .unwrap();
        let cursors: Vec<Option<String>> = controller
            .into_fetcher()
            .requests
            .iter()
            .map(|r| r.cursor.clone())
            .collect();
        assert_eq!(
            cursors,
            [Some("0".into()), Some("BAKER, BO".into()), Some("CRUZ, CY".into())]
        );
        let names: Vec<&str> = sink.records.iter().filter_map(|r| r.get("Last Name")).collect();
        assert_eq!(names, ["ADAMS", "BAKER", "CRUZ"]);
    }

    struct SlowOnce {
        slow: bool,
    }

    #[async_trait]
    impl PageFetcher for SlowOnce {
        async fn fetch_page(&mut self, _request: &PageRequest) -> Result<PageResult, TransportError> {
            if std::mem::take(&mut self.slow) {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Ok(page(vec![new("A", "A")], true))
        }
    }

    #[tokio::test]
    async fn fetch_timeout_is_retried() {
        let mut opts = options(2);
        opts.retry.fetch_timeout = Duration::from_millis(20);
        let mut controller = PaginationController::new(&WATER_SYSTEMS, SlowOnce { slow: true }, opts);
        let summary = controller
            .run(&mut MemorySink::default(), &mut NullProgress, &mut MemoryCheckpoints::default())
            .await
            .unwrap();
        assert_eq!(summary.records_accepted, 1);
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            base_backoff: Duration::from_millis(100),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
    }
}
