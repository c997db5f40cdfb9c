use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing::info;

use crate::scraper::RunSummary;

/// Counters sent after every committed page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageProgress {
    pub pages_committed: u64,
    pub records_accepted: u64,
    pub duplicates_ignored: u64,
}

/// Observes an extraction; never consulted for control decisions.
pub trait ProgressReporter: Send {
    fn begin(&mut self, _dataset: &str, _expected: Option<u64>) {}
    fn expected_total(&mut self, _total: u64) {}
    fn page_committed(&mut self, progress: PageProgress);
    fn finish(&mut self, _summary: &RunSummary) {}
}

impl<P: ProgressReporter + ?Sized> ProgressReporter for Box<P> {
    fn begin(&mut self, dataset: &str, expected: Option<u64>) {
        (**self).begin(dataset, expected)
    }

    fn expected_total(&mut self, total: u64) {
        (**self).expected_total(total)
    }

    fn page_committed(&mut self, progress: PageProgress) {
        (**self).page_committed(progress)
    }

    fn finish(&mut self, summary: &RunSummary) {
        (**self).finish(summary)
    }
}

/// No-op reporter.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct NullProgress;

#[cfg(test)]
impl ProgressReporter for NullProgress {
    fn page_committed(&mut self, _progress: PageProgress) {}
}

/// Writes one log line per committed page, for non-interactive runs.
#[derive(Debug, Default)]
pub struct LogProgress {
    dataset: String,
}

impl ProgressReporter for LogProgress {
    fn begin(&mut self, dataset: &str, expected: Option<u64>) {
        self.dataset = dataset.to_string();
        info!(dataset, expected, "Extraction started");
    }

    fn page_committed(&mut self, p: PageProgress) {
        info!(
            dataset = %self.dataset,
            pages = p.pages_committed,
            accepted = p.records_accepted,
            duplicates = p.duplicates_ignored,
            "Page committed"
        );
    }
}

/// Terminal progress bar; one line per dataset under a shared `MultiProgress`.
pub struct BarProgress {
    pb: ProgressBar,
}

impl BarProgress {
    pub fn new(multi: &MultiProgress, dataset: &str) -> Self {
        let pb = multi.add(ProgressBar::new_spinner());
        pb.set_prefix(dataset.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(120));
        Self { pb }
    }

    fn use_bar(&self, total: u64) {
        self.pb.set_length(total);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{prefix:>16} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            self.pb.set_style(style.progress_chars("#>-"));
        }
    }
}

impl ProgressReporter for BarProgress {
    fn begin(&mut self, _dataset: &str, expected: Option<u64>) {
        match expected {
            Some(total) => self.use_bar(total),
            None => {
                if let Ok(style) = ProgressStyle::default_spinner()
                    .template("{spinner:.green} {prefix:>16} [{elapsed_precise}] {pos} records {msg}")
                {
                    self.pb.set_style(style);
                }
            }
        }
    }

    fn expected_total(&mut self, total: u64) {
        self.use_bar(total);
    }

    fn page_committed(&mut self, p: PageProgress) {
        self.pb.set_position(p.records_accepted);
        self.pb.set_message(format!(
            "page {} ({} dup)",
            p.pages_committed, p.duplicates_ignored
        ));
    }

    fn finish(&mut self, summary: &RunSummary) {
        self.pb.finish_with_message(summary.verification.label().to_string());
    }
}
