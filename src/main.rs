mod checkpoint;
mod coverage;
mod db;
mod error;
mod fetch;
mod parser;
mod progress;
mod scraper;
mod settings;
mod sink;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use indicatif::MultiProgress;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::checkpoint::{CheckpointStore, ExtractionCheckpoint};
use crate::error::ExtractError;
use crate::fetch::{with_session, HttpPageFetcher, PageFetcher, ReplayFetcher};
use crate::parser::datasets::{self, Pagination};
use crate::parser::DatasetSpec;
use crate::progress::{BarProgress, LogProgress, ProgressReporter};
use crate::scraper::{CancelFlag, ControllerOptions, PaginationController, RunSummary, StopReason};
use crate::settings::Settings;
use crate::sink::{ExclusionFilter, OutputSink};

#[derive(Parser)]
#[command(name = "sdwis_extract", about = "Complete, resumable extraction of SDWIS datasets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract datasets from the first page (one concurrent session each)
    Run {
        #[arg(required = true)]
        datasets: Vec<String>,
        #[command(flatten)]
        opts: ExtractArgs,
    },
    /// Continue interrupted extractions from their checkpoints
    Resume {
        #[arg(required = true)]
        datasets: Vec<String>,
        #[command(flatten)]
        opts: ExtractArgs,
    },
    /// Show stored records, pending checkpoints and last runs
    Status,
    /// Write a dataset's records as a JSON array
    Export {
        dataset: String,
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Discard a dataset's checkpoint
    Abort { dataset: String },
    /// List extractable datasets
    Datasets,
}

#[derive(Args, Clone)]
struct ExtractArgs {
    /// Expected record count, overrides the count the server reports
    #[arg(long)]
    expected: Option<u64>,
    /// Read captured pages from <DIR>/<dataset>/ instead of a live server
    #[arg(long, value_name = "DIR")]
    replay: Option<PathBuf>,
    /// Skip writing records whose name matches this regex (repeatable)
    #[arg(long)]
    exclude: Vec<String>,
    #[arg(long)]
    max_pages: Option<u64>,
    #[arg(long)]
    page_size: Option<usize>,
    /// Log progress lines instead of drawing bars
    #[arg(long)]
    log_progress: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let mut settings = Settings::load()?;

    let result = match cli.command {
        Commands::Run { datasets, opts } => extract_all(&mut settings, &datasets, opts, false).await,
        Commands::Resume { datasets, opts } => extract_all(&mut settings, &datasets, opts, true).await,
        Commands::Status => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            let names: Vec<&str> = datasets::ALL.iter().map(|s| s.name).collect();
            println!(
                "{:<18} | {:>8} | {:<10} | {:<12} | {:<25}",
                "Dataset", "Records", "Resume at", "Last run", "Finished"
            );
            println!("{}", "-".repeat(85));
            for s in db::get_stats(&conn, &names)? {
                println!(
                    "{:<18} | {:>8} | {:<10} | {:<12} | {:<25}",
                    s.dataset,
                    s.records,
                    s.resume_at.map(|p| format!("page {p}")).unwrap_or_else(|| "-".into()),
                    s.last_outcome.as_deref().unwrap_or("-"),
                    truncate(s.last_finished.as_deref().unwrap_or("-"), 25),
                );
            }
            Ok(())
        }
        Commands::Export { dataset, out } => {
            let spec = lookup(&dataset)?;
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            let records = db::fetch_records(&conn, spec.name)?;
            let rows: Vec<serde_json::Map<String, serde_json::Value>> = records
                .iter()
                .map(|r| {
                    r.fields()
                        .iter()
                        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                        .collect()
                })
                .collect();
            if let Some(dir) = out.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::write(&out, serde_json::to_string_pretty(&rows)?)
                .with_context(|| format!("writing {}", out.display()))?;
            if db::load_checkpoint(&conn, spec.name)?.is_some() {
                warn!("{} has an unfinished checkpoint, export is partial", spec.name);
            }
            println!("Exported {} {} records to {}", rows.len(), spec.name, out.display());
            Ok(())
        }
        Commands::Abort { dataset } => {
            let spec = lookup(&dataset)?;
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            if db::delete_checkpoint(&conn, spec.name)? {
                info!(dataset = spec.name, "Checkpoint discarded");
                println!("Discarded checkpoint for {}", spec.name);
            } else {
                println!("No checkpoint for {}", spec.name);
            }
            Ok(())
        }
        Commands::Datasets => {
            for spec in datasets::ALL {
                let paging = match spec.pagination {
                    Pagination::Offset => "offset".to_string(),
                    Pagination::Cursor { field, .. } => format!("cursor on {field}"),
                };
                println!(
                    "{:<18} key: {:<32} continues: {:<28} {}",
                    spec.name,
                    spec.key_fields.join(" + "),
                    spec.continuable.join(", "),
                    paging
                );
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn lookup(name: &str) -> Result<&'static DatasetSpec, ExtractError> {
    datasets::lookup(name).ok_or_else(|| ExtractError::UnknownDataset(name.to_string()))
}

// ── Extraction ──

struct Job {
    spec: &'static DatasetSpec,
    settings: Arc<Settings>,
    opts: ExtractArgs,
    resume: bool,
    cancel: CancelFlag,
    progress: Box<dyn ProgressReporter>,
}

async fn extract_all(
    settings: &mut Settings,
    names: &[String],
    opts: ExtractArgs,
    resume: bool,
) -> anyhow::Result<()> {
    let specs = names.iter().map(|n| lookup(n)).collect::<Result<Vec<_>, _>>()?;
    if let Some(n) = opts.page_size {
        settings.page_size = n;
    }
    if opts.max_pages.is_some() {
        settings.max_pages = opts.max_pages;
    }
    if opts.replay.is_some() {
        settings.replay_dir = opts.replay.clone();
    }
    settings.validate()?;
    if opts.expected.is_some() && specs.len() > 1 {
        bail!("--expected applies to a single dataset");
    }
    {
        let conn = db::connect(&settings.db_path)?;
        db::init_schema(&conn)?;
    }

    let cancel = CancelFlag::default();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping after the current page");
                cancel.cancel();
            }
        });
    }

    let settings = Arc::new(settings.clone());
    let multi = MultiProgress::new();
    let mut set = JoinSet::new();
    for spec in specs {
        let progress: Box<dyn ProgressReporter> = if opts.log_progress {
            Box::new(LogProgress::default())
        } else {
            Box::new(BarProgress::new(&multi, spec.name))
        };
        let job = Job {
            spec,
            settings: Arc::clone(&settings),
            opts: opts.clone(),
            resume,
            cancel: cancel.clone(),
            progress,
        };
        set.spawn(async move { (spec.name, extract_dataset(job).await) });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = set.join_next().await {
        outcomes.push(joined.context("extraction task panicked")?);
    }
    outcomes.sort_by_key(|(name, _)| *name);

    let conn = db::connect(&settings.db_path)?;
    println!();
    let mut failed = 0;
    for (name, outcome) in &outcomes {
        match outcome {
            Ok(s) => {
                println!(
                    "{:<18} {:<11} {:>7} records  {:>5} pages  {} dup  {} excluded  {} anomalies  stop: {}",
                    name,
                    s.verification.label(),
                    s.records_accepted,
                    s.pages_committed,
                    s.duplicates_ignored,
                    s.records_excluded,
                    s.anomalies,
                    serde_json::to_value(s.stop)?.as_str().unwrap_or_default(),
                );
                if let coverage::Verification::Incomplete { found, expected } = s.verification {
                    println!("{:<18} found {} of {} expected", "", found, expected);
                }
                if s.stop == StopReason::PageLimit {
                    println!("{:<18} continue with: sdwis_extract resume {}", "", name);
                }
            }
            Err(e) => {
                failed += 1;
                println!("{:<18} FAILED      {}", name, truncate(&format!("{e:#}"), 100));
                let resumable = e
                    .downcast_ref::<ExtractError>()
                    .is_some_and(ExtractError::is_resumable)
                    && db::load_checkpoint(&conn, name)?.is_some();
                if resumable {
                    println!("{:<18} resume with: sdwis_extract resume {}", "", name);
                }
            }
        }
    }

    let flagged = outcomes
        .iter()
        .filter(|(_, o)| o.as_ref().is_ok_and(|s| !s.verification.is_complete()))
        .count();
    if flagged > 0 {
        println!("\n{} dataset(s) finished without verified coverage", flagged);
    }

    if failed > 0 {
        bail!("{} of {} extractions did not finish", failed, outcomes.len());
    }
    Ok(())
}

async fn extract_dataset(job: Job) -> anyhow::Result<RunSummary> {
    let Job {
        spec,
        settings,
        opts,
        resume,
        cancel,
        mut progress,
    } = job;

    let conn = db::connect(&settings.db_path)?;
    let checkpoint = db::load_checkpoint(&conn, spec.name)?;
    match (&checkpoint, resume) {
        (Some(cp), false) => bail!(
            "{} has an unfinished extraction at page {}; use `resume` or `abort`",
            spec.name,
            cp.next_page()
        ),
        (None, true) => bail!("{} has no checkpoint to resume", spec.name),
        (Some(cp), true) => cp.validate(spec, settings.page_size)?,
        (None, false) => {
            let cleared = db::clear_records(&conn, spec.name)?;
            if cleared > 0 {
                info!(dataset = spec.name, cleared, "Cleared records from a previous run");
            }
        }
    }

    let field = exclusion_field(spec);
    let mut patterns = settings.exclude.clone();
    patterns.extend(opts.exclude.iter().cloned());
    let mut sink = ExclusionFilter::new(db::SqliteStore::new(conn, spec.name), field, &patterns)
        .context("invalid exclude pattern")?;
    let mut store = db::SqliteStore::new(db::connect(&settings.db_path)?, spec.name);
    let options = settings.controller_options(opts.expected);

    let summary = match &settings.replay_dir {
        Some(dir) => {
            let fetcher = ReplayFetcher::new(dir.join(spec.name), spec);
            drive(spec, fetcher, options, checkpoint, cancel, &mut sink, &mut progress, &mut store).await?
        }
        None => {
            let provider = settings.session_provider()?;
            let page_url = settings.page_urls.get(spec.name).cloned();
            with_session(&provider, |session| async move {
                let fetcher = HttpPageFetcher::new(session.clone(), spec, page_url);
                let result =
                    drive(spec, fetcher, options, checkpoint, cancel, &mut sink, &mut progress, &mut store).await;
                (session, result)
            })
            .await?
        }
    };
    Ok(summary)
}

#[allow(clippy::too_many_arguments)]
async fn drive<F, S, P, C>(
    spec: &'static DatasetSpec,
    fetcher: F,
    options: ControllerOptions,
    checkpoint: Option<ExtractionCheckpoint>,
    cancel: CancelFlag,
    sink: &mut S,
    progress: &mut P,
    store: &mut C,
) -> Result<RunSummary, ExtractError>
where
    F: PageFetcher,
    S: OutputSink,
    P: ProgressReporter,
    C: CheckpointStore,
{
    let controller = match checkpoint {
        Some(cp) => PaginationController::resume(spec, fetcher, options, cp)?,
        None => PaginationController::new(spec, fetcher, options),
    };
    let mut controller = controller.with_cancel(cancel);
    match controller.run(sink, progress, store).await {
        Ok(summary) => Ok(summary),
        Err(e) => {
            error!(dataset = spec.name, state = ?controller.state(), "{}", e);
            Err(e)
        }
    }
}

/// Field the exclusion patterns are matched against.
fn exclusion_field(spec: &DatasetSpec) -> &'static str {
    spec.cursor_field()
        .or_else(|| spec.continuable.first().copied())
        .or_else(|| spec.key_fields.first().copied())
        .unwrap_or_default()
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
