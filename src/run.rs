use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::extract::extract_all;
use crate::fetcher::PageFetcher;
use crate::format::{self, format_prompts};
use crate::harvest::harvest;
use crate::llm::{GenerationService, KeyPool};
use crate::observer::Observer;
use crate::pipeline::metadata::generate_metadata;
use crate::pipeline::variations::generate_variations;
use crate::pipeline::{BatchReport, Pacing};
use crate::postprocess::write_versioned_tables;
use crate::tables::TableSink;

static RUN_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSummary {
    pub stage: String,
    pub total: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub retries: usize,
}

impl StageSummary {
    fn from_batches<T>(stage: &str, report: &BatchReport<T>) -> Self {
        debug!(stage, attempts = report.attempts.len(), cancelled = report.cancelled, "stage finished");
        Self {
            stage: stage.to_string(),
            total: report.total,
            succeeded: report.succeeded(),
            skipped: report.skipped,
            retries: report.retries,
        }
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub target_url: String,
    pub status: RunStatus,
    pub error: Option<String>,
    pub links: usize,
    pub raw_items: usize,
    pub prompts: usize,
    pub metadata_rows: usize,
    pub stages: Vec<StageSummary>,
    pub skipped_files: Vec<String>,
    pub outputs: Vec<PathBuf>,
}

impl RunReport {
    pub fn start(settings: &Settings) -> Self {
        let started_at = Utc::now();
        Self {
            run_id: run_id(started_at),
            started_at,
            finished_at: started_at,
            target_url: settings.target_url.clone(),
            status: RunStatus::Completed,
            error: None,
            links: 0,
            raw_items: 0,
            prompts: 0,
            metadata_rows: 0,
            stages: Vec::new(),
            skipped_files: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// A run that ended before any stage could start.
    pub fn failed(settings: &Settings, error: String, observer: &dyn Observer) -> Self {
        observer.log_line(&format!("An error occurred: {}", error));
        let mut report = Self::start(settings);
        report.status = RunStatus::Failed;
        report.error = Some(error);
        report
    }
}

/// `run-<unix secs>.<micros>-<seq>`; the sequence keeps ids distinct within
/// one process even when the clock does not move.
fn run_id(started_at: DateTime<Utc>) -> String {
    format!(
        "run-{}.{:06}-{}",
        started_at.timestamp(),
        started_at.timestamp_subsec_micros(),
        RUN_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

/// The external capabilities a run drives.
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn PageFetcher>,
    pub service: Arc<dyn GenerationService>,
    pub sink: Arc<dyn TableSink>,
    pub observer: Arc<dyn Observer>,
}

/// Run every stage in order. Never returns an error: anything unexpected is
/// logged, the browser session is released and the report says `failed`.
pub async fn execute(
    settings: &Settings,
    deps: &Collaborators,
    pacing: Pacing,
    cancel: &CancellationToken,
) -> RunReport {
    let observer = deps.observer.as_ref();
    let mut report = RunReport::start(settings);
    info!(run = %report.run_id, url = %settings.target_url, "run started");

    if let Err(e) = run_stages(settings, deps, pacing, cancel, &mut report).await {
        observer.log_line(&format!("An error occurred: {:#}", e));
        report.status = RunStatus::Failed;
        report.error = Some(format!("{:#}", e));
    } else if cancel.is_cancelled() {
        observer.log_line("Run cancelled.");
        report.status = RunStatus::Cancelled;
    }

    if let Err(e) = deps.fetcher.close().await {
        warn!(error = %e, "failed to close browser session");
    }

    report.finished_at = Utc::now();
    report
}

async fn run_stages(
    settings: &Settings,
    deps: &Collaborators,
    pacing: Pacing,
    cancel: &CancellationToken,
    report: &mut RunReport,
) -> Result<()> {
    let observer = deps.observer.as_ref();
    let fetcher = deps.fetcher.as_ref();
    let service = deps.service.as_ref();
    let sink = deps.sink.as_ref();
    let generation = &settings.generation;
    let pool = KeyPool::from_strings(&settings.api_keys, generation.key_rotation_interval)?;
    info!(keys = pool.len(), model = %generation.model, "credential pool ready");

    observer.log_line("Starting web scraping...");
    let links = harvest(fetcher, &settings.target_url, &settings.harvest, observer, cancel)
        .await
        .with_context(|| format!("Failed to load {}", settings.target_url))?;
    report.links = links.len();
    if cancel.is_cancelled() {
        return Ok(());
    }

    observer.log_line("Scraping content from links...");
    let mut content = extract_all(fetcher, &links, &settings.extract, observer, cancel).await;
    report.raw_items = content.len();
    observer.log_line("Scraping completed.");
    if cancel.is_cancelled() {
        return Ok(());
    }

    if settings.generate_variations {
        observer.log_line("Generating variations for extracted prompts...");
        let variations =
            generate_variations(&content, &pool, service, generation, pacing, observer, cancel).await;
        report.stages.push(StageSummary::from_batches("variations", &variations));
        content = variations.accepted;
        if cancel.is_cancelled() {
            return Ok(());
        }
    }

    observer.log_line("Starting formatting...");
    let formatted = format_prompts(
        &content,
        settings.start_serial,
        &settings.file_prefix,
        &settings.format,
        observer,
    );
    report.prompts = formatted.prompts.len();
    format::persist(sink, &settings.output_file, &formatted.prompts)
        .context("Failed to write prompts table")?;
    observer.log_line(&format!(
        "Process completed. Formatted content saved to {}",
        settings.output_file
    ));

    observer.log_line(&format!(
        "Generating metadata for {}...",
        settings.post.versions.join(", ")
    ));
    let metadata = generate_metadata(
        &formatted.prompts,
        &pool,
        service,
        generation,
        pacing,
        observer,
        cancel,
    )
    .await;
    report
        .stages
        .push(StageSummary::from_batches("metadata", &metadata.batches));
    report.metadata_rows = metadata.batches.accepted.len();
    report.skipped_files = metadata.skipped_files;
    if cancel.is_cancelled() {
        return Ok(());
    }

    report.outputs = write_versioned_tables(
        sink,
        &settings.file_prefix,
        &metadata.batches.accepted,
        &settings.post,
        observer,
    )
    .context("Failed to write metadata tables")?;

    observer.log_line("Metadata generation completed.");
    Ok(())
}
