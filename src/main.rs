mod config;
mod db;
mod error;
mod extract;
mod fetcher;
mod format;
mod harvest;
mod llm;
mod observer;
mod pipeline;
mod postprocess;
mod run;
mod tables;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use config::{Overrides, Settings};
use fetcher::WebDriverFetcher;
use llm::GeminiClient;
use observer::ConsoleObserver;
use pipeline::Pacing;
use run::{Collaborators, RunReport, RunStatus};
use tables::CsvDir;

#[derive(Parser)]
#[command(
    name = "prompt_harvester",
    about = "Harvest image prompts from a gallery and generate stock metadata"
)]
struct Cli {
    /// Configuration file (default: ./harvester.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape, format and generate metadata in one run
    Run {
        /// Gallery page to harvest prompt links from
        #[arg(long)]
        url: Option<String>,
        /// Name of the prompts table
        #[arg(short, long)]
        output: Option<String>,
        /// File-name prefix, e.g. "X-" gives X-V1-1.jpg
        #[arg(short, long)]
        prefix: Option<String>,
        /// First serial number
        #[arg(short, long)]
        start: Option<u64>,
        /// Scroll attempts while harvesting links
        #[arg(long)]
        max_attempts: Option<usize>,
        /// API key (repeat for several)
        #[arg(long = "api-key")]
        api_keys: Vec<String>,
        /// Expand every prompt into variations before numbering
        #[arg(long)]
        variations: bool,
        /// WebDriver endpoint
        #[arg(long)]
        webdriver: Option<String>,
        /// Directory for every written table
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    /// Format raw prompts from a text file (one per line) without a browser
    Format {
        input: PathBuf,
        #[arg(short, long)]
        output: String,
        #[arg(short, long, default_value = "1")]
        start: u64,
        #[arg(short, long)]
        prefix: String,
    },
    /// Cap keyword lists in an existing metadata table
    Reduce {
        input: PathBuf,
        /// Defaults to <input>-reduced.csv
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short = 'k', long)]
        max_keywords: Option<usize>,
    },
    /// Show recent runs from the ledger
    Stats {
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },
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
    let mut settings = Settings::load(cli.config.as_deref())?;

    let result = match cli.command {
        Commands::Run {
            url,
            output,
            prefix,
            start,
            max_attempts,
            api_keys,
            variations,
            webdriver,
            out_dir,
        } => {
            settings.apply(Overrides {
                target_url: url,
                output_file: output,
                file_prefix: prefix,
                start_serial: start,
                max_attempts,
                api_keys,
                generate_variations: variations,
                webdriver_url: webdriver,
                out_dir,
            });
            settings.validate().context("Invalid configuration")?;
            run_pipeline(settings).await
        }
        Commands::Format {
            input,
            output,
            start,
            prefix,
        } => {
            let raw = std::fs::read_to_string(&input)
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let items: Vec<String> = raw.lines().map(String::from).collect();
            let observer = ConsoleObserver::new()?;
            let formatted =
                format::format_prompts(&items, start, &prefix, &settings.format, &observer);
            observer.finish();
            format::persist(&CsvDir::new(&settings.out_dir), &output, &formatted.prompts)?;
            println!(
                "Formatted {} prompts ({} duplicates removed) into {}",
                formatted.prompts.len(),
                formatted.duplicates,
                output
            );
            if let (Some(first), Some(last)) =
                (formatted.file_names.first(), formatted.file_names.last())
            {
                println!("File names: {} .. {}", first, last);
            }
            Ok(())
        }
        Commands::Reduce {
            input,
            output,
            max_keywords,
        } => {
            let output = output.unwrap_or_else(|| reduced_sibling(&input));
            let observer = ConsoleObserver::new()?;
            let path = postprocess::reduce_table(
                &CsvDir::new("."),
                &input.to_string_lossy(),
                &output.to_string_lossy(),
                max_keywords.unwrap_or(settings.post.max_keywords),
                &observer,
            )?;
            observer.finish();
            println!("Reduced table written to {}", path.display());
            Ok(())
        }
        Commands::Stats { limit } => {
            let conn = db::connect(&settings.ledger_path)?;
            db::init_schema(&conn)?;
            let runs = db::fetch_recent_runs(&conn, limit)?;
            if runs.is_empty() {
                println!("No runs recorded yet.");
                return Ok(());
            }

            println!(
                "{:<32} | {:<20} | {:<9} | {:>6} | {:>7} | {:>8}",
                "Run", "Started", "Status", "Links", "Prompts", "Metadata"
            );
            println!("{}", "-".repeat(96));
            for r in &runs {
                println!(
                    "{:<32} | {:<20} | {:<9} | {:>6} | {:>7} | {:>8}",
                    truncate(&r.id, 32),
                    truncate(&r.started_at, 20),
                    r.status,
                    r.links,
                    r.prompts,
                    r.metadata_rows
                );
                for s in &r.stages {
                    println!(
                        "    {:<10} total {:>5}  ok {:>5}  skipped {:>5}  retries {:>4}",
                        s.stage, s.total, s.succeeded, s.skipped, s.retries
                    );
                }
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

async fn run_pipeline(settings: Settings) -> anyhow::Result<()> {
    let observer = Arc::new(ConsoleObserver::new()?);
    let cancel = CancellationToken::new();

    let conn = db::connect(&settings.ledger_path)?;
    db::init_schema(&conn)?;

    let mut task = {
        let settings = settings.clone();
        let observer = observer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let fetcher =
                match WebDriverFetcher::connect(&settings.browser.webdriver_url, &settings.browser.args)
                    .await
                {
                    Ok(f) => f,
                    Err(e) => {
                        return RunReport::failed(
                            &settings,
                            format!("Could not start browser session: {}", e),
                            observer.as_ref(),
                        )
                    }
                };
            let deps = Collaborators {
                fetcher: Arc::new(fetcher),
                service: Arc::new(gemini_client(&settings)),
                sink: Arc::new(CsvDir::new(&settings.out_dir)),
                observer,
            };
            let pacing = Pacing::from_settings(&settings.generation);
            run::execute(&settings, &deps, pacing, &cancel).await
        })
    };

    let report = tokio::select! {
        joined = &mut task => joined.context("Run task panicked")?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Ctrl-C received, cancelling run");
            cancel.cancel();
            task.await.context("Run task panicked")?
        }
    };
    observer.finish();

    db::record_run(&conn, &report)?;
    info!(run = %report.run_id, status = report.status.as_str(), "run recorded");

    println!(
        "{}: {} links, {} raw items, {} prompts, {} metadata rows",
        report.status.as_str(),
        report.links,
        report.raw_items,
        report.prompts,
        report.metadata_rows
    );
    for s in &report.stages {
        println!(
            "  {}: {}/{} succeeded, {} skipped, {} retries",
            s.stage, s.succeeded, s.total, s.skipped, s.retries
        );
    }
    if !report.skipped_files.is_empty() {
        println!("  no metadata for {} files", report.skipped_files.len());
    }
    for path in &report.outputs {
        println!("  wrote {}", path.display());
    }

    match report.status {
        RunStatus::Failed => bail!(report.error.unwrap_or_else(|| "run failed".into())),
        RunStatus::Completed | RunStatus::Cancelled => Ok(()),
    }
}

fn gemini_client(settings: &Settings) -> GeminiClient {
    let client = GeminiClient::new(&settings.generation.model);
    match &settings.generation.api_base_url {
        Some(url) => client.with_base_url(url),
        None => client,
    }
}

fn reduced_sibling(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    input.with_file_name(format!("{}-reduced.csv", stem))
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
