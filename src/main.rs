mod aggregate;
mod crawler;
mod extract;
mod fetch;
mod frontier;
mod inputs;
mod ledger;
mod output;
mod settings;
mod store;
mod utils;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::crawler::CrawlOptions;
use crate::fetch::HttpSource;
use crate::inputs::LinkMap;
use crate::ledger::ProgressLedger;
use crate::output::DoseReport;
use crate::settings::{Settings, SubstanceLimit};
use crate::store::ReportStore;
use crate::utils::format_duration;

#[derive(Parser)]
#[command(
    name = "dose_harvester",
    about = "Harvest dose records from experience reports and summarize them into dose ranges"
)]
struct Cli {
    /// YAML configuration file (optional; DOSES_* env vars override it)
    #[arg(short, long, global = true, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl categories and reports, then aggregate everything stored so far
    Run {
        /// Only the first N substances of the link map (overrides max_substances)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Rebuild the dose ranges from stored reports without touching the network
    Aggregate,
    /// Show progress ledger and report store counts
    Stats,
    /// Re-sort an existing result file by the canonical substance order
    Reorder {
        /// Result file to rewrite in place
        file: PathBuf,
    },
    /// Run the dose extractor over a local file and print the records
    Extract {
        file: PathBuf,
        /// Treat the file as a report page and pull the report text out first
        #[arg(long)]
        html: bool,
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
    let mut settings = Settings::load(&cli.config)?;

    let result = match cli.command {
        Commands::Run { limit } => {
            if let Some(n) = limit {
                settings.max_substances = SubstanceLimit::First(n);
            }
            run(&settings).await
        }
        Commands::Aggregate => {
            let canonical = inputs::load_canonical_order(&settings.canonical_path)?;
            let store = ReportStore::open(&settings.store_dir)?;
            aggregate_and_write(&settings, &store, &canonical)
        }
        Commands::Stats => {
            let ledger = ProgressLedger::load(&settings.progress_path);
            let (done, failed, blocked) = ledger.counts();
            let stored = if settings.store_dir.exists() {
                ReportStore::open(&settings.store_dir)?.count()?
            } else {
                0
            };
            if ledger.is_empty() {
                println!("No progress recorded yet at {}", ledger.path().display());
            }
            println!("Ledger:         {}", ledger.path().display());
            println!("Tracked:        {}", ledger.len());
            println!("Done:           {}", done);
            println!("Failed:         {}", failed);
            println!("Failed blocked: {}", blocked);
            println!("Stored reports: {}", stored);
            Ok(())
        }
        Commands::Reorder { file } => {
            let canonical = inputs::load_canonical_order(&settings.canonical_path)?;
            let (known, other) = output::reorder_file(&file, &canonical)?;
            println!(
                "Reordered {}: {} canonical entries, {} others appended.",
                file.display(),
                known,
                other
            );
            Ok(())
        }
        Commands::Extract { file, html } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let text = if html { fetch::report_text(&raw) } else { raw };
            let doses = extract::extract_doses(&text);
            println!("{}", serde_json::to_string_pretty(&doses)?);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

async fn run(settings: &Settings) -> anyhow::Result<()> {
    println!("{}", "-".repeat(50));
    println!("Dose harvester (progress tracking enabled)");
    println!("Progress file: {}", settings.progress_path.display());
    println!("Report store:  {}", settings.store_dir.display());
    println!("{}", "-".repeat(50));

    let canonical = inputs::load_canonical_order(&settings.canonical_path)?;
    let links = LinkMap::load(&settings.link_map_path)?;
    let links = frontier::select_substances(links, &settings.max_substances);
    if links.is_empty() {
        warn!("No substances selected; only stored reports will be aggregated");
    }
    if settings.max_substances != SubstanceLimit::All {
        info!(
            "Substance filter {:?} kept {} substances",
            settings.max_substances,
            links.len()
        );
    }

    let store = ReportStore::open(&settings.store_dir)?;
    let mut ledger = ProgressLedger::load(&settings.progress_path);
    println!("Loaded {} tracked URLs from {}", ledger.len(), ledger.path().display());

    let categories: Vec<String> = frontier::category_urls(&links).into_iter().collect();
    println!("Processing {} category URLs...", categories.len());

    let source = Arc::new(HttpSource::new(
        &settings.user_agent,
        settings.request_timeout(),
    )?);
    let opts = CrawlOptions::from(settings);
    let summary = crawler::crawl(source, categories, &opts, &mut ledger, &store).await;

    println!(
        "Categories: {} total, {} scanned, {} failed, {} cancelled.",
        summary.discovery.categories,
        summary.discovery.scanned,
        summary.discovery.failed,
        summary.discovery.cancelled
    );
    println!(
        "Reports: {} queued, {} skipped, {} done, {} failed, {} cancelled ({} dose records).",
        summary.reports.total,
        summary.skipped,
        summary.reports.done,
        summary.reports.failed,
        summary.reports.cancelled,
        summary.reports.records
    );

    aggregate_and_write(settings, &store, &canonical)?;

    if summary.blocked() {
        println!("Warning: the pass was incomplete because the site blocked the crawler.");
        println!("Run again later to resume; finished reports will be skipped.");
    }
    Ok(())
}

/// Full rebuild from the report store, sorted and written to a new result file.
fn aggregate_and_write(
    settings: &Settings,
    store: &ReportStore,
    canonical: &[String],
) -> anyhow::Result<()> {
    println!("Merging stored reports from {}...", store.dir().display());
    let reports = store.load_all()?;
    let corpus = aggregate::build_corpus(&reports);
    let bands = aggregate::summarize(&corpus);
    info!(
        "Aggregated {} report files into {} substance labels ({} with bands)",
        reports.len(),
        corpus.substance_count(),
        bands.len()
    );
    if corpus.is_empty() {
        println!("No dose records stored yet.");
    }

    let report = DoseReport(output::sort_by_canonical(bands, canonical));
    let path = output::write_report(&settings.output_dir, &report)?;
    println!("Saved {} substances to {}", report.0.len(), path.display());
    Ok(())
}
