//! Driftnet main entry point
//!
//! This is the command-line interface for the Driftnet crawler.

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use driftnet::clock::{Clock, SystemClock};
use driftnet::config::{load_config_with_hash, Config, StoreBackend};
use driftnet::crawler::{Frontier, HttpFetcher, StopReason, WorkerContext, WorkerPool};
use driftnet::output::{load_statistics, print_statistics, MetricsAggregator};
use driftnet::storage::{open_page_store, PageStore, RunStatus};
use driftnet::store::{open_store, SharedStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Driftnet: a polite, distributed breadth-first web crawler
///
/// Any number of `driftnet run` processes pointed at the same shared store cooperate on
/// one frontier, with per-domain politeness and robots.txt enforced across all of them.
#[derive(Parser, Debug)]
#[command(name = "driftnet")]
#[command(version)]
#[command(about = "A polite, distributed breadth-first web crawler", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add URLs to the shared frontier at depth 0
    Seed {
        #[arg(value_name = "URL", required = true)]
        urls: Vec<String>,
    },

    /// Seed from the configuration and run a worker pool
    Run {
        /// Number of workers (overrides the configuration)
        #[arg(long)]
        concurrency: Option<u32>,

        /// Stop after this many successful fetches (overrides the configuration)
        #[arg(long)]
        max_pages: Option<u64>,

        /// Clear the shared store before seeding
        #[arg(long)]
        fresh: bool,
    },

    /// Show frontier and page statistics and exit
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    match cli.command {
        Command::Seed { urls } => handle_seed(&config, &urls).await,
        Command::Run {
            concurrency,
            max_pages,
            fresh,
        } => handle_run(config, &config_hash, concurrency, max_pages, fresh).await,
        Command::Stats => handle_stats(&config).await,
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("driftnet=info,warn"),
            1 => EnvFilter::new("driftnet=debug,info"),
            2 => EnvFilter::new("driftnet=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

async fn connect(config: &Config) -> anyhow::Result<Arc<dyn SharedStore>> {
    let store = open_store(&config.store)
        .await
        .with_context(|| format!("Failed to open {:?} store", config.store.backend))?;
    Ok(store)
}

async fn seed_urls(frontier: &Frontier, urls: &[String]) -> anyhow::Result<usize> {
    let mut admitted = 0;
    for url in urls {
        if frontier
            .insert(url, 0, 0)
            .await
            .with_context(|| format!("Cannot seed {}", url))?
        {
            admitted += 1;
        } else {
            tracing::debug!("Already seen: {}", url);
        }
    }
    Ok(admitted)
}

/// Handles `seed`: admits URLs into the shared frontier
async fn handle_seed(config: &Config, urls: &[String]) -> anyhow::Result<()> {
    if config.store.backend == StoreBackend::Memory {
        tracing::warn!("The memory store does not outlive this process; seeds will be lost");
    }

    let frontier = Frontier::new(connect(config).await?, Arc::new(SystemClock));
    let admitted = seed_urls(&frontier, urls).await?;

    println!(
        "Seeded {} of {} URLs ({} queued)",
        admitted,
        urls.len(),
        frontier.len().await?
    );
    Ok(())
}

/// Handles `run`: seeds, drains the frontier with a worker pool and records the run
async fn handle_run(
    config: Config,
    config_hash: &str,
    concurrency: Option<u32>,
    max_pages: Option<u64>,
    fresh: bool,
) -> anyhow::Result<()> {
    let store = connect(&config).await?;
    if fresh {
        tracing::info!("Starting fresh crawl (clearing shared state)");
        store.clear().await?;
    }

    let pages = Arc::new(
        open_page_store(Path::new(&config.output.database_path))
            .context("Failed to open page database")?,
    );
    let fetcher = Arc::new(HttpFetcher::from_config(&config.user_agent)?);
    let metrics = Arc::new(MetricsAggregator::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let ctx = WorkerContext::from_config(
        &config,
        store,
        clock,
        fetcher,
        pages.clone(),
        metrics.clone(),
    );

    let admitted = seed_urls(&ctx.frontier, &config.crawler.seeds).await?;
    tracing::info!(
        "Seeded {} of {} configured URLs",
        admitted,
        config.crawler.seeds.len()
    );

    let run_id = pages.create_run(config_hash).await?;
    tracing::info!("Starting crawl run {}", run_id);

    let concurrency = concurrency.unwrap_or(config.crawler.concurrency);
    let pool = WorkerPool::new(ctx, concurrency as usize)
        .with_max_pages(max_pages.or(config.crawler.max_pages))
        .with_stop_when_idle(config.crawler.stop_when_idle);

    let stop = pool.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, letting in-flight requests finish");
            stop.stop();
        }
    });

    let started_at = Utc::now();
    let result = pool.run().await;
    let finished_at = Utc::now();

    let metrics_path = Path::new(&config.output.metrics_path);
    match metrics.write_json(metrics_path, started_at, finished_at) {
        Ok(snapshot) => tracing::info!(
            "Metrics written to {} ({} pages, {:.2} pages/sec)",
            metrics_path.display(),
            snapshot.pages_crawled,
            snapshot.pages_per_second
        ),
        Err(e) => tracing::warn!("Failed to write metrics: {}", e),
    }

    match result {
        Ok(report) => {
            let status = match report.stop_reason {
                StopReason::Requested => RunStatus::Interrupted,
                _ => RunStatus::Completed,
            };
            pages
                .finish_run(run_id, status, report.pages_fetched)
                .await?;
            tracing::info!(
                "Crawl run {} {}: {} pages fetched in {:?}",
                run_id,
                status.to_db_string(),
                report.pages_fetched,
                report.elapsed
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!("Crawl failed: {}", e);
            if let Err(finish_error) = pages.finish_run(run_id, RunStatus::Failed, 0).await {
                tracing::warn!("Failed to record run failure: {}", finish_error);
            }
            Err(e.into())
        }
    }
}

/// Handles `stats`: prints statistics from the shared store and page database
async fn handle_stats(config: &Config) -> anyhow::Result<()> {
    println!("Store: {:?}", config.store.backend);
    println!("Database: {}\n", config.output.database_path);

    let frontier = Frontier::new(connect(config).await?, Arc::new(SystemClock));
    let pages = open_page_store(Path::new(&config.output.database_path))?;

    let stats = load_statistics(&frontier, &pages).await?;
    print_statistics(&stats);

    if let Some(run) = pages.latest_run().await? {
        println!("Latest run:");
        println!("  ID: {}", run.id);
        println!("  Status: {}", run.status.to_db_string());
        println!("  Started: {}", run.started_at);
        if let Some(finished) = &run.finished_at {
            println!("  Finished: {}", finished);
        }
        println!("  Pages fetched: {}", run.pages_fetched);
    }

    Ok(())
}
