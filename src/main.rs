//! Scrape-Relay main entry point
//!
//! Runs one scraping job through the orchestration core from the command line and
//! prints its event stream as JSON lines.

use clap::Parser;
use scrape_relay::config::{load_config_with_hash, Config};
use scrape_relay::fetch::HttpFetcherFactory;
use scrape_relay::storage::{open_sink, NullSink, ResultSink};
use scrape_relay::{Coordinator, JobEvent, PriorityTier, ScrapeConfig, SubmitRequest};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Scrape-Relay: scraping job orchestration
///
/// Schedules the given URLs as one job on a bounded worker pool, throttled per
/// domain, and streams the job's progress events to stdout.
#[derive(Parser, Debug)]
#[command(name = "scrape-relay")]
#[command(version)]
#[command(about = "Scraping job orchestration and progress tracking", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// URL to scrape (repeatable)
    #[arg(short = 'u', long = "url", value_name = "URL", required_unless_present = "dry_run")]
    urls: Vec<String>,

    /// Tenant submitting the job
    #[arg(long, default_value = "cli")]
    tenant: String,

    /// Priority tier (free, starter, pro, enterprise)
    #[arg(long, default_value = "free")]
    tier: PriorityTier,

    /// Per-page timeout in milliseconds
    #[arg(long, value_name = "MS")]
    page_timeout: Option<u64>,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Validate config and show what would run without scraping anything
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    // Load and validate configuration
    tracing::info!("Loading configuration from: {}", cli.config.display());
    let config = match load_config_with_hash(&cli.config) {
        Ok((cfg, hash)) => {
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            cfg
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if cli.dry_run {
        handle_dry_run(&config, &cli.urls);
        return Ok(());
    }

    let mut scrape = ScrapeConfig::default();
    if let Some(timeout) = cli.page_timeout {
        scrape.page_timeout_ms = timeout;
    }
    let request = SubmitRequest::new(cli.tenant, cli.urls, cli.tier).with_config(scrape);

    handle_run(config, request).await
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("scrape_relay=info,warn"),
            1 => EnvFilter::new("scrape_relay=debug,info"),
            2 => EnvFilter::new("scrape_relay=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    // Events go to stdout, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: shows the effective configuration
fn handle_dry_run(config: &Config, urls: &[String]) {
    println!("=== Scrape-Relay Dry Run ===\n");

    println!("Scheduler:");
    println!(
        "  Admission threshold: {} (recovery below {})",
        config.scheduler.admission_threshold, config.scheduler.recovery_depth
    );
    println!("  Overload window: {}ms", config.scheduler.overload_window_ms);
    let weights = &config.scheduler.tier_weights;
    println!(
        "  Tier weights: free={} starter={} pro={} enterprise={}",
        weights.free, weights.starter, weights.pro, weights.enterprise
    );
    println!("  Max URLs per job: {}", config.scheduler.max_urls_per_job);
    match config.scheduler.job_timeout_secs {
        Some(secs) => println!("  Job timeout: {}s", secs),
        None => println!("  Job timeout: none"),
    }

    println!("\nWorkers:");
    println!(
        "  Pool size: {}..={}",
        config.workers.min_workers, config.workers.max_workers
    );
    println!(
        "  Recycle after: {} jobs",
        config.workers.max_jobs_per_worker
    );

    println!("\nRetry:");
    println!(
        "  Transient: {} retries from {}ms",
        config.retry.transient_max_retries, config.retry.base_delay_ms
    );
    println!(
        "  Rate limit: {} retries from {}ms",
        config.retry.rate_limit_max_retries, config.retry.rate_limit_base_delay_ms
    );

    println!("\nRate limit:");
    println!(
        "  Domain spacing: {}ms (max {}ms when penalized)",
        config.rate_limit.min_spacing_ms, config.rate_limit.max_spacing_ms
    );

    println!("\nQuotas ({}):", config.quota.len());
    for (tier, quota) in &config.quota {
        println!(
            "  - {}: {} pages per {}s",
            tier, quota.pages, quota.window_secs
        );
    }

    println!("\nUser Agent: {}", config.fetcher.user_agent());
    match &config.output.database_path {
        Some(path) => println!("Database: {}", path),
        None => println!("Database: none (results discarded)"),
    }

    println!("\n✓ Configuration is valid");
    if !urls.is_empty() {
        println!("✓ Would submit 1 job with {} URLs", urls.len());
    }
}

/// Runs one job to completion, printing every event as a JSON line
async fn handle_run(
    config: Config,
    request: SubmitRequest,
) -> Result<(), Box<dyn std::error::Error>> {
    let factory = Arc::new(HttpFetcherFactory::new(&config.fetcher)?);
    let sink: Arc<dyn ResultSink> = match &config.output.database_path {
        Some(path) => {
            tracing::info!("Storing results in {}", path);
            Arc::new(open_sink(Path::new(path))?)
        }
        None => Arc::new(NullSink),
    };

    let coordinator = Coordinator::start(config, factory, sink)?;
    let receipt = coordinator.submit(request)?;
    tracing::info!("Submitted job {}", receipt.job_id);

    let subscription = coordinator.join(receipt.job_id, "cli")?;
    let mut success = false;

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                println!("{}", event.to_json()?);
                if let JobEvent::Complete(done) = &event {
                    success = done.success;
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Interrupted, cancelling job {}", receipt.job_id);
                coordinator.cancel(receipt.job_id)?;
            }
        }
    }

    coordinator.shutdown().await;

    if success {
        tracing::info!("Job completed successfully");
        Ok(())
    } else {
        Err(format!("job {} did not complete", receipt.job_id).into())
    }
}
