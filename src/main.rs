//! FabFleet worker
//!
//! Consumes the device message queue, or drains the dead-letter queue when
//! started with `--dlq`.
//!
//! # Usage
//!
//! ```bash
//! # Process messages with the configured retry policy
//! ./fabfleet-worker
//!
//! # Three attempts, starting with a 5 s backoff
//! ./fabfleet-worker -r 3 -s 5
//!
//! # Show and delete everything on the dead-letter queue, then exit
//! ./fabfleet-worker --dlq
//! ```
//!
//! # Environment Variables
//!
//! - `FABFLEET_CONFIG`: Path to the worker TOML config (default: ./worker_config.toml)
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use fabfleet_worker::config::WorkerConfig;
use fabfleet_worker::{
    DeadLetterDrainer, DeviceClient, DirectoryQueue, FsBlobStore, HandlerSet, HttpOutcomeReporter,
    MessageProcessor,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "fabfleet-worker")]
#[command(about = "Queue worker for a fleet of fabrication devices")]
#[command(version)]
struct CliArgs {
    /// Maximum number of attempts per message before it is dead-lettered
    #[arg(short = 'r', long = "retries")]
    retries: Option<u32>,

    /// Seconds before the first retry (doubles for successive retries)
    #[arg(short = 's', long = "initial-backoff")]
    initial_backoff: Option<u64>,

    /// Read, show and delete every message on the dead-letter queue, then exit
    #[arg(long)]
    dlq: bool,

    /// Worker config file (overrides FABFLEET_CONFIG and ./worker_config.toml)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(args: &CliArgs) -> Result<WorkerConfig> {
    let mut config = match &args.config {
        Some(path) => WorkerConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => WorkerConfig::load(),
    };

    if let Some(retries) = args.retries {
        config.retry.retries = retries;
    }
    if let Some(secs) = args.initial_backoff {
        config.retry.initial_backoff_secs = secs;
    }
    config.validate().context("Invalid worker configuration")?;
    Ok(config)
}

// ============================================================================
// Modes
// ============================================================================

async fn run_worker(config: WorkerConfig) -> Result<()> {
    let broker = Arc::new(
        DirectoryQueue::open_with_config(&config.queue.messages_dir, &config.queue)
            .context("Failed to open message queue")?,
    );
    let dead_letters = Arc::new(
        DirectoryQueue::open_with_config(&config.queue.dead_letter_dir, &config.queue)
            .context("Failed to open dead-letter queue")?,
    );
    let blobs = Arc::new(FsBlobStore::open(&config.queue.blob_dir).context("Failed to open blob store")?);

    let http = config.http.build_client().context("Failed to build HTTP client")?;
    let devices = Arc::new(DeviceClient::from_config(http.clone(), &config.device));
    let handlers = Arc::new(HandlerSet::new(blobs, devices.clone(), &config.worker.scratch_dir));
    let reporter = Arc::new(HttpOutcomeReporter::new(http));

    info!(
        queue = %config.queue.messages_dir.display(),
        dead_letter = %config.queue.dead_letter_dir.display(),
        job_transport = devices.job_transport_name(),
        max_in_flight = config.worker.max_in_flight,
        "Worker configured"
    );

    let processor = MessageProcessor::new(broker, dead_letters, handlers, reporter, config.retry)
        .with_max_in_flight(config.worker.max_in_flight);

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, finishing in-flight messages...");
        shutdown_token.cancel();
    });

    processor.run(cancel_token).await;
    Ok(())
}

async fn run_drain(config: WorkerConfig) -> Result<()> {
    // No long-poll: the first empty receive ends the drain
    let dead_letters = Arc::new(
        DirectoryQueue::open_with_config(&config.queue.dead_letter_dir, &config.queue)
            .context("Failed to open dead-letter queue")?
            .with_wait_time(Duration::ZERO),
    );

    let mut drainer = DeadLetterDrainer::new(dead_letters, std::io::stdout());
    let report = drainer.drain().await.context("Dead-letter drain failed")?;
    info!(
        displayed = report.displayed,
        deleted = report.deleted,
        delete_failures = report.delete_failures,
        "Drain complete"
    );
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    init_logging(args.log_json);

    let config = load_config(&args)?;

    if args.dlq {
        return run_drain(config).await;
    }

    info!(
        retries = config.retry.retries,
        initial_backoff_secs = config.retry.initial_backoff_secs,
        "Starting FabFleet worker"
    );
    run_worker(config).await?;
    info!("FabFleet worker shutdown complete");
    Ok(())
}
