//! snapship - watch a snapshot directory and ship changes to a bucket.
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use clap::Parser;
use snapship::config::{CliArgs, ShipConfig, SinkSelection};
use snapship::logging;
use snapship::shipping::ShipPipeline;
use snapship::sink::open_sink;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = CliArgs::parse();

    // Validate before logging so config errors reach the terminal
    let config = ShipConfig::from_args(args).context("Invalid configuration")?;

    if let Some(path) = logging::init(&config.log, config.verbose)? {
        eprintln!("Logging to {}", path.display());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create async runtime")?;

    runtime.block_on(run_async(config))
}

async fn run_async(config: ShipConfig) -> Result<()> {
    let sink = open_sink(&config.sink).context("Failed to open delivery sink")?;

    match &config.sink {
        SinkSelection::Local { root } => info!(dest = %root.display(), "Delivering to local directory"),
        SinkSelection::Remote(creds) => info!(?creds, "Delivering to object storage"),
    }
    info!(
        watch_dir = %config.detector.root.display(),
        staging = %config.archiver.staging.display(),
        batch_size = config.batcher.batch_size,
        mode = ?config.archiver.mode,
        "Starting snapship"
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                eprintln!("\nInterrupt received, shutting down...");
                shutdown.cancel();
            }
            Err(e) => warn!("Failed to listen for interrupt: {}", e),
        }
    });

    let pipeline = ShipPipeline::new(config, sink);
    let stats = pipeline.supervise(cancel).await.context("Shipping failed")?;

    info!(
        events = stats.events_detected,
        batches = stats.batches_emitted,
        delivered = stats.artifacts_delivered,
        failed = stats.artifacts_failed,
        bytes = stats.bytes_delivered,
        recovered = stats.orphans_recovered,
        dropped = stats.relay_dropped,
        "Shutdown complete"
    );
    Ok(())
}
