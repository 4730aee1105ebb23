//! Shipping pipeline.
//!
//! Orchestrates Detector, Batcher, and Shipper tasks, or the periodic
//! whole-root snapshotter, and restarts them after fatal failures when
//! configured to.

use crate::config::ShipConfig;
use crate::error::{Result, ShipError};
use crate::shipping::archiver::{ArchiveScope, Archiver, ArchiverConfig, DeliveryMode};
use crate::shipping::channel::{relay, Batch, ShipStats};
use crate::shipping::{Batcher, ChangeDetector, Shipper};
use crate::sink::BlobSink;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Result of one pipeline attempt
struct RunOutcome {
    stats: ShipStats,
    failure: Option<ShipError>,
}

/// Orchestrator for the shipping pipeline
pub struct ShipPipeline {
    config: ShipConfig,
    sink: Arc<dyn BlobSink>,
}

impl ShipPipeline {
    pub fn new(config: ShipConfig, sink: Arc<dyn BlobSink>) -> Self {
        Self { config, sink }
    }

    /// Run until cancelled, restarting after restartable failures up to the
    /// configured limit. Returns the statistics of all attempts combined.
    pub async fn supervise(&self, cancel: CancellationToken) -> Result<ShipStats> {
        let restart = &self.config.restart;
        let mut total = ShipStats::new();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let outcome = self.run_once(&cancel).await;
            total.merge(&outcome.stats);

            let Some(failure) = outcome.failure else {
                return Ok(total);
            };
            if cancel.is_cancelled() || !failure.is_restartable() || attempt >= restart.max_attempts
            {
                error!(attempt, "Pipeline stopped: {}", failure);
                return Err(failure);
            }

            let delay = restart.backoff(attempt);
            warn!(
                attempt,
                remaining = restart.max_attempts - attempt,
                "Pipeline failed, restarting in {:?}: {}",
                delay,
                failure
            );
            tokio::select! {
                _ = cancel.cancelled() => return Ok(total),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run a single attempt without restarts.
    pub async fn run(&self, cancel: CancellationToken) -> Result<ShipStats> {
        let outcome = self.run_once(&cancel).await;
        match outcome.failure {
            Some(failure) => Err(failure),
            None => Ok(outcome.stats),
        }
    }

    async fn run_once(&self, cancel: &CancellationToken) -> RunOutcome {
        match self.config.snapshot_interval {
            Some(interval) => self.run_periodic(interval, cancel).await,
            None => self.run_watch(cancel).await,
        }
    }

    async fn run_watch(&self, cancel: &CancellationToken) -> RunOutcome {
        let config = &self.config;
        // Cancelled on shutdown or when a sibling task fails
        let run_cancel = cancel.child_token();

        let (path_tx, path_rx) = relay("paths", config.relay_capacity, config.overflow);
        let (batch_tx, batch_rx) = relay("batches", config.relay_capacity, config.overflow);

        let mut detector = ChangeDetector::new(config.detector.clone());
        let mut batcher = Batcher::new(config.batcher.clone());
        let archiver = Arc::new(Archiver::new(config.archiver.clone()));
        let mut shipper = Shipper::new(config.shipper.clone(), archiver, self.sink.clone());

        let mut tasks = JoinSet::new();
        let mut names = HashMap::new();

        let token = run_cancel.clone();
        let handle = tasks.spawn(async move {
            let result = detector.run(path_tx, token).await;
            (detector.stats(), result)
        });
        names.insert(handle.id(), "detector");

        let token = run_cancel.clone();
        let handle = tasks.spawn(async move {
            let result = batcher.run(path_rx, batch_tx, token).await;
            (batcher.stats().clone(), result)
        });
        names.insert(handle.id(), "batcher");

        let token = run_cancel.clone();
        let handle = tasks.spawn(async move {
            let result = shipper.run(batch_rx, token).await;
            (shipper.stats().clone(), result)
        });
        names.insert(handle.id(), "shipper");

        let mut stats = ShipStats::new();
        let mut failure = None;

        while let Some(joined) = tasks.join_next_with_id().await {
            // Counts survive a task error; only a panic loses them
            let (task, result) = match joined {
                Ok((id, (task_stats, result))) => {
                    stats.merge(&task_stats);
                    (names.get(&id).copied().unwrap_or("unknown"), result)
                }
                Err(e) => (
                    names.get(&e.id()).copied().unwrap_or("unknown"),
                    Err(ShipError::Join(e)),
                ),
            };

            if let Err(e) = result {
                error!(task, "Task failed: {}", e);
                run_cancel.cancel();
                if failure.is_none() {
                    failure = Some(ShipError::TaskFailed {
                        task,
                        source: Box::new(e),
                    });
                }
            }
        }

        info!(
            events = stats.events_detected,
            batches = stats.batches_emitted,
            delivered = stats.artifacts_delivered,
            failed = stats.artifacts_failed,
            dropped = stats.relay_dropped,
            "Pipeline stopped"
        );
        RunOutcome { stats, failure }
    }

    /// Archive the whole snapshot root every `interval` and ship it.
    async fn run_periodic(&self, interval: Duration, cancel: &CancellationToken) -> RunOutcome {
        let archiver = Arc::new(Archiver::new(ArchiverConfig {
            mode: DeliveryMode::Archive,
            scope: ArchiveScope::SnapshotRoot,
            ..self.config.archiver.clone()
        }));
        let mut shipper = Shipper::new(self.config.shipper.clone(), archiver, self.sink.clone());

        info!(
            root = %self.config.archiver.snapshot_root.display(),
            interval = ?interval,
            "Shipping periodic snapshots"
        );

        let failure = self.periodic_loop(&mut shipper, interval, cancel).await.err();
        if let Some(e) = &failure {
            error!(task = "snapshotter", "Task failed: {}", e);
        }

        RunOutcome {
            stats: shipper.stats().clone(),
            failure: failure.map(|e| ShipError::TaskFailed {
                task: "snapshotter",
                source: Box::new(e),
            }),
        }
    }

    async fn periodic_loop(
        &self,
        shipper: &mut Shipper,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        shipper.sweep_orphans(cancel).await?;

        let mut sequence = 0u64;
        while !cancel.is_cancelled() {
            shipper.ship_batch(Batch::new(sequence, Vec::new()), cancel).await?;
            sequence += 1;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        Ok(())
    }
}
