//! Shipper task.
//!
//! Receives full batches, packages each one with the Archiver and delivers
//! the artifact to the configured sink. Batches are handled one at a time so
//! delivery order matches detection order.

use crate::error::{PackagingError, Result, ShipError};
use crate::shipping::archiver::{ArchiveArtifact, Archiver, ArtifactName};
use crate::shipping::channel::{Batch, RelayReceiver, ShipStats};
use crate::sink::{BlobSink, SinkKind};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bounded retry with capped exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per object, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before attempt `attempt + 1`, given `attempt` failures so far.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Outcome of delivering one artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    pub artifact_id: Uuid,
    pub success: bool,
    pub destination: String,
    /// Objects confirmed by the sink
    pub objects_delivered: usize,
    pub bytes: u64,
}

/// Shipper configuration
#[derive(Debug, Clone)]
pub struct ShipperConfig {
    pub retry: RetryPolicy,
    /// Longest wait for the next batch before the stage fails
    pub timeout: Duration,
}

/// Shipper state
pub struct Shipper {
    config: ShipperConfig,
    archiver: Arc<Archiver>,
    sink: Arc<dyn BlobSink>,
    stats: ShipStats,
}

impl Shipper {
    pub fn new(config: ShipperConfig, archiver: Arc<Archiver>, sink: Arc<dyn BlobSink>) -> Self {
        Self {
            config,
            archiver,
            sink,
            stats: ShipStats::new(),
        }
    }

    pub fn stats(&self) -> &ShipStats {
        &self.stats
    }

    /// Run the shipper until cancelled or upstream closes.
    pub async fn run(
        &mut self,
        mut rx: RelayReceiver<Batch>,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!(destination = %self.sink.destination(), "Shipper ready");
        let result = self.drain(&mut rx, &cancel).await;
        self.stats.relay_dropped += rx.dropped();
        result
    }

    async fn drain(&mut self, rx: &mut RelayReceiver<Batch>, cancel: &CancellationToken) -> Result<()> {
        self.sweep_orphans(cancel).await?;

        while let Some(batch) = rx.recv(self.config.timeout, cancel).await? {
            self.ship_batch(batch, cancel).await?;
        }
        Ok(())
    }

    /// Package and deliver one batch.
    ///
    /// Only errors that make every later batch fail are returned; anything
    /// else is logged and reported as an unsuccessful delivery.
    pub async fn ship_batch(
        &mut self,
        batch: Batch,
        cancel: &CancellationToken,
    ) -> Result<DeliveryResult> {
        let batch_id = batch.id;
        let artifact = match self.package(batch).await? {
            Ok(artifact) => artifact,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                error!(batch_id = %batch_id, "Skipping batch: {}", e);
                self.stats.artifacts_failed += 1;
                return Ok(DeliveryResult {
                    artifact_id: batch_id,
                    success: false,
                    destination: self.sink.destination(),
                    objects_delivered: 0,
                    bytes: 0,
                });
            }
        };

        Ok(self.deliver(&artifact, cancel).await)
    }

    async fn package(&self, batch: Batch) -> Result<std::result::Result<ArchiveArtifact, PackagingError>> {
        let archiver = self.archiver.clone();
        // Archiving is blocking I/O
        Ok(tokio::task::spawn_blocking(move || archiver.package(&batch)).await?)
    }

    /// Deliver an artifact, retrying each object per the retry policy.
    ///
    /// On success the staged copy is removed when the sink is remote. On
    /// failure the artifact stays on local disk.
    pub async fn deliver(
        &mut self,
        artifact: &ArchiveArtifact,
        cancel: &CancellationToken,
    ) -> DeliveryResult {
        let destination = self.sink.destination();
        let objects = artifact.objects();
        let mut delivered = 0usize;
        let mut bytes = 0u64;

        for (local, name) in &objects {
            if !self.put_with_retry(artifact.id, local, name, cancel).await {
                break;
            }
            delivered += 1;
            bytes += tokio::fs::metadata(local).await.map(|m| m.len()).unwrap_or(0);
        }

        let success = delivered == objects.len();
        if success {
            info!(
                artifact_id = %artifact.id,
                objects = delivered,
                bytes,
                destination = %destination,
                "Shipped artifact"
            );
            self.stats.artifacts_delivered += 1;
            self.stats.bytes_delivered += bytes;

            if self.sink.kind() == SinkKind::Remote {
                if let Err(e) = artifact.remove_local() {
                    warn!(
                        artifact_id = %artifact.id,
                        path = %artifact.local_path().display(),
                        "Failed to remove delivered artifact: {}",
                        e
                    );
                }
            }
        } else {
            error!(
                artifact_id = %artifact.id,
                path = %artifact.local_path().display(),
                delivered,
                total = objects.len(),
                "Delivery failed; artifact kept on local disk"
            );
            self.stats.artifacts_failed += 1;
        }

        DeliveryResult {
            artifact_id: artifact.id,
            success,
            destination,
            objects_delivered: delivered,
            bytes,
        }
    }

    async fn put_with_retry(
        &self,
        artifact_id: Uuid,
        local: &Path,
        name: &str,
        cancel: &CancellationToken,
    ) -> bool {
        let retry = &self.config.retry;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.sink.put(local, name).await {
                Ok(()) => return true,
                Err(e) if attempt >= retry.max_attempts.max(1) => {
                    error!(
                        artifact_id = %artifact_id,
                        object = name,
                        attempt,
                        "Giving up on object: {}",
                        e
                    );
                    return false;
                }
                Err(e) => {
                    let delay = retry.backoff(attempt);
                    warn!(
                        artifact_id = %artifact_id,
                        object = name,
                        attempt,
                        "Put failed, retrying in {:?}: {}",
                        delay,
                        e
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return false,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Redeliver artifacts left in staging by earlier failed deliveries.
    ///
    /// Only meaningful for remote sinks: local delivery keeps staged copies,
    /// so leftovers there are not evidence of failure.
    pub async fn sweep_orphans(&mut self, cancel: &CancellationToken) -> Result<u64> {
        if self.sink.kind() != SinkKind::Remote {
            return Ok(0);
        }

        let staging = self.archiver.config().staging.clone();
        let orphans = tokio::task::spawn_blocking(move || find_orphans(&staging)).await??;
        if orphans.is_empty() {
            return Ok(0);
        }

        info!(count = orphans.len(), "Redelivering leftover artifacts");
        let mut recovered = 0u64;
        for artifact in orphans {
            if cancel.is_cancelled() {
                break;
            }
            if self.deliver(&artifact, cancel).await.success {
                recovered += 1;
            }
        }
        self.stats.orphans_recovered += recovered;
        Ok(recovered)
    }
}

/// Artifacts in `staging` whose names follow the artifact naming pattern.
fn find_orphans(staging: &Path) -> Result<Vec<ArchiveArtifact>> {
    let entries = match std::fs::read_dir(staging) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(ShipError::Staging {
                path: staging.to_path_buf(),
                source,
            })
        }
    };

    let mut found = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let artifact = if path.is_dir() {
            ArchiveArtifact::from_staged_dir(path)
        } else {
            let named = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| ArtifactName::parse(n).is_ok());
            if !named {
                continue;
            }
            ArchiveArtifact::from_archive_path(path)
        };

        match artifact {
            Ok(artifact) => found.push(artifact),
            Err(e) => debug!("Ignoring staging entry: {}", e),
        }
    }

    found.sort_by_key(|a| a.created);
    Ok(found)
}
