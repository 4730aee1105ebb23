//! Batcher task.
//!
//! Drains change events, groups them into fixed-size batches and publishes
//! each completed batch to the Shipper. Partial batches are never shipped.

use crate::error::Result;
use crate::shipping::channel::{Batch, ChangeEvent, RelayReceiver, RelaySender, ShipStats};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Batcher configuration
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Exact number of paths per batch
    pub batch_size: usize,
    /// Longest wait for the next event before the stage fails
    pub timeout: Duration,
}

/// Batcher state
pub struct Batcher {
    config: BatcherConfig,
    pending: Vec<PathBuf>,
    next_sequence: u64,
    stats: ShipStats,
}

impl Batcher {
    pub fn new(config: BatcherConfig) -> Self {
        let pending = Vec::with_capacity(config.batch_size);
        Self {
            config,
            pending,
            next_sequence: 0,
            stats: ShipStats::new(),
        }
    }

    /// Batches handed downstream and events lost to a full relay.
    pub fn stats(&self) -> &ShipStats {
        &self.stats
    }

    /// Paths waiting for the batch to fill up.
    pub fn pending(&self) -> &[PathBuf] {
        &self.pending
    }

    /// Add a path, returning a batch once the accumulator is full.
    ///
    /// A path already waiting in the accumulator is ignored.
    pub fn push(&mut self, path: PathBuf) -> Option<Batch> {
        if self.pending.contains(&path) {
            debug!(path = %path.display(), "Path already pending, skipping");
            return None;
        }
        self.pending.push(path);

        if self.pending.len() < self.config.batch_size {
            return None;
        }

        let paths = std::mem::replace(
            &mut self.pending,
            Vec::with_capacity(self.config.batch_size),
        );
        let batch = Batch::new(self.next_sequence, paths);
        self.next_sequence += 1;
        Some(batch)
    }

    /// Run the batcher until cancelled or upstream closes.
    pub async fn run(
        &mut self,
        mut rx: RelayReceiver<ChangeEvent>,
        tx: RelaySender<Batch>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let result = self.forward(&mut rx, &tx, &cancel).await;
        self.stats.relay_dropped = rx.dropped();

        if !self.pending.is_empty() {
            warn!(
                pending = self.pending.len(),
                "Stopping with an incomplete batch; pending paths are not shipped"
            );
        }
        result
    }

    async fn forward(
        &mut self,
        rx: &mut RelayReceiver<ChangeEvent>,
        tx: &RelaySender<Batch>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        while let Some(event) = rx.recv(self.config.timeout, cancel).await? {
            if let Some(batch) = self.push(event.path) {
                info!(
                    batch_id = %batch.id,
                    sequence = batch.sequence,
                    files = batch.len(),
                    "Batch complete"
                );
                if tx.send(batch, cancel).await? {
                    self.stats.batches_emitted += 1;
                }
            }
        }
        Ok(())
    }
}
