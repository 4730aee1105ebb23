//! Channel types for the shipping pipeline.
//!
//! Three-task pipeline: Detector -> Batcher -> Shipper
//! Using bounded relays with an explicit overflow policy.

use crate::error::{Result, ShipError};
use chrono::{DateTime, Local};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default capacity for both relays
pub const RELAY_CAPACITY: usize = 1024;

/// How long a relay consumer waits for input before giving up (12 hours)
pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(12 * 60 * 60);

/// Number of changed files shipped together
pub const DEFAULT_BATCH_SIZE: usize = 5;

// =============================================================================
// ChangeEvent: Detector -> Batcher
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// First time the path was seen
    New,
    /// The path was seen before and its mtime advanced
    Modified,
}

/// A tracked file that is new or has a newer modification time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Absolute path of the changed file
    pub path: PathBuf,

    pub kind: ChangeKind,

    /// Modification time observed when the event was emitted
    pub mtime: SystemTime,
}

// =============================================================================
// Batch: Batcher -> Shipper
// =============================================================================

/// A full, ordered group of changed paths shipped as one artifact.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Unique batch id, reused by the artifact and delivered object names
    pub id: Uuid,

    /// Monotonic sequence number, starting at 0
    pub sequence: u64,

    /// Member paths in arrival order
    pub paths: Vec<PathBuf>,

    pub created: DateTime<Local>,
}

impl Batch {
    pub fn new(sequence: u64, paths: Vec<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence,
            paths,
            created: Local::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

// =============================================================================
// BoundedRelay
// =============================================================================

/// What a relay does when a producer finds it full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Wait for the consumer to make room (backpressure)
    #[default]
    Block,
    /// Discard the incoming item and keep going
    DropNewest,
    /// Fail the producing task
    Fail,
}

/// Create a bounded FIFO relay between two pipeline stages.
pub fn relay<T>(
    name: &'static str,
    capacity: usize,
    policy: OverflowPolicy,
) -> (RelaySender<T>, RelayReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    let dropped = Arc::new(AtomicU64::new(0));
    (
        RelaySender {
            name,
            policy,
            tx,
            dropped: dropped.clone(),
        },
        RelayReceiver { name, rx, dropped },
    )
}

pub struct RelaySender<T> {
    name: &'static str,
    policy: OverflowPolicy,
    tx: mpsc::Sender<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for RelaySender<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            policy: self.policy,
            tx: self.tx.clone(),
            dropped: self.dropped.clone(),
        }
    }
}

impl<T> RelaySender<T> {
    /// Hand an item downstream, applying the overflow policy.
    ///
    /// Returns `Ok(true)` once the item is queued. `Ok(false)` means it was
    /// not: dropped under [`OverflowPolicy::DropNewest`], or `cancel` fired
    /// while blocked.
    pub async fn send(&self, item: T, cancel: &CancellationToken) -> Result<bool> {
        match self.policy {
            OverflowPolicy::Block => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Ok(false),
                    res = self.tx.send(item) => res
                        .map(|()| true)
                        .map_err(|_| ShipError::ChannelClosed),
                }
            }
            OverflowPolicy::DropNewest => match self.tx.try_send(item) {
                Ok(()) => Ok(true),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(relay = self.name, dropped = total, "Relay full, dropping item");
                    Ok(false)
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(ShipError::ChannelClosed),
            },
            OverflowPolicy::Fail => match self.tx.try_send(item) {
                Ok(()) => Ok(true),
                Err(mpsc::error::TrySendError::Full(_)) => Err(ShipError::RelayFull(self.name)),
                Err(mpsc::error::TrySendError::Closed(_)) => Err(ShipError::ChannelClosed),
            },
        }
    }
}

pub struct RelayReceiver<T> {
    name: &'static str,
    rx: mpsc::Receiver<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> RelayReceiver<T> {
    /// Wait for the next item.
    ///
    /// `Ok(None)` means cancellation or a closed upstream. Waiting longer
    /// than `timeout` fails with [`ShipError::TimeoutExceeded`].
    pub async fn recv(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<T>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(None),
            res = tokio::time::timeout(timeout, self.rx.recv()) => match res {
                Ok(item) => Ok(item),
                Err(_) => Err(ShipError::TimeoutExceeded {
                    stage: self.name,
                    waited: timeout,
                }),
            },
        }
    }

    /// Items the producer discarded under [`OverflowPolicy::DropNewest`]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Shipping statistics
// =============================================================================

/// Statistics for a pipeline run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShipStats {
    /// Change events emitted by the detector
    pub events_detected: u64,

    /// Full batches handed to the shipper
    pub batches_emitted: u64,

    /// Artifacts confirmed by the sink
    pub artifacts_delivered: u64,

    /// Artifacts left on local disk after failed delivery
    pub artifacts_failed: u64,

    /// Total bytes handed to the sink
    pub bytes_delivered: u64,

    /// Leftover artifacts from earlier runs that were redelivered
    pub orphans_recovered: u64,

    /// Items discarded by full relays
    pub relay_dropped: u64,
}

impl ShipStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, other: &ShipStats) {
        self.events_detected += other.events_detected;
        self.batches_emitted += other.batches_emitted;
        self.artifacts_delivered += other.artifacts_delivered;
        self.artifacts_failed += other.artifacts_failed;
        self.bytes_delivered += other.bytes_delivered;
        self.orphans_recovered += other.orphans_recovered;
        self.relay_dropped += other.relay_dropped;
    }
}

// =============================================================================
// Tests
// =============================================================================
