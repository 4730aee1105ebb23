//! Snapshot shipping pipeline.
//!
//! Three tasks connected by bounded relays:
//!
//! ```text
//! +--------------+     +--------------+     +--------------+
//! |   Detector   | --> |   Batcher    | --> |   Shipper    |
//! | (poll mtime) |     | (group by N) |     | (pack + put) |
//! +--------------+     +--------------+     +--------------+
//!                                                  |
//!                                                  v
//!                                           local dir / S3
//! ```
//!
//! The Detector reports new and modified snapshot files, the Batcher groups
//! them into fixed-size batches, and the Shipper packages each batch in the
//! staging area before handing it to a [`BlobSink`](crate::sink::BlobSink).

pub mod archiver;
pub mod batcher;
pub mod channel;
pub mod detector;
pub mod pipeline;
pub mod shipper;

pub use archiver::{
    ArchiveArtifact, ArchiveScope, Archiver, ArchiverConfig, ArtifactPayload, DeliveryMode,
};
pub use batcher::{Batcher, BatcherConfig};
pub use channel::{
    relay, Batch, ChangeEvent, ChangeKind, OverflowPolicy, RelayReceiver, RelaySender, ShipStats,
    DEFAULT_BATCH_SIZE, DEFAULT_RELAY_TIMEOUT, RELAY_CAPACITY,
};
pub use detector::{ChangeDetector, DetectorConfig};
pub use pipeline::ShipPipeline;
pub use shipper::{DeliveryResult, RetryPolicy, Shipper, ShipperConfig};
