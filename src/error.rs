//! Error types for snapship.
//!
//! Fatal conditions (unreadable watch directory, unwritable staging area,
//! naming invariant violations) abort the owning task. Delivery failures are
//! carried as [`SinkError`] and handled by the shipper without stopping the
//! pipeline.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ShipError>;

#[derive(Error, Debug)]
pub enum ShipError {
    #[error("Cannot read watch directory {path}: {source}")]
    WatchDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Staging directory {path} is not usable: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Packaging failed: {0}")]
    Packaging(#[from] PackagingError),

    #[error("Delivery failed: {0}")]
    Sink(#[from] SinkError),

    /// A relay consumer waited longer than the configured safety timeout.
    #[error("No input for {stage} within {waited:?}")]
    TimeoutExceeded {
        stage: &'static str,
        waited: Duration,
    },

    #[error("Relay '{0}' is full")]
    RelayFull(&'static str),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task '{task}' failed: {source}")]
    TaskFailed {
        task: &'static str,
        #[source]
        source: Box<ShipError>,
    },

    #[error("Channel closed unexpectedly")]
    ChannelClosed,

    #[error("Task panicked or was aborted: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShipError {
    /// Whether a pipeline restart has a chance of getting past this error.
    pub fn is_restartable(&self) -> bool {
        match self {
            ShipError::Config(_) => false,
            ShipError::Packaging(PackagingError::NameCollision(_)) => false,
            ShipError::TaskFailed { source, .. } => source.is_restartable(),
            _ => true,
        }
    }
}

#[derive(Error, Debug)]
pub enum PackagingError {
    #[error("Source path does not exist: {0}")]
    SourceMissing(PathBuf),

    #[error("Staging directory {path} is not writable: {source}")]
    StagingNotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Artifact names carry a fresh uuid, so this is an invariant violation.
    #[error("Artifact already exists: {0}")]
    NameCollision(PathBuf),

    #[error("Invalid artifact name: {0}")]
    InvalidName(String),

    #[error("I/O error while packaging: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid object name '{name}': {reason}")]
    InvalidObjectName { name: String, reason: String },

    #[error("Remote store rejected object '{object}': {message}")]
    Remote { object: String, message: String },
}
