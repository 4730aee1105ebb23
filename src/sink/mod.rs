//! Delivery sinks.
//!
//! A sink is chosen once at startup and shared by the shipper. Object names
//! are relative, `/`-separated keys such as `<uuid>/<name>` or
//! `<timestamp>-<uuid>.tar.gz`.

use crate::config::SinkSelection;
use crate::error::SinkError;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

pub mod local;
#[cfg(feature = "s3")]
pub mod object_store;

pub use local::LocalFilesystemSink;
#[cfg(feature = "s3")]
pub use self::object_store::ObjectStoreSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Local,
    Remote,
}

#[async_trait]
pub trait BlobSink: Send + Sync {
    fn kind(&self) -> SinkKind;

    /// Human readable destination (directory or bucket URL)
    fn destination(&self) -> String;

    /// Store the local file under `object_name`.
    async fn put(&self, local: &Path, object_name: &str) -> Result<(), SinkError>;
}

/// Build the sink selected at startup.
pub fn open_sink(selection: &SinkSelection) -> Result<Arc<dyn BlobSink>, SinkError> {
    match selection {
        SinkSelection::Local { root } => Ok(Arc::new(LocalFilesystemSink::new(root.clone()))),
        #[cfg(feature = "s3")]
        SinkSelection::Remote(creds) => Ok(Arc::new(ObjectStoreSink::s3(creds)?)),
        #[cfg(not(feature = "s3"))]
        SinkSelection::Remote(creds) => Err(SinkError::Remote {
            object: String::new(),
            message: format!("no S3 support compiled in for bucket {}", creds.bucket),
        }),
    }
}

/// Validate that an object name is relative and does not escape its root.
/// Returns the name as a relative path.
pub fn validate_object_name(name: &str) -> Result<PathBuf, SinkError> {
    let invalid = |reason: &str| SinkError::InvalidObjectName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("empty name"));
    }

    let rel = Path::new(name);
    if rel.is_absolute() {
        return Err(invalid("absolute names not allowed"));
    }

    for component in rel.components() {
        match component {
            Component::ParentDir => return Err(invalid("path traversal not allowed")),
            Component::Prefix(_) | Component::RootDir => {
                return Err(invalid("prefixed names not allowed"))
            }
            _ => {}
        }
    }

    Ok(rel.to_path_buf())
}
