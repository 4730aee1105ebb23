//! Local filesystem sink.

use super::{validate_object_name, BlobSink, SinkKind};
use crate::error::SinkError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Copies artifacts into a local directory tree.
#[derive(Debug, Clone)]
pub struct LocalFilesystemSink {
    root: PathBuf,
}

impl LocalFilesystemSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BlobSink for LocalFilesystemSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Local
    }

    fn destination(&self) -> String {
        self.root.display().to_string()
    }

    async fn put(&self, local: &Path, object_name: &str) -> Result<(), SinkError> {
        let target = self.root.join(validate_object_name(object_name)?);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Copy under a temporary name so readers never see a partial object
        let mut tmp = target.clone().into_os_string();
        tmp.push(".partial");
        let tmp = PathBuf::from(tmp);
        if let Err(e) = fs::copy(local, &tmp).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        fs::rename(&tmp, &target).await?;
        Ok(())
    }
}
