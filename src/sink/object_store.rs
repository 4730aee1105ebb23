//! Remote object storage sink backed by the `object_store` crate.

use super::{validate_object_name, BlobSink, SinkKind};
use crate::config::S3Credentials;
use crate::error::SinkError;
use async_trait::async_trait;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use std::path::Path;
use std::sync::Arc;

pub struct ObjectStoreSink {
    store: Arc<dyn ObjectStore>,
    label: String,
}

impl ObjectStoreSink {
    pub fn new(store: Arc<dyn ObjectStore>, label: impl Into<String>) -> Self {
        Self {
            store,
            label: label.into(),
        }
    }

    /// Build a sink for an S3 bucket.
    pub fn s3(creds: &S3Credentials) -> Result<Self, SinkError> {
        let store = AmazonS3Builder::new()
            .with_access_key_id(&creds.access_key)
            .with_secret_access_key(&creds.secret_key)
            .with_region(&creds.region)
            .with_bucket_name(&creds.bucket)
            .build()
            .map_err(|e| SinkError::Remote {
                object: String::new(),
                message: e.to_string(),
            })?;

        Ok(Self::new(
            Arc::new(store),
            format!("s3://{} ({})", creds.bucket, creds.region),
        ))
    }
}

#[async_trait]
impl BlobSink for ObjectStoreSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Remote
    }

    fn destination(&self) -> String {
        self.label.clone()
    }

    async fn put(&self, local: &Path, object_name: &str) -> Result<(), SinkError> {
        validate_object_name(object_name)?;
        let location = ObjectPath::parse(object_name).map_err(|e| SinkError::InvalidObjectName {
            name: object_name.to_string(),
            reason: e.to_string(),
        })?;

        let data = tokio::fs::read(local).await?;
        self.store
            .put(&location, PutPayload::from(data))
            .await
            .map_err(|e| SinkError::Remote {
                object: object_name.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }
}
