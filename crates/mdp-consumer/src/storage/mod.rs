//! Staged artifact access
//!
//! [`ArtifactStore`] is the seam between the consumer and the object store.
//! Artifacts are immutable once written; the consumer only reads them, and
//! the object store sink writes derived artifacts under a separate prefix.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_s3::{error::DisplayErrorContext, primitives::ByteStream, Client};
use tracing::{debug, info, instrument};

use crate::error::FetchError;
use crate::notification::ArtifactLocation;

pub mod config;

pub use config::StorageConfig;

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Read the full payload of an artifact.
    async fn fetch(&self, location: &ArtifactLocation) -> Result<Vec<u8>, FetchError>;

    /// Write an artifact, replacing any object at the same location.
    async fn put(&self, location: &ArtifactLocation, body: Vec<u8>, content_type: &str)
        -> Result<()>;
}

#[derive(Clone)]
pub struct S3ArtifactStore {
    client: Client,
}

impl S3ArtifactStore {
    pub fn new(sdk_config: &SdkConfig, config: &StorageConfig) -> Self {
        let s3_config = aws_sdk_s3::config::Builder::from(sdk_config)
            .force_path_style(config.path_style)
            .build();

        info!(path_style = config.path_style, "S3 artifact store initialized");

        Self {
            client: Client::from_conf(s3_config),
        }
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    #[instrument(skip(self), fields(bucket = %location.bucket, key = %location.key))]
    async fn fetch(&self, location: &ArtifactLocation) -> Result<Vec<u8>, FetchError> {
        debug!("Downloading artifact");

        let response = self
            .client
            .get_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
            .map_err(|e| {
                let not_found = e
                    .as_service_error()
                    .map(|service| service.is_no_such_key())
                    .unwrap_or(false);
                if not_found {
                    FetchError::NotFound {
                        bucket: location.bucket.clone(),
                        key: location.key.clone(),
                    }
                } else {
                    FetchError::Transport {
                        bucket: location.bucket.clone(),
                        key: location.key.clone(),
                        message: DisplayErrorContext(&e).to_string(),
                    }
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| FetchError::Body {
                bucket: location.bucket.clone(),
                key: location.key.clone(),
                message: e.to_string(),
            })?
            .into_bytes()
            .to_vec();

        debug!(bytes = data.len(), "Downloaded artifact");

        Ok(data)
    }

    #[instrument(skip(self, body), fields(bucket = %location.bucket, key = %location.key))]
    async fn put(
        &self,
        location: &ArtifactLocation,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        let size = body.len();

        self.client
            .put_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!(DisplayErrorContext(&e).to_string()))
            .with_context(|| format!("Failed to upload {location}"))?;

        info!(bytes = size, "Uploaded artifact");

        Ok(())
    }
}
