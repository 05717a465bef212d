//! Object store sink
//!
//! Buffers accepted records as CSV and uploads them in one `put` on commit.
//! The output key is derived from the source artifact key, so a redelivered
//! notification overwrites the same object instead of adding a duplicate.

use async_trait::async_trait;
use csv::Writer;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::{Destination, RecordSink, SinkSession};
use crate::error::{SinkConnectionError, SinkRowError};
use crate::notification::ArtifactLocation;
use crate::storage::ArtifactStore;
use crate::transform::TransformedRecord;

const RAW_PREFIX: &str = "raw/";
const CSV_CONTENT_TYPE: &str = "text/csv";

#[derive(Clone)]
pub struct ObjectStoreSink {
    store: Arc<dyn ArtifactStore>,
    bucket: String,
    prefix: String,
}

impl ObjectStoreSink {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    /// Where the processed form of `artifact` is written.
    ///
    /// `raw/coinmarketcap/2024/05/01/1300.csv` becomes
    /// `<prefix>coinmarketcap/2024/05/01/1300.csv`.
    pub fn output_location(&self, artifact: &ArtifactLocation) -> ArtifactLocation {
        let relative = artifact
            .key
            .strip_prefix(RAW_PREFIX)
            .unwrap_or(&artifact.key)
            .trim_start_matches('/');
        ArtifactLocation::new(&self.bucket, format!("{}{}", self.prefix, relative))
    }
}

#[async_trait]
impl RecordSink for ObjectStoreSink {
    fn name(&self) -> &'static str {
        "object_store"
    }

    #[instrument(skip(self, destination), fields(artifact = %destination.artifact))]
    async fn open(
        &self,
        destination: &Destination,
    ) -> Result<Box<dyn SinkSession>, SinkConnectionError> {
        let output = self.output_location(&destination.artifact);
        let label = format!("object_store:{output}");

        let mut writer = Writer::from_writer(Vec::new());
        writer
            .write_record(destination.schema.destination_columns())
            .map_err(|e| SinkConnectionError::Connect {
                destination: label.clone(),
                message: e.to_string(),
            })?;

        debug!(output = %output, "Opened CSV buffer");

        Ok(Box::new(ObjectStoreSession {
            store: self.store.clone(),
            writer,
            output,
            label,
        }))
    }
}

struct ObjectStoreSession {
    store: Arc<dyn ArtifactStore>,
    writer: Writer<Vec<u8>>,
    output: ArtifactLocation,
    label: String,
}

#[async_trait]
impl SinkSession for ObjectStoreSession {
    async fn insert(&mut self, record: &TransformedRecord) -> Result<(), SinkRowError> {
        let fields: Vec<String> = record.values().map(|v| v.to_field()).collect();
        self.writer
            .write_record(&fields)
            .map_err(|e| SinkRowError {
                destination: self.label.clone(),
                message: e.to_string(),
            })
    }

    async fn commit(self: Box<Self>) -> Result<(), SinkConnectionError> {
        let ObjectStoreSession {
            store,
            writer,
            output,
            label,
        } = *self;

        let body = writer
            .into_inner()
            .map_err(|e| SinkConnectionError::Commit {
                destination: label.clone(),
                message: e.to_string(),
            })?;

        store
            .put(&output, body, CSV_CONTENT_TYPE)
            .await
            .map_err(|e| SinkConnectionError::Commit {
                destination: label,
                message: format!("{e:#}"),
            })
    }
}
