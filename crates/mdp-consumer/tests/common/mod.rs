//! In-memory collaborators for consumer integration tests
//!
//! The queue, store and sink doubles record every call so tests can assert
//! on acknowledgments and loaded rows without AWS or Postgres.

#![allow(dead_code, clippy::unwrap_used)]

use async_trait::async_trait;
use mdp_consumer::error::{FetchError, SinkConnectionError, SinkRowError, TransportError};
use mdp_consumer::sink::{Destination, RecordSink, SinkSession};
use mdp_consumer::transform::TransformedRecord;
use mdp_consumer::{
    ArtifactLocation, ArtifactStore, ConsumerLoop, ConsumerSettings, Delivery, NotificationQueue,
    SinkRouter, SourceKind,
};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const RAW_BUCKET: &str = "raw-data";

// ============================================================================
// Queue
// ============================================================================

#[derive(Default)]
pub struct InMemoryQueue {
    batches: Mutex<VecDeque<Vec<Delivery>>>,
    acknowledged: Mutex<Vec<String>>,
    failing_acks: Mutex<HashSet<String>>,
    receive_calls: Mutex<usize>,
    fail_receive: Mutex<bool>,
}

impl InMemoryQueue {
    pub fn with_batch(deliveries: Vec<Delivery>) -> Arc<Self> {
        let queue = Self::default();
        queue.push_batch(deliveries);
        Arc::new(queue)
    }

    pub fn push_batch(&self, deliveries: Vec<Delivery>) {
        self.batches.lock().unwrap().push_back(deliveries);
    }

    pub fn fail_ack_for(&self, message_id: &str) {
        self.failing_acks
            .lock()
            .unwrap()
            .insert(message_id.to_string());
    }

    pub fn fail_receive(&self) {
        *self.fail_receive.lock().unwrap() = true;
    }

    pub fn acknowledged(&self) -> Vec<String> {
        let mut acked = self.acknowledged.lock().unwrap().clone();
        acked.sort();
        acked
    }

    pub fn receive_calls(&self) -> usize {
        *self.receive_calls.lock().unwrap()
    }
}

#[async_trait]
impl NotificationQueue for InMemoryQueue {
    async fn receive(
        &self,
        max_messages: i32,
        _wait: Duration,
    ) -> Result<Vec<Delivery>, TransportError> {
        *self.receive_calls.lock().unwrap() += 1;
        if *self.fail_receive.lock().unwrap() {
            return Err(TransportError::Receive("queue unavailable".to_string()));
        }
        assert!((1..=10).contains(&max_messages));
        Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn acknowledge(&self, delivery: &Delivery) -> Result<(), TransportError> {
        if self.failing_acks.lock().unwrap().contains(&delivery.message_id) {
            return Err(TransportError::Acknowledge {
                message_id: delivery.message_id.clone(),
                message: "receipt handle expired".to_string(),
            });
        }
        self.acknowledged
            .lock()
            .unwrap()
            .push(delivery.message_id.clone());
        Ok(())
    }
}

// ============================================================================
// Artifact store
// ============================================================================

#[derive(Default)]
pub struct InMemoryStore {
    objects: Mutex<HashMap<ArtifactLocation, Vec<u8>>>,
    fetches: Mutex<Vec<ArtifactLocation>>,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, key: &str, body: &str) {
        self.objects
            .lock()
            .unwrap()
            .insert(ArtifactLocation::new(RAW_BUCKET, key), body.as_bytes().to_vec());
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<String> {
        self.objects
            .lock()
            .unwrap()
            .get(&ArtifactLocation::new(bucket, key))
            .map(|body| String::from_utf8(body.clone()).unwrap())
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryStore {
    async fn fetch(&self, location: &ArtifactLocation) -> Result<Vec<u8>, FetchError> {
        self.fetches.lock().unwrap().push(location.clone());
        self.objects
            .lock()
            .unwrap()
            .get(location)
            .cloned()
            .ok_or_else(|| FetchError::NotFound {
                bucket: location.bucket.clone(),
                key: location.key.clone(),
            })
    }

    async fn put(
        &self,
        location: &ArtifactLocation,
        body: Vec<u8>,
        _content_type: &str,
    ) -> anyhow::Result<()> {
        self.objects.lock().unwrap().insert(location.clone(), body);
        Ok(())
    }
}

// ============================================================================
// Sink
// ============================================================================

/// A committed row: table, source column and the first mapped column.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedRow {
    pub table: &'static str,
    pub key: String,
    pub source: String,
}

#[derive(Default)]
pub struct RecordingSink {
    rows: Mutex<Vec<LoadedRow>>,
    reject_keys: Mutex<HashSet<String>>,
    fail_connect: Mutex<bool>,
    fail_commit: Mutex<bool>,
    sessions_opened: Mutex<usize>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reject records whose first column renders to `key`.
    pub fn reject(&self, key: &str) {
        self.reject_keys.lock().unwrap().insert(key.to_string());
    }

    pub fn fail_connect(&self, fail: bool) {
        *self.fail_connect.lock().unwrap() = fail;
    }

    pub fn fail_commit(&self, fail: bool) {
        *self.fail_commit.lock().unwrap() = fail;
    }

    pub fn rows(&self) -> Vec<LoadedRow> {
        self.rows.lock().unwrap().clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.rows().into_iter().map(|row| row.key).collect()
    }

    pub fn sessions_opened(&self) -> usize {
        *self.sessions_opened.lock().unwrap()
    }
}

struct RecordingSession {
    sink: Arc<RecordingSink>,
    table: &'static str,
    pending: Vec<LoadedRow>,
}

/// Shares one [`RecordingSink`] as a `RecordSink`.
pub struct SharedSink(pub Arc<RecordingSink>);

#[async_trait]
impl RecordSink for SharedSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn open(
        &self,
        destination: &Destination,
    ) -> Result<Box<dyn SinkSession>, SinkConnectionError> {
        if *self.0.fail_connect.lock().unwrap() {
            return Err(SinkConnectionError::Connect {
                destination: "recording".to_string(),
                message: "connection refused".to_string(),
            });
        }
        *self.0.sessions_opened.lock().unwrap() += 1;
        Ok(Box::new(RecordingSession {
            sink: self.0.clone(),
            table: destination.schema.table,
            pending: Vec::new(),
        }))
    }
}

#[async_trait]
impl SinkSession for RecordingSession {
    async fn insert(&mut self, record: &TransformedRecord) -> Result<(), SinkRowError> {
        let key = record.columns()[0].1.to_field();
        if self.sink.reject_keys.lock().unwrap().contains(&key) {
            return Err(SinkRowError {
                destination: "recording".to_string(),
                message: format!("constraint violation on {key}"),
            });
        }
        let source = record
            .get("source")
            .map(|v| v.to_field())
            .unwrap_or_default();
        self.pending.push(LoadedRow {
            table: self.table,
            key,
            source,
        });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), SinkConnectionError> {
        let RecordingSession { sink, pending, .. } = *self;
        if *sink.fail_commit.lock().unwrap() {
            return Err(SinkConnectionError::Commit {
                destination: "recording".to_string(),
                message: "connection reset".to_string(),
            });
        }
        sink.rows.lock().unwrap().extend(pending);
        Ok(())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub const RATES_HEADER: &str =
    "currency,rate,base,exchange_timestamp,ingest_timestamp,source,status";

pub fn rates_row(currency: &str, rate: &str, status: &str) -> String {
    format!("{currency},{rate},USD,2024-05-01T13:00:00,2024-05-01T13:00:05,openexchangerates,{status}")
}

pub fn rates_csv(rows: &[String]) -> String {
    let mut csv = RATES_HEADER.to_string();
    for row in rows {
        csv.push('\n');
        csv.push_str(row);
    }
    csv.push('\n');
    csv
}

/// A fan-out envelope pointing at `key` in the raw bucket.
pub fn notification(message_id: &str, key: &str, source: Option<&str>) -> Delivery {
    let mut pointer = json!({ "bucket": RAW_BUCKET, "key": key });
    if let Some(source) = source {
        pointer["source"] = json!(source);
    }
    let body = json!({ "Message": pointer.to_string() }).to_string();
    Delivery::new(message_id, format!("rh-{message_id}"), body)
}

/// A consumer whose fallback schema is the FX rates schema.
pub fn consumer(
    queue: Arc<InMemoryQueue>,
    store: Arc<InMemoryStore>,
    sink: Arc<RecordingSink>,
) -> ConsumerLoop {
    let settings = ConsumerSettings {
        default_source: SourceKind::OpenExchangeRates,
        ..ConsumerSettings::default()
    };
    consumer_with(queue, store, sink, settings)
}

pub fn consumer_with(
    queue: Arc<InMemoryQueue>,
    store: Arc<InMemoryStore>,
    sink: Arc<RecordingSink>,
    settings: ConsumerSettings,
) -> ConsumerLoop {
    ConsumerLoop::new(
        queue,
        store,
        SinkRouter::all(Arc::new(SharedSink(sink))),
        settings,
    )
}

pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,mdp_consumer=debug")),
        )
        .with_test_writer()
        .try_init();
}
