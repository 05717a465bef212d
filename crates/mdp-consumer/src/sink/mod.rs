//! Sink writer
//!
//! A sink is opened once per notification. Records are inserted one at a
//! time; a rejected record is logged and skipped, and the session is then
//! committed once. Failing to open or commit abandons the notification.
//!
//! Sessions release their resources on drop, so every exit path out of
//! [`write_records`] (including an early return on a commit error) hands the
//! connection back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{SinkConnectionError, SinkRowError};
use crate::notification::ArtifactLocation;
use crate::schema::{SourceKind, SourceSchema};
use crate::transform::TransformedRecord;
use mdp_common::MdpError;

pub mod object_store;
pub mod postgres;

pub use object_store::ObjectStoreSink;
pub use postgres::PostgresSink;

/// What a session writes to: the schema's table plus the artifact it came from.
#[derive(Debug, Clone)]
pub struct Destination {
    pub schema: &'static SourceSchema,
    pub source_tag: String,
    pub artifact: ArtifactLocation,
}

impl Destination {
    pub fn new(
        schema: &'static SourceSchema,
        source_tag: impl Into<String>,
        artifact: ArtifactLocation,
    ) -> Self {
        Self {
            schema,
            source_tag: source_tag.into(),
            artifact,
        }
    }
}

#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Short label used in logs and errors, e.g. `postgres`.
    fn name(&self) -> &'static str;

    async fn open(
        &self,
        destination: &Destination,
    ) -> Result<Box<dyn SinkSession>, SinkConnectionError>;
}

#[async_trait]
pub trait SinkSession: Send {
    /// Insert one record. A failure here affects only this record.
    async fn insert(&mut self, record: &TransformedRecord) -> Result<(), SinkRowError>;

    /// Make all accepted inserts durable.
    async fn commit(self: Box<Self>) -> Result<(), SinkConnectionError>;
}

/// Outcome of loading one notification's records.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    pub inserted: usize,
    pub rejected: usize,
}

/// Write records through one session, tolerating per-record rejection.
///
/// An empty record set does not open a session at all.
pub async fn write_records(
    sink: &dyn RecordSink,
    destination: &Destination,
    records: &[TransformedRecord],
) -> Result<LoadReport, SinkConnectionError> {
    let mut report = LoadReport::default();
    if records.is_empty() {
        debug!(table = destination.schema.table, "No records to load");
        return Ok(report);
    }

    let mut session = sink.open(destination).await?;

    for record in records {
        match session.insert(record).await {
            Ok(()) => report.inserted += 1,
            Err(e) => {
                report.rejected += 1;
                warn!(
                    sink = sink.name(),
                    table = destination.schema.table,
                    error = %e,
                    record = ?record.columns(),
                    "Skipping rejected record"
                );
            },
        }
    }

    session.commit().await?;

    debug!(
        sink = sink.name(),
        table = destination.schema.table,
        inserted = report.inserted,
        rejected = report.rejected,
        "Committed records"
    );

    Ok(report)
}

/// Sink implementations selectable per source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Postgres,
    ObjectStore,
}

impl SinkKind {
    /// Crypto prices were historically re-exported as processed CSV; the
    /// relational sources load into Postgres.
    pub fn default_for(source: SourceKind) -> Self {
        match source {
            SourceKind::CoinMarketCap => SinkKind::ObjectStore,
            SourceKind::OpenExchangeRates | SourceKind::YahooFinance => SinkKind::Postgres,
        }
    }
}

impl FromStr for SinkKind {
    type Err = MdpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" | "sql" => Ok(SinkKind::Postgres),
            "object_store" | "object-store" | "s3" => Ok(SinkKind::ObjectStore),
            other => Err(MdpError::config(format!("unknown sink kind '{other}'"))),
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkKind::Postgres => f.write_str("postgres"),
            SinkKind::ObjectStore => f.write_str("object_store"),
        }
    }
}

/// Routes each source to the sink that receives its records.
#[derive(Clone, Default)]
pub struct SinkRouter {
    routes: HashMap<SourceKind, Arc<dyn RecordSink>>,
}

impl SinkRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, source: SourceKind, sink: Arc<dyn RecordSink>) -> Self {
        self.routes.insert(source, sink);
        self
    }

    /// Route every known source to the same sink.
    pub fn all(sink: Arc<dyn RecordSink>) -> Self {
        SourceKind::ALL
            .into_iter()
            .fold(Self::new(), |router, source| router.route(source, sink.clone()))
    }

    pub fn sink_for(&self, source: SourceKind) -> Result<Arc<dyn RecordSink>, SinkConnectionError> {
        self.routes
            .get(&source)
            .cloned()
            .ok_or_else(|| SinkConnectionError::Unrouted(source.to_string()))
    }
}
