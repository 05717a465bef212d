//! Consumer loop
//!
//! One invocation receives a bounded batch of deliveries and runs each one
//! through fetch, transform, load and acknowledge on its own. A delivery is
//! acknowledged only after its records are committed; any earlier failure
//! leaves it on the queue for redelivery. Nothing a single delivery does can
//! fail the invocation.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, field, info, info_span, warn, Instrument, Span};

use crate::error::{NotificationError, TransportError};
use crate::notification::Delivery;
use crate::queue::{NotificationQueue, MAX_BATCH_SIZE, MAX_WAIT_TIME_SECS};
use crate::schema::SourceKind;
use crate::sink::{write_records, Destination, LoadReport, SinkRouter};
use crate::storage::ArtifactStore;
use crate::transform::transform;

/// Status code of every invocation report.
pub const STATUS_OK: u16 = 200;

/// How far a notification got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    Pending,
    Fetched,
    Transformed,
    Loaded,
    Acknowledged,
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Schema used when a notification's source tag is not a known source
    pub default_source: SourceKind,
    pub max_messages: i32,
    pub wait_time: Duration,
    /// Deliveries processed at once within a batch
    pub concurrency: usize,
    /// Pause after an empty poll in [`ConsumerLoop::run_until`]
    pub idle_backoff: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            default_source: SourceKind::CoinMarketCap,
            max_messages: MAX_BATCH_SIZE,
            wait_time: Duration::from_secs(1),
            concurrency: 1,
            idle_backoff: Duration::from_secs(1),
        }
    }
}

/// Row accounting for one loaded notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSummary {
    pub source: String,
    pub rows_total: usize,
    pub rows_filtered: usize,
    /// Rows that failed to parse plus records the sink rejected
    pub rows_rejected: usize,
    pub records_loaded: usize,
}

#[derive(Debug)]
pub enum NotificationOutcome {
    Acknowledged(LoadSummary),
    /// Records were committed but the delivery will come back
    AckFailed(LoadSummary, TransportError),
    Failed(NotificationError),
}

impl NotificationOutcome {
    pub fn stage(&self) -> ProcessingStage {
        match self {
            NotificationOutcome::Acknowledged(_) => ProcessingStage::Acknowledged,
            NotificationOutcome::AckFailed(..) => ProcessingStage::Loaded,
            NotificationOutcome::Failed(e) => e.failed_at(),
        }
    }

    pub fn summary(&self) -> Option<&LoadSummary> {
        match self {
            NotificationOutcome::Acknowledged(summary)
            | NotificationOutcome::AckFailed(summary, _) => Some(summary),
            NotificationOutcome::Failed(_) => None,
        }
    }
}

/// Result of one invocation. Always carries status 200.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationReport {
    pub processed: usize,
    pub acknowledged: usize,
    pub failed: usize,
    pub ack_failures: usize,
    pub records_loaded: usize,
    pub rows_filtered: usize,
    pub rows_rejected: usize,
    pub status_code: u16,
}

impl Default for InvocationReport {
    fn default() -> Self {
        Self {
            processed: 0,
            acknowledged: 0,
            failed: 0,
            ack_failures: 0,
            records_loaded: 0,
            rows_filtered: 0,
            rows_rejected: 0,
            status_code: STATUS_OK,
        }
    }
}

impl InvocationReport {
    pub fn record(&mut self, outcome: &NotificationOutcome) {
        self.processed += 1;
        match outcome {
            NotificationOutcome::Acknowledged(_) => self.acknowledged += 1,
            NotificationOutcome::AckFailed(..) => self.ack_failures += 1,
            NotificationOutcome::Failed(_) => self.failed += 1,
        }
        if let Some(summary) = outcome.summary() {
            self.records_loaded += summary.records_loaded;
            self.rows_filtered += summary.rows_filtered;
            self.rows_rejected += summary.rows_rejected;
        }
    }

    /// Fold another invocation's counts into this one.
    pub fn merge(&mut self, other: &InvocationReport) {
        self.processed += other.processed;
        self.acknowledged += other.acknowledged;
        self.failed += other.failed;
        self.ack_failures += other.ack_failures;
        self.records_loaded += other.records_loaded;
        self.rows_filtered += other.rows_filtered;
        self.rows_rejected += other.rows_rejected;
    }
}

pub struct ConsumerLoop {
    queue: Arc<dyn NotificationQueue>,
    store: Arc<dyn ArtifactStore>,
    sinks: SinkRouter,
    settings: ConsumerSettings,
}

impl ConsumerLoop {
    pub fn new(
        queue: Arc<dyn NotificationQueue>,
        store: Arc<dyn ArtifactStore>,
        sinks: SinkRouter,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            queue,
            store,
            sinks,
            settings,
        }
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Drain one batch. Poll failures are logged and yield an empty report.
    pub async fn run_once(&self) -> InvocationReport {
        let mut report = InvocationReport::default();

        let max_messages = self.settings.max_messages.clamp(1, MAX_BATCH_SIZE);
        let wait = self
            .settings
            .wait_time
            .min(Duration::from_secs(MAX_WAIT_TIME_SECS));

        let deliveries = match self.queue.receive(max_messages, wait).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                error!(error = %e, "Failed to poll notification queue");
                return report;
            },
        };

        if deliveries.is_empty() {
            debug!("No notifications available");
            return report;
        }

        let outcomes: Vec<NotificationOutcome> = stream::iter(&deliveries)
            .map(|delivery| self.handle_delivery(delivery))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        for outcome in &outcomes {
            report.record(outcome);
        }

        info!(
            processed = report.processed,
            acknowledged = report.acknowledged,
            failed = report.failed,
            ack_failures = report.ack_failures,
            records_loaded = report.records_loaded,
            rows_filtered = report.rows_filtered,
            rows_rejected = report.rows_rejected,
            "Batch complete"
        );

        report
    }

    /// Process one delivery end to end and acknowledge it on success.
    pub async fn handle_delivery(&self, delivery: &Delivery) -> NotificationOutcome {
        let span = info_span!(
            "notification",
            message_id = %delivery.message_id,
            bucket = field::Empty,
            key = field::Empty,
            source = field::Empty,
        );

        async move {
            let summary = match self.load(delivery).await {
                Ok(summary) => summary,
                Err(e) => {
                    if e.is_retryable() {
                        warn!(error = %e, stage = ?e.failed_at(), "Notification failed, leaving it for redelivery");
                    } else {
                        error!(error = %e, stage = ?e.failed_at(), "Notification cannot be processed as sent, leaving it for redelivery");
                    }
                    return NotificationOutcome::Failed(e);
                },
            };

            match self.queue.acknowledge(delivery).await {
                Ok(()) => {
                    info!(
                        records_loaded = summary.records_loaded,
                        rows_filtered = summary.rows_filtered,
                        rows_rejected = summary.rows_rejected,
                        "Notification processed"
                    );
                    NotificationOutcome::Acknowledged(summary)
                },
                Err(e) => {
                    warn!(error = %e, "Records committed but acknowledgment failed");
                    NotificationOutcome::AckFailed(summary, e)
                },
            }
        }
        .instrument(span)
        .await
    }

    async fn load(&self, delivery: &Delivery) -> Result<LoadSummary, NotificationError> {
        let notification = delivery.decode()?;

        let span = Span::current();
        span.record("bucket", notification.location.bucket.as_str());
        span.record("key", notification.location.key.as_str());
        span.record("source", notification.source.as_str());

        let kind = self.schema_for(&notification.source);
        let schema = kind.schema();

        let payload = self.store.fetch(&notification.location).await?;

        let output = transform(schema, &notification.source, &payload, Utc::now())?;
        debug!(
            table = schema.table,
            rows = output.total_rows,
            records = output.records.len(),
            "Transformed artifact"
        );

        let load = if output.records.is_empty() {
            LoadReport::default()
        } else {
            let sink = self.sinks.sink_for(kind)?;
            let destination =
                Destination::new(schema, notification.source.clone(), notification.location);
            write_records(sink.as_ref(), &destination, &output.records).await?
        };

        Ok(LoadSummary {
            source: notification.source,
            rows_total: output.total_rows,
            rows_filtered: output.filtered,
            rows_rejected: output.rejected + load.rejected,
            records_loaded: load.inserted,
        })
    }

    fn schema_for(&self, source: &str) -> SourceKind {
        source.parse().unwrap_or_else(|_| {
            debug!(
                source,
                default = %self.settings.default_source,
                "Unrecognized source tag, using default schema"
            );
            self.settings.default_source
        })
    }

    /// Poll until `shutdown` resolves, pausing after empty polls.
    ///
    /// Deliveries in flight when shutdown arrives are dropped without an
    /// acknowledgment and come back after their visibility timeout.
    pub async fn run_until<F>(&self, shutdown: F) -> InvocationReport
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut total = InvocationReport::default();

        loop {
            let report = tokio::select! {
                _ = &mut shutdown => break,
                report = self.run_once() => report,
            };

            let idle = report.processed == 0;
            total.merge(&report);

            if idle {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(self.settings.idle_backoff) => {},
                }
            }
        }

        info!(
            processed = total.processed,
            acknowledged = total.acknowledged,
            "Consumer loop stopped"
        );

        total
    }
}
