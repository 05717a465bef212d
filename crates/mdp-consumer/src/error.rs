//! Error taxonomy for the consumer pipeline
//!
//! Errors are split by blast radius:
//!
//! - row-level ([`ParseError::is_row_level`], [`SinkRowError`]) drop one row
//! - notification-level ([`NotificationError`]) leave one delivery un-acknowledged
//! - transport-level ([`TransportError`]) are logged by the loop
//!
//! Nothing here ever fails a whole invocation.

use thiserror::Error;

use crate::consumer::ProcessingStage;

/// The staged artifact could not be located or read.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("invalid notification envelope: {0}")]
    InvalidEnvelope(String),

    #[error("artifact s3://{bucket}/{key} does not exist")]
    NotFound { bucket: String, key: String },

    #[error("failed to fetch s3://{bucket}/{key}: {message}")]
    Transport {
        bucket: String,
        key: String,
        message: String,
    },

    #[error("failed to read body of s3://{bucket}/{key}: {message}")]
    Body {
        bucket: String,
        key: String,
        message: String,
    },
}

/// The artifact payload (or one of its rows) did not match the source schema.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("malformed CSV payload: {0}")]
    Csv(#[from] csv::Error),

    #[error("artifact header is missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    #[error("row {row}: required field '{column}' is empty")]
    MissingField { row: usize, column: String },

    #[error("row {row}: field '{column}' value {value:?} is not a valid {expected}")]
    InvalidField {
        row: usize,
        column: String,
        value: String,
        expected: &'static str,
    },
}

impl ParseError {
    /// Row-level errors drop a single row; the rest of the artifact still loads.
    pub fn is_row_level(&self) -> bool {
        matches!(
            self,
            ParseError::MissingField { .. } | ParseError::InvalidField { .. }
        )
    }
}

/// The sink could not be opened or committed; the whole notification is abandoned.
#[derive(Error, Debug)]
pub enum SinkConnectionError {
    #[error("no sink configured for source '{0}'")]
    Unrouted(String),

    #[error("failed to open session on {destination}: {message}")]
    Connect {
        destination: String,
        message: String,
    },

    #[error("failed to commit to {destination}: {message}")]
    Commit {
        destination: String,
        message: String,
    },
}

/// A single record was rejected by the sink.
#[derive(Error, Debug)]
#[error("{destination} rejected record: {message}")]
pub struct SinkRowError {
    pub destination: String,
    pub message: String,
}

/// Polling or acknowledging against the notification transport failed.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to receive notifications: {0}")]
    Receive(String),

    #[error("failed to acknowledge message {message_id}: {message}")]
    Acknowledge { message_id: String, message: String },
}

/// Why one notification was left un-acknowledged.
#[derive(Error, Debug)]
pub enum NotificationError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Sink(#[from] SinkConnectionError),
}

impl NotificationError {
    /// Last stage the notification reached before failing.
    pub fn failed_at(&self) -> ProcessingStage {
        match self {
            NotificationError::Fetch(_) => ProcessingStage::Pending,
            NotificationError::Parse(_) => ProcessingStage::Fetched,
            NotificationError::Sink(_) => ProcessingStage::Transformed,
        }
    }

    /// Whether a redelivery has a chance of succeeding without a producer fix.
    ///
    /// Malformed envelopes and schema drift fail identically on every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            NotificationError::Fetch(FetchError::InvalidEnvelope(_)) => false,
            NotificationError::Fetch(_) => true,
            NotificationError::Parse(_) => false,
            NotificationError::Sink(SinkConnectionError::Unrouted(_)) => false,
            NotificationError::Sink(_) => true,
        }
    }
}
