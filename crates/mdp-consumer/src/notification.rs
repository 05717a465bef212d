//! Delivery envelopes and artifact pointers
//!
//! A delivery body is the fan-out envelope wrapping a JSON pointer:
//!
//! ```json
//! { "Message": "{\"bucket\": \"raw-data\", \"key\": \"raw/yahoofinance/2024/05/01/1330.csv\"}",
//!   "MessageAttributes": { "source": { "Type": "String", "Value": "yahoofinance" } } }
//! ```
//!
//! With raw message delivery enabled on the subscription the body is the
//! pointer itself, so both shapes are accepted.

use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;

use crate::error::FetchError;

/// Source tag used when neither the message nor its attributes carry one.
pub const UNKNOWN_SOURCE: &str = "unknown";

/// Attribute name carrying the source tag.
pub const SOURCE_ATTRIBUTE: &str = "source";

/// Bucket/key of an immutable staged artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactLocation {
    pub bucket: String,
    pub key: String,
}

impl ArtifactLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ArtifactLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// One delivery of a notification, as handed over by the queue.
///
/// `receipt_handle` is only valid for this delivery; a redelivery after the
/// visibility timeout comes with a new one.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    /// Transport-level string attributes
    pub attributes: HashMap<String, String>,
}

impl Delivery {
    pub fn new(
        message_id: impl Into<String>,
        receipt_handle: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            receipt_handle: receipt_handle.into(),
            body: body.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Decode the envelope into an artifact location and resolved source tag.
    pub fn decode(&self) -> Result<Notification, FetchError> {
        let body: serde_json::Value = serde_json::from_str(&self.body)
            .map_err(|e| FetchError::InvalidEnvelope(format!("body is not JSON: {e}")))?;

        let (pointer, envelope_attribute) = match body.get("Message") {
            Some(serde_json::Value::String(inner)) => {
                let pointer: ArtifactPointer = serde_json::from_str(inner).map_err(|e| {
                    FetchError::InvalidEnvelope(format!("Message is not an artifact pointer: {e}"))
                })?;
                let envelope: Envelope = serde_json::from_value(body.clone())
                    .map_err(|e| FetchError::InvalidEnvelope(e.to_string()))?;
                (pointer, envelope.source_attribute())
            },
            Some(_) => {
                return Err(FetchError::InvalidEnvelope(
                    "Message must be a JSON-encoded string".to_string(),
                ))
            },
            None => {
                let pointer: ArtifactPointer = serde_json::from_value(body).map_err(|e| {
                    FetchError::InvalidEnvelope(format!("body is not an artifact pointer: {e}"))
                })?;
                (pointer, None)
            },
        };

        if pointer.bucket.trim().is_empty() || pointer.key.trim().is_empty() {
            return Err(FetchError::InvalidEnvelope(
                "artifact pointer has an empty bucket or key".to_string(),
            ));
        }

        let attribute = self
            .attributes
            .get(SOURCE_ATTRIBUTE)
            .map(String::as_str)
            .or(envelope_attribute.as_deref());

        Ok(Notification {
            location: ArtifactLocation::new(pointer.bucket, pointer.key),
            source: resolve_source(pointer.source.as_deref(), attribute),
        })
    }
}

/// A decoded notification: which artifact to load and under which source tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub location: ArtifactLocation,
    pub source: String,
}

/// The embedded tag wins; the attribute only fills in when it is absent.
pub fn resolve_source(embedded: Option<&str>, attribute: Option<&str>) -> String {
    [embedded, attribute]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .unwrap_or(UNKNOWN_SOURCE)
        .to_string()
}

#[derive(Debug, Deserialize)]
struct ArtifactPointer {
    bucket: String,
    key: String,
    #[serde(default)]
    source: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "MessageAttributes", default)]
    message_attributes: HashMap<String, EnvelopeAttribute>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeAttribute {
    #[serde(rename = "Value", alias = "StringValue", default)]
    value: Option<String>,
}

impl Envelope {
    fn source_attribute(self) -> Option<String> {
        self.message_attributes
            .into_iter()
            .find(|(name, _)| name == SOURCE_ATTRIBUTE)
            .and_then(|(_, attr)| attr.value)
    }
}
