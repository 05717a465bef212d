//! Notification queue access
//!
//! Delivery is at-least-once: a delivery that is not acknowledged before its
//! visibility timeout comes back with a new receipt handle.

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_sqs::{error::DisplayErrorContext, Client};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::error::TransportError;
use crate::notification::{Delivery, SOURCE_ATTRIBUTE};

/// Largest batch a single receive may return.
pub const MAX_BATCH_SIZE: i32 = 10;

/// Longest long-poll wait the transport supports.
pub const MAX_WAIT_TIME_SECS: u64 = 20;

#[async_trait]
pub trait NotificationQueue: Send + Sync {
    /// Receive up to `max_messages` deliveries, waiting at most `wait`.
    async fn receive(
        &self,
        max_messages: i32,
        wait: Duration,
    ) -> Result<Vec<Delivery>, TransportError>;

    /// Remove a delivery so it is not redelivered.
    async fn acknowledge(&self, delivery: &Delivery) -> Result<(), TransportError>;
}

pub struct SqsQueue {
    client: Client,
    queue_url: String,
    visibility_timeout: Option<Duration>,
}

impl SqsQueue {
    pub fn new(
        sdk_config: &SdkConfig,
        queue_url: impl Into<String>,
        visibility_timeout: Option<Duration>,
    ) -> Self {
        Self {
            client: Client::new(sdk_config),
            queue_url: queue_url.into(),
            visibility_timeout,
        }
    }
}

#[async_trait]
impl NotificationQueue for SqsQueue {
    #[instrument(skip(self), fields(queue = %self.queue_url))]
    async fn receive(
        &self,
        max_messages: i32,
        wait: Duration,
    ) -> Result<Vec<Delivery>, TransportError> {
        let wait_secs = wait.as_secs().min(MAX_WAIT_TIME_SECS) as i32;

        let mut request = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages.clamp(1, MAX_BATCH_SIZE))
            .wait_time_seconds(wait_secs)
            .message_attribute_names(SOURCE_ATTRIBUTE);

        if let Some(timeout) = self.visibility_timeout {
            request = request.visibility_timeout(timeout.as_secs() as i32);
        }

        let output = request
            .send()
            .await
            .map_err(|e| TransportError::Receive(DisplayErrorContext(&e).to_string()))?;

        let deliveries: Vec<Delivery> = output
            .messages()
            .iter()
            .filter_map(|message| {
                let receipt_handle = message.receipt_handle()?.to_string();
                let attributes: HashMap<String, String> = message
                    .message_attributes()
                    .map(|attrs| {
                        attrs
                            .iter()
                            .filter_map(|(name, value)| {
                                value.string_value().map(|v| (name.clone(), v.to_string()))
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                Some(Delivery {
                    message_id: message.message_id().unwrap_or("unknown").to_string(),
                    receipt_handle,
                    body: message.body().unwrap_or_default().to_string(),
                    attributes,
                })
            })
            .collect();

        debug!(count = deliveries.len(), "Received deliveries");

        Ok(deliveries)
    }

    #[instrument(skip(self, delivery), fields(message_id = %delivery.message_id))]
    async fn acknowledge(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(&delivery.receipt_handle)
            .send()
            .await
            .map_err(|e| TransportError::Acknowledge {
                message_id: delivery.message_id.clone(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        debug!("Deleted delivery");

        Ok(())
    }
}
