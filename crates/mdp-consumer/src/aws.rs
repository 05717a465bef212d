//! Shared AWS SDK configuration for the S3 and SQS clients

use aws_config::{timeout::TimeoutConfig, BehaviorVersion, Region, SdkConfig};
use aws_credential_types::Credentials;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_REGION: &str = "us-east-1";

/// Upper bound for any single S3/SQS call, retries included.
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AwsConfig {
    /// Custom endpoint (MinIO, LocalStack); `None` for AWS
    pub endpoint: Option<String>,
    pub region: String,
    /// Explicit credentials; when unset the default provider chain is used
    pub access_key: Option<String>,
    #[serde(skip_serializing)]
    pub secret_key: Option<String>,
    pub operation_timeout_secs: u64,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: DEFAULT_REGION.to_string(),
            access_key: None,
            secret_key: None,
            operation_timeout_secs: DEFAULT_OPERATION_TIMEOUT_SECS,
        }
    }
}

impl AwsConfig {
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            endpoint: var("AWS_ENDPOINT_URL").or_else(|| var("S3_ENDPOINT")),
            region: var("AWS_REGION")
                .or_else(|| var("S3_REGION"))
                .unwrap_or_else(|| DEFAULT_REGION.to_string()),
            access_key: var("AWS_ACCESS_KEY_ID").or_else(|| var("S3_ACCESS_KEY")),
            secret_key: var("AWS_SECRET_ACCESS_KEY").or_else(|| var("S3_SECRET_KEY")),
            operation_timeout_secs: var("AWS_OPERATION_TIMEOUT_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_OPERATION_TIMEOUT_SECS),
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Load the SDK configuration shared by every client of this process.
    pub async fn load(&self) -> SdkConfig {
        debug!(
            region = %self.region,
            endpoint = ?self.endpoint,
            explicit_credentials = self.access_key.is_some(),
            "Loading AWS SDK configuration"
        );

        let timeouts = TimeoutConfig::builder()
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .operation_timeout(self.operation_timeout())
            .build();

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(self.region.clone()))
            .timeout_config(timeouts);

        if let (Some(access_key), Some(secret_key)) = (&self.access_key, &self.secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "mdp-consumer",
            ));
        }

        if let Some(endpoint) = &self.endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        loader.load().await
    }
}
