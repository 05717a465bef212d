//! Configuration management

use mdp_common::{MdpError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::aws::AwsConfig;
use crate::consumer::ConsumerSettings;
use crate::queue::{MAX_BATCH_SIZE, MAX_WAIT_TIME_SECS};
use crate::schema::SourceKind;
use crate::sink::SinkKind;
use crate::storage::StorageConfig;

// ============================================================================
// Queue Configuration Constants
// ============================================================================

/// Default number of deliveries requested per poll.
pub const DEFAULT_MAX_MESSAGES: i32 = 10;

/// Default long-poll wait in seconds.
pub const DEFAULT_WAIT_TIME_SECS: u64 = 1;

/// Default number of deliveries processed at once within a batch.
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Default pause after an empty poll in continuous mode.
pub const DEFAULT_IDLE_BACKOFF_MS: u64 = 1000;

// ============================================================================
// Database Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/mdp";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

/// Default pool acquire timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default per-statement timeout in seconds.
pub const DEFAULT_DATABASE_STATEMENT_TIMEOUT_SECS: u64 = 30;

/// Consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub queue: QueueConfig,
    pub database: DatabaseConfig,
    pub aws: AwsConfig,
    pub storage: StorageConfig,
    /// Sink receiving each source's records
    pub sinks: BTreeMap<SourceKind, SinkKind>,
}

/// Queue polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub queue_url: String,
    /// Schema used when a notification's source tag is not a known source
    pub default_source: SourceKind,
    pub max_messages: i32,
    pub wait_time_secs: u64,
    pub visibility_timeout_secs: Option<u64>,
    pub concurrency: usize,
    pub idle_backoff_ms: u64,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
    pub statement_timeout_secs: u64,
}

fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    var(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

impl ConsumerConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_vars(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Build configuration from an arbitrary variable lookup.
    ///
    /// Malformed numbers fall back to their defaults; malformed source or
    /// sink names are errors.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let default_source = match var("MDP_SOURCE") {
            Some(source) => source.parse()?,
            None => SourceKind::CoinMarketCap,
        };

        let mut sinks = BTreeMap::new();
        for source in SourceKind::ALL {
            let key = format!("SINK_{}", source.as_str().to_uppercase());
            let kind = match var(key.as_str()) {
                Some(kind) => kind.parse()?,
                None => SinkKind::default_for(source),
            };
            sinks.insert(source, kind);
        }

        Ok(Self {
            queue: QueueConfig {
                queue_url: var("MDP_QUEUE_URL").unwrap_or_default(),
                default_source,
                max_messages: parsed(&var, "MDP_MAX_MESSAGES", DEFAULT_MAX_MESSAGES),
                wait_time_secs: parsed(&var, "MDP_WAIT_TIME_SECS", DEFAULT_WAIT_TIME_SECS),
                visibility_timeout_secs: var("MDP_VISIBILITY_TIMEOUT_SECS")
                    .and_then(|s| s.trim().parse().ok()),
                concurrency: parsed(&var, "MDP_CONCURRENCY", DEFAULT_CONCURRENCY),
                idle_backoff_ms: parsed(&var, "MDP_IDLE_BACKOFF_MS", DEFAULT_IDLE_BACKOFF_MS),
            },
            database: DatabaseConfig {
                url: var("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
                max_connections: parsed(
                    &var,
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                connect_timeout_secs: parsed(
                    &var,
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                statement_timeout_secs: parsed(
                    &var,
                    "DATABASE_STATEMENT_TIMEOUT",
                    DEFAULT_DATABASE_STATEMENT_TIMEOUT_SECS,
                ),
            },
            aws: AwsConfig::from_vars(&var),
            storage: StorageConfig::from_vars(&var),
            sinks,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.queue.queue_url.trim().is_empty() {
            return Err(MdpError::config("MDP_QUEUE_URL must be set"));
        }

        if !(1..=MAX_BATCH_SIZE).contains(&self.queue.max_messages) {
            return Err(MdpError::config(format!(
                "MDP_MAX_MESSAGES must be between 1 and {MAX_BATCH_SIZE}, got {}",
                self.queue.max_messages
            )));
        }

        if self.queue.wait_time_secs > MAX_WAIT_TIME_SECS {
            return Err(MdpError::config(format!(
                "MDP_WAIT_TIME_SECS cannot exceed {MAX_WAIT_TIME_SECS}, got {}",
                self.queue.wait_time_secs
            )));
        }

        if self.queue.concurrency == 0 {
            return Err(MdpError::config("MDP_CONCURRENCY must be greater than 0"));
        }

        if self.uses(SinkKind::Postgres) {
            if self.database.url.is_empty() {
                return Err(MdpError::config("Database URL cannot be empty"));
            }
            if self.database.max_connections == 0 {
                return Err(MdpError::config("Database max_connections must be greater than 0"));
            }
            if self.database.connect_timeout_secs == 0 {
                return Err(MdpError::config("DATABASE_CONNECT_TIMEOUT must be greater than 0"));
            }
            // Postgres reads a zero statement_timeout as no limit.
            if self.database.statement_timeout_secs == 0 {
                return Err(MdpError::config("DATABASE_STATEMENT_TIMEOUT must be greater than 0"));
            }
        }

        if self.aws.operation_timeout_secs <= self.queue.wait_time_secs {
            return Err(MdpError::config(format!(
                "AWS_OPERATION_TIMEOUT_SECS must exceed MDP_WAIT_TIME_SECS ({}), got {}",
                self.queue.wait_time_secs, self.aws.operation_timeout_secs
            )));
        }

        if self.uses(SinkKind::ObjectStore) && self.storage.destination_bucket.is_none() {
            return Err(MdpError::config(
                "MDP_DEST_BUCKET must be set when a source uses the object_store sink",
            ));
        }

        Ok(())
    }

    /// Whether any source is routed to `kind`.
    pub fn uses(&self, kind: SinkKind) -> bool {
        self.sinks.values().any(|k| *k == kind)
    }

    pub fn visibility_timeout(&self) -> Option<Duration> {
        self.queue.visibility_timeout_secs.map(Duration::from_secs)
    }

    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            default_source: self.queue.default_source,
            max_messages: self.queue.max_messages,
            wait_time: Duration::from_secs(self.queue.wait_time_secs),
            concurrency: self.queue.concurrency,
            idle_backoff: Duration::from_millis(self.queue.idle_backoff_ms),
        }
    }
}
