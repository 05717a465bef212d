//! MDP Consumer Library
//!
//! Queue-driven loader for staged market data artifacts. Each notification
//! points at one immutable CSV artifact in the object store; the consumer
//! fetches it, keeps the rows whose `status` is `success`, maps them onto the
//! source's table and writes them to a sink. Delivery is at-least-once, so a
//! notification is acknowledged only after its records are committed.
//!
//! # Supported Sources
//!
//! - **coinmarketcap**: crypto prices
//! - **openexchangerates**: FX rates
//! - **yahoofinance**: minute-level equity quotes
//!
//! # Example
//!
//! ```no_run
//! use mdp_consumer::{ConsumerConfig, ConsumerLoop, S3ArtifactStore, SinkRouter, SqsQueue};
//! use mdp_consumer::sink::PostgresSink;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConsumerConfig::load()?;
//!     let sdk_config = config.aws.load().await;
//!
//!     let queue = Arc::new(SqsQueue::new(&sdk_config, &config.queue.queue_url, None));
//!     let store = Arc::new(S3ArtifactStore::new(&sdk_config, &config.storage));
//!     let sinks = SinkRouter::all(Arc::new(PostgresSink::connect_lazy(&config.database)?));
//!
//!     let report = ConsumerLoop::new(queue, store, sinks, config.consumer_settings())
//!         .run_once()
//!         .await;
//!     println!("{}", serde_json::to_string(&report)?);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod aws;
pub mod config;
pub mod consumer;
pub mod error;
pub mod notification;
pub mod queue;
pub mod schema;
pub mod sink;
pub mod storage;
pub mod transform;

pub use config::ConsumerConfig;
pub use consumer::{ConsumerLoop, ConsumerSettings, InvocationReport, NotificationOutcome};
pub use notification::{ArtifactLocation, Delivery, Notification};
pub use queue::{NotificationQueue, SqsQueue};
pub use schema::SourceKind;
pub use sink::{RecordSink, SinkRouter};
pub use storage::{ArtifactStore, S3ArtifactStore};
