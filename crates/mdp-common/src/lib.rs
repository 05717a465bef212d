//! MDP Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared plumbing for the market data pipeline workspace.
//!
//! - **Error Handling**: the workspace-wide [`MdpError`] and [`Result`] alias
//! - **Logging**: environment-driven `tracing` subscriber setup
//!
//! # Example
//!
//! ```no_run
//! use mdp_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!("consumer starting");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

pub use error::{MdpError, Result};
