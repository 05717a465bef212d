//! Error types shared across MDP crates

use thiserror::Error;

/// Result type alias for MDP operations
pub type Result<T> = std::result::Result<T, MdpError>;

/// Workspace-level error for plumbing that sits outside the per-notification
/// taxonomy (configuration, startup, serialization of reports).
#[derive(Error, Debug)]
pub enum MdpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown source: {0}")]
    UnknownSource(String),
}

impl MdpError {
    pub fn config(msg: impl Into<String>) -> Self {
        MdpError::Config(msg.into())
    }
}
