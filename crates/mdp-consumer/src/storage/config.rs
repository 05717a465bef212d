use serde::{Deserialize, Serialize};

pub const DEFAULT_DEST_PREFIX: &str = "processed/";

/// Object store settings beyond the shared AWS configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    /// Path-style addressing, required by MinIO
    pub path_style: bool,
    /// Bucket receiving processed artifacts (object store sink)
    pub destination_bucket: Option<String>,
    /// Key prefix for processed artifacts
    pub destination_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path_style: false,
            destination_bucket: None,
            destination_prefix: DEFAULT_DEST_PREFIX.to_string(),
        }
    }
}

impl StorageConfig {
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut prefix = var("MDP_DEST_PREFIX").unwrap_or_else(|| DEFAULT_DEST_PREFIX.to_string());
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }

        Self {
            path_style: var("S3_PATH_STYLE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
            destination_bucket: var("MDP_DEST_BUCKET").filter(|b| !b.trim().is_empty()),
            destination_prefix: prefix,
        }
    }
}
