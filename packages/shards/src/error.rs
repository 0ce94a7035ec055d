//! Error types for shard loading.

use thiserror::Error;

/// Errors that abort a single load, prefetch or cache operation.
#[derive(Debug, Error)]
pub enum ShardError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("fetching {url} failed with status {status}")]
    Status { url: String, status: u16 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("load aborted")]
    Aborted,

    #[error("download task failed: {0}")]
    Task(String),

    #[error("bridge error: {0}")]
    Bridge(#[from] sandlink_bridge::Error),
}

pub type Result<T> = std::result::Result<T, ShardError>;
