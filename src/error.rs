//! Error taxonomy for the ingestion pipeline.
use std::path::PathBuf;
use thiserror::Error;

/// Raised to the caller of a sync. Only a total failure to enumerate
/// descriptors escalates this far.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("descriptor source unavailable: {0:#}")]
    SourceUnavailable(#[source] anyhow::Error),
}

/// Failure local to one descriptor. Logged and counted, never raised.
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("malformed descriptor: {0}")]
    Malformed(&'static str),
    #[error("upsert failed for {external_id}: {source:#}")]
    Upsert {
        external_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("enqueue failed for resource {resource_id}: {source:#}")]
    Enqueue {
        resource_id: i64,
        #[source]
        source: anyhow::Error,
    },
}

/// Network-side failure of a download attempt.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid fetch url {0}")]
    InvalidUrl(String),
    #[error("request timed out")]
    Timeout,
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("response exceeds {limit} byte cap")]
    TooLarge { limit: u64 },
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Network(err)
        }
    }
}

/// Filesystem-side failure of a download attempt.
#[derive(Debug, Error)]
#[error("failed to write {path}: {source}")]
pub struct WriteError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}
