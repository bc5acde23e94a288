//! Byte fetcher used by the ingestion worker.
use crate::error::FetchError;
use async_trait::async_trait;
use reqwest::{Client, Url};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// 100 MiB.
pub const DEFAULT_MAX_BYTES: u64 = 100 * 1024 * 1024;

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Full body of `url`, or an error if it is longer than `max_bytes`.
    async fn fetch(&self, url: &str, max_bytes: u64) -> Result<Vec<u8>, FetchError>;
}

#[derive(Clone)]
pub struct HttpFetcher {
    http: Client,
}

impl fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpFetcher").finish_non_exhaustive()
    }
}

impl HttpFetcher {
    /// `timeout` bounds the whole request, body included.
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent("lecture-ingest/0.1")
            .timeout(timeout)
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, max_bytes: u64) -> Result<Vec<u8>, FetchError> {
        let url = Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
        let mut res = self.http.get(url).send().await?;

        let status = res.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        if let Some(declared) = res.content_length() {
            if declared > max_bytes {
                warn!(declared, max_bytes, "declared length over cap");
                return Err(FetchError::TooLarge { limit: max_bytes });
            }
        }

        let capacity = res.content_length().unwrap_or(0).min(max_bytes) as usize;
        let mut body = Vec::with_capacity(capacity);
        while let Some(chunk) = res.chunk().await? {
            if (body.len() + chunk.len()) as u64 > max_bytes {
                warn!(max_bytes, "streamed body over cap");
                return Err(FetchError::TooLarge { limit: max_bytes });
            }
            body.extend_from_slice(&chunk);
        }
        debug!(bytes = body.len(), "fetched body");
        Ok(body)
    }
}
