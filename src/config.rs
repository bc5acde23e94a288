//! Configuration loader and validator for the resource-ingestion pipeline.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::queue::QueueConfig;
use crate::worker::WorkerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub lms: Lms,
    pub ingest: Ingest,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
}

/// Remote LMS settings used to list course files.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lms {
    pub base_url: String,
    pub token: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl std::fmt::Debug for Lms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lms")
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .field("page_size", &self.page_size)
            .finish()
    }
}

/// Download pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ingest {
    pub storage_dir: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default = "default_max_download_bytes")]
    pub max_download_bytes: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
}

fn default_page_size() -> u32 {
    100
}

fn default_queue() -> String {
    crate::queue::DEFAULT_QUEUE.to_string()
}

fn default_max_download_bytes() -> u64 {
    crate::fetch::DEFAULT_MAX_BYTES
}

fn default_fetch_timeout_secs() -> u64 {
    60
}

fn default_concurrency() -> usize {
    4
}

fn default_lease_seconds() -> u64 {
    300
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` and
    /// `ingest.storage_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if !self.app.data_dir.trim().is_empty() {
            fs::create_dir_all(&self.app.data_dir)?;
        }
        if !self.ingest.storage_dir.trim().is_empty() {
            fs::create_dir_all(&self.ingest.storage_dir)?;
        }
        Ok(())
    }

    /// Default SQLite URL inside the data directory.
    pub fn database_url(&self) -> String {
        format!("sqlite://{}/ingest.db", self.app.data_dir.trim_end_matches('/'))
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            name: self.ingest.queue.clone(),
            lease: Duration::from_secs(self.ingest.lease_seconds),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            storage_dir: PathBuf::from(&self.ingest.storage_dir),
            max_download_bytes: self.ingest.max_download_bytes,
            concurrency: self.ingest.concurrency,
            poll_interval: Duration::from_millis(self.app.poll_interval_ms),
            max_backoff_secs: self.app.max_backoff_seconds as i64,
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.ingest.fetch_timeout_secs)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }

    if cfg.lms.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("lms.base_url must be non-empty"));
    }
    if reqwest::Url::parse(&cfg.lms.base_url).is_err() {
        return Err(ConfigError::Invalid("lms.base_url must be an absolute URL"));
    }
    if cfg.lms.token.trim().is_empty() {
        return Err(ConfigError::Invalid("lms.token must be non-empty"));
    }
    if cfg.lms.page_size == 0 {
        return Err(ConfigError::Invalid("lms.page_size must be > 0"));
    }

    let ing = &cfg.ingest;
    if ing.storage_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("ingest.storage_dir must be non-empty"));
    }
    if ing.queue.trim().is_empty() {
        return Err(ConfigError::Invalid("ingest.queue must be non-empty"));
    }
    if ing.max_download_bytes == 0 {
        return Err(ConfigError::Invalid("ingest.max_download_bytes must be > 0"));
    }
    if ing.fetch_timeout_secs == 0 {
        return Err(ConfigError::Invalid("ingest.fetch_timeout_secs must be > 0"));
    }
    if ing.concurrency == 0 {
        return Err(ConfigError::Invalid("ingest.concurrency must be > 0"));
    }
    if ing.lease_seconds == 0 {
        return Err(ConfigError::Invalid("ingest.lease_seconds must be > 0"));
    }
    if ing.lease_seconds <= ing.fetch_timeout_secs {
        return Err(ConfigError::Invalid(
            "ingest.lease_seconds must exceed ingest.fetch_timeout_secs",
        ));
    }

    Ok(())
}

/// Returns the example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  max_backoff_seconds: 60

lms:
  base_url: "https://lms.example.edu/"
  token: "YOUR_LMS_API_TOKEN"
  page_size: 100

ingest:
  storage_dir: "./data/files"
  queue: "resource-download"
  max_download_bytes: 104857600
  fetch_timeout_secs: 60
  concurrency: 4
  lease_seconds: 300
"#
}
