//! Ingestion worker: dequeue download jobs, fetch bytes, store them and record
//! the outcome on the resource.
//!
//! Per job the record is re-read from the store, so a job redelivered after a
//! resync always works from the current `fetch_url`. A fetch or write failure
//! is terminal for the attempt: the record goes to `failed` and the job is
//! acked. Only failures of the store or queue themselves release the job for
//! redelivery.
use crate::db;
use crate::error::{FetchError, WriteError};
use crate::fetch::Fetcher;
use crate::model::{Job, ResourceRecord};
use crate::queue::{backoff_delay, Delivery, JobQueue};
use anyhow::Result;
use sqlx::SqlitePool;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub mod naming;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub storage_dir: PathBuf,
    pub max_download_bytes: u64,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub max_backoff_secs: i64,
}

impl WorkerConfig {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            max_download_bytes: crate::fetch::DEFAULT_MAX_BYTES,
            concurrency: 4,
            poll_interval: Duration::from_millis(500),
            max_backoff_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Downloaded {
        resource_id: i64,
        path: PathBuf,
        byte_size: u64,
    },
    Failed {
        resource_id: i64,
        reason: String,
    },
    /// The record no longer exists. Not an error.
    Stale { resource_id: i64 },
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Write(#[from] WriteError),
}

pub struct IngestionWorker {
    pool: SqlitePool,
    queue: Arc<dyn JobQueue>,
    fetcher: Arc<dyn Fetcher>,
    config: WorkerConfig,
}

impl IngestionWorker {
    pub fn new(
        pool: SqlitePool,
        queue: Arc<dyn JobQueue>,
        fetcher: Arc<dyn Fetcher>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            pool,
            queue,
            fetcher,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Dequeue and process one job. Returns false when the queue was empty.
    pub async fn process_next(&self) -> Result<bool> {
        match self.queue.dequeue().await? {
            Some(delivery) => {
                self.process_delivery(delivery).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Handle one delivery and settle it with the queue. `None` means the job was
    /// released for redelivery.
    #[instrument(skip_all, fields(job_id = delivery.ack.job_id, resource_id = delivery.job.resource_id))]
    pub async fn process_delivery(&self, delivery: Delivery) -> Result<Option<JobOutcome>> {
        match self.handle(&delivery.job).await {
            Ok(outcome) => {
                self.queue.ack(&delivery.ack).await?;
                Ok(Some(outcome))
            }
            Err(err) => {
                let delay = backoff_delay(delivery.attempt - 1, self.config.max_backoff_secs);
                warn!(
                    ?err,
                    attempt = delivery.attempt,
                    delay_secs = delay.as_secs(),
                    "job handling failed; releasing for redelivery"
                );
                self.queue.nack(&delivery.ack, delay).await?;
                Ok(None)
            }
        }
    }

    /// Run the fetch-and-store algorithm for one job. Errors are store failures
    /// only; resource-level failures come back as `JobOutcome::Failed`.
    pub async fn handle(&self, job: &Job) -> Result<JobOutcome> {
        let resource_id = job.resource_id;
        let Some(record) = db::get_resource(&self.pool, resource_id).await? else {
            debug!(resource_id, "stale job reference; nothing to do");
            return Ok(JobOutcome::Stale { resource_id });
        };

        let dest = naming::destination(
            &self.config.storage_dir,
            record.id,
            &record.display_name,
            record.content_type.as_deref(),
        );

        match self.fetch_and_store(&record, &dest).await {
            Ok(byte_size) => {
                let path_str = dest.to_string_lossy();
                if !db::mark_resource_downloaded(&self.pool, resource_id, &path_str, byte_size as i64)
                    .await?
                {
                    // Deleted while downloading; do not leave an unreferenced file.
                    let _ = tokio::fs::remove_file(&dest).await;
                    return Ok(JobOutcome::Stale { resource_id });
                }
                info!(resource_id, path = %dest.display(), byte_size, "resource downloaded");
                Ok(JobOutcome::Downloaded {
                    resource_id,
                    path: dest,
                    byte_size,
                })
            }
            Err(err) => {
                warn!(resource_id, url = %record.fetch_url, error = %err, "resource download failed");
                if !db::mark_resource_failed(&self.pool, resource_id).await? {
                    return Ok(JobOutcome::Stale { resource_id });
                }
                Ok(JobOutcome::Failed {
                    resource_id,
                    reason: err.to_string(),
                })
            }
        }
    }

    async fn fetch_and_store(
        &self,
        record: &ResourceRecord,
        dest: &Path,
    ) -> Result<u64, AttemptError> {
        let bytes = self
            .fetcher
            .fetch(&record.fetch_url, self.config.max_download_bytes)
            .await?;
        write_atomic(dest, &bytes).await?;
        Ok(bytes.len() as u64)
    }

    /// Consume jobs until `shutdown` resolves, running up to
    /// `config.concurrency` jobs at once. In-flight jobs are drained before
    /// returning.
    pub async fn run<S>(self: Arc<Self>, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        let concurrency = self.config.concurrency.max(1);
        let permits = Arc::new(Semaphore::new(concurrency));
        tokio::pin!(shutdown);
        info!(concurrency, "ingestion worker started");

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = permits.clone().acquire_owned() => permit?,
            };

            let delivery = match self.queue.dequeue().await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => continue,
                    }
                }
                Err(err) => {
                    error!(?err, "dequeue failed");
                    drop(permit);
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    }
                }
            };

            let worker = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = worker.process_delivery(delivery).await {
                    error!(?err, "failed to settle job");
                }
                drop(permit);
            });
        }

        info!("shutdown requested; draining in-flight jobs");
        let _all = permits.acquire_many(concurrency as u32).await?;
        info!("ingestion worker stopped");
        Ok(())
    }
}

/// Write to a unique temp file next to `dest` and rename it into place, so
/// readers only ever see a complete file and concurrent writers of the same
/// destination resolve to the last rename.
pub async fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<(), WriteError> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| WriteError {
            path: dir.to_path_buf(),
            source,
        })?;

    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.{}.part", file_name, Uuid::new_v4()));

    if let Err(source) = tokio::fs::write(&tmp, bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(WriteError { path: tmp, source });
    }
    if let Err(source) = tokio::fs::rename(&tmp, dest).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(WriteError {
            path: dest.to_path_buf(),
            source,
        });
    }
    Ok(())
}
