//! Durable at-least-once job queue.
//!
//! A dequeued job is leased for `QueueConfig::lease`. Acking deletes it, nacking
//! returns it to the queue after a delay, and a lease that simply runs out
//! (worker crash, lost process) makes the job deliverable again.
use crate::db;
use crate::model::{Job, JobKind};
use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

pub const DEFAULT_QUEUE: &str = "resource-download";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub name: String,
    pub lease: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_QUEUE.to_string(),
            lease: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobHandle {
    pub id: i64,
    /// True when an identical waiting job already existed and was reused.
    pub deduplicated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckHandle {
    pub job_id: i64,
    pub lease_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub job: Job,
    pub attempt: i32,
    pub ack: AckHandle,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<JobHandle>;

    /// Next due job, or `None` when the queue is currently empty.
    async fn dequeue(&self) -> Result<Option<Delivery>>;

    /// Returns false if the lease had already been lost.
    async fn ack(&self, handle: &AckHandle) -> Result<bool>;

    async fn nack(&self, handle: &AckHandle, delay: Duration) -> Result<bool>;
}

/// Exponential backoff: 5s * 2^attempt, capped at `max_cap_secs` (3600s when
/// the cap is not positive).
pub fn backoff_delay(attempt: i32, max_cap_secs: i64) -> Duration {
    let secs = 5_i64 * (1_i64 << attempt.clamp(0, 10));
    let cap = if max_cap_secs <= 0 { 3600 } else { max_cap_secs };
    Duration::from_secs(secs.min(cap) as u64)
}

/// Queue backed by the `jobs` table of the pipeline database.
#[derive(Debug, Clone)]
pub struct SqliteJobQueue {
    pool: SqlitePool,
    config: QueueConfig,
    dedup: bool,
}

impl SqliteJobQueue {
    pub fn new(pool: SqlitePool, config: QueueConfig) -> Self {
        Self {
            pool,
            config,
            dedup: true,
        }
    }

    /// Disable reuse of waiting jobs so every enqueue inserts a row.
    pub fn without_dedup(mut self) -> Self {
        self.dedup = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub async fn len(&self) -> Result<i64> {
        db::count_jobs(&self.pool, &self.config.name).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    #[instrument(skip_all, fields(queue = %self.config.name, resource_id = job.resource_id))]
    async fn enqueue(&self, job: Job) -> Result<JobHandle> {
        let row = db::enqueue_job(
            &self.pool,
            &self.config.name,
            job.kind.as_str(),
            job.resource_id,
            self.dedup,
        )
        .await?;
        if row.deduplicated {
            debug!(job_id = row.id, "reused waiting job");
        }
        Ok(JobHandle {
            id: row.id,
            deduplicated: row.deduplicated,
        })
    }

    #[instrument(skip_all, fields(queue = %self.config.name))]
    async fn dequeue(&self) -> Result<Option<Delivery>> {
        let lease_secs = self.config.lease.as_secs() as i64;
        loop {
            let token = Uuid::new_v4().to_string();
            let Some(claimed) =
                db::claim_next_job(&self.pool, &self.config.name, lease_secs, &token).await?
            else {
                return Ok(None);
            };
            let Some(kind) = JobKind::parse_kind(&claimed.kind) else {
                warn!(job_id = claimed.id, kind = %claimed.kind, "dropping job of unknown kind");
                db::delete_job(&self.pool, claimed.id).await?;
                continue;
            };
            return Ok(Some(Delivery {
                job: Job {
                    kind,
                    resource_id: claimed.resource_id,
                },
                attempt: claimed.attempt,
                ack: AckHandle {
                    job_id: claimed.id,
                    lease_token: token,
                },
            }));
        }
    }

    async fn ack(&self, handle: &AckHandle) -> Result<bool> {
        let acked = db::delete_leased_job(&self.pool, handle.job_id, &handle.lease_token).await?;
        if !acked {
            warn!(job_id = handle.job_id, "ack after lease was lost");
        }
        Ok(acked)
    }

    async fn nack(&self, handle: &AckHandle, delay: Duration) -> Result<bool> {
        db::release_leased_job(
            &self.pool,
            handle.job_id,
            &handle.lease_token,
            delay.as_secs() as i64,
        )
        .await
    }
}
