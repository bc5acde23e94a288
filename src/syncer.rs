//! Metadata synchronizer: reconcile a course's remote file listing with the
//! local resource records and queue one download per resource.
use crate::db::{self, StatusCounts, UpsertOutcome};
use crate::error::{DescriptorError, SyncError};
use crate::model::{Credential, Job, ResourceDescriptor};
use crate::queue::{JobHandle, JobQueue};
use crate::source::{RawDescriptor, ResourceSource};
use anyhow::{anyhow, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// One descriptor that could not be processed.
#[derive(Debug)]
pub struct DescriptorFailure {
    /// Known only when the descriptor got past validation.
    pub external_id: Option<String>,
    pub error: DescriptorError,
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub listed: usize,
    pub created: usize,
    pub refreshed: usize,
    pub enqueued: usize,
    /// Enqueues that reused a job already waiting for the same resource.
    pub deduplicated: usize,
    pub failures: Vec<DescriptorFailure>,
}

impl SyncReport {
    pub fn succeeded(&self) -> usize {
        self.created + self.refreshed
    }
}

pub struct MetadataSyncer {
    pool: SqlitePool,
    source: Arc<dyn ResourceSource>,
    queue: Arc<dyn JobQueue>,
}

impl MetadataSyncer {
    pub fn new(
        pool: SqlitePool,
        source: Arc<dyn ResourceSource>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            pool,
            source,
            queue,
        }
    }

    /// Synchronize one course. Only a failure to list descriptors is returned
    /// as an error; everything per-descriptor ends up in the report.
    #[instrument(skip_all, fields(owner_ref = %owner_ref, course_ref = %course_ref))]
    pub async fn sync(
        &self,
        owner_ref: &str,
        course_ref: &str,
        credential: &Credential,
    ) -> Result<SyncReport, SyncError> {
        let raw = self
            .source
            .list_resources(course_ref, credential)
            .await
            .map_err(SyncError::SourceUnavailable)?;

        let mut report = SyncReport {
            listed: raw.len(),
            ..Default::default()
        };

        for item in raw {
            match self.process_descriptor(owner_ref, course_ref, item).await {
                Ok((upsert, handle)) => {
                    if upsert.created {
                        report.created += 1;
                    } else {
                        report.refreshed += 1;
                    }
                    report.enqueued += 1;
                    if handle.deduplicated {
                        report.deduplicated += 1;
                    }
                }
                Err(failure) => {
                    warn!(
                        external_id = failure.external_id.as_deref().unwrap_or("?"),
                        error = %failure.error,
                        "descriptor skipped"
                    );
                    report.failures.push(failure);
                }
            }
        }

        info!(
            listed = report.listed,
            created = report.created,
            refreshed = report.refreshed,
            enqueued = report.enqueued,
            failed = report.failures.len(),
            "course sync complete"
        );
        Ok(report)
    }

    async fn process_descriptor(
        &self,
        owner_ref: &str,
        course_ref: &str,
        raw: RawDescriptor,
    ) -> Result<(UpsertOutcome, JobHandle), DescriptorFailure> {
        let descriptor = ResourceDescriptor::try_from(raw).map_err(|error| DescriptorFailure {
            external_id: None,
            error,
        })?;
        let fail = |error| DescriptorFailure {
            external_id: Some(descriptor.external_id.clone()),
            error,
        };

        let upsert = db::upsert_resource(&self.pool, owner_ref, course_ref, &descriptor)
            .await
            .map_err(|source| {
                fail(DescriptorError::Upsert {
                    external_id: descriptor.external_id.clone(),
                    source,
                })
            })?;

        let handle = self
            .queue
            .enqueue(Job::download(upsert.id))
            .await
            .map_err(|source| {
                fail(DescriptorError::Enqueue {
                    resource_id: upsert.id,
                    source,
                })
            })?;

        Ok((upsert, handle))
    }

    /// Manual recovery path: put every `failed` resource of a course back to
    /// `pending` and queue a download for it. Returns the number enqueued.
    ///
    /// A record whose enqueue fails goes back to `failed` so a later call picks
    /// it up again, and the call returns an error naming the shortfall.
    #[instrument(skip_all, fields(course_ref = %course_ref))]
    pub async fn requeue_failed(&self, course_ref: &str) -> Result<usize> {
        let ids = db::reset_failed_resources(&self.pool, course_ref).await?;
        let mut enqueued = 0;
        let mut reverted = Vec::new();
        for id in &ids {
            match self.queue.enqueue(Job::download(*id)).await {
                Ok(_) => enqueued += 1,
                Err(err) => {
                    warn!(resource_id = id, ?err, "failed to requeue resource");
                    db::mark_resource_failed(&self.pool, *id).await?;
                    reverted.push(*id);
                }
            }
        }
        info!(
            reset = ids.len(),
            enqueued,
            reverted = reverted.len(),
            "requeued failed resources"
        );
        if !reverted.is_empty() {
            return Err(anyhow!(
                "{} of {} failed resources could not be queued: {:?}",
                reverted.len(),
                ids.len(),
                reverted
            ));
        }
        Ok(enqueued)
    }

    pub async fn status(&self, course_ref: &str) -> Result<StatusCounts> {
        db::status_counts(&self.pool, course_ref).await
    }
}
