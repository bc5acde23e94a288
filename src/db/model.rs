//! View models returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! lives in the syncer, queue and worker.

/// Result of a keyed upsert on `resources`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: i64,
    pub created: bool,
}

/// Row claimed from `jobs` under a fresh lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    pub id: i64,
    pub kind: String,
    pub resource_id: i64,
    pub attempt: i32,
}

/// Row id of an enqueued job and whether an existing waiting job was reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueuedJob {
    pub id: i64,
    pub deduplicated: bool,
}

/// Per-status record counts for one course.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: i64,
    pub downloaded: i64,
    pub failed: i64,
}

impl StatusCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.downloaded + self.failed
    }
}
