use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Persisted download state of a resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Pending,
    Downloaded,
    Failed,
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Pending => "pending",
            ResourceStatus::Downloaded => "downloaded",
            ResourceStatus::Failed => "failed",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ResourceStatus::Pending),
            "downloaded" => Some(ResourceStatus::Downloaded),
            "failed" => Some(ResourceStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Download,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Download => "download",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "download" => Some(JobKind::Download),
            _ => None,
        }
    }
}

/// Queue-transported job reference. Carries identity only; everything else is
/// read from the store when the job is handled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub kind: JobKind,
    pub resource_id: i64,
}

impl Job {
    pub fn download(resource_id: i64) -> Self {
        Self {
            kind: JobKind::Download,
            resource_id,
        }
    }
}

/// Durable record of one remote resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceRecord {
    pub id: i64,
    pub external_id: String,
    pub owner_ref: String,
    pub course_ref: String,
    pub display_name: String,
    pub fetch_url: String,
    pub content_type: Option<String>,
    pub local_path: Option<String>,
    pub byte_size: Option<i64>,
    pub status: ResourceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub downloaded_at: Option<DateTime<Utc>>,
}

/// Validated remote descriptor, the only shape the store accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub external_id: String,
    pub display_name: String,
    pub fetch_url: String,
    pub content_type: Option<String>,
}

/// Opaque credential for the descriptor source. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}
