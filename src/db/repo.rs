use super::model::{ClaimedJob, EnqueuedJob, StatusCounts, UpsertOutcome};
use crate::model::{ResourceDescriptor, ResourceRecord, ResourceStatus};
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDateTime;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use sqlx::SqlitePool;
use tracing::instrument;

pub type Pool = SqlitePool;

const RESOURCE_COLUMNS: &str = "id, external_id, owner_ref, course_ref, display_name, fetch_url, \
     content_type, local_path, byte_size, status, created_at, updated_at, downloaded_at";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {}", normalized))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout=5000;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and request create-if-missing. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let query = match query_part {
        Some(q) if q.contains("mode=") => q.to_string(),
        Some(q) => format!("{}&mode=rwc", q),
        None => "mode=rwc".to_string(),
    };
    format!("sqlite://{}?{}", expanded_path, query)
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn parse_ts(raw: NaiveDateTime) -> chrono::DateTime<chrono::Utc> {
    raw.and_utc()
}

fn record_from_row(row: &SqliteRow) -> Result<ResourceRecord> {
    let id: i64 = row.get("id");
    let status_str: String = row.get("status");
    let status = ResourceStatus::parse_status(&status_str)
        .ok_or_else(|| anyhow!("resource {} has unknown status {}", id, status_str))?;
    Ok(ResourceRecord {
        id,
        external_id: row.get("external_id"),
        owner_ref: row.get("owner_ref"),
        course_ref: row.get("course_ref"),
        display_name: row.get("display_name"),
        fetch_url: row.get("fetch_url"),
        content_type: row.try_get::<Option<String>, _>("content_type")?,
        local_path: row.try_get::<Option<String>, _>("local_path")?,
        byte_size: row.try_get::<Option<i64>, _>("byte_size")?,
        status,
        created_at: parse_ts(row.try_get("created_at")?),
        updated_at: parse_ts(row.try_get("updated_at")?),
        downloaded_at: row
            .try_get::<Option<NaiveDateTime>, _>("downloaded_at")?
            .map(parse_ts),
    })
}

/// Create-or-refresh a record keyed by `external_id`.
///
/// A new record starts `pending`. An existing record only has `fetch_url` and
/// `display_name` refreshed; status, local path and size are left alone.
#[instrument(skip_all, fields(external_id = %descriptor.external_id))]
pub async fn upsert_resource(
    pool: &Pool,
    owner_ref: &str,
    course_ref: &str,
    descriptor: &ResourceDescriptor,
) -> Result<UpsertOutcome> {
    let mut tx = pool.begin().await?;
    let existing =
        sqlx::query_scalar::<_, i64>("SELECT id FROM resources WHERE external_id = ?")
            .bind(&descriptor.external_id)
            .fetch_optional(&mut *tx)
            .await?;

    let outcome = if let Some(id) = existing {
        sqlx::query(
            "UPDATE resources SET fetch_url = ?, display_name = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(&descriptor.fetch_url)
        .bind(&descriptor.display_name)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        UpsertOutcome { id, created: false }
    } else {
        // A concurrent sync may insert between the lookup and here; the conflict
        // clause turns that into the same refresh as above.
        let id: i64 = sqlx::query(
            "INSERT INTO resources (external_id, owner_ref, course_ref, display_name, fetch_url, content_type, status) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(external_id) DO UPDATE SET fetch_url = excluded.fetch_url, \
                 display_name = excluded.display_name, updated_at = CURRENT_TIMESTAMP \
             RETURNING id",
        )
        .bind(&descriptor.external_id)
        .bind(owner_ref)
        .bind(course_ref)
        .bind(&descriptor.display_name)
        .bind(&descriptor.fetch_url)
        .bind(descriptor.content_type.as_deref())
        .bind(ResourceStatus::Pending.as_str())
        .fetch_one(&mut *tx)
        .await?
        .get("id");
        UpsertOutcome { id, created: true }
    };

    tx.commit().await?;
    Ok(outcome)
}

#[instrument(skip_all)]
pub async fn get_resource(pool: &Pool, id: i64) -> Result<Option<ResourceRecord>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM resources WHERE id = ?",
        RESOURCE_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(record_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn get_resource_by_external_id(
    pool: &Pool,
    external_id: &str,
) -> Result<Option<ResourceRecord>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM resources WHERE external_id = ?",
        RESOURCE_COLUMNS
    ))
    .bind(external_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(record_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list_course_resources(pool: &Pool, course_ref: &str) -> Result<Vec<ResourceRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM resources WHERE course_ref = ? ORDER BY id ASC",
        RESOURCE_COLUMNS
    ))
    .bind(course_ref)
    .fetch_all(pool)
    .await?;
    rows.iter().map(record_from_row).collect()
}

/// Record a successful download. Returns false if the record no longer exists.
#[instrument(skip_all)]
pub async fn mark_resource_downloaded(
    pool: &Pool,
    id: i64,
    local_path: &str,
    byte_size: i64,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE resources SET status = ?, local_path = ?, byte_size = ?, \
             downloaded_at = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(ResourceStatus::Downloaded.as_str())
    .bind(local_path)
    .bind(byte_size)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to persist downloaded resource")?;
    Ok(res.rows_affected() > 0)
}

/// Record a failed attempt. Local path and size are not touched.
#[instrument(skip_all)]
pub async fn mark_resource_failed(pool: &Pool, id: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE resources SET status = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(ResourceStatus::Failed.as_str())
    .bind(id)
    .execute(pool)
    .await
    .context("failed to persist failed resource")?;
    Ok(res.rows_affected() > 0)
}

/// Move every failed record of a course back to pending and return their ids.
#[instrument(skip_all)]
pub async fn reset_failed_resources(pool: &Pool, course_ref: &str) -> Result<Vec<i64>> {
    let ids: Vec<i64> = sqlx::query_scalar(
        "UPDATE resources SET status = ?, updated_at = CURRENT_TIMESTAMP \
         WHERE course_ref = ? AND status = ? RETURNING id",
    )
    .bind(ResourceStatus::Pending.as_str())
    .bind(course_ref)
    .bind(ResourceStatus::Failed.as_str())
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

#[instrument(skip_all)]
pub async fn delete_resource(pool: &Pool, id: i64) -> Result<bool> {
    let res = sqlx::query("DELETE FROM resources WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn status_counts(pool: &Pool, course_ref: &str) -> Result<StatusCounts> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM resources WHERE course_ref = ? GROUP BY status",
    )
    .bind(course_ref)
    .fetch_all(pool)
    .await?;
    let mut counts = StatusCounts::default();
    for (status, n) in rows {
        match ResourceStatus::parse_status(&status) {
            Some(ResourceStatus::Pending) => counts.pending = n,
            Some(ResourceStatus::Downloaded) => counts.downloaded = n,
            Some(ResourceStatus::Failed) => counts.failed = n,
            None => return Err(anyhow!("unknown resource status {}", status)),
        }
    }
    Ok(counts)
}

#[instrument(skip_all)]
pub async fn count_resources(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM resources")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Insert a job row. With `dedup`, an existing job for the same resource that
/// has not been leased yet is returned instead of inserting a second one.
#[instrument(skip_all)]
pub async fn enqueue_job(
    pool: &Pool,
    queue: &str,
    kind: &str,
    resource_id: i64,
    dedup: bool,
) -> Result<EnqueuedJob> {
    let mut tx = pool.begin().await?;
    if dedup {
        let waiting = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM jobs WHERE queue = ? AND kind = ? AND resource_id = ? AND leased_until IS NULL \
             ORDER BY id ASC LIMIT 1",
        )
        .bind(queue)
        .bind(kind)
        .bind(resource_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(id) = waiting {
            tx.commit().await?;
            return Ok(EnqueuedJob {
                id,
                deduplicated: true,
            });
        }
    }
    let id: i64 = sqlx::query(
        "INSERT INTO jobs (queue, kind, resource_id, attempt, due_at) VALUES (?, ?, ?, 0, CURRENT_TIMESTAMP) RETURNING id",
    )
    .bind(queue)
    .bind(kind)
    .bind(resource_id)
    .fetch_one(&mut *tx)
    .await?
    .get("id");
    tx.commit().await?;
    Ok(EnqueuedJob {
        id,
        deduplicated: false,
    })
}

/// Atomically lease the next due job. A job whose lease has expired is due again.
#[instrument(skip_all)]
pub async fn claim_next_job(
    pool: &Pool,
    queue: &str,
    lease_secs: i64,
    lease_token: &str,
) -> Result<Option<ClaimedJob>> {
    let row = sqlx::query(
        "UPDATE jobs SET leased_until = datetime('now', ? || ' seconds'), lease_token = ?, attempt = attempt + 1 \
         WHERE id = ( \
             SELECT id FROM jobs \
             WHERE queue = ? AND datetime(due_at) <= CURRENT_TIMESTAMP \
               AND (leased_until IS NULL OR datetime(leased_until) <= CURRENT_TIMESTAMP) \
             ORDER BY datetime(due_at) ASC, id ASC LIMIT 1 \
         ) \
         RETURNING id, kind, resource_id, attempt",
    )
    .bind(lease_secs)
    .bind(lease_token)
    .bind(queue)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| ClaimedJob {
        id: row.get("id"),
        kind: row.get("kind"),
        resource_id: row.get("resource_id"),
        attempt: row.get("attempt"),
    }))
}

/// Delete a job held under `lease_token`. False if the lease was lost.
#[instrument(skip_all)]
pub async fn delete_leased_job(pool: &Pool, id: i64, lease_token: &str) -> Result<bool> {
    let res = sqlx::query("DELETE FROM jobs WHERE id = ? AND lease_token = ?")
        .bind(id)
        .bind(lease_token)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Drop the lease and make the job due again after `delay_secs`.
#[instrument(skip_all)]
pub async fn release_leased_job(
    pool: &Pool,
    id: i64,
    lease_token: &str,
    delay_secs: i64,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE jobs SET leased_until = NULL, lease_token = NULL, due_at = datetime('now', ? || ' seconds') \
         WHERE id = ? AND lease_token = ?",
    )
    .bind(delay_secs)
    .bind(id)
    .bind(lease_token)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn delete_job(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM jobs WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_jobs(pool: &Pool, queue: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE queue = ?")
        .bind(queue)
        .fetch_one(pool)
        .await?;
    Ok(count)
}
