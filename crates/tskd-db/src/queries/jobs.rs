//! Database query functions for the `jobs` table.

use chrono::{DateTime, Utc};
use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{JobRow, JobStatus, Trigger};

/// Input to [`insert_job`] -- the flattened `RepoState` plus job metadata.
#[allow(clippy::too_many_arguments)]
pub struct NewJob<'a> {
    pub repo: &'a str,
    pub revision: Option<&'a str>,
    pub patch_issue: Option<&'a str>,
    pub patch_patchset: Option<&'a str>,
    pub patch_server: Option<&'a str>,
    pub patch_repo: Option<&'a str>,
    pub name: &'a str,
    pub priority: f64,
    pub trigger: Trigger,
    pub is_force: bool,
}

/// Insert a new job row.
///
/// `TriggerJobs` calls this once per input; each call produces a distinct
/// row (TriggerJobs is deliberately not idempotent -- §8).
pub async fn insert_job(pool: &PgPool, new: &NewJob<'_>) -> Result<JobRow> {
    let status = if new.revision.is_some() {
        JobStatus::InProgress
    } else {
        JobStatus::Requested
    };

    let job = sqlx::query_as::<_, JobRow>(
        "INSERT INTO jobs \
            (repo, revision, patch_issue, patch_patchset, patch_server, patch_repo, \
             name, priority, trigger, status, is_force) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
         RETURNING *",
    )
    .bind(new.repo)
    .bind(new.revision)
    .bind(new.patch_issue)
    .bind(new.patch_patchset)
    .bind(new.patch_server)
    .bind(new.patch_repo)
    .bind(new.name)
    .bind(new.priority)
    .bind(new.trigger)
    .bind(status)
    .bind(new.is_force)
    .fetch_one(pool)
    .await
    .context("failed to insert job")?;

    Ok(job)
}

/// Fetch a single job by ID.
pub async fn get_job(pool: &PgPool, id: Uuid) -> Result<Option<JobRow>> {
    let job = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch job")?;

    Ok(job)
}

/// List every non-terminal job. Used by the candidate builder at the start
/// of each tick.
pub async fn list_non_terminal(pool: &PgPool) -> Result<Vec<JobRow>> {
    let jobs = sqlx::query_as::<_, JobRow>(
        "SELECT * FROM jobs \
         WHERE status IN ('requested', 'in_progress') \
         ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list non-terminal jobs")?;

    Ok(jobs)
}

/// List jobs whose `RepoState` exactly matches the given fields (used to
/// find all jobs sharing a candidate's `RepoState`).
pub async fn list_by_repo_state(
    pool: &PgPool,
    repo: &str,
    revision: &str,
    patch_issue: Option<&str>,
) -> Result<Vec<JobRow>> {
    let jobs = sqlx::query_as::<_, JobRow>(
        "SELECT * FROM jobs \
         WHERE repo = $1 AND revision = $2 AND patch_issue IS NOT DISTINCT FROM $3 \
         ORDER BY created_at ASC",
    )
    .bind(repo)
    .bind(revision)
    .bind(patch_issue)
    .fetch_all(pool)
    .await
    .context("failed to list jobs by repo state")?;

    Ok(jobs)
}

/// Filters accepted by [`search_jobs`]. `None` means "don't filter on this
/// field".
#[derive(Debug, Clone, Default)]
pub struct JobSearchFilter {
    pub repo: Option<String>,
    pub name: Option<String>,
    pub status: Option<JobStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

/// Paged job search.
pub async fn search_jobs(pool: &PgPool, filter: &JobSearchFilter) -> Result<Vec<JobRow>> {
    let jobs = sqlx::query_as::<_, JobRow>(
        "SELECT * FROM jobs \
         WHERE ($1::text IS NULL OR repo = $1) \
           AND ($2::text IS NULL OR name = $2) \
           AND ($3::text IS NULL OR status = $3) \
           AND ($4::timestamptz IS NULL OR created_at >= $4) \
           AND ($5::timestamptz IS NULL OR created_at <= $5) \
         ORDER BY created_at DESC \
         LIMIT $6 OFFSET $7",
    )
    .bind(&filter.repo)
    .bind(&filter.name)
    .bind(filter.status)
    .bind(filter.since)
    .bind(filter.until)
    .bind(filter.limit)
    .bind(filter.offset)
    .fetch_all(pool)
    .await
    .context("failed to search jobs")?;

    Ok(jobs)
}

/// Jobs modified at or after `since`, for the durable store's modifications
/// feed (§4.5).
pub async fn modified_since(pool: &PgPool, since: DateTime<Utc>) -> Result<Vec<JobRow>> {
    let jobs = sqlx::query_as::<_, JobRow>(
        "SELECT * FROM jobs WHERE db_modified >= $1 ORDER BY db_modified ASC",
    )
    .bind(since)
    .fetch_all(pool)
    .await
    .context("failed to list jobs modified since")?;

    Ok(jobs)
}

/// Compare-and-set status/timestamp update. Returns the number of rows
/// affected -- 0 means `expected_db_modified` was stale and the caller must
/// re-read and retry (§7, "Scheduling conflict").
#[allow(clippy::too_many_arguments)]
pub async fn transition_status(
    pool: &PgPool,
    id: Uuid,
    expected_db_modified: DateTime<Utc>,
    new_status: JobStatus,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE jobs \
         SET status = $1, \
             started_at = COALESCE(started_at, $2), \
             finished_at = COALESCE($3, finished_at), \
             db_modified = now() \
         WHERE id = $4 AND db_modified = $5",
    )
    .bind(new_status)
    .bind(started_at)
    .bind(finished_at)
    .bind(id)
    .bind(expected_db_modified)
    .execute(pool)
    .await
    .context("failed to transition job status")?;

    Ok(result.rows_affected())
}

/// Assign a resolved revision to a job that was created `REQUESTED` (e.g.
/// once an upstream revision resolves).
pub async fn set_revision(
    pool: &PgPool,
    id: Uuid,
    expected_db_modified: DateTime<Utc>,
    revision: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE jobs \
         SET revision = $1, status = 'in_progress', db_modified = now() \
         WHERE id = $2 AND db_modified = $3 AND status = 'requested'",
    )
    .bind(revision)
    .bind(id)
    .bind(expected_db_modified)
    .execute(pool)
    .await
    .context("failed to set job revision")?;

    Ok(result.rows_affected())
}

/// Cancel a job. Idempotent: an already-terminal job is returned unchanged
/// and the cancel is a no-op (§8).
pub async fn cancel_job(pool: &PgPool, id: Uuid) -> Result<Option<JobRow>> {
    let Some(job) = get_job(pool, id).await? else {
        return Ok(None);
    };

    if job.status.is_terminal() {
        return Ok(Some(job));
    }

    let updated = sqlx::query_as::<_, JobRow>(
        "UPDATE jobs \
         SET status = 'canceled', finished_at = now(), db_modified = now() \
         WHERE id = $1 AND db_modified = $2 \
         RETURNING *",
    )
    .bind(id)
    .bind(job.db_modified)
    .fetch_optional(pool)
    .await
    .context("failed to cancel job")?;

    match updated {
        Some(job) => Ok(Some(job)),
        // Lost the CAS race; re-read whatever the winner left behind.
        None => get_job(pool, id).await,
    }
}
