//! Database query functions for the `tasks` table.

use chrono::{DateTime, Utc};
use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{TaskRow, TaskStatus};

/// Input to [`insert_task`] -- a freshly-selected candidate becoming a
/// dispatched `Task` row.
#[allow(clippy::too_many_arguments)]
pub struct NewTask<'a> {
    pub repo: &'a str,
    pub revision: &'a str,
    pub patch_issue: Option<&'a str>,
    pub patch_patchset: Option<&'a str>,
    pub patch_server: Option<&'a str>,
    pub patch_repo: Option<&'a str>,
    pub name: &'a str,
    pub forced_job_id: Option<Uuid>,
    pub attempt: i32,
    pub retry_of: Option<Uuid>,
}

/// Insert a new task row in `Pending` status.
pub async fn insert_task(pool: &PgPool, new: &NewTask<'_>) -> Result<TaskRow> {
    let task = sqlx::query_as::<_, TaskRow>(
        "INSERT INTO tasks \
            (repo, revision, patch_issue, patch_patchset, patch_server, patch_repo, \
             name, forced_job_id, attempt, retry_of, status) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'pending') \
         RETURNING *",
    )
    .bind(new.repo)
    .bind(new.revision)
    .bind(new.patch_issue)
    .bind(new.patch_patchset)
    .bind(new.patch_server)
    .bind(new.patch_repo)
    .bind(new.name)
    .bind(new.forced_job_id)
    .bind(new.attempt)
    .bind(new.retry_of)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<TaskRow>> {
    let task = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Fetch the task an executor is reporting a completion event for.
pub async fn get_by_executor_task_id(pool: &PgPool, executor_task_id: &str) -> Result<Option<TaskRow>> {
    let task = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE executor_task_id = $1")
        .bind(executor_task_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task by executor task id")?;

    Ok(task)
}

/// All tasks sharing a `(repo, revision, patch, name)` key -- used by
/// candidate derivation to check whether a non-`FAILURE`/`MISHAP` attempt
/// already exists.
pub async fn list_by_repo_state_and_name(
    pool: &PgPool,
    repo: &str,
    revision: &str,
    patch_issue: Option<&str>,
    name: &str,
) -> Result<Vec<TaskRow>> {
    let tasks = sqlx::query_as::<_, TaskRow>(
        "SELECT * FROM tasks \
         WHERE repo = $1 AND revision = $2 AND patch_issue IS NOT DISTINCT FROM $3 AND name = $4 \
         ORDER BY attempt ASC",
    )
    .bind(repo)
    .bind(revision)
    .bind(patch_issue)
    .bind(name)
    .fetch_all(pool)
    .await
    .context("failed to list tasks by repo state and name")?;

    Ok(tasks)
}

/// All terminal `SUCCESS` tasks for `(repo, name)` with no patch (post-submit
/// only), ordered most-recent-first. Used for blamelist windowing: the walk
/// stops at the first commit already covered by one of these.
pub async fn list_success_no_patch(pool: &PgPool, repo: &str, name: &str) -> Result<Vec<TaskRow>> {
    let tasks = sqlx::query_as::<_, TaskRow>(
        "SELECT * FROM tasks \
         WHERE repo = $1 AND name = $2 AND status = 'success' AND patch_issue IS NULL \
         ORDER BY finished_at DESC NULLS LAST",
    )
    .bind(repo)
    .bind(name)
    .fetch_all(pool)
    .await
    .context("failed to list successful tasks")?;

    Ok(tasks)
}

/// Filters accepted by [`search_tasks`].
#[derive(Debug, Clone, Default)]
pub struct TaskSearchFilter {
    pub repo: Option<String>,
    pub name: Option<String>,
    pub status: Option<TaskStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

/// Paged task search.
pub async fn search_tasks(pool: &PgPool, filter: &TaskSearchFilter) -> Result<Vec<TaskRow>> {
    let tasks = sqlx::query_as::<_, TaskRow>(
        "SELECT * FROM tasks \
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
    .context("failed to search tasks")?;

    Ok(tasks)
}

/// Tasks modified at or after `since`.
pub async fn modified_since(pool: &PgPool, since: DateTime<Utc>) -> Result<Vec<TaskRow>> {
    let tasks = sqlx::query_as::<_, TaskRow>(
        "SELECT * FROM tasks WHERE db_modified >= $1 ORDER BY db_modified ASC",
    )
    .bind(since)
    .fetch_all(pool)
    .await
    .context("failed to list tasks modified since")?;

    Ok(tasks)
}

/// `PENDING -> RUNNING`: the executor accepted dispatch and reported a
/// start.
pub async fn begin_running(
    pool: &PgPool,
    id: Uuid,
    expected_db_modified: DateTime<Utc>,
    executor_task_id: &str,
    started_at: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'running', executor_task_id = $1, started_at = $2, db_modified = now() \
         WHERE id = $3 AND db_modified = $4 AND status = 'pending'",
    )
    .bind(executor_task_id)
    .bind(started_at)
    .bind(id)
    .bind(expected_db_modified)
    .execute(pool)
    .await
    .context("failed to begin running task")?;

    Ok(result.rows_affected())
}

/// Transition to a terminal status (`SUCCESS`, `FAILURE`, or `MISHAP`),
/// optionally recording the blamelist (`commits`, only set on `SUCCESS`) and
/// the executor's output digest.
#[allow(clippy::too_many_arguments)]
pub async fn finish(
    pool: &PgPool,
    id: Uuid,
    expected_db_modified: DateTime<Utc>,
    from: TaskStatus,
    to: TaskStatus,
    finished_at: DateTime<Utc>,
    commits: Option<&[String]>,
    output_digest: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, \
             finished_at = $2, \
             commits = COALESCE($3, commits), \
             output_digest = COALESCE($4, output_digest), \
             db_modified = now() \
         WHERE id = $5 AND db_modified = $6 AND status = $7",
    )
    .bind(to)
    .bind(finished_at)
    .bind(commits)
    .bind(output_digest)
    .bind(id)
    .bind(expected_db_modified)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to finish task")?;

    Ok(result.rows_affected())
}

/// `PENDING -> MISHAP` directly: the dispatch deadline expired before the
/// executor reported a start.
pub async fn dispatch_timeout(
    pool: &PgPool,
    id: Uuid,
    expected_db_modified: DateTime<Utc>,
    finished_at: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'mishap', finished_at = $1, db_modified = now() \
         WHERE id = $2 AND db_modified = $3 AND status = 'pending'",
    )
    .bind(finished_at)
    .bind(id)
    .bind(expected_db_modified)
    .execute(pool)
    .await
    .context("failed to time out dispatch")?;

    Ok(result.rows_affected())
}
