//! Database query functions for the `tasks_cfg_cache` table.
//!
//! This is the durable half of the Task-Cfg Cacher (the in-process "lazy
//! resolver" lives in `tskd-core`). The table is write-once per
//! `repo_state_digest`: both rows are inserted with `ON CONFLICT DO
//! NOTHING`, so a losing concurrent writer discards its own resolved value
//! and re-reads whichever row actually landed.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::TasksCfgCacheRow;

/// Look up a cache row by `RepoState` digest.
pub async fn get(pool: &PgPool, repo_state_digest: &str) -> Result<Option<TasksCfgCacheRow>> {
    let row = sqlx::query_as::<_, TasksCfgCacheRow>(
        "SELECT * FROM tasks_cfg_cache WHERE repo_state_digest = $1",
    )
    .bind(repo_state_digest)
    .fetch_optional(pool)
    .await
    .context("failed to fetch tasks_cfg_cache row")?;

    Ok(row)
}

/// Insert a resolved `TasksCfg` (as JSON) for `repo_state_digest`.
///
/// If another writer already won the race for this digest, the insert is a
/// no-op and the winner's row is returned instead (at-most-once resolution,
/// §4.1).
pub async fn insert_resolved(
    pool: &PgPool,
    repo_state_digest: &str,
    tasks_cfg_json: &serde_json::Value,
) -> Result<TasksCfgCacheRow> {
    sqlx::query(
        "INSERT INTO tasks_cfg_cache (repo_state_digest, tasks_cfg_json) \
         VALUES ($1, $2) \
         ON CONFLICT (repo_state_digest) DO NOTHING",
    )
    .bind(repo_state_digest)
    .bind(tasks_cfg_json)
    .execute(pool)
    .await
    .context("failed to insert resolved tasks_cfg_cache row")?;

    get(pool, repo_state_digest)
        .await?
        .context("tasks_cfg_cache row missing immediately after insert")
}

/// Insert a negative cache entry (a permanent resolution error) for
/// `repo_state_digest`. Same at-most-once semantics as [`insert_resolved`].
pub async fn insert_error(
    pool: &PgPool,
    repo_state_digest: &str,
    error_kind: &str,
    error_message: &str,
) -> Result<TasksCfgCacheRow> {
    sqlx::query(
        "INSERT INTO tasks_cfg_cache (repo_state_digest, error_kind, error_message) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (repo_state_digest) DO NOTHING",
    )
    .bind(repo_state_digest)
    .bind(error_kind)
    .bind(error_message)
    .execute(pool)
    .await
    .context("failed to insert negative tasks_cfg_cache row")?;

    get(pool, repo_state_digest)
        .await?
        .context("tasks_cfg_cache row missing immediately after insert")
}
