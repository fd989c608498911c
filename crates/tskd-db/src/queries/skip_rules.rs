//! Database query functions for the `skip_rules` table.
//!
//! Rules are created and deleted by operators, never mutated in place
//! (§3). The in-memory snapshot rebuilt from these rows lives in
//! `tskd-core`.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;

use crate::models::SkipRuleRow;

/// Fetch every skip rule, for rebuilding the in-memory snapshot.
pub async fn list_all(pool: &PgPool) -> Result<Vec<SkipRuleRow>> {
    let rules = sqlx::query_as::<_, SkipRuleRow>("SELECT * FROM skip_rules ORDER BY name")
        .fetch_all(pool)
        .await
        .context("failed to list skip rules")?;

    Ok(rules)
}

/// Error returned by [`add`] when the rule name already exists.
#[derive(Debug, thiserror::Error)]
#[error("skip rule {0:?} already exists")]
pub struct DuplicateRuleName(pub String);

/// Add a new skip rule. `name` must be unique; returns
/// [`DuplicateRuleName`] otherwise.
pub async fn add(
    pool: &PgPool,
    name: &str,
    added_by: &str,
    description: &str,
    task_spec_patterns: &[String],
    commits: &[String],
) -> Result<SkipRuleRow> {
    let existing = get(pool, name).await?;
    if existing.is_some() {
        return Err(DuplicateRuleName(name.to_owned()).into());
    }

    let result = sqlx::query_as::<_, SkipRuleRow>(
        "INSERT INTO skip_rules (name, added_by, description, added_at, task_spec_patterns, commits) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(name)
    .bind(added_by)
    .bind(description)
    .bind(Utc::now())
    .bind(task_spec_patterns)
    .bind(commits)
    .fetch_one(pool)
    .await;

    match result {
        Ok(row) => Ok(row),
        Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("23505") => {
            Err(DuplicateRuleName(name.to_owned()).into())
        }
        Err(e) => Err(e).context("failed to insert skip rule"),
    }
}

/// Fetch a single rule by name.
pub async fn get(pool: &PgPool, name: &str) -> Result<Option<SkipRuleRow>> {
    let row = sqlx::query_as::<_, SkipRuleRow>("SELECT * FROM skip_rules WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("failed to fetch skip rule")?;

    Ok(row)
}

/// Delete a rule by name. Idempotent: deleting a name that doesn't exist
/// succeeds and returns `false`.
pub async fn delete(pool: &PgPool, name: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM skip_rules WHERE name = $1")
        .bind(name)
        .execute(pool)
        .await
        .context("failed to delete skip rule")?;

    Ok(result.rows_affected() > 0)
}
