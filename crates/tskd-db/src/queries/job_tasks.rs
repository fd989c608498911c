//! Database query functions for the `job_tasks` join table: which jobs a
//! task belongs to, and which tasks make up a job.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::TaskRow;

/// Link a task to a job. Idempotent (`ON CONFLICT DO NOTHING`): two jobs
/// that dedup onto the same candidate both link to the one resulting task.
pub async fn link(pool: &PgPool, job_id: Uuid, task_id: Uuid) -> Result<()> {
    sqlx::query(
        "INSERT INTO job_tasks (job_id, task_id) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(job_id)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to link job to task")?;

    Ok(())
}

/// All job IDs that a task belongs to.
pub async fn jobs_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT job_id FROM job_tasks WHERE task_id = $1")
            .bind(task_id)
            .fetch_all(pool)
            .await
            .context("failed to list jobs for task")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// All tasks belonging to a job.
pub async fn tasks_for_job(pool: &PgPool, job_id: Uuid) -> Result<Vec<TaskRow>> {
    let tasks = sqlx::query_as::<_, TaskRow>(
        "SELECT t.* FROM tasks t \
         JOIN job_tasks jt ON jt.task_id = t.id \
         WHERE jt.job_id = $1 \
         ORDER BY t.created_at ASC",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks for job")?;

    Ok(tasks)
}
