//! `tskd task ...`: operator-facing wrappers around [`tskd_core::rpc::Service`]'s
//! task operations.

use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use tskd_core::auth::Role;
use tskd_core::rpc::{Service, TaskSearchFilter};
use tskd_db::models::TaskStatus;

pub async fn run_get(service: &Service, id: Uuid, include_stats: bool) -> Result<()> {
    let view = service.get_task(Role::Editor, id, include_stats).await?;
    println!("{}", serde_json::to_string_pretty(&view.task)?);
    if let Some(stats) = view.stats {
        println!(
            "stats: cpu={:?}s wall={:?}s exit={:?}",
            stats.cpu_seconds, stats.wall_seconds, stats.exit_code
        );
    } else if include_stats {
        println!("stats: unavailable (no matching executor backend configured)");
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn run_search(
    service: &Service,
    repo: Option<String>,
    name: Option<String>,
    status: Option<TaskStatus>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    limit: i64,
    offset: i64,
) -> Result<()> {
    let filter = TaskSearchFilter { repo, name, status, since, until, limit, offset };
    let tasks = service.search_tasks(Role::Editor, &filter).await?;
    for task in &tasks {
        println!(
            "{} {:<24} repo={:<30} attempt={} status={:<10} commits={}",
            task.id,
            task.name,
            task.repo,
            task.attempt,
            task.status,
            task.commits.len()
        );
    }
    Ok(())
}
