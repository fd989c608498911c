//! `tskd job ...`: operator-facing wrappers around [`tskd_core::rpc::Service`]'s
//! job operations. Run with the operator's own `Role::Editor` -- this is a
//! trusted local tool, not the HTTP surface, so there is no bearer token
//! to check (§6.1 auth lives at the HTTP boundary only).

use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use tskd_core::auth::Role;
use tskd_core::rpc::{JobSearchFilter, Service, TriggerRequest};
use tskd_db::models::JobStatus;

#[allow(clippy::too_many_arguments)]
pub async fn run_trigger(
    service: &Service,
    job_name: &str,
    repo: &str,
    revision: Option<&str>,
    patch_issue: Option<&str>,
    patch_patchset: Option<&str>,
    patch_server: Option<&str>,
    patch_repo: Option<&str>,
    priority: f64,
    force: bool,
) -> Result<()> {
    let request = TriggerRequest {
        job_name: job_name.to_string(),
        repo: repo.to_string(),
        revision: revision.map(str::to_string),
        patch_issue: patch_issue.map(str::to_string),
        patch_patchset: patch_patchset.map(str::to_string),
        patch_server: patch_server.map(str::to_string),
        patch_repo: patch_repo.map(str::to_string),
        priority,
        is_force: force,
    };

    let ids = service.trigger_jobs(Role::Editor, &[request]).await?;
    for id in &ids {
        println!("{id}");
    }
    Ok(())
}

pub async fn run_get(service: &Service, id: Uuid) -> Result<()> {
    let view = service.get_job(Role::Editor, id).await?;
    println!("{}", serde_json::to_string_pretty(&view.job)?);
    println!("tasks:");
    for task in &view.tasks {
        println!(
            "  {} {:<24} attempt={} status={}",
            task.id, task.name, task.attempt, task.status
        );
    }
    Ok(())
}

pub async fn run_cancel(service: &Service, id: Uuid) -> Result<()> {
    let job = service.cancel_job(Role::Editor, id).await?;
    println!("job {} is now {}", job.id, job.status);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn run_search(
    service: &Service,
    repo: Option<String>,
    name: Option<String>,
    status: Option<JobStatus>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    limit: i64,
    offset: i64,
) -> Result<()> {
    let filter = JobSearchFilter { repo, name, status, since, until, limit, offset };
    let jobs = service.search_jobs(Role::Editor, &filter).await?;
    for job in &jobs {
        println!(
            "{} {:<30} repo={:<30} status={:<12} priority={}",
            job.id, job.name, job.repo, job.status, job.priority
        );
    }
    Ok(())
}
