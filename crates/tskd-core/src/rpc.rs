//! The nine public operations (§6), transport-agnostic. Both the CLI and
//! the HTTP server (`tskd-cli`) call through this module rather than
//! duplicating query orchestration and authorization checks at each
//! transport.

use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use tskd_db::models::{JobRow, JobStatus, SkipRuleRow, TaskRow, TaskStatus, Trigger};
use tskd_db::queries::{job_tasks, jobs, skip_rules as skip_rule_queries, tasks};

use crate::auth::{authorize, AuthError, Requirement, Role};
use crate::external::{Executor, ExternalError, ExecutorStats};
use crate::skip_rules::{DuplicateRuleName, SkipRuleEngine};

/// Errors surfaced across the RPC boundary (§7, "User error").
#[derive(Debug, Error)]
pub enum RpcError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One input to [`Service::trigger_jobs`]: either a resolved commit or an
/// unresolved patch, per job-spec name requested.
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub job_name: String,
    pub repo: String,
    pub revision: Option<String>,
    pub patch_issue: Option<String>,
    pub patch_patchset: Option<String>,
    pub patch_server: Option<String>,
    pub patch_repo: Option<String>,
    pub priority: f64,
    pub is_force: bool,
}

/// Full `Job` view: the row plus its linked tasks (§6, `GetJob`).
#[derive(Debug, Clone)]
pub struct JobView {
    pub job: JobRow,
    pub tasks: Vec<TaskRow>,
}

/// Full `Task` view, optionally with executor-reported runtime stats
/// (§6, `GetTask`).
#[derive(Debug, Clone)]
pub struct TaskView {
    pub task: TaskRow,
    pub stats: Option<ExecutorStats>,
}

pub use tskd_db::queries::jobs::JobSearchFilter;
pub use tskd_db::queries::tasks::TaskSearchFilter;

/// The service: owns the durable store handle, the skip-rule engine, and
/// (optionally) the executor registry needed for `GetTask(includeStats)`.
pub struct Service {
    pool: sqlx::PgPool,
    skip_rules: Arc<SkipRuleEngine>,
    executors: Vec<Arc<dyn Executor>>,
}

impl Service {
    pub fn new(pool: sqlx::PgPool, skip_rules: Arc<SkipRuleEngine>, executors: Vec<Arc<dyn Executor>>) -> Self {
        Self { pool, skip_rules, executors }
    }

    /// `TriggerJobs`: each input produces exactly one new job row,
    /// atomically. Deliberately not idempotent (§8): calling this twice
    /// with the same input produces two distinct jobs.
    pub async fn trigger_jobs(&self, caller: Role, requests: &[TriggerRequest]) -> Result<Vec<Uuid>, RpcError> {
        authorize(caller, Requirement::Write)?;

        let mut ids = Vec::with_capacity(requests.len());
        for req in requests {
            let new = jobs::NewJob {
                repo: &req.repo,
                revision: req.revision.as_deref(),
                patch_issue: req.patch_issue.as_deref(),
                patch_patchset: req.patch_patchset.as_deref(),
                patch_server: req.patch_server.as_deref(),
                patch_repo: req.patch_repo.as_deref(),
                name: &req.job_name,
                priority: req.priority,
                trigger: Trigger::OnDemand,
                is_force: req.is_force,
            };
            let row = jobs::insert_job(&self.pool, &new).await?;
            ids.push(row.id);
        }
        Ok(ids)
    }

    /// `GetJob`: reflects state at read time.
    pub async fn get_job(&self, caller: Role, id: Uuid) -> Result<JobView, RpcError> {
        authorize(caller, Requirement::Read)?;
        let job = jobs::get_job(&self.pool, id).await?.ok_or(RpcError::NotFound)?;
        let tasks = job_tasks::tasks_for_job(&self.pool, id).await?;
        Ok(JobView { job, tasks })
    }

    /// `CancelJob`: idempotent; already-terminal jobs are returned
    /// unchanged (§8).
    pub async fn cancel_job(&self, caller: Role, id: Uuid) -> Result<JobRow, RpcError> {
        authorize(caller, Requirement::Write)?;
        jobs::cancel_job(&self.pool, id).await?.ok_or(RpcError::NotFound)
    }

    /// `SearchJobs`: paged.
    pub async fn search_jobs(&self, caller: Role, filter: &JobSearchFilter) -> Result<Vec<JobRow>, RpcError> {
        authorize(caller, Requirement::Read)?;
        Ok(jobs::search_jobs(&self.pool, filter).await?)
    }

    /// `GetTask`: if `include_stats`, requires a round-trip to the
    /// executor that reported `executor_task_id` (§6).
    pub async fn get_task(&self, caller: Role, id: Uuid, include_stats: bool) -> Result<TaskView, RpcError> {
        authorize(caller, Requirement::Read)?;
        let task = tasks::get_task(&self.pool, id).await?.ok_or(RpcError::NotFound)?;

        let stats = if include_stats {
            match &task.executor_task_id {
                Some(executor_task_id) => self.query_stats(executor_task_id).await?,
                None => None,
            }
        } else {
            None
        };

        Ok(TaskView { task, stats })
    }

    async fn query_stats(&self, executor_task_id: &str) -> Result<Option<ExecutorStats>, RpcError> {
        for executor in &self.executors {
            match executor.query_result(executor_task_id, true).await {
                Ok(stats) => return Ok(stats),
                Err(ExternalError::NotFound(_)) => continue,
                Err(e) => return Err(anyhow::anyhow!(e).into()),
            }
        }
        Ok(None)
    }

    /// `SearchTasks`: paged.
    pub async fn search_tasks(&self, caller: Role, filter: &TaskSearchFilter) -> Result<Vec<TaskRow>, RpcError> {
        authorize(caller, Requirement::Read)?;
        Ok(tasks::search_tasks(&self.pool, filter).await?)
    }

    /// `GetSkipTaskRules`.
    pub fn get_skip_task_rules(&self, caller: Role) -> Result<Vec<SkipRuleRow>, RpcError> {
        authorize(caller, Requirement::Read)?;
        Ok(self
            .skip_rules
            .list()
            .into_iter()
            .map(|r| SkipRuleRow {
                name: r.name,
                added_by: r.added_by,
                description: r.description,
                added_at: r.added_at,
                task_spec_patterns: r.task_spec_patterns,
                commits: r.commits,
            })
            .collect())
    }

    /// `AddSkipTaskRule`: `name` required and unique; at least one
    /// pattern required (§6).
    pub async fn add_skip_task_rule(
        &self,
        caller: Role,
        name: &str,
        added_by: &str,
        description: &str,
        patterns: &[String],
        commits: &[String],
    ) -> Result<Vec<SkipRuleRow>, RpcError> {
        authorize(caller, Requirement::Write)?;
        if name.is_empty() {
            return Err(RpcError::InvalidArgument("name must not be empty".to_string()));
        }
        if patterns.is_empty() {
            return Err(RpcError::InvalidArgument(
                "at least one pattern is required".to_string(),
            ));
        }

        match self.skip_rules.add(name, added_by, description, patterns, commits).await {
            Ok(_) => {}
            Err(e) if e.downcast_ref::<DuplicateRuleName>().is_some() => {
                return Err(RpcError::InvalidArgument(e.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        self.get_skip_task_rules(caller)
    }

    /// `DeleteSkipTaskRule`: idempotent (§8).
    pub async fn delete_skip_task_rule(&self, caller: Role, name: &str) -> Result<Vec<SkipRuleRow>, RpcError> {
        authorize(caller, Requirement::Write)?;
        self.skip_rules.delete(name).await?;
        self.get_skip_task_rules(caller)
    }
}

