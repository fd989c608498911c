use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a single task (executor attempt).
///
/// `Pending -> Running -> {Success, Failure, Mishap}`, or `Pending ->
/// Mishap` directly if the dispatch deadline expires before the executor
/// reports a start. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failure,
    Mishap,
}

impl TaskStatus {
    /// Whether this status is terminal (absorbing).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Mishap)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Mishap => "mishap",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "mishap" => Ok(Self::Mishap),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a job (a work request spanning a DAG of tasks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Requested,
    InProgress,
    Success,
    Failure,
    Mishap,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failure | Self::Mishap | Self::Canceled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Requested => "requested",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Mishap => "mishap",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

impl FromStr for JobStatus {
    type Err = JobStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(Self::Requested),
            "in_progress" => Ok(Self::InProgress),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "mishap" => Ok(Self::Mishap),
            "canceled" => Ok(Self::Canceled),
            other => Err(JobStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`JobStatus`] string.
#[derive(Debug, Clone)]
pub struct JobStatusParseError(pub String);

impl fmt::Display for JobStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid job status: {:?}", self.0)
    }
}

impl std::error::Error for JobStatusParseError {}

// ---------------------------------------------------------------------------

/// Trigger policy for a `JobSpec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Periodic,
    AnyCommit,
    MasterOnly,
    OnDemand,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Periodic => "periodic",
            Self::AnyCommit => "any_commit",
            Self::MasterOnly => "master_only",
            Self::OnDemand => "on_demand",
        };
        f.write_str(s)
    }
}

impl FromStr for Trigger {
    type Err = TriggerParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "periodic" => Ok(Self::Periodic),
            "any_commit" => Ok(Self::AnyCommit),
            "master_only" => Ok(Self::MasterOnly),
            "on_demand" => Ok(Self::OnDemand),
            other => Err(TriggerParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Trigger`] string.
#[derive(Debug, Clone)]
pub struct TriggerParseError(pub String);

impl fmt::Display for TriggerParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid trigger: {:?}", self.0)
    }
}

impl std::error::Error for TriggerParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A cache row for the Task-Cfg Cacher (`tasks_cfg_cache` table), keyed by
/// the `RepoState` content digest. Exactly one of `tasks_cfg_json` /
/// (`error_kind`, `error_message`) is populated.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TasksCfgCacheRow {
    pub repo_state_digest: String,
    pub tasks_cfg_json: Option<serde_json::Value>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub resolved_at: DateTime<Utc>,
}

/// A job row -- one per `Job` (a work request spanning a task-spec DAG).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub repo: String,
    pub revision: Option<String>,
    pub patch_issue: Option<String>,
    pub patch_patchset: Option<String>,
    pub patch_server: Option<String>,
    pub patch_repo: Option<String>,
    pub name: String,
    pub priority: f64,
    pub trigger: Trigger,
    pub status: JobStatus,
    pub is_force: bool,
    pub created_at: DateTime<Utc>,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub db_modified: DateTime<Utc>,
}

impl JobRow {
    pub fn is_try_job(&self) -> bool {
        self.patch_issue.as_deref().is_some_and(|i| !i.is_empty())
    }
}

/// A task row -- one per executor attempt (`tasks` table).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskRow {
    pub id: Uuid,
    pub repo: String,
    pub revision: String,
    pub patch_issue: Option<String>,
    pub patch_patchset: Option<String>,
    pub patch_server: Option<String>,
    pub patch_repo: Option<String>,
    pub name: String,
    pub forced_job_id: Option<Uuid>,
    pub attempt: i32,
    pub retry_of: Option<Uuid>,
    pub status: TaskStatus,
    pub commits: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub executor_task_id: Option<String>,
    pub output_digest: Option<String>,
    pub db_modified: DateTime<Utc>,
}

impl TaskRow {
    pub fn is_try_job(&self) -> bool {
        self.patch_issue.as_deref().is_some_and(|i| !i.is_empty())
    }
}

/// Join row recording that a task belongs to a job (`job_tasks` table). A
/// task may be shared by more than one job before dedup collapses further
/// demand onto the same `(Name, RepoState)` candidate.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct JobTaskRow {
    pub job_id: Uuid,
    pub task_id: Uuid,
}

/// A skip rule row (`skip_rules` table).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SkipRuleRow {
    pub name: String,
    pub added_by: String,
    pub description: String,
    pub added_at: DateTime<Utc>,
    pub task_spec_patterns: Vec<String>,
    pub commits: Vec<String>,
}
