//! Object-safe trait boundaries for every collaborator this crate
//! consumes but does not implement (§6): the read-file-at-ref host
//! interface, the code-review integration, textual patch application, the
//! worktree syncer, the CAS backend, and the task executor.
//!
//! Each trait is `dyn`-compatible (`Send + Sync`) so the scheduler can
//! hold heterogeneous or swappable backends behind a single type: a
//! narrow capability set plus a registry keyed by a backend tag carried
//! on the `TaskSpec`.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::tasks_cfg::TaskSpec;

/// Errors surfaced by any of the external collaborators below. The
/// Cacher (§4.1) and scheduler tick classify these into the permanent /
/// transient taxonomy (§7) at their own boundaries; this enum only
/// distinguishes "this call cannot succeed no matter how many times you
/// retry it" from "this call failed this time".
#[derive(Debug, Error)]
pub enum ExternalError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("patch does not apply: {0}")]
    PatchRejected(String),
    #[error("transient I/O error: {0}")]
    Transient(String),
    #[error("permanent error: {0}")]
    Permanent(String),
}

/// Reads a file at a given ref from the underlying git host. The core
/// only consumes this through the narrow `(repo, ref, path) -> bytes`
/// contract; everything about authentication and transport is the
/// implementer's concern.
#[async_trait]
pub trait ReadFileAtRef: Send + Sync {
    async fn read_file_at_ref(
        &self,
        repo: &str,
        git_ref: &str,
        path: &str,
    ) -> Result<Vec<u8>, ExternalError>;
}

/// Code-review (Gerrit-shaped) integration, restricted to the
/// patch-fetching contract (§1): which files a patch touches, and the
/// unified diff for one of them.
#[async_trait]
pub trait CodeReview: Send + Sync {
    async fn get_changed_files(
        &self,
        issue: &str,
        patchset: &str,
    ) -> Result<Vec<String>, ExternalError>;

    async fn get_patch(
        &self,
        issue: &str,
        patchset: &str,
        path: &str,
    ) -> Result<Vec<u8>, ExternalError>;
}

/// Applies a unified diff to the original bytes of one file. Implementers
/// should reject (return `ExternalError::PatchRejected`) rather than
/// silently drop hunks -- the Cacher treats a reject as a permanent
/// error (§4.1, §7).
pub trait PatchApplier: Send + Sync {
    fn apply(
        &self,
        original: &[u8],
        unified_diff: &[u8],
        path: &str,
    ) -> Result<Vec<u8>, ExternalError>;
}

/// Materializes a `RepoState` into a scratch checkout directory for the
/// duration of a closure. Teardown is guaranteed on all exit paths,
/// including the closure returning an error or panicking -- callers must
/// not assume the directory is usable after `with_worktree` returns.
#[async_trait]
pub trait Syncer: Send + Sync {
    async fn sync(
        &self,
        repo: &str,
        revision: &str,
        patch_issue: Option<&str>,
        patch_patchset: Option<&str>,
    ) -> Result<WorktreeHandle, ExternalError>;
}

/// Ownership handle for a materialized worktree. Dropping it releases the
/// scratch directory; implementations of [`Syncer`] are expected to wire
/// real teardown (e.g. via a `Drop` impl on the concrete handle type they
/// return, or an explicit `tempfile::TempDir` held alongside `path`).
#[derive(Debug)]
pub struct WorktreeHandle {
    pub path: std::path::PathBuf,
}

/// Content-addressed storage backend. `upload` honors `excludes` against
/// `paths` rooted at `root` and returns an opaque digest string.
#[async_trait]
pub trait Cas: Send + Sync {
    async fn upload(
        &self,
        root: &Path,
        paths: &[String],
        excludes: &[String],
    ) -> Result<String, ExternalError>;
}

/// One reported executor completion event, consumed by the state machine
/// to drive task transitions (§4.3, §6).
#[derive(Debug, Clone)]
pub struct ExecutorEvent {
    pub executor_task_id: String,
    pub status: ExecutorEventStatus,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub output_digest: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorEventStatus {
    Started,
    Success,
    Failure,
    Mishap,
}

/// On-demand runtime stats for `GetTask(includeStats=true)` (§6).
#[derive(Debug, Clone, Default)]
pub struct ExecutorStats {
    pub cpu_seconds: Option<f64>,
    pub wall_seconds: Option<f64>,
    pub exit_code: Option<i32>,
}

/// The execution backend: reports free capacity, accepts dispatches, and
/// answers on-demand result queries. The scheduler never talks to workers
/// directly; everything about the backend's own queueing and retry
/// semantics is the implementer's concern.
#[async_trait]
pub trait Executor: Send + Sync {
    /// A tag identifying which backend this is, matched against the
    /// tag carried by a `TaskSpec`'s dimensions (the "backend tag"
    /// design note, §9).
    fn backend_tag(&self) -> &str;

    /// Current free capacity for a dimension set (e.g. `os=linux,
    /// cpu=x86-64`). The scheduler treats this as a hint, not a
    /// reservation -- concurrent dispatches can still race it.
    async fn free_capacity(&self, dimensions: &[(String, String)]) -> Result<u32, ExternalError>;

    /// Dispatch one task. Returns the executor-assigned task ID used to
    /// correlate subsequent completion events.
    async fn dispatch(
        &self,
        task_spec: &TaskSpec,
        resolved_cas_digest: Option<&str>,
        task_id: uuid::Uuid,
    ) -> Result<String, ExternalError>;

    /// On-demand detail for a single executor task, optionally including
    /// runtime stats (§6, `GetTask.includeStats`).
    async fn query_result(
        &self,
        executor_task_id: &str,
        include_stats: bool,
    ) -> Result<Option<ExecutorStats>, ExternalError>;
}
