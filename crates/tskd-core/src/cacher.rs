//! The Task-Cfg Cacher (§4.1): resolves `RepoState -> TasksCfg` exactly
//! once per distinct `RepoState`, negative-caching permanent failures and
//! retrying transient ones.
//!
//! The per-`rs` "lazy resolver" is a keyed table of single-resolution
//! futures: one `tokio::sync::OnceCell` per distinct `RepoState` digest,
//! held behind a short-lived `std::sync::Mutex` guarding only the table
//! itself, never the resolution work -- a narrow critical section that's
//! released before any I/O starts. A second scheduler process does not
//! share this in-process table; cross-process at-most-once-ness
//! additionally relies on `tasks_cfg_cache`'s `INSERT ... ON CONFLICT DO
//! NOTHING` semantics (`tskd_db::queries::tasks_cfg_cache`), so a losing
//! concurrent writer discards its own resolved value and re-reads the
//! winner's row instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use thiserror::Error;
use tokio::sync::OnceCell;

use tskd_db::queries::tasks_cfg_cache;
use tskd_db::models::TasksCfgCacheRow;

use crate::external::{Cas, CodeReview, ExternalError, PatchApplier, ReadFileAtRef, Syncer};
use crate::repo_state::RepoState;
use crate::tasks_cfg::{parse_tasks_cfg, TasksCfg, TasksCfgParseError};

/// Path, relative to the repo root, at which the pipeline definition is
/// expected to live.
pub const TASKS_CFG_PATH: &str = "infra/config/tasks.toml";

/// A fixed list of substrings that, when present in a lower-level error
/// message, indicate the failure is permanent rather than transient
/// (§4.1 error taxonomy). This textual-match fallback exists because not
/// every upstream collaborator distinguishes the two cleanly; `ReadFileAtRef`
/// in particular surfaces host errors as opaque strings.
const PERMANENT_ERROR_SUBSTRINGS: &[&str] = &[
    "no such revision",
    "unknown revision",
    "does not exist",
    "misconfigured",
];

/// Errors returned by [`TasksCfgCacher::get_or_cache`]. Stored (as a
/// negative cache entry) iff [`CachedError::is_permanent`] is true.
#[derive(Debug, Error, Clone)]
pub enum CachedError {
    #[error("pipeline file not found at {path:?} for revision {revision:?}")]
    PipelineFileMissing { path: String, revision: String },

    #[error("patch does not apply to pipeline file: {0}")]
    PatchRejected(String),

    #[error("pipeline file is not valid: {0}")]
    InvalidConfig(String),

    #[error("source revision unreachable: {0}")]
    RevisionUnreachable(String),

    #[error("gclient_gn_args_from misconfigured: {0}")]
    GclientMisconfigured(String),

    #[error("permanent error: {0}")]
    OtherPermanent(String),

    #[error("transient error: {0}")]
    Transient(String),
}

impl CachedError {
    /// Whether this error belongs in the negative cache (§4.1, §7).
    pub fn is_permanent(&self) -> bool {
        !matches!(self, CachedError::Transient(_))
    }

    /// A short, stable tag used as the `error_kind` column
    /// (`tskd_db::models::TasksCfgCacheRow`).
    pub fn kind(&self) -> &'static str {
        match self {
            CachedError::PipelineFileMissing { .. } => "pipeline_file_missing",
            CachedError::PatchRejected(_) => "patch_rejected",
            CachedError::InvalidConfig(_) => "invalid_config",
            CachedError::RevisionUnreachable(_) => "revision_unreachable",
            CachedError::GclientMisconfigured(_) => "gclient_misconfigured",
            CachedError::OtherPermanent(_) => "other_permanent",
            CachedError::Transient(_) => "transient",
        }
    }

    fn from_external(err: ExternalError) -> Self {
        match err {
            ExternalError::NotFound(msg) => CachedError::RevisionUnreachable(msg),
            ExternalError::PatchRejected(msg) => CachedError::PatchRejected(msg),
            ExternalError::Permanent(msg) => classify_permanent_text(&msg),
            ExternalError::Transient(msg) => CachedError::Transient(msg),
        }
    }
}

fn classify_permanent_text(msg: &str) -> CachedError {
    let lower = msg.to_ascii_lowercase();
    if PERMANENT_ERROR_SUBSTRINGS
        .iter()
        .any(|needle| lower.contains(needle))
    {
        if lower.contains("gclient_gn_args_from") {
            return CachedError::GclientMisconfigured(msg.to_string());
        }
        return CachedError::RevisionUnreachable(msg.to_string());
    }
    CachedError::OtherPermanent(msg.to_string())
}

impl From<TasksCfgParseError> for CachedError {
    fn from(err: TasksCfgParseError) -> Self {
        CachedError::InvalidConfig(err.to_string())
    }
}

/// Either a resolved config or a stored permanent error, as read back
/// from the cache.
#[derive(Debug, Clone)]
pub enum CacheOutcome {
    Resolved(TasksCfg),
    Error(CachedError),
}

/// The Task-Cfg Cacher: resolves and caches `TasksCfg` per `RepoState`.
pub struct TasksCfgCacher {
    pool: sqlx::PgPool,
    read_file: Arc<dyn ReadFileAtRef>,
    code_review: Arc<dyn CodeReview>,
    patch_applier: Arc<dyn PatchApplier>,
    syncer: Arc<dyn Syncer>,
    cas: Arc<dyn Cas>,
    // Per-digest single-resolution futures. Entries are never removed:
    // once a `RepoState` resolves (successfully or not), later lookups
    // hit the durable cache directly via `get_or_cache`'s first step, so
    // the table's steady-state size is bounded by the set of distinct
    // `RepoState`s seen since process start, not by request volume.
    in_flight: StdMutex<HashMap<String, Arc<OnceCell<Result<TasksCfg, CachedError>>>>>,
}

impl TasksCfgCacher {
    pub fn new(
        pool: sqlx::PgPool,
        read_file: Arc<dyn ReadFileAtRef>,
        code_review: Arc<dyn CodeReview>,
        patch_applier: Arc<dyn PatchApplier>,
        syncer: Arc<dyn Syncer>,
        cas: Arc<dyn Cas>,
    ) -> Self {
        Self {
            pool,
            read_file,
            code_review,
            patch_applier,
            syncer,
            cas,
            in_flight: StdMutex::new(HashMap::new()),
        }
    }

    /// Resolve `rs` to a `TasksCfg`, or return a (possibly cached) error.
    /// Guarantees at-most-once resolution per `RepoState` (§4.1, §8).
    pub async fn get_or_cache(&self, rs: &RepoState) -> Result<TasksCfg, CachedError> {
        let digest = rs.digest();

        // Step 1: durable cache lookup.
        if let Some(outcome) = self.read_durable(&digest).await {
            return match outcome {
                CacheOutcome::Resolved(cfg) => Ok(cfg),
                CacheOutcome::Error(err) => Err(err),
            };
        }

        // Step 2: acquire (or join) the per-digest lazy resolver.
        let cell = {
            let mut table = self.in_flight.lock().expect("in_flight mutex poisoned");
            table
                .entry(digest.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell
            .get_or_init(|| async { self.resolve_and_persist(rs, &digest).await })
            .await
            .clone();

        // A transient error must not poison the cell for future callers
        // within this process: remove it so the next call retries.
        if let Err(CachedError::Transient(_)) = &result {
            let mut table = self.in_flight.lock().expect("in_flight mutex poisoned");
            table.remove(&digest);
        }

        result
    }

    async fn read_durable(&self, digest: &str) -> Option<CacheOutcome> {
        let row = tasks_cfg_cache::get(&self.pool, digest).await.ok()??;
        Some(row_to_outcome(row))
    }

    /// Steps 2-4 of §4.1's resolution algorithm, run under the in-process
    /// lock's narrow critical section.
    async fn resolve_and_persist(
        &self,
        rs: &RepoState,
        digest: &str,
    ) -> Result<TasksCfg, CachedError> {
        // Another process may have already resolved this digest between
        // our durable miss and acquiring the lazy resolver; re-check.
        if let Some(outcome) = self.read_durable(digest).await {
            return match outcome {
                CacheOutcome::Resolved(cfg) => Ok(cfg),
                CacheOutcome::Error(err) => Err(err),
            };
        }

        let result = self.resolve(rs).await;

        match &result {
            Ok(cfg) => {
                let json = serde_json::to_value(cfg)
                    .map_err(|e| CachedError::InvalidConfig(e.to_string()))?;
                // Best-effort: a persistence failure here is itself
                // transient (§7); the caller still gets the resolved
                // value for this tick, just not a durable cache hit.
                let _ = tasks_cfg_cache::insert_resolved(&self.pool, digest, &json).await;
            }
            Err(err) if err.is_permanent() => {
                let _ = tasks_cfg_cache::insert_error(
                    &self.pool,
                    digest,
                    err.kind(),
                    &err.to_string(),
                )
                .await;
            }
            Err(_) => {
                // Transient: never cached (§4.1).
            }
        }

        result
    }

    /// §4.1 step 2-3: read the tip content, apply a patch diff if the
    /// patched file is among those the patch touches, parse and
    /// validate, then resolve any unresolved CAS specs.
    async fn resolve(&self, rs: &RepoState) -> Result<TasksCfg, CachedError> {
        let tip_bytes = self
            .read_file
            .read_file_at_ref(&rs.repo, &rs.revision, TASKS_CFG_PATH)
            .await
            .map_err(|e| match e {
                ExternalError::NotFound(_) => CachedError::PipelineFileMissing {
                    path: TASKS_CFG_PATH.to_string(),
                    revision: rs.revision.clone(),
                },
                other => CachedError::from_external(other),
            })?;

        let content_bytes = if let Some(patch) = &rs.patch {
            let changed = self
                .code_review
                .get_changed_files(&patch.issue, &patch.patchset)
                .await
                .map_err(CachedError::from_external)?;

            if changed.iter().any(|f| f == TASKS_CFG_PATH) {
                let diff = self
                    .code_review
                    .get_patch(&patch.issue, &patch.patchset, TASKS_CFG_PATH)
                    .await
                    .map_err(CachedError::from_external)?;

                self.patch_applier
                    .apply(&tip_bytes, &diff, TASKS_CFG_PATH)
                    .map_err(CachedError::from_external)?
            } else {
                tip_bytes
            }
        } else {
            tip_bytes
        };

        let content = String::from_utf8(content_bytes)
            .map_err(|e| CachedError::InvalidConfig(format!("pipeline file is not UTF-8: {e}")))?;

        let mut cfg = parse_tasks_cfg(&content)?;

        self.resolve_cas_specs(rs, &mut cfg).await?;

        Ok(cfg)
    }

    /// §4.1 step 3: materialize a worktree only if at least one CAS spec
    /// still needs a digest. The overwhelming common case (no CAS specs,
    /// or all already resolved) skips the worktree and upload entirely.
    async fn resolve_cas_specs(
        &self,
        rs: &RepoState,
        cfg: &mut TasksCfg,
    ) -> Result<(), CachedError> {
        let needs_resolution = cfg.cas_specs.values().any(|spec| !spec.is_resolved());
        if !needs_resolution {
            return Ok(());
        }

        let worktree = self
            .syncer
            .sync(
                &rs.repo,
                &rs.revision,
                rs.patch.as_ref().map(|p| p.issue.as_str()),
                rs.patch.as_ref().map(|p| p.patchset.as_str()),
            )
            .await
            .map_err(CachedError::from_external)?;

        for spec in cfg.cas_specs.values_mut() {
            if spec.is_resolved() {
                continue;
            }
            let root = worktree.path.join(&spec.root);
            let digest = self
                .cas
                .upload(&root, &spec.paths, &spec.excludes)
                .await
                .map_err(CachedError::from_external)?;
            spec.digest = digest;
        }

        Ok(())
    }
}

fn row_to_outcome(row: TasksCfgCacheRow) -> CacheOutcome {
    if let Some(json) = row.tasks_cfg_json {
        match serde_json::from_value::<TasksCfg>(json) {
            Ok(cfg) => CacheOutcome::Resolved(cfg),
            Err(e) => CacheOutcome::Error(CachedError::InvalidConfig(format!(
                "corrupt cache row: {e}"
            ))),
        }
    } else {
        let message = row.error_message.unwrap_or_default();
        let err = match row.error_kind.as_deref() {
            Some("pipeline_file_missing") => CachedError::PipelineFileMissing {
                path: TASKS_CFG_PATH.to_string(),
                revision: String::new(),
            },
            Some("patch_rejected") => CachedError::PatchRejected(message),
            Some("invalid_config") => CachedError::InvalidConfig(message),
            Some("revision_unreachable") => CachedError::RevisionUnreachable(message),
            Some("gclient_misconfigured") => CachedError::GclientMisconfigured(message),
            _ => CachedError::OtherPermanent(message),
        };
        CacheOutcome::Error(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_not_permanent() {
        let err = CachedError::Transient("auth refresh failed".to_string());
        assert!(!err.is_permanent());
    }

    #[test]
    fn permanent_errors_report_permanent() {
        let variants = [
            CachedError::PipelineFileMissing {
                path: "x".into(),
                revision: "r".into(),
            },
            CachedError::PatchRejected("x".into()),
            CachedError::InvalidConfig("x".into()),
            CachedError::RevisionUnreachable("x".into()),
            CachedError::GclientMisconfigured("x".into()),
            CachedError::OtherPermanent("x".into()),
        ];
        for v in &variants {
            assert!(v.is_permanent(), "{v:?} should be permanent");
        }
    }

    #[test]
    fn classify_permanent_text_detects_known_substrings() {
        let err = classify_permanent_text("unknown revision abc123");
        assert!(matches!(err, CachedError::RevisionUnreachable(_)));

        let err = classify_permanent_text("gclient_gn_args_from target misconfigured");
        assert!(matches!(err, CachedError::GclientMisconfigured(_)));

        let err = classify_permanent_text("totally unrelated failure");
        assert!(matches!(err, CachedError::OtherPermanent(_)));
    }

    #[test]
    fn error_kind_is_stable() {
        assert_eq!(
            CachedError::InvalidConfig("x".into()).kind(),
            "invalid_config"
        );
        assert_eq!(CachedError::Transient("x".into()).kind(), "transient");
    }
}
