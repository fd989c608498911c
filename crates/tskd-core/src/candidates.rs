//! Candidate derivation (§4.2): converts non-terminal jobs, their
//! resolved `TasksCfg`s, and the tasks already on file into the set of
//! `(task-spec, RepoState)` candidates eligible for dispatch this tick.
//!
//! This module is pure and I/O-free: callers fetch jobs, configs, and
//! tasks from the persistence adapter and the Cacher, then hand them to
//! [`derive_candidates`]. Keeping derivation pure makes it directly unit
//! testable without a database (§8.1).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use tskd_db::models::{JobRow, TaskRow, TaskStatus};

use crate::repo_state::RepoState;
use crate::tasks_cfg::{TaskSpec, TasksCfg};

/// A non-terminal job paired with its resolved pipeline definition. The
/// caller is responsible for invoking the Cacher (§4.1) to get here; a
/// job whose `RepoState` hasn't resolved yet (or resolved to a permanent
/// error) is simply omitted from the slice passed to
/// [`derive_candidates`].
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: JobRow,
    pub cfg: TasksCfg,
}

/// A `(task-spec, RepoState)` pair eligible for dispatch this tick, with
/// everything the scorer (§4.2) needs already attached.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub repo_state: RepoState,
    pub name: String,
    pub task_spec: TaskSpec,
    /// `TaskSpec.priority * max(JobSpec.priority over parent jobs)`.
    pub priority: f64,
    /// Every job whose closure needs this candidate (dedup, §4.2).
    pub parent_job_ids: Vec<Uuid>,
    /// Earliest `created` among parent jobs -- the age term is bounded
    /// by how long the *oldest* waiting job has been stuck (§4.2).
    pub oldest_job_created: DateTime<Utc>,
    /// `attempt` this candidate would run as if dispatched.
    pub attempt: u32,
    /// Set when this candidate is a retry of a prior terminal attempt.
    pub retry_of: Option<Uuid>,
    /// The resolved digest for `task_spec.cas_spec`, looked up from the
    /// job's `TasksCfg.cas_specs` (the Cacher resolves these before
    /// caching, §4.1 step 3). `None` if the task spec names no CAS spec.
    pub cas_digest: Option<String>,
}

impl Candidate {
    pub fn is_try_job(&self) -> bool {
        self.repo_state.is_try_job()
    }

    pub fn is_retry(&self) -> bool {
        self.retry_of.is_some()
    }
}

/// Key used to dedup/group existing tasks and candidates: a `(repo,
/// revision, patch issue, name)` tuple. Two jobs at the same `RepoState`
/// needing the same task-spec name collapse onto one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TaskKey {
    repo: String,
    revision: String,
    patch_issue: Option<String>,
    name: String,
}

fn task_key_for_row(row: &TaskRow) -> TaskKey {
    TaskKey {
        repo: row.repo.clone(),
        revision: row.revision.clone(),
        patch_issue: row.patch_issue.clone(),
        name: row.name.clone(),
    }
}

fn task_key_for(repo_state: &RepoState, name: &str) -> TaskKey {
    TaskKey {
        repo: repo_state.repo.clone(),
        revision: repo_state.revision.clone(),
        patch_issue: repo_state.patch.as_ref().map(|p| p.issue.clone()),
        name: name.to_string(),
    }
}

/// Derive and dedup the candidate set from a tick's snapshot.
///
/// `existing_tasks` should cover every task whose `(repo, revision,
/// patch)` matches one of `jobs`' `RepoState`s -- the caller typically
/// gets this via `tskd_db::queries::tasks::list_by_repo_state_and_name`
/// per distinct `(RepoState, name)`, or a broader range query narrowed in
/// memory.
pub fn derive_candidates(jobs: &[JobContext], existing_tasks: &[TaskRow]) -> Vec<Candidate> {
    let mut by_key: HashMap<TaskKey, Vec<&TaskRow>> = HashMap::new();
    for row in existing_tasks {
        by_key.entry(task_key_for_row(row)).or_default().push(row);
    }

    let mut candidates: HashMap<TaskKey, Candidate> = HashMap::new();

    for ctx in jobs {
        let Some(revision) = job_revision(&ctx.job) else {
            continue; // REQUESTED job with no resolved revision yet.
        };
        let repo_state = RepoState {
            repo: ctx.job.repo.clone(),
            revision: revision.to_string(),
            patch: job_patch(&ctx.job),
        };

        let Some(closure) = ctx.cfg.closure_for_job(&ctx.job.name) else {
            continue; // Job references a job-spec the config no longer has.
        };

        for name in &closure {
            let Some(task_spec) = ctx.cfg.tasks.get(name) else {
                continue;
            };
            let key = task_key_for(&repo_state, name);
            let existing = by_key.get(&key).map(|v| v.as_slice()).unwrap_or(&[]);

            let Some((attempt, retry_of)) =
                next_attempt_for(task_spec, existing, &closure, &ctx.cfg, &by_key, &repo_state)
            else {
                continue;
            };

            let cas_digest = task_spec
                .cas_spec
                .as_ref()
                .and_then(|cas_name| ctx.cfg.cas_specs.get(cas_name))
                .map(|spec| spec.digest.clone());

            candidates
                .entry(key)
                .and_modify(|c| {
                    c.priority = c.priority.max(task_spec.priority * ctx.job.priority);
                    if !c.parent_job_ids.contains(&ctx.job.id) {
                        c.parent_job_ids.push(ctx.job.id);
                    }
                    if ctx.job.created_at < c.oldest_job_created {
                        c.oldest_job_created = ctx.job.created_at;
                    }
                })
                .or_insert_with(|| Candidate {
                    repo_state: repo_state.clone(),
                    name: name.clone(),
                    task_spec: task_spec.clone(),
                    priority: task_spec.priority * ctx.job.priority,
                    parent_job_ids: vec![ctx.job.id],
                    oldest_job_created: ctx.job.created_at,
                    attempt,
                    retry_of,
                    cas_digest,
                });
        }
    }

    candidates.into_values().collect()
}

fn job_revision(job: &JobRow) -> Option<&str> {
    job.revision.as_deref()
}

fn job_patch(job: &JobRow) -> Option<crate::repo_state::Patch> {
    let issue = job.patch_issue.clone()?;
    Some(crate::repo_state::Patch {
        issue,
        patchset: job.patch_patchset.clone().unwrap_or_default(),
        server: job.patch_server.clone().unwrap_or_default(),
        patch_repo: job.patch_repo.clone(),
    })
}

/// Decide whether `name` needs a candidate, and if so at what attempt
/// number (§4.2 step 2, §4.3 retry policy). Returns `None` if `name` is
/// already covered (success, in flight, or retries exhausted with no
/// eligible retry).
fn next_attempt_for(
    task_spec: &TaskSpec,
    existing: &[&TaskRow],
    closure: &std::collections::HashSet<String>,
    cfg: &TasksCfg,
    by_key: &HashMap<TaskKey, Vec<&TaskRow>>,
    repo_state: &RepoState,
) -> Option<(u32, Option<Uuid>)> {
    if existing
        .iter()
        .any(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Running))
    {
        return None; // in flight
    }
    if existing.iter().any(|t| t.status == TaskStatus::Success) {
        return None; // satisfied
    }

    if existing.is_empty() {
        if deps_satisfied(task_spec, closure, cfg, by_key, repo_state) {
            return Some((0, None));
        }
        return None;
    }

    // Every existing attempt is terminal FAILURE/MISHAP. Consider a retry
    // of the most recent one.
    let latest = existing.iter().max_by_key(|t| t.attempt)?;
    let next_attempt = latest.attempt as u32 + 1;
    if next_attempt >= task_spec.max_attempts {
        return None; // retries exhausted
    }

    let eligible = match latest.status {
        TaskStatus::Mishap => true,
        TaskStatus::Failure => task_spec.retry_on_failure,
        _ => false,
    };
    if !eligible {
        return None;
    }

    Some((next_attempt, Some(latest.id)))
}

/// Every dependency of `name` must have a `SUCCESS` task at this
/// `RepoState` (§4.2 step 2). Dependencies outside the job's own closure
/// are treated as already satisfied (they are not this job's
/// responsibility -- a `TasksCfg` bug, not a scheduling one).
fn deps_satisfied(
    task_spec: &TaskSpec,
    closure: &std::collections::HashSet<String>,
    cfg: &TasksCfg,
    by_key: &HashMap<TaskKey, Vec<&TaskRow>>,
    repo_state: &RepoState,
) -> bool {
    for dep in &task_spec.dependencies {
        if !closure.contains(dep) {
            continue;
        }
        if !cfg.tasks.contains_key(dep) {
            return false;
        }
        let key = task_key_for(repo_state, dep);
        let satisfied = by_key
            .get(&key)
            .is_some_and(|rows| rows.iter().any(|t| t.status == TaskStatus::Success));
        if !satisfied {
            return false;
        }
    }
    true
}
