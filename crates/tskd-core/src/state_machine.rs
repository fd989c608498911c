//! Task/Job state machine and blamelist attribution (§4.3).
//!
//! This module is pure: it computes *what* a transition should look
//! like (next status, blamelist, rolled-up job status) from an in-memory
//! snapshot. Applying a transition durably -- the compare-and-set dance
//! against `db_modified` -- lives in the scheduler, which re-reads and
//! retries on a lost race (§7, "Scheduling conflict").

use thiserror::Error;

use tskd_db::models::{JobStatus, TaskRow, TaskStatus};

use crate::commit_graph::CommitGraph;
use crate::tasks_cfg::TaskSpec;

/// Errors from attempting an invalid task/job transition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("task is already in a terminal state ({0})")]
    AlreadyTerminal(TaskStatus),
    #[error("cannot transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
}

/// Validate (without applying) a task status transition per the table in
/// §4.3. Terminal states are absorbing; any further event for that task
/// is rejected here so the caller can log-and-ignore it instead of
/// silently re-persisting.
pub fn validate_task_transition(from: TaskStatus, to: TaskStatus) -> Result<(), TransitionError> {
    if from.is_terminal() {
        return Err(TransitionError::AlreadyTerminal(from));
    }
    let allowed = matches!(
        (from, to),
        (TaskStatus::Pending, TaskStatus::Running)
            | (TaskStatus::Pending, TaskStatus::Mishap)
            | (TaskStatus::Running, TaskStatus::Success)
            | (TaskStatus::Running, TaskStatus::Failure)
            | (TaskStatus::Running, TaskStatus::Mishap)
    );
    if !allowed {
        return Err(TransitionError::InvalidTransition { from, to });
    }
    Ok(())
}

/// Compute the blamelist for a task entering `SUCCESS` (§4.3).
///
/// Walks the first-parent chain backwards from `revision`, stopping at
/// the most recent commit already covered by a prior `SUCCESS` task of
/// the same `(repo, name)` (`prior_tip`, if any), or after
/// `max_window` commits. Try-job tasks never contribute to blamelist
/// coverage and always get an empty result regardless of the graph.
pub fn compute_blamelist(
    graph: &CommitGraph,
    revision: &str,
    prior_tip: Option<&str>,
    max_window: usize,
    is_try_job: bool,
) -> Vec<String> {
    if is_try_job {
        return Vec::new();
    }
    graph.first_parent_chain(revision, prior_tip, max_window)
}

/// The most recent commit covered by any prior `SUCCESS` task for
/// `(repo, name)`, used as the `stop_at` bound for [`compute_blamelist`].
/// `prior_successes` should be ordered most-recent-first (the shape
/// `tskd_db::queries::tasks::list_success_no_patch` returns).
pub fn prior_blamelist_tip(prior_successes: &[TaskRow]) -> Option<String> {
    prior_successes.iter().find_map(|t| t.commits.first().cloned())
}

/// Whether `latest` (the most recent, terminal `MISHAP`/`FAILURE`
/// attempt for some name) still has a retry coming per the policy in
/// §4.3: `MISHAP` is always retry-eligible below `max_attempts`;
/// `FAILURE` only if the spec opts in via `retry_on_failure`. Mirrors
/// `candidates::next_attempt_for`'s eligibility check so the rollup and
/// the candidate deriver never disagree about whether a name is "done".
/// A name with no spec in the resolved config (a dangling reference the
/// Cacher should have rejected already) is treated as exhausted rather
/// than panicking.
fn retry_still_eligible(latest: &TaskRow, spec: Option<&TaskSpec>) -> bool {
    let Some(spec) = spec else {
        return false;
    };
    let next_attempt = latest.attempt as u32 + 1;
    if next_attempt >= spec.max_attempts {
        return false;
    }
    match latest.status {
        TaskStatus::Mishap => true,
        TaskStatus::Failure => spec.retry_on_failure,
        _ => false,
    }
}

/// Recompute a job's rolled-up status from the terminal/non-terminal
/// status of its required tasks (§4.3). `tasks_by_name` holds every
/// attempt row for every name in the job's closure; `closure` names the
/// full set of required task-spec names (may be empty); `specs` carries
/// the resolved `TaskSpec` for each entry of `closure` in the same
/// order, so a name whose latest attempt is `MISHAP`/`FAILURE` but still
/// has a retry coming (§4.3 retry policy) reads as `IN_PROGRESS` rather
/// than being rolled up to a terminal status prematurely.
pub fn rollup_job_status(
    closure: &[String],
    tasks_by_name: &[Vec<TaskRow>],
    specs: &[Option<&TaskSpec>],
) -> JobStatus {
    if closure.is_empty() {
        return JobStatus::Success;
    }

    let mut any_mishap_final = false;
    let mut any_failure_final = false;
    let mut all_have_success = true;

    for (attempts, spec) in tasks_by_name.iter().zip(specs.iter()) {
        if attempts.iter().any(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Running)) {
            return JobStatus::InProgress;
        }
        let has_success = attempts.iter().any(|t| t.status == TaskStatus::Success);
        if has_success {
            continue;
        }
        all_have_success = false;

        let Some(latest) = attempts.iter().max_by_key(|t| t.attempt) else {
            // No attempts at all yet for this name: still waiting on
            // dependencies or scheduling, i.e. in progress.
            return JobStatus::InProgress;
        };
        match latest.status {
            TaskStatus::Mishap | TaskStatus::Failure if retry_still_eligible(latest, *spec) => {
                return JobStatus::InProgress;
            }
            TaskStatus::Mishap => any_mishap_final = true,
            TaskStatus::Failure => any_failure_final = true,
            TaskStatus::Pending | TaskStatus::Running | TaskStatus::Success => {
                return JobStatus::InProgress;
            }
        }
    }

    if all_have_success {
        JobStatus::Success
    } else if any_mishap_final {
        JobStatus::Mishap
    } else if any_failure_final {
        JobStatus::Failure
    } else {
        JobStatus::InProgress
    }
}
