//! The scheduler loop (§2 data flow, §5 concurrency model): one tick
//! resolves configs, derives candidates, filters skipped ones, scores,
//! requests executor capacity, and dispatches up to that capacity.
//!
//! The tick is a single async function fanning out cancellable
//! sub-operations: a `CancellationToken` for graceful shutdown and a
//! bounded wall-clock deadline per tick (§5, "Cancellation & timeouts").

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tskd_db::models::JobStatus;
use tskd_db::queries::{job_tasks, jobs, tasks};

use crate::cacher::TasksCfgCacher;
use crate::candidates::{self, Candidate, JobContext};
use crate::clock::Clock;
use crate::commit_graph::CommitGraph;
use crate::config::SchedulerConfig;
use crate::external::Executor;
use crate::scoring;
use crate::skip_rules::SkipRuleEngine;
use crate::state_machine::prior_blamelist_tip;

/// Per-repo commit graph snapshots, one `tokio::sync::watch` subscription
/// per repo (§5, §9). Registering a repo twice replaces its receiver.
#[derive(Default)]
pub struct CommitGraphRegistry {
    receivers: RwLock<HashMap<String, watch::Receiver<Arc<CommitGraph>>>>,
}

impl CommitGraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, repo: impl Into<String>, rx: watch::Receiver<Arc<CommitGraph>>) {
        self.receivers
            .write()
            .expect("commit graph registry poisoned")
            .insert(repo.into(), rx);
    }

    pub fn snapshot(&self, repo: &str) -> Option<Arc<CommitGraph>> {
        self.receivers
            .read()
            .expect("commit graph registry poisoned")
            .get(repo)
            .map(|rx| rx.borrow().clone())
    }
}

/// Outcome of one tick, returned for logging/testing (§8).
#[derive(Debug, Default, Clone)]
pub struct TickReport {
    pub candidates_considered: usize,
    pub candidates_skipped_by_rule: usize,
    pub tasks_dispatched: usize,
    pub jobs_marked_mishap: usize,
}

pub struct Scheduler {
    pool: sqlx::PgPool,
    cacher: Arc<TasksCfgCacher>,
    skip_rules: Arc<SkipRuleEngine>,
    graphs: Arc<CommitGraphRegistry>,
    executors: Vec<Arc<dyn Executor>>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        pool: sqlx::PgPool,
        cacher: Arc<TasksCfgCacher>,
        skip_rules: Arc<SkipRuleEngine>,
        graphs: Arc<CommitGraphRegistry>,
        executors: Vec<Arc<dyn Executor>>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            pool,
            cacher,
            skip_rules,
            graphs,
            executors,
            clock,
            config,
        }
    }

    /// Run one tick, bounded by `config.tick_deadline` and abandonable via
    /// `cancel`. Abandoned in-flight resolutions are transient and are
    /// simply retried on the next tick (§5).
    pub async fn tick(&self, cancel: &CancellationToken) -> anyhow::Result<TickReport> {
        tokio::select! {
            result = tokio::time::timeout(self.config.tick_deadline, self.run_tick()) => {
                match result {
                    Ok(report) => report,
                    Err(_) => {
                        warn!(deadline_secs = self.config.tick_deadline.as_secs(), "tick exceeded deadline, abandoning in-flight work");
                        Ok(TickReport::default())
                    }
                }
            }
            _ = cancel.cancelled() => {
                info!("tick canceled");
                Ok(TickReport::default())
            }
        }
    }

    async fn run_tick(&self) -> anyhow::Result<TickReport> {
        let mut report = TickReport::default();

        let non_terminal = jobs::list_non_terminal(&self.pool).await?;
        let mut job_contexts = Vec::new();
        for job in non_terminal {
            let Some(revision) = job.revision.clone() else {
                continue; // still waiting on an external revision resolver.
            };
            let repo_state = crate::repo_state::RepoState {
                repo: job.repo.clone(),
                revision,
                patch: job_patch(&job),
            };

            match self.cacher.get_or_cache(&repo_state).await {
                Ok(cfg) => job_contexts.push(JobContext { job, cfg }),
                Err(err) if err.is_permanent() => {
                    self.mark_job_mishap(&job, &err.to_string()).await?;
                    report.jobs_marked_mishap += 1;
                }
                Err(_) => {
                    // Transient: this job simply doesn't participate this tick.
                }
            }
        }

        let existing_tasks = self.load_existing_tasks(&job_contexts).await?;
        let derived = candidates::derive_candidates(&job_contexts, &existing_tasks);
        report.candidates_considered = derived.len();

        let filtered = self.skip_rules.filter_candidates(derived);
        report.candidates_skipped_by_rule = report.candidates_considered - filtered.len();

        let blamelist_lens = self.blamelist_lens(&filtered).await;
        let now = self.clock.now();
        let ranked = scoring::rank(&filtered, &blamelist_lens, now, &self.config.scoring);

        let dispatched = self.select_and_dispatch(ranked).await?;
        report.tasks_dispatched = dispatched;

        Ok(report)
    }

    async fn mark_job_mishap(&self, job: &tskd_db::models::JobRow, message: &str) -> anyhow::Result<()> {
        let rows = jobs::transition_status(
            &self.pool,
            job.id,
            job.db_modified,
            JobStatus::Mishap,
            None,
            Some(self.clock.now()),
        )
        .await?;
        if rows == 0 {
            warn!(job_id = %job.id, "lost race marking job mishap; another writer already transitioned it");
        } else {
            warn!(job_id = %job.id, error = message, "job marked mishap: unresolvable tasks config");
        }
        Ok(())
    }

    async fn load_existing_tasks(&self, job_contexts: &[JobContext]) -> anyhow::Result<Vec<tskd_db::models::TaskRow>> {
        let mut seen = std::collections::HashSet::new();
        let mut all = Vec::new();
        for ctx in job_contexts {
            let Some(revision) = ctx.job.revision.as_deref() else {
                continue;
            };
            let Some(closure) = ctx.cfg.closure_for_job(&ctx.job.name) else {
                continue;
            };
            for name in &closure {
                let key = (ctx.job.repo.clone(), revision.to_string(), ctx.job.patch_issue.clone(), name.clone());
                if !seen.insert(key) {
                    continue;
                }
                let rows = tasks::list_by_repo_state_and_name(
                    &self.pool,
                    &ctx.job.repo,
                    revision,
                    ctx.job.patch_issue.as_deref(),
                    name,
                )
                .await?;
                all.extend(rows);
            }
        }
        Ok(all)
    }

    async fn blamelist_lens(&self, candidates: &[Candidate]) -> Vec<usize> {
        let mut lens = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let len = match self.graphs.snapshot(&candidate.repo_state.repo) {
                Some(graph) => {
                    let prior_tip = tasks::list_success_no_patch(&self.pool, &candidate.repo_state.repo, &candidate.name)
                        .await
                        .ok()
                        .and_then(|rows| prior_blamelist_tip(&rows));
                    graph
                        .first_parent_chain(
                            &candidate.repo_state.revision,
                            prior_tip.as_deref(),
                            self.config.blamelist_max_window,
                        )
                        .len()
                }
                None => 0,
            };
            lens.push(len);
        }
        lens
    }

    /// Greedily select candidates in ranked order, reserving executor
    /// capacity in-memory per distinct dimension set as it's spent (§4.2,
    /// "Selection").
    async fn select_and_dispatch(&self, ranked: Vec<&Candidate>) -> anyhow::Result<usize> {
        let mut remaining_capacity: HashMap<Vec<(String, String)>, u32> = HashMap::new();
        let mut dispatched = 0;

        for candidate in ranked {
            let dims = candidate.task_spec.dimensions.clone();
            let capacity = match remaining_capacity.get(&dims) {
                Some(&c) => c,
                None => {
                    let fetched = self.free_capacity_for(&dims).await;
                    remaining_capacity.insert(dims.clone(), fetched);
                    fetched
                }
            };
            if capacity == 0 {
                continue;
            }

            if self.dispatch_one(candidate).await? {
                remaining_capacity.insert(dims, capacity - 1);
                dispatched += 1;
            }
        }

        Ok(dispatched)
    }

    async fn free_capacity_for(&self, dims: &[(String, String)]) -> u32 {
        let Some(executor) = self.executor_for(dims) else {
            return 0;
        };
        executor.free_capacity(dims).await.unwrap_or(0)
    }

    fn executor_for(&self, dims: &[(String, String)]) -> Option<&Arc<dyn Executor>> {
        let tag = dims.iter().find(|(k, _)| k == "backend").map(|(_, v)| v.as_str());
        match tag {
            Some(tag) => self.executors.iter().find(|e| e.backend_tag() == tag),
            None => self.executors.first(),
        }
    }

    /// Insert the task row, link it to every parent job, and dispatch it
    /// to the executor. Returns `true` if a task was actually created.
    async fn dispatch_one(&self, candidate: &Candidate) -> anyhow::Result<bool> {
        let new_task = tasks::NewTask {
            repo: &candidate.repo_state.repo,
            revision: &candidate.repo_state.revision,
            patch_issue: candidate.repo_state.patch.as_ref().map(|p| p.issue.as_str()),
            patch_patchset: candidate.repo_state.patch.as_ref().map(|p| p.patchset.as_str()),
            patch_server: candidate.repo_state.patch.as_ref().map(|p| p.server.as_str()),
            patch_repo: candidate.repo_state.patch.as_ref().and_then(|p| p.patch_repo.as_deref()),
            name: &candidate.name,
            forced_job_id: None,
            attempt: candidate.attempt as i32,
            retry_of: candidate.retry_of,
        };
        let task = tasks::insert_task(&self.pool, &new_task).await?;

        for job_id in &candidate.parent_job_ids {
            job_tasks::link(&self.pool, *job_id, task.id).await?;
        }

        let Some(executor) = self.executor_for(&candidate.task_spec.dimensions) else {
            warn!(task_id = %task.id, "no executor backend matches task dimensions; leaving task pending");
            return Ok(true);
        };

        let dispatch = executor.dispatch(&candidate.task_spec, candidate.cas_digest.as_deref(), task.id);

        match tokio::time::timeout(self.config.dispatch_deadline, dispatch).await {
            Ok(Ok(executor_task_id)) => {
                let rows = tasks::begin_running(
                    &self.pool,
                    task.id,
                    task.db_modified,
                    &executor_task_id,
                    self.clock.now(),
                )
                .await?;
                if rows == 0 {
                    warn!(task_id = %task.id, "lost race transitioning dispatched task to running");
                } else {
                    info!(task_id = %task.id, executor_task_id = %executor_task_id, name = %candidate.name, "dispatched task");
                }
            }
            Ok(Err(err)) => {
                warn!(task_id = %task.id, error = %err, "dispatch failed, marking task mishap");
                if tasks::dispatch_timeout(&self.pool, task.id, task.db_modified, self.clock.now()).await? > 0 {
                    self.rollup_jobs_for_task(task.id).await?;
                }
            }
            Err(_) => {
                warn!(
                    task_id = %task.id,
                    deadline_secs = self.config.dispatch_deadline.as_secs(),
                    "dispatch deadline expired before executor confirmed receipt, marking task mishap"
                );
                if tasks::dispatch_timeout(&self.pool, task.id, task.db_modified, self.clock.now()).await? > 0 {
                    self.rollup_jobs_for_task(task.id).await?;
                }
            }
        }

        Ok(true)
    }

    /// Run ticks forever, spaced `config.tick_interval` apart, until
    /// `cancel` fires. A tick that overruns its interval (distinct from
    /// overrunning `tick_deadline`, which `tick` itself bounds) simply
    /// delays the next one rather than firing ticks back-to-back, since
    /// two overlapping ticks would double-dispatch against the same
    /// executor capacity snapshot.
    pub async fn run(&self, cancel: &CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick(cancel).await {
                        Ok(report) => info!(
                            considered = report.candidates_considered,
                            skipped = report.candidates_skipped_by_rule,
                            dispatched = report.tasks_dispatched,
                            mishaps = report.jobs_marked_mishap,
                            "tick complete"
                        ),
                        Err(err) => warn!(error = %err, "tick failed"),
                    }
                }
                _ = cancel.cancelled() => {
                    info!("scheduler loop shutting down");
                    return;
                }
            }
        }
    }

    /// Ingest one reported completion event (§4.3, §6): validate the
    /// transition, persist it via compare-and-set, recompute the
    /// blamelist on `SUCCESS`, and roll up every job the task belongs to.
    /// Returns `Ok(false)` (a no-op) if the task is already terminal or
    /// the CAS race was lost, so callers can log-and-ignore rather than
    /// treat a duplicate or stale event as an error.
    pub async fn apply_completion(&self, event: &crate::external::ExecutorEvent) -> anyhow::Result<bool> {
        use crate::external::ExecutorEventStatus;

        if event.status == ExecutorEventStatus::Started {
            return Ok(false);
        }

        let Some(task) = tasks::get_by_executor_task_id(&self.pool, &event.executor_task_id).await? else {
            warn!(executor_task_id = %event.executor_task_id, "completion event for unknown task");
            return Ok(false);
        };

        let to = match event.status {
            ExecutorEventStatus::Success => tskd_db::models::TaskStatus::Success,
            ExecutorEventStatus::Failure => tskd_db::models::TaskStatus::Failure,
            ExecutorEventStatus::Mishap => tskd_db::models::TaskStatus::Mishap,
            ExecutorEventStatus::Started => unreachable!("handled above"),
        };

        if crate::state_machine::validate_task_transition(task.status, to).is_err() {
            warn!(task_id = %task.id, from = %task.status, to = %to, "ignoring invalid completion event");
            return Ok(false);
        }

        let commits = if to == tskd_db::models::TaskStatus::Success {
            let graph = self.graphs.snapshot(&task.repo);
            let prior_tip = tasks::list_success_no_patch(&self.pool, &task.repo, &task.name)
                .await
                .ok()
                .and_then(|rows| prior_blamelist_tip(&rows));
            graph.map(|g| {
                crate::state_machine::compute_blamelist(
                    &g,
                    &task.revision,
                    prior_tip.as_deref(),
                    self.config.blamelist_max_window,
                    task.patch_issue.is_some(),
                )
            })
        } else {
            None
        };

        let finished_at = event.finished.unwrap_or_else(|| self.clock.now());
        let rows = tasks::finish(
            &self.pool,
            task.id,
            task.db_modified,
            task.status,
            to,
            finished_at,
            commits.as_deref(),
            event.output_digest.as_deref(),
        )
        .await?;
        if rows == 0 {
            warn!(task_id = %task.id, "lost race applying completion event");
            return Ok(false);
        }

        self.rollup_jobs_for_task(task.id).await?;
        Ok(true)
    }

    /// Recompute and persist the rolled-up status of every job `task_id`
    /// belongs to (§4.3).
    async fn rollup_jobs_for_task(&self, task_id: uuid::Uuid) -> anyhow::Result<()> {
        for job_id in job_tasks::jobs_for_task(&self.pool, task_id).await? {
            let Some(job) = jobs::get_job(&self.pool, job_id).await? else {
                continue;
            };
            if job.status.is_terminal() {
                continue;
            }
            let Some(revision) = job.revision.as_deref() else {
                continue;
            };

            let repo_state = crate::repo_state::RepoState {
                repo: job.repo.clone(),
                revision: revision.to_string(),
                patch: job_patch(&job),
            };
            let cfg = match self.cacher.get_or_cache(&repo_state).await {
                Ok(cfg) => cfg,
                Err(_) => continue,
            };
            let Some(closure) = cfg.closure_for_job(&job.name) else {
                continue;
            };
            let mut closure_names: Vec<String> = closure.into_iter().collect();
            closure_names.sort_unstable();

            let mut tasks_by_name = Vec::with_capacity(closure_names.len());
            for name in &closure_names {
                let rows = tasks::list_by_repo_state_and_name(
                    &self.pool,
                    &job.repo,
                    revision,
                    job.patch_issue.as_deref(),
                    name,
                )
                .await?;
                tasks_by_name.push(rows);
            }

            let specs: Vec<Option<&crate::tasks_cfg::TaskSpec>> =
                closure_names.iter().map(|name| cfg.tasks.get(name)).collect();
            let new_status = crate::state_machine::rollup_job_status(&closure_names, &tasks_by_name, &specs);
            if new_status == job.status {
                continue;
            }
            let finished_at = new_status.is_terminal().then(|| self.clock.now());
            let rows = jobs::transition_status(&self.pool, job.id, job.db_modified, new_status, None, finished_at).await?;
            if rows == 0 {
                warn!(job_id = %job.id, "lost race rolling up job status; will retry next completion event");
            } else {
                info!(job_id = %job.id, status = %new_status, "job status rolled up");
            }
        }
        Ok(())
    }
}

fn job_patch(job: &tskd_db::models::JobRow) -> Option<crate::repo_state::Patch> {
    let issue = job.patch_issue.clone()?;
    Some(crate::repo_state::Patch {
        issue,
        patchset: job.patch_patchset.clone().unwrap_or_default(),
        server: job.patch_server.clone().unwrap_or_default(),
        patch_repo: job.patch_repo.clone(),
    })
}
