//! Local-subprocess `Executor`: dispatches a task's command as a child
//! process on the machine `tskd` itself runs on, the same shape as
//! `ClaudeCodeAdapter` spawning `claude` and tracking it by OS pid --
//! just without the stream-json parsing, since a task's own exit code
//! is the only signal this backend has to report.
//!
//! Completion is push-based from the scheduler's point of view but
//! pull-based from this executor's: each finished child is turned into
//! an [`ExecutorEvent`] and sent down an unbounded channel. Whatever
//! process embeds the scheduler drains that channel and feeds the
//! events to [`crate::scheduler::Scheduler::apply_completion`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;
use uuid::Uuid;

use crate::external::{Executor, ExecutorEvent, ExecutorEventStatus, ExecutorStats, ExternalError};
use crate::tasks_cfg::TaskSpec;

#[derive(Clone)]
struct RunningTask {
    stats: Option<ExecutorStats>,
}

pub struct LocalProcessExecutor {
    backend_tag: String,
    max_concurrency: u32,
    running: Arc<AtomicUsize>,
    tasks: Arc<Mutex<HashMap<String, RunningTask>>>,
    events_tx: mpsc::UnboundedSender<ExecutorEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ExecutorEvent>>>,
}

impl LocalProcessExecutor {
    pub fn new(backend_tag: impl Into<String>, max_concurrency: u32) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            backend_tag: backend_tag.into(),
            max_concurrency,
            running: Arc::new(AtomicUsize::new(0)),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Takes ownership of the completion-event stream. Panics if called
    /// twice -- there is exactly one consumer per executor instance, the
    /// daemon loop that feeds `Scheduler::apply_completion`.
    pub async fn take_events(&self) -> mpsc::UnboundedReceiver<ExecutorEvent> {
        self.events_rx
            .lock()
            .await
            .take()
            .expect("take_events called more than once on the same executor")
    }
}

#[async_trait]
impl Executor for LocalProcessExecutor {
    fn backend_tag(&self) -> &str {
        &self.backend_tag
    }

    async fn free_capacity(&self, _dimensions: &[(String, String)]) -> Result<u32, ExternalError> {
        let running = self.running.load(Ordering::SeqCst) as u32;
        Ok(self.max_concurrency.saturating_sub(running))
    }

    async fn dispatch(
        &self,
        task_spec: &TaskSpec,
        _resolved_cas_digest: Option<&str>,
        task_id: Uuid,
    ) -> Result<String, ExternalError> {
        let Some((program, args)) = task_spec.command.split_first() else {
            return Err(ExternalError::Permanent(
                "task spec has an empty command".to_string(),
            ));
        };

        let mut command = Command::new(program);
        command.args(args);
        for (key, value) in &task_spec.environment {
            command.env(key, value);
        }
        command.kill_on_drop(false);

        let mut child = command
            .spawn()
            .map_err(|e| ExternalError::Transient(format!("failed to spawn {program}: {e}")))?;

        let executor_task_id = task_id.to_string();
        self.tasks
            .lock()
            .await
            .insert(executor_task_id.clone(), RunningTask { stats: None });
        self.running.fetch_add(1, Ordering::SeqCst);

        let tag = executor_task_id.clone();
        let started = Utc::now();
        let events_tx = self.events_tx.clone();
        let tasks = Arc::clone(&self.tasks);
        let running = Arc::clone(&self.running);

        tokio::spawn(async move {
            let wall_start = std::time::Instant::now();
            let status = child.wait().await;
            let wall_seconds = wall_start.elapsed().as_secs_f64();
            running.fetch_sub(1, Ordering::SeqCst);

            let (event_status, exit_code) = match &status {
                Ok(exit) if exit.success() => (ExecutorEventStatus::Success, exit.code()),
                Ok(exit) => (ExecutorEventStatus::Failure, exit.code()),
                Err(e) => {
                    warn!(task_id = %tag, error = %e, "local process wait failed");
                    (ExecutorEventStatus::Mishap, None)
                }
            };

            let stats = ExecutorStats {
                cpu_seconds: None,
                wall_seconds: Some(wall_seconds),
                exit_code,
            };
            tasks.lock().await.insert(tag.clone(), RunningTask { stats: Some(stats) });

            let event = ExecutorEvent {
                executor_task_id: tag,
                status: event_status,
                started: Some(started),
                finished: Some(Utc::now()),
                output_digest: None,
            };
            if events_tx.send(event).is_err() {
                warn!("completion event dropped: no receiver listening");
            }
        });

        Ok(executor_task_id)
    }

    async fn query_result(
        &self,
        executor_task_id: &str,
        include_stats: bool,
    ) -> Result<Option<ExecutorStats>, ExternalError> {
        if !include_stats {
            return Ok(self
                .tasks
                .lock()
                .await
                .contains_key(executor_task_id)
                .then(ExecutorStats::default));
        }
        Ok(self
            .tasks
            .lock()
            .await
            .get(executor_task_id)
            .and_then(|t| t.stats.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn spec(command: Vec<&str>) -> TaskSpec {
        TaskSpec {
            dimensions: Vec::new(),
            command: command.into_iter().map(String::from).collect(),
            dependencies: Vec::new(),
            priority: 1.0,
            max_attempts: 2,
            cas_spec: None,
            environment: StdHashMap::new(),
            retry_on_failure: false,
        }
    }

    #[tokio::test]
    async fn dispatch_reports_success_for_a_zero_exit() {
        let executor = LocalProcessExecutor::new("local", 4);
        let mut events = executor.take_events().await;

        let executor_task_id = executor
            .dispatch(&spec(vec!["true"]), None, Uuid::new_v4())
            .await
            .expect("dispatch should succeed");

        let event = events.recv().await.expect("completion event expected");
        assert_eq!(event.executor_task_id, executor_task_id);
        assert_eq!(event.status, ExecutorEventStatus::Success);
    }

    #[tokio::test]
    async fn dispatch_reports_failure_for_a_nonzero_exit() {
        let executor = LocalProcessExecutor::new("local", 4);
        let mut events = executor.take_events().await;

        executor
            .dispatch(&spec(vec!["false"]), None, Uuid::new_v4())
            .await
            .expect("dispatch should succeed");

        let event = events.recv().await.expect("completion event expected");
        assert_eq!(event.status, ExecutorEventStatus::Failure);
    }

    #[tokio::test]
    async fn dispatch_rejects_an_empty_command() {
        let executor = LocalProcessExecutor::new("local", 4);
        let err = executor.dispatch(&spec(vec![]), None, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ExternalError::Permanent(_)));
    }

    #[tokio::test]
    async fn free_capacity_ignores_dimensions_and_reflects_running_count() {
        let executor = LocalProcessExecutor::new("local", 2);
        assert_eq!(executor.free_capacity(&[]).await.unwrap(), 2);
    }
}
