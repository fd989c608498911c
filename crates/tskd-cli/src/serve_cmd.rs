//! `tskd serve`: run the HTTP JSON API (§6.1) until interrupted, plus
//! the scheduler daemon loop (§2, §5) as a background task sharing the
//! same process and the same graceful-shutdown signal.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tskd_core::backends::{GitRepoBackend, GitRepoBackendConfig, GitApplyPatcher, LocalFsCas, LocalProcessExecutor};
use tskd_core::cacher::TasksCfgCacher;
use tskd_core::clock::SystemClock;
use tskd_core::config::SchedulerConfig;
use tskd_core::external::Executor;
use tskd_core::rpc::Service;
use tskd_core::scheduler::{CommitGraphRegistry, Scheduler};
use tskd_core::skip_rules::SkipRuleEngine;
use tskd_core::token::TokenConfig;

use crate::config::SchedulerSection;
use crate::http::{AppState, build_router};

pub async fn run_serve(
    pool: PgPool,
    token_config: TokenConfig,
    bind: &str,
    port: u16,
    scheduler_config: SchedulerSection,
) -> Result<()> {
    let skip_rules = Arc::new(SkipRuleEngine::new(pool.clone()));
    skip_rules.reload().await.context("failed to load skip rules")?;

    let cancel = CancellationToken::new();
    let executors: Vec<Arc<dyn Executor>> = if scheduler_config.remote_base.is_empty() {
        warn!("scheduler.remote_base not configured; `tskd serve` will not run the scheduler daemon");
        Vec::new()
    } else {
        let executor = Arc::new(LocalProcessExecutor::new(
            "local-process",
            scheduler_config.local_executor_concurrency,
        ));
        spawn_scheduler_daemon(pool.clone(), Arc::clone(&skip_rules), Arc::clone(&executor), &scheduler_config, cancel.clone());
        let executor: Arc<dyn Executor> = executor;
        vec![executor]
    };

    let service = Arc::new(Service::new(pool, skip_rules, executors));
    let state = AppState { service, token_config: Arc::new(token_config) };

    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse().with_context(|| format!("invalid bind address {bind}:{port}"))?;

    info!(%addr, "tskd serve listening");
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await.context("server error")?;
    cancel.cancel();
    info!("tskd serve shut down");
    Ok(())
}

/// Builds the Cacher and Scheduler out of the local git/filesystem
/// backends and spawns two background tasks: the periodic tick loop
/// (`Scheduler::run`) and a completion-event drain that feeds the local
/// executor's exit events into `Scheduler::apply_completion` -- the seam
/// a real deployment's own executor transport (a webhook, a queue
/// consumer) would call into instead.
fn spawn_scheduler_daemon(
    pool: PgPool,
    skip_rules: Arc<SkipRuleEngine>,
    executor: Arc<LocalProcessExecutor>,
    scheduler_config: &SchedulerSection,
    cancel: CancellationToken,
) {
    let git_backend = Arc::new(GitRepoBackend::new(GitRepoBackendConfig {
        mirror_root: PathBuf::from(&scheduler_config.mirror_root),
        worktree_root: PathBuf::from(&scheduler_config.worktree_root),
        remote_base: scheduler_config.remote_base.clone(),
    }));
    let cas = Arc::new(LocalFsCas::new(PathBuf::from(&scheduler_config.cas_root)));
    let patch_applier = Arc::new(GitApplyPatcher::new());

    let cacher = Arc::new(TasksCfgCacher::new(
        pool.clone(),
        git_backend.clone(),
        git_backend.clone(),
        patch_applier,
        git_backend,
        cas,
    ));

    let mut config = SchedulerConfig::default();
    config.tick_interval = std::time::Duration::from_secs(scheduler_config.tick_interval_secs.max(1));

    let scheduler = Arc::new(Scheduler::new(
        pool,
        cacher,
        skip_rules,
        Arc::new(CommitGraphRegistry::new()),
        vec![Arc::clone(&executor) as Arc<dyn Executor>],
        Arc::new(SystemClock),
        config,
    ));

    let tick_scheduler = Arc::clone(&scheduler);
    let tick_cancel = cancel.clone();
    tokio::spawn(async move {
        tick_scheduler.run(&tick_cancel).await;
    });

    tokio::spawn(async move {
        let mut events = executor.take_events().await;
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => {
                            if let Err(err) = scheduler.apply_completion(&event).await {
                                warn!(error = %err, executor_task_id = %event.executor_task_id, "failed to apply completion event");
                            }
                        }
                        None => break,
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
