//! Integration tests for the `tskd job`/`task`/`skip-rule` command
//! bodies against a real PostgreSQL instance. These exercise the same
//! `Service` the binary's `main.rs` builds, without spawning a process.

use std::sync::Arc;

use tskd_core::auth::Role;
use tskd_core::rpc::{JobSearchFilter, Service, TriggerRequest};
use tskd_core::skip_rules::SkipRuleEngine;
use tskd_db::models::Trigger;
use tskd_db::queries::jobs;
use tskd_test_utils::{create_test_db, drop_test_db};

async fn build_service(pool: sqlx::PgPool) -> Service {
    let skip_rules = Arc::new(SkipRuleEngine::new(pool.clone()));
    skip_rules.reload().await.expect("reload should succeed");
    Service::new(pool, skip_rules, Vec::new())
}

#[tokio::test]
async fn trigger_then_get_job_roundtrips() {
    let (pool, db_name) = create_test_db().await;
    let service = build_service(pool).await;

    let request = TriggerRequest {
        job_name: "ci-linux".to_string(),
        repo: "chromium/src".to_string(),
        revision: Some("deadbeef".to_string()),
        patch_issue: None,
        patch_patchset: None,
        patch_server: None,
        patch_repo: None,
        priority: 1.0,
        is_force: false,
    };
    let ids = service.trigger_jobs(Role::Editor, &[request]).await.expect("trigger should succeed");
    assert_eq!(ids.len(), 1);

    let view = service.get_job(Role::Editor, ids[0]).await.expect("get_job should succeed");
    assert_eq!(view.job.name, "ci-linux");
    assert_eq!(view.job.revision.as_deref(), Some("deadbeef"));
    assert!(view.tasks.is_empty());

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn trigger_is_not_idempotent() {
    let (pool, db_name) = create_test_db().await;
    let service = build_service(pool).await;

    let request = TriggerRequest {
        job_name: "ci-linux".to_string(),
        repo: "chromium/src".to_string(),
        revision: Some("deadbeef".to_string()),
        patch_issue: None,
        patch_patchset: None,
        patch_server: None,
        patch_repo: None,
        priority: 1.0,
        is_force: false,
    };

    let first = service.trigger_jobs(Role::Editor, &[request.clone()]).await.unwrap();
    let second = service.trigger_jobs(Role::Editor, &[request]).await.unwrap();
    assert_ne!(first[0], second[0], "two TriggerJobs calls must produce distinct job IDs");

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancel_job_is_idempotent() {
    let (pool, db_name) = create_test_db().await;
    let service = build_service(pool.clone()).await;

    let new = jobs::NewJob {
        repo: "chromium/src",
        revision: Some("abc123"),
        patch_issue: None,
        patch_patchset: None,
        patch_server: None,
        patch_repo: None,
        name: "ci-linux",
        priority: 1.0,
        trigger: Trigger::OnDemand,
        is_force: false,
    };
    let job = jobs::insert_job(&pool, &new).await.unwrap();

    let first = service.cancel_job(Role::Editor, job.id).await.unwrap();
    assert_eq!(first.status.to_string(), "canceled");

    let second = service.cancel_job(Role::Editor, job.id).await.unwrap();
    assert_eq!(second.status, first.status);
    assert_eq!(second.finished_at, first.finished_at);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn search_jobs_filters_by_repo() {
    let (pool, db_name) = create_test_db().await;
    let service = build_service(pool.clone()).await;

    for (repo, name) in [("repo-a", "job-a"), ("repo-b", "job-b")] {
        let new = jobs::NewJob {
            repo,
            revision: Some("abc123"),
            patch_issue: None,
            patch_patchset: None,
            patch_server: None,
            patch_repo: None,
            name,
            priority: 1.0,
            trigger: Trigger::OnDemand,
            is_force: false,
        };
        jobs::insert_job(&pool, &new).await.unwrap();
    }

    let filter = JobSearchFilter { repo: Some("repo-a".to_string()), limit: 10, ..Default::default() };
    let found = service.search_jobs(Role::Editor, &filter).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].repo, "repo-a");

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn skip_rule_add_then_delete_restores_empty_set() {
    let (pool, db_name) = create_test_db().await;
    let service = build_service(pool).await;

    let added = service
        .add_skip_task_rule(Role::Editor, "flaky-gpu", "ci-admin", "known flaky on this bot", &["gpu_*".to_string()], &[])
        .await
        .unwrap();
    assert_eq!(added.len(), 1);

    let duplicate = service
        .add_skip_task_rule(Role::Editor, "flaky-gpu", "ci-admin", "dup", &["gpu_*".to_string()], &[])
        .await;
    assert!(duplicate.is_err(), "duplicate rule name must be rejected");

    let after_delete = service.delete_skip_task_rule(Role::Editor, "flaky-gpu").await.unwrap();
    assert!(after_delete.is_empty());

    let idempotent_delete = service.delete_skip_task_rule(Role::Editor, "flaky-gpu").await.unwrap();
    assert!(idempotent_delete.is_empty());

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn skip_rule_requires_at_least_one_pattern() {
    let (pool, db_name) = create_test_db().await;
    let service = build_service(pool).await;

    let result = service.add_skip_task_rule(Role::Editor, "no-patterns", "ci-admin", "", &[], &[]).await;
    assert!(result.is_err());

    drop_test_db(&db_name).await;
}
