//! Integration tests for `tasks` table CRUD and CAS transitions.

use uuid::Uuid;

use tskd_db::models::TaskStatus;
use tskd_db::queries::tasks::{self, NewTask, TaskSearchFilter};

use tskd_test_utils::{create_test_db, drop_test_db};

fn new_commit_task<'a>(repo: &'a str, revision: &'a str, name: &'a str) -> NewTask<'a> {
    NewTask {
        repo,
        revision,
        patch_issue: None,
        patch_patchset: None,
        patch_server: None,
        patch_repo: None,
        name,
        forced_job_id: None,
        attempt: 0,
        retry_of: None,
    }
}

#[tokio::test]
async fn insert_task_starts_pending() {
    let (pool, db_name) = create_test_db().await;

    let task = tasks::insert_task(&pool, &new_commit_task("repo", "rev1", "linux-rel"))
        .await
        .expect("insert_task should succeed");

    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempt, 0);
    assert!(task.commits.is_empty());
    assert!(!task.is_try_job());

    let fetched = tasks::get_task(&pool, task.id)
        .await
        .expect("get_task should succeed")
        .expect("task should exist");
    assert_eq!(fetched.id, task.id);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn get_task_returns_none_for_missing_id() {
    let (pool, db_name) = create_test_db().await;

    let result = tasks::get_task(&pool, Uuid::new_v4())
        .await
        .expect("get_task should not error");
    assert!(result.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn list_by_repo_state_and_name_orders_by_attempt() {
    let (pool, db_name) = create_test_db().await;

    let first = tasks::insert_task(&pool, &new_commit_task("repo", "rev1", "linux-rel"))
        .await
        .expect("insert first attempt");
    let retry = NewTask {
        attempt: 1,
        retry_of: Some(first.id),
        ..new_commit_task("repo", "rev1", "linux-rel")
    };
    let second = tasks::insert_task(&pool, &retry)
        .await
        .expect("insert retry attempt");

    let results = tasks::list_by_repo_state_and_name(&pool, "repo", "rev1", None, "linux-rel")
        .await
        .expect("list_by_repo_state_and_name should succeed");

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].id, first.id);
    assert_eq!(results[1].id, second.id);
    assert_eq!(results[1].retry_of, Some(first.id));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn list_success_no_patch_excludes_try_tasks() {
    let (pool, db_name) = create_test_db().await;

    let post_submit = tasks::insert_task(&pool, &new_commit_task("repo", "rev1", "linux-rel"))
        .await
        .expect("insert post-submit task");
    tasks::finish(
        &pool,
        post_submit.id,
        post_submit.db_modified,
        TaskStatus::Pending,
        TaskStatus::Success,
        chrono::Utc::now(),
        Some(&["rev1".to_string()]),
        Some("digest-a"),
    )
    .await
    .expect("finish should succeed");

    let try_task = NewTask {
        patch_issue: Some("123456"),
        ..new_commit_task("repo", "rev1", "linux-rel")
    };
    let try_task = tasks::insert_task(&pool, &try_task)
        .await
        .expect("insert try task");
    tasks::finish(
        &pool,
        try_task.id,
        try_task.db_modified,
        TaskStatus::Pending,
        TaskStatus::Success,
        chrono::Utc::now(),
        None,
        None,
    )
    .await
    .expect("finish try task");

    let results = tasks::list_success_no_patch(&pool, "repo", "linux-rel")
        .await
        .expect("list_success_no_patch should succeed");

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, post_submit.id);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn begin_running_sets_executor_task_id() {
    let (pool, db_name) = create_test_db().await;

    let task = tasks::insert_task(&pool, &new_commit_task("repo", "rev1", "linux-rel"))
        .await
        .expect("insert task");

    let rows = tasks::begin_running(
        &pool,
        task.id,
        task.db_modified,
        "executor-task-1",
        chrono::Utc::now(),
    )
    .await
    .expect("begin_running should succeed");
    assert_eq!(rows, 1);

    let updated = tasks::get_task(&pool, task.id)
        .await
        .expect("get_task should succeed")
        .expect("task should exist");
    assert_eq!(updated.status, TaskStatus::Running);
    assert_eq!(updated.executor_task_id.as_deref(), Some("executor-task-1"));
    assert!(updated.started_at.is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn begin_running_fails_on_stale_db_modified() {
    let (pool, db_name) = create_test_db().await;

    let task = tasks::insert_task(&pool, &new_commit_task("repo", "rev1", "linux-rel"))
        .await
        .expect("insert task");

    let stale = task.db_modified - chrono::Duration::seconds(1);
    let rows = tasks::begin_running(&pool, task.id, stale, "executor-task-1", chrono::Utc::now())
        .await
        .expect("begin_running should not error on stale CAS");
    assert_eq!(rows, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn finish_records_commits_only_on_success() {
    let (pool, db_name) = create_test_db().await;

    let task = tasks::insert_task(&pool, &new_commit_task("repo", "rev1", "linux-rel"))
        .await
        .expect("insert task");

    let rows = tasks::finish(
        &pool,
        task.id,
        task.db_modified,
        TaskStatus::Pending,
        TaskStatus::Failure,
        chrono::Utc::now(),
        None,
        Some("digest-failed"),
    )
    .await
    .expect("finish should succeed");
    assert_eq!(rows, 1);

    let finished = tasks::get_task(&pool, task.id)
        .await
        .expect("get_task should succeed")
        .expect("task should exist");
    assert_eq!(finished.status, TaskStatus::Failure);
    assert!(finished.commits.is_empty());
    assert_eq!(finished.output_digest.as_deref(), Some("digest-failed"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn dispatch_timeout_moves_pending_task_to_mishap() {
    let (pool, db_name) = create_test_db().await;

    let task = tasks::insert_task(&pool, &new_commit_task("repo", "rev1", "linux-rel"))
        .await
        .expect("insert task");

    let rows = tasks::dispatch_timeout(&pool, task.id, task.db_modified, chrono::Utc::now())
        .await
        .expect("dispatch_timeout should succeed");
    assert_eq!(rows, 1);

    let timed_out = tasks::get_task(&pool, task.id)
        .await
        .expect("get_task should succeed")
        .expect("task should exist");
    assert_eq!(timed_out.status, TaskStatus::Mishap);
    assert!(timed_out.finished_at.is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn dispatch_timeout_is_noop_once_running() {
    let (pool, db_name) = create_test_db().await;

    let task = tasks::insert_task(&pool, &new_commit_task("repo", "rev1", "linux-rel"))
        .await
        .expect("insert task");

    let running = tasks::begin_running(
        &pool,
        task.id,
        task.db_modified,
        "executor-task-1",
        chrono::Utc::now(),
    )
    .await
    .expect("begin_running should succeed");
    assert_eq!(running, 1);

    let refetched = tasks::get_task(&pool, task.id)
        .await
        .expect("get_task should succeed")
        .expect("task should exist");

    let rows = tasks::dispatch_timeout(
        &pool,
        task.id,
        refetched.db_modified,
        chrono::Utc::now(),
    )
    .await
    .expect("dispatch_timeout should not error");
    assert_eq!(rows, 0, "a running task must not be timed out");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn search_tasks_filters_by_name_and_status() {
    let (pool, db_name) = create_test_db().await;

    let a = tasks::insert_task(&pool, &new_commit_task("repo", "rev1", "linux-rel"))
        .await
        .expect("insert task a");
    let b = tasks::insert_task(&pool, &new_commit_task("repo", "rev1", "mac-rel"))
        .await
        .expect("insert task b");

    tasks::finish(
        &pool,
        a.id,
        a.db_modified,
        TaskStatus::Pending,
        TaskStatus::Success,
        chrono::Utc::now(),
        Some(&["rev1".to_string()]),
        None,
    )
    .await
    .expect("finish task a");

    let filter = TaskSearchFilter {
        name: Some("linux-rel".to_string()),
        status: Some(TaskStatus::Success),
        limit: 10,
        offset: 0,
        ..Default::default()
    };
    let results = tasks::search_tasks(&pool, &filter)
        .await
        .expect("search_tasks should succeed");

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, a.id);
    assert_ne!(results[0].id, b.id);

    pool.close().await;
    drop_test_db(&db_name).await;
}
