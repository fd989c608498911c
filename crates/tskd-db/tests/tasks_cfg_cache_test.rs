//! Integration tests for the `tasks_cfg_cache` table: at-most-once
//! resolution of a `RepoState` digest to either a resolved config or a
//! permanent parse/validation error.

use serde_json::json;

use tskd_db::queries::tasks_cfg_cache;

use tskd_test_utils::{create_test_db, drop_test_db};

#[tokio::test]
async fn get_returns_none_for_unknown_digest() {
    let (pool, db_name) = create_test_db().await;

    let row = tasks_cfg_cache::get(&pool, "deadbeef")
        .await
        .expect("get should succeed");
    assert!(row.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn insert_resolved_and_read_back() {
    let (pool, db_name) = create_test_db().await;

    let cfg = json!({"tasks": [{"name": "build"}]});
    let row = tasks_cfg_cache::insert_resolved(&pool, "digest-a", &cfg)
        .await
        .expect("insert_resolved should succeed");

    assert_eq!(row.repo_state_digest, "digest-a");
    assert_eq!(row.tasks_cfg_json.as_ref(), Some(&cfg));
    assert!(row.error_kind.is_none());
    assert!(row.error_message.is_none());

    let fetched = tasks_cfg_cache::get(&pool, "digest-a")
        .await
        .expect("get should succeed")
        .expect("row should exist");
    assert_eq!(fetched.tasks_cfg_json, Some(cfg));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn insert_error_and_read_back() {
    let (pool, db_name) = create_test_db().await;

    let row = tasks_cfg_cache::insert_error(&pool, "digest-b", "parse_error", "unexpected token")
        .await
        .expect("insert_error should succeed");

    assert!(row.tasks_cfg_json.is_none());
    assert_eq!(row.error_kind.as_deref(), Some("parse_error"));
    assert_eq!(row.error_message.as_deref(), Some("unexpected token"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

/// Second writer for the same digest loses the race and observes the
/// first writer's row instead of its own (§4.1 at-most-once resolution).
#[tokio::test]
async fn concurrent_insert_resolved_keeps_first_writer() {
    let (pool, db_name) = create_test_db().await;

    let first_cfg = json!({"tasks": [{"name": "first"}]});
    let second_cfg = json!({"tasks": [{"name": "second"}]});

    let first = tasks_cfg_cache::insert_resolved(&pool, "digest-race", &first_cfg)
        .await
        .expect("first insert should succeed");
    let second = tasks_cfg_cache::insert_resolved(&pool, "digest-race", &second_cfg)
        .await
        .expect("second insert should succeed (observing the winner)");

    assert_eq!(first.tasks_cfg_json, Some(first_cfg.clone()));
    assert_eq!(second.tasks_cfg_json, Some(first_cfg));
    assert_eq!(first.resolved_at, second.resolved_at);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn insert_resolved_then_insert_error_keeps_resolved() {
    let (pool, db_name) = create_test_db().await;

    let cfg = json!({"tasks": []});
    tasks_cfg_cache::insert_resolved(&pool, "digest-c", &cfg)
        .await
        .expect("insert_resolved should succeed");

    let row = tasks_cfg_cache::insert_error(&pool, "digest-c", "parse_error", "too late")
        .await
        .expect("insert_error should observe the existing resolved row");

    assert_eq!(row.tasks_cfg_json, Some(cfg));
    assert!(row.error_kind.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}
