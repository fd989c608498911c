//! Integration tests for `skip_rules` CRUD operations.

use tskd_db::queries::skip_rules;

use tskd_test_utils::{create_test_db, drop_test_db};

#[tokio::test]
async fn add_and_get_rule() {
    let (pool, db_name) = create_test_db().await;

    let patterns = vec!["linux-*".to_string(), "mac-rel".to_string()];
    let rule = skip_rules::add(
        &pool,
        "skip-docs-only",
        "operator@example.com",
        "skip builders for docs-only changes",
        &patterns,
        &[],
    )
    .await
    .expect("add should succeed");

    assert_eq!(rule.name, "skip-docs-only");
    assert_eq!(rule.added_by, "operator@example.com");
    assert_eq!(rule.task_spec_patterns, patterns);
    assert!(rule.commits.is_empty());

    let fetched = skip_rules::get(&pool, "skip-docs-only")
        .await
        .expect("get should succeed")
        .expect("rule should exist");
    assert_eq!(fetched.name, rule.name);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn add_rejects_duplicate_name() {
    let (pool, db_name) = create_test_db().await;

    let patterns = vec!["linux-*".to_string()];
    skip_rules::add(&pool, "dup", "a@example.com", "first", &patterns, &[])
        .await
        .expect("first add should succeed");

    let result = skip_rules::add(&pool, "dup", "b@example.com", "second", &patterns, &[]).await;
    assert!(result.is_err(), "duplicate rule name should be rejected");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn concurrent_add_of_same_name_surfaces_duplicate_rule_name() {
    let (pool, db_name) = create_test_db().await;

    let patterns = vec!["linux-*".to_string()];
    let (first, second) = tokio::join!(
        skip_rules::add(&pool, "racing", "a@example.com", "first", &patterns, &[]),
        skip_rules::add(&pool, "racing", "b@example.com", "second", &patterns, &[]),
    );

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1, "exactly one racer should win");
    let loser = results.into_iter().find(Result::is_err).unwrap().unwrap_err();
    assert!(
        loser.downcast_ref::<skip_rules::DuplicateRuleName>().is_some(),
        "the losing racer's unique violation should surface as DuplicateRuleName, not a raw db error"
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn list_all_orders_by_name() {
    let (pool, db_name) = create_test_db().await;

    let patterns = vec!["*".to_string()];
    skip_rules::add(&pool, "zzz-last", "a@example.com", "", &patterns, &[])
        .await
        .expect("add zzz-last");
    skip_rules::add(&pool, "aaa-first", "a@example.com", "", &patterns, &[])
        .await
        .expect("add aaa-first");

    let rules = skip_rules::list_all(&pool)
        .await
        .expect("list_all should succeed");

    assert_eq!(rules.len(), 2);
    assert_eq!(rules[0].name, "aaa-first");
    assert_eq!(rules[1].name, "zzz-last");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn delete_is_idempotent() {
    let (pool, db_name) = create_test_db().await;

    let patterns = vec!["*".to_string()];
    skip_rules::add(&pool, "to-delete", "a@example.com", "", &patterns, &[])
        .await
        .expect("add should succeed");

    let first_delete = skip_rules::delete(&pool, "to-delete")
        .await
        .expect("delete should succeed");
    assert!(first_delete);

    let second_delete = skip_rules::delete(&pool, "to-delete")
        .await
        .expect("repeated delete should not error");
    assert!(!second_delete);

    let fetched = skip_rules::get(&pool, "to-delete")
        .await
        .expect("get should succeed");
    assert!(fetched.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn get_returns_none_for_unknown_name() {
    let (pool, db_name) = create_test_db().await;

    let result = skip_rules::get(&pool, "does-not-exist")
        .await
        .expect("get should not error");
    assert!(result.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}
