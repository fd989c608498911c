//! Integration tests for the `job_tasks` join table.

use tskd_db::queries::{job_tasks, jobs, tasks};
use tskd_db::models::Trigger;
use tskd_db::queries::jobs::NewJob;
use tskd_db::queries::tasks::NewTask;

use tskd_test_utils::{create_test_db, drop_test_db};

fn new_job<'a>(repo: &'a str, revision: &'a str, name: &'a str) -> NewJob<'a> {
    NewJob {
        repo,
        revision: Some(revision),
        patch_issue: None,
        patch_patchset: None,
        patch_server: None,
        patch_repo: None,
        name,
        priority: 1.0,
        trigger: Trigger::AnyCommit,
        is_force: false,
    }
}

fn new_task<'a>(repo: &'a str, revision: &'a str, name: &'a str) -> NewTask<'a> {
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
async fn link_is_idempotent() {
    let (pool, db_name) = create_test_db().await;

    let job = jobs::insert_job(&pool, &new_job("repo", "rev1", "linux-rel"))
        .await
        .expect("insert job");
    let task = tasks::insert_task(&pool, &new_task("repo", "rev1", "linux-rel"))
        .await
        .expect("insert task");

    job_tasks::link(&pool, job.id, task.id)
        .await
        .expect("first link should succeed");
    job_tasks::link(&pool, job.id, task.id)
        .await
        .expect("second link should be a no-op");

    let jobs_for_task = job_tasks::jobs_for_task(&pool, task.id)
        .await
        .expect("jobs_for_task should succeed");
    assert_eq!(jobs_for_task, vec![job.id]);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn two_jobs_dedup_onto_one_task() {
    let (pool, db_name) = create_test_db().await;

    let job_a = jobs::insert_job(&pool, &new_job("repo", "rev1", "linux-rel"))
        .await
        .expect("insert job a");
    let job_b = jobs::insert_job(&pool, &new_job("repo", "rev1", "mac-rel"))
        .await
        .expect("insert job b");
    let task = tasks::insert_task(&pool, &new_task("repo", "rev1", "linux-rel"))
        .await
        .expect("insert task");

    job_tasks::link(&pool, job_a.id, task.id)
        .await
        .expect("link job a");
    job_tasks::link(&pool, job_b.id, task.id)
        .await
        .expect("link job b");

    let mut linked_jobs = job_tasks::jobs_for_task(&pool, task.id)
        .await
        .expect("jobs_for_task should succeed");
    linked_jobs.sort();
    let mut expected = vec![job_a.id, job_b.id];
    expected.sort();
    assert_eq!(linked_jobs, expected);

    let tasks_for_job_a = job_tasks::tasks_for_job(&pool, job_a.id)
        .await
        .expect("tasks_for_job should succeed");
    assert_eq!(tasks_for_job_a.len(), 1);
    assert_eq!(tasks_for_job_a[0].id, task.id);

    pool.close().await;
    drop_test_db(&db_name).await;
}
