use chrono::{Duration, Utc};

use appshot_core::error::AppError;
use appshot_core::job::{JobStatus, NewJob, Priority, Store, Transition};
use appshot_core::job_store::JobStore;
use appshot_db::JobRepository;

use crate::integration::common::setup_test_db;

fn request() -> NewJob {
    NewJob::new("com.example.app", Store::PlayStore, "client-1")
}

#[tokio::test]
async fn create_job_and_verify_fields() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);

    let job = repo
        .create(request().with_priority(Priority::Batch))
        .await
        .unwrap();

    assert_eq!(job.app_id, "com.example.app");
    assert_eq!(job.store, Store::PlayStore);
    assert_eq!(job.client_id, "client-1");
    assert_eq!(job.priority, Priority::Batch);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempt_count, 0);
    assert_eq!(job.max_attempts, 3);
    assert!(job.result.is_empty());
    assert!(!job.from_cache);

    let fetched = repo.get(job.id).await.unwrap().unwrap();
    assert_eq!(fetched.id, job.id);
    assert_eq!(fetched.status, JobStatus::Pending);
}

#[tokio::test]
async fn record_cached_job_is_completed() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);
    let scraped_at = Utc::now() - Duration::minutes(10);

    let job = repo
        .record_cached(
            request(),
            vec!["https://cdn.example/a.png".into()],
            scraped_at,
        )
        .await
        .unwrap();

    let fetched = repo.get(job.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, JobStatus::Completed);
    assert!(fetched.from_cache);
    assert_eq!(fetched.result, vec!["https://cdn.example/a.png"]);
    assert_eq!(fetched.attempt_count, 0);
}

#[tokio::test]
async fn full_lifecycle_with_retry() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);
    let job = repo.create(request()).await.unwrap();

    repo.transition(job.id, Transition::Queue).await.unwrap();
    let started = repo.transition(job.id, Transition::Start).await.unwrap();
    assert_eq!(started.status, JobStatus::Processing);
    assert_eq!(started.attempt_count, 1);
    assert!(started.started_at.is_some());

    let retrying = repo
        .transition(job.id, Transition::Retry { error: "HTTP 503".into() })
        .await
        .unwrap();
    assert_eq!(retrying.status, JobStatus::Retrying);
    assert_eq!(retrying.error_message.as_deref(), Some("HTTP 503"));

    repo.transition(job.id, Transition::Queue).await.unwrap();
    repo.transition(job.id, Transition::Start).await.unwrap();
    let done = repo
        .transition(
            job.id,
            Transition::Complete {
                result: vec!["https://cdn.example/1.png".into()],
            },
        )
        .await
        .unwrap();

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.attempt_count, 2);
    assert!(done.error_message.is_none());

    let stored = repo.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.result, vec!["https://cdn.example/1.png"]);
    assert!(stored.completed_at.is_some());
}

#[tokio::test]
async fn illegal_transition_is_rejected_and_not_persisted() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);
    let job = repo.create(request()).await.unwrap();

    let err = repo
        .transition(job.id, Transition::Complete { result: vec![] })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::StateConflict { .. }));

    let stored = repo.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
}

#[tokio::test]
async fn transition_unknown_job_is_not_found() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);

    let err = repo
        .transition(uuid::Uuid::new_v4(), Transition::Queue)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn concurrent_start_only_one_wins() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);
    let job = repo.create(request()).await.unwrap();
    repo.transition(job.id, Transition::Queue).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let repo = repo.clone();
        let id = job.id;
        handles.push(tokio::spawn(async move {
            repo.transition(id, Transition::Start).await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let stored = repo.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.attempt_count, 1);
}

#[tokio::test]
async fn list_and_count_by_status() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);

    let first = repo.create(request()).await.unwrap();
    let second = repo
        .create(NewJob::new("284882215", Store::AppStore, "client-2"))
        .await
        .unwrap();
    repo.transition(second.id, Transition::Queue).await.unwrap();

    assert_eq!(repo.count_by_status(JobStatus::Pending).await.unwrap(), 1);
    assert_eq!(repo.count_by_status(JobStatus::Queued).await.unwrap(), 1);
    assert_eq!(repo.count_by_status(JobStatus::Failed).await.unwrap(), 0);

    let all = repo.list(None, 10).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id, second.id);
    assert_eq!(all[1].id, first.id);

    let pending = repo.list(Some(JobStatus::Pending), 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, first.id);

    assert_eq!(repo.list(None, 1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn purge_removes_only_old_terminal_jobs() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool.clone());

    let old = repo.create(request()).await.unwrap();
    repo.transition(old.id, Transition::Fail { error: "gone".into() })
        .await
        .unwrap();
    let active = repo.create(request()).await.unwrap();

    sqlx::query("UPDATE screenshot_jobs SET updated_at = NOW() - INTERVAL '8 days'")
        .execute(&pool)
        .await
        .unwrap();

    let purged = repo
        .purge_terminal_before(Utc::now() - Duration::days(7))
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert!(repo.get(old.id).await.unwrap().is_none());
    assert!(repo.get(active.id).await.unwrap().is_some());
}
