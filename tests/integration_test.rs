use std::time::Duration;

use bizcase_report::{
    config::AppConfig,
    models::job::{JobState, JobUpdate},
    services::{
        job_store::{JobStore, Retention, StoreError},
        queue::{JobQueue, QueuedJob},
        redis_store::RedisJobStore,
    },
};
use serde_json::{json, Map};

fn redis_url() -> String {
    AppConfig::from_env()
        .map(|c| c.redis_url)
        .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

/// Integration test: job store and queue against a real Redis
///
/// This test verifies:
/// 1. Job creation and read-back
/// 2. Atomic updates and payload merging
/// 3. Terminal states rejecting later writes
/// 4. Queue hand-off (enqueue/dequeue/complete)
///
/// Note: This requires a running Redis instance configured via REDIS_URL.
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_redis_store_and_queue() {
    let url = redis_url();
    let store = RedisJobStore::new(&url, Retention::default()).expect("Failed to initialize store");
    let queue = JobQueue::new(&url).expect("Failed to initialize queue");
    queue.health_check().await.expect("Redis is not reachable");

    // 1. Create a job
    let mut payload = Map::new();
    payload.insert("input".to_string(), json!({"company_name": "Acme"}));
    let job_id = store.enqueue(payload).await.expect("Failed to create job");

    let job = store
        .get_status(&job_id)
        .await
        .expect("Failed to read job")
        .expect("Job not found");
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.payload["input"]["company_name"], "Acme");

    // 2. Progress with a merged step output
    let job = store
        .update_status(
            &job_id,
            JobUpdate::processing()
                .step("basic_roi_calculation")
                .progress(16)
                .merge("basic_roi", json!("12%"))
                .warning("basic_roi_calculation: model output was truncated"),
        )
        .await
        .expect("Failed to update job");
    assert_eq!(job.state, JobState::Processing);
    assert_eq!(job.payload["basic_roi"], "12%");
    assert_eq!(job.payload["input"]["company_name"], "Acme");
    assert_eq!(job.warnings.len(), 1);

    // 3. Finish, then reject late writes
    let mut done = JobUpdate::new(JobState::Completed).progress(100);
    done.result = Some(json!({"executive_summary": "ok"}));
    store.update_status(&job_id, done).await.expect("Failed to complete job");

    let err = store
        .update_status(&job_id, JobUpdate::processing())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Terminal { .. }));

    let first = store.get_status(&job_id).await.unwrap();
    let second = store.get_status(&job_id).await.unwrap();
    assert_eq!(first, second);

    // 4. Queue hand-off
    queue
        .enqueue(&QueuedJob::new(&job_id))
        .await
        .expect("Failed to enqueue");
    let dequeued = queue
        .dequeue()
        .await
        .expect("Failed to dequeue")
        .expect("No job in queue");
    assert_eq!(dequeued.job_id, job_id);
    queue.complete(&dequeued).await.expect("Failed to complete job in queue");

    println!("✅ Redis integration passed for job {job_id}");
}

/// Expired records are removed by cleanup.
#[tokio::test]
#[ignore]
async fn test_redis_cleanup() {
    let retention = Retention {
        terminal: Duration::ZERO,
        max_age: Duration::from_secs(3600),
        cleanup_interval: Duration::from_secs(3600),
    };
    let store = RedisJobStore::new(&redis_url(), retention).expect("Failed to initialize store");

    let job_id = store.enqueue(Map::new()).await.expect("Failed to create job");
    store
        .update_status(&job_id, JobUpdate::failed("Processing failed.", "step_failed"))
        .await
        .expect("Failed to fail job");
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let removed = store.cleanup().await.expect("Cleanup failed");
    assert!(removed >= 1);
    assert!(store.get_status(&job_id).await.unwrap().is_none());
}

/// A claimed entry that is never completed goes back on the queue.
#[tokio::test]
#[ignore]
async fn test_queue_reclaims_abandoned_claims() {
    let queue = JobQueue::new(&redis_url()).expect("Failed to initialize queue");
    queue.health_check().await.expect("Redis is not reachable");

    let job = QueuedJob::new(format!("abandoned-{}", uuid::Uuid::new_v4()));
    queue.enqueue(&job).await.expect("Failed to enqueue");

    // Claimed by a worker that then disappears.
    let mut claimed = None;
    while let Some(next) = queue.dequeue().await.expect("Failed to dequeue") {
        if next.job_id == job.job_id {
            claimed = Some(next);
            break;
        }
        queue.complete(&next).await.expect("Failed to complete");
    }
    assert_eq!(claimed.as_ref(), Some(&job));

    // A fresh claim survives a generous threshold.
    assert_eq!(queue.reclaim(Duration::from_secs(3600)).await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(queue.reclaim(Duration::ZERO).await.unwrap() >= 1);

    let again = queue
        .dequeue()
        .await
        .expect("Failed to dequeue")
        .expect("Reclaimed job should be next");
    assert_eq!(again, job);
    queue.complete(&again).await.expect("Failed to complete");
}
