#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;

use actors::{Job, JobId};
use db::FailPoint;
use queue_core::{ERROR, RETRYING_AT};
use serde_json::json;

#[tokio::test]
async fn test_enqueue_strips_metadata_and_assigns_ids() -> Result<(), Box<dyn Error>> {
    let (_store, queue) = common::memory_queue();

    let mut job = Job::new(json!({ "task": "resize" }));
    job.started_at = Some(chrono::Utc::now());
    job.error = Some("stale".to_string());
    let generated = queue.enqueue(job).await?;
    let named = queue
        .enqueue(Job::new(json!({ "task": "crop" })).with_id("crop-1"))
        .await?;
    assert_eq!(named, JobId::new("crop-1"));

    let pending = queue.pending_jobs().await?;
    assert_eq!(pending.len(), 2);
    let resize = pending
        .iter()
        .find(|job| job.id.as_ref() == Some(&generated))
        .ok_or("generated job missing")?;
    assert_eq!(resize.field("task"), Some(&json!("resize")));
    assert!(resize.started_at.is_none());
    assert!(resize.error.is_none());

    // Same id overwrites
    queue
        .enqueue(Job::new(json!({ "task": "crop", "size": 64 })).with_id("crop-1"))
        .await?;
    assert_eq!(queue.count_pending().await?, 2);

    queue.remove_pending(&named).await?;
    assert_eq!(queue.count_pending().await?, 1);

    queue.clear().await?;
    assert_eq!(queue.count_pending().await?, 0);
    assert_eq!(queue.count_started().await?, 0);

    Ok(())
}

#[tokio::test]
async fn test_pending_jobs_follow_priority_order() -> Result<(), Box<dyn Error>> {
    let (_store, queue) = common::memory_queue();
    for priority in [5.0, 1.0, 3.0] {
        queue
            .enqueue(Job::new(json!({})).with_priority(priority))
            .await?;
    }
    queue.enqueue(Job::new(json!({ "plain": true }))).await?;

    let order: Vec<Option<f64>> = queue
        .pending_jobs()
        .await?
        .iter()
        .map(|job| job.priority)
        .collect();
    assert_eq!(order, vec![None, Some(1.0), Some(3.0), Some(5.0)]);

    Ok(())
}

#[tokio::test]
async fn test_record_lifecycle_fields() -> Result<(), Box<dyn Error>> {
    let (_store, queue) = common::memory_queue();
    let job = Job::new(json!({ "task": "resize" }))
        .with_id("j-1")
        .with_priority(2.0);

    queue.record_start(&job).await?;
    let started = queue.started_jobs().await?;
    assert_eq!(started.len(), 1);
    assert!(started[0].started_at.is_some());
    assert_eq!(started[0].priority, Some(2.0));
    assert_eq!(started[0].field("task"), Some(&json!("resize")));

    queue.record_failure(&job, "disk full").await?;
    let failed = queue.failed_jobs().await?;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].error.as_deref(), Some("disk full"));

    queue.record_success(&job).await?;
    let done = queue.started_jobs().await?;
    assert!(done[0].succeeded_at.is_some());
    assert!(done[0].failed_at.is_none());
    assert!(done[0].error.is_none());
    assert!(queue.failed_jobs().await?.is_empty());

    let anonymous = Job::new(json!({}));
    assert!(queue.record_start(&anonymous).await.is_err());

    Ok(())
}

#[tokio::test]
async fn test_retry_failed_jobs_resets_metadata() -> Result<(), Box<dyn Error>> {
    let (_store, queue) = common::memory_queue();
    let job = Job::new(json!({ "n": 1 })).with_id("j-1");
    queue.record_start(&job).await?;
    queue.record_failure(&job, "boom").await?;

    let ok = Job::new(json!({ "n": 2 })).with_id("j-2");
    queue.record_start(&ok).await?;
    queue.record_success(&ok).await?;

    assert_eq!(queue.retry_failed_jobs(None).await?, 1);
    assert_eq!(queue.count_started().await?, 1);

    let pending = queue.pending_jobs().await?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, Some(JobId::new("j-1")));
    assert_eq!(pending[0].field("n"), Some(&json!(1)));
    assert!(pending[0].started_at.is_none());
    assert!(pending[0].failed_at.is_none());
    assert!(pending[0].error.is_none());

    // Nothing left to retry
    assert_eq!(queue.retry_failed_jobs(None).await?, 0);

    Ok(())
}

#[tokio::test]
async fn test_retry_respects_max_jobs() -> Result<(), Box<dyn Error>> {
    let (_store, queue) = common::memory_queue();
    for n in 0..3 {
        let job = Job::new(json!({ "n": n })).with_id(format!("j-{}", n));
        queue.record_start(&job).await?;
        queue.record_failure(&job, "boom").await?;
    }

    assert_eq!(queue.retry_failed_jobs(Some(2)).await?, 2);
    assert_eq!(queue.count_pending().await?, 2);
    assert_eq!(queue.count_started().await?, 1);

    // Zero means no limit
    assert_eq!(queue.retry_failed_jobs(Some(0)).await?, 1);
    assert_eq!(queue.count_pending().await?, 3);
    assert_eq!(queue.count_started().await?, 0);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_retries_requeue_once() -> Result<(), Box<dyn Error>> {
    let (_store, queue) = common::memory_queue();
    let job = Job::new(json!({ "n": 1 })).with_id("j-1");
    queue.record_start(&job).await?;
    queue.record_failure(&job, "boom").await?;

    let (a, b) = tokio::join!(queue.retry_failed_jobs(None), queue.retry_failed_jobs(None));
    assert_eq!(a? + b?, 1);
    assert_eq!(queue.count_pending().await?, 1);
    assert_eq!(queue.count_started().await?, 0);

    Ok(())
}

#[tokio::test]
async fn test_retry_keeps_started_record_when_requeue_fails() -> Result<(), Box<dyn Error>> {
    let (store, queue) = common::memory_queue();
    let job = Job::new(json!({ "n": 1 })).with_id("j-1");
    queue.record_start(&job).await?;
    queue.record_failure(&job, "boom").await?;

    // Marking the started record succeeds, writing to pending fails.
    store.inject_failure_after(FailPoint::Transform, 1, 1).await;
    assert!(queue.retry_failed_jobs(None).await.is_err());

    assert_eq!(queue.count_pending().await?, 0);
    let record = store.get(queue.started(), "j-1").await.ok_or("started record lost")?;
    assert_eq!(record[ERROR], "boom");
    assert!(record.get(RETRYING_AT).is_none());

    // The job can still be retried later
    assert_eq!(queue.retry_failed_jobs(None).await?, 1);
    assert_eq!(queue.count_pending().await?, 1);
    assert_eq!(queue.count_started().await?, 0);

    Ok(())
}

#[tokio::test]
async fn test_interrupted_retry_leaves_job_in_started() -> Result<(), Box<dyn Error>> {
    let (store, queue) = common::memory_queue();
    let job = Job::new(json!({ "n": 1 })).with_id("j-1");
    queue.record_start(&job).await?;
    queue.record_failure(&job, "boom").await?;

    // Requeue and clearing the marker both fail, as if the process died
    // after marking.
    store.inject_failure_after(FailPoint::Transform, 1, 2).await;
    assert!(queue.retry_failed_jobs(None).await.is_err());

    assert_eq!(queue.count_pending().await?, 0);
    let record = store.get(queue.started(), "j-1").await.ok_or("started record lost")?;
    assert!(record[RETRYING_AT].is_string());
    assert_eq!(queue.failed_jobs().await?.len(), 1);

    // A fresh marker keeps other retries away
    assert_eq!(queue.retry_failed_jobs(None).await?, 0);

    // Running the job again clears the marker
    queue.record_start(&job).await?;
    let record = store.get(queue.started(), "j-1").await.ok_or("started record lost")?;
    assert!(record.get(RETRYING_AT).is_none());

    Ok(())
}

#[tokio::test]
async fn test_store_errors_propagate() -> Result<(), Box<dyn Error>> {
    let (store, queue) = common::memory_queue();
    store.inject_failure(FailPoint::Push, 1).await;
    assert!(matches!(
        queue.enqueue(Job::new(json!({}))).await,
        Err(actors::QueueError::Store(_))
    ));
    assert_eq!(queue.count_pending().await?, 0);
    Ok(())
}
