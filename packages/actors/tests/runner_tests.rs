#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::time::Duration;

use actors::{
    Job, QueueError, QueueWorkerFactory, Worker, WorkerEvent, WorkerId, start_runner,
};
use db::FailPoint;
use serde_json::json;

fn ids(workers: &[actors::WorkerHandle]) -> Vec<u64> {
    workers.iter().map(|w| w.id().0).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_converges_to_requested_size() -> Result<(), Box<dyn Error>> {
    let (_store, queue) = common::memory_queue();
    let (processor, _count) = common::counting_processor(Duration::ZERO);
    let runner =
        start_runner(QueueWorkerFactory::new(queue, processor).with_config(common::fast_config()))
            .await?;

    let added = runner.set_number_of_workers(5).await?;
    assert_eq!(ids(&added), vec![1, 2, 3, 4, 5]);
    assert_eq!(runner.worker_count().await?, 5);

    // Shrinking evicts the oldest workers and waits for them to stop
    let removed = runner.set_number_of_workers(2).await?;
    assert_eq!(ids(&removed), vec![1, 2, 3]);
    assert_eq!(ids(&runner.workers().await?), vec![4, 5]);
    let evicted = &removed;
    assert!(common::eventually(|| async move { evicted.iter().all(|w| !w.is_alive()) }).await);

    assert!(runner.set_number_of_workers(2).await?.is_empty());

    let added = runner.increment_workers(2).await?;
    assert_eq!(ids(&added), vec![6, 7]);
    assert_eq!(runner.worker_count().await?, 4);

    let removed = runner.decrement_workers(10).await?;
    assert_eq!(removed.len(), 4);
    assert_eq!(runner.worker_count().await?, 0);

    runner.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_processes_jobs() -> Result<(), Box<dyn Error>> {
    let (_store, queue) = common::memory_queue();
    let (processor, _count) = common::counting_processor(Duration::from_millis(5));
    let runner = start_runner(
        QueueWorkerFactory::new(queue.clone(), processor).with_config(common::fast_config()),
    )
    .await?;
    let mut events = runner.subscribe();

    runner.set_number_of_workers(3).await?;
    for n in 0..10 {
        queue.enqueue(Job::new(json!({ "n": n }))).await?;
    }
    common::wait_finished(&mut events, 10).await;

    assert_eq!(queue.count_pending().await?, 0);
    assert_eq!(queue.count_started().await?, 10);

    runner.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_worker_is_replaced() -> Result<(), Box<dyn Error>> {
    let (store, queue) = common::memory_queue();
    let (processor, _count) = common::counting_processor(Duration::ZERO);
    let runner = start_runner(
        QueueWorkerFactory::new(queue.clone(), processor).with_config(common::fast_config()),
    )
    .await?;
    let mut events = runner.subscribe();
    runner.set_number_of_workers(3).await?;

    // The first claim attempt hits a store error; another worker gets the job
    store.inject_failure(FailPoint::Transform, 1).await;
    queue.enqueue(Job::new(json!({}))).await?;

    let error = common::wait_for(&mut events, |e| matches!(e, WorkerEvent::Error { .. })).await;
    let failed = error.worker_id();

    let handle = &runner;
    assert!(
        common::eventually(|| async move {
            match handle.workers().await {
                Ok(workers) => {
                    workers.len() == 3
                        && workers.iter().all(|w| w.id() != failed)
                        && workers.iter().any(|w| w.id() == WorkerId(4))
                }
                Err(_) => false,
            }
        })
        .await
    );

    let jobs = &queue;
    assert!(common::eventually(|| async move { matches!(jobs.count_started().await, Ok(1)) }).await);

    runner.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_replacement_is_retried() -> Result<(), Box<dyn Error>> {
    let (store, queue) = common::memory_queue();
    let (processor, _count) = common::counting_processor(Duration::ZERO);
    let jobs = queue.clone();
    // The first replacement (worker 4) cannot be built
    let factory = move |id: WorkerId| {
        if id == WorkerId(4) {
            Err(QueueError::Factory("no capacity".to_string()))
        } else {
            Ok(Worker::new(id, jobs.clone(), processor.clone()).with_config(common::fast_config()))
        }
    };
    let runner = start_runner(factory).await?;
    let mut events = runner.subscribe();
    runner.set_number_of_workers(3).await?;

    store.inject_failure(FailPoint::Transform, 1).await;
    queue.enqueue(Job::new(json!({}))).await?;

    let error = common::wait_for(&mut events, |e| matches!(e, WorkerEvent::Error { .. })).await;
    let failed = error.worker_id();

    let handle = &runner;
    assert!(
        common::eventually(|| async move {
            match handle.workers().await {
                Ok(workers) => {
                    workers.len() == 3
                        && workers.iter().all(|w| w.id() != failed)
                        && workers.iter().any(|w| w.id() == WorkerId(5))
                }
                Err(_) => false,
            }
        })
        .await
    );

    runner.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_factory_errors_reach_the_caller() -> Result<(), Box<dyn Error>> {
    let (_store, queue) = common::memory_queue();
    let (processor, _count) = common::counting_processor(Duration::ZERO);
    let factory = move |id: WorkerId| {
        if id.0 > 2 {
            Err(QueueError::Factory("no capacity".to_string()))
        } else {
            Ok(Worker::new(id, queue.clone(), processor.clone()))
        }
    };
    let runner = start_runner(factory).await?;

    let result = runner.set_number_of_workers(3).await;
    assert!(matches!(result, Err(QueueError::Factory(_))));
    assert_eq!(runner.worker_count().await?, 2);

    runner.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_stops_workers_and_runner() -> Result<(), Box<dyn Error>> {
    let (_store, queue) = common::memory_queue();
    let (processor, _count) = common::counting_processor(Duration::ZERO);
    let runner = start_runner(QueueWorkerFactory::new(queue, processor)).await?;
    let workers = runner.set_number_of_workers(2).await?;

    runner.shutdown().await;

    let stopped = &workers;
    assert!(common::eventually(|| async move { stopped.iter().all(|w| !w.is_alive()) }).await);
    let runner_ref = &runner;
    assert!(
        common::eventually(|| async move { runner_ref.worker_count().await.is_err() }).await
    );
    assert!(matches!(
        runner.set_number_of_workers(1).await,
        Err(QueueError::RunnerStopped)
    ));

    Ok(())
}
