#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actors::{
    FnHandler, HandlerFuture, Job, JobProcessor, Queue, Worker, WorkerConfig, WorkerEvent,
    WorkerHandle, WorkerId,
};
use db::{DbConfig, MemoryStore, StoreError, SurrealStore};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// A queue on a fresh in-memory store.
pub fn memory_queue() -> (MemoryStore, Queue) {
    let store = MemoryStore::new();
    let queue = Queue::new(Arc::new(store.clone()), "jobs");
    (store, queue)
}

/// A queue on a fresh in-memory SurrealDB database.
pub async fn surreal_queue() -> Result<Queue, StoreError> {
    let store = SurrealStore::connect(&DbConfig::memory().with_database("test")).await?;
    Ok(Queue::new(Arc::new(store), "jobs"))
}

pub fn fast_config() -> WorkerConfig {
    WorkerConfig::default().with_requery_interval(Duration::from_millis(20))
}

pub fn events() -> (broadcast::Sender<WorkerEvent>, broadcast::Receiver<WorkerEvent>) {
    broadcast::channel(1024)
}

/// Spawn and start a standalone worker.
pub async fn start_worker(
    id: u64,
    queue: &Queue,
    processor: Arc<dyn JobProcessor>,
    event_tx: &broadcast::Sender<WorkerEvent>,
) -> WorkerHandle {
    let handle = Worker::new(WorkerId(id), queue.clone(), processor)
        .with_config(fast_config())
        .with_event_tx(event_tx.clone())
        .spawn()
        .await
        .expect("spawn worker");
    handle.start().await.expect("start worker");
    handle
}

/// Wait for the first event matching `pred`, skipping the others.
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<WorkerEvent>, mut pred: F) -> WorkerEvent
where
    F: FnMut(&WorkerEvent) -> bool,
{
    tokio::time::timeout(TIMEOUT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for worker event")
}

/// Receive the next event.
pub async fn next_event(rx: &mut broadcast::Receiver<WorkerEvent>) -> WorkerEvent {
    wait_for(rx, |_| true).await
}

/// Wait for `count` `Finished` events.
pub async fn wait_finished(rx: &mut broadcast::Receiver<WorkerEvent>, count: usize) {
    for _ in 0..count {
        wait_for(rx, |e| matches!(e, WorkerEvent::Finished { .. })).await;
    }
}

/// Poll `check` until it holds or the timeout passes.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Processor that succeeds after `delay` and counts executions.
pub fn counting_processor(delay: Duration) -> (Arc<dyn JobProcessor>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let handler = FnHandler::new("count", move |_job: &Job| -> HandlerFuture {
        let counter = counter.clone();
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok(())
        })
    });
    (Arc::new(handler), count)
}

/// Processor that records every job it runs, in order.
pub fn recording_processor() -> (Arc<dyn JobProcessor>, Arc<Mutex<Vec<Job>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();
    let handler = FnHandler::new("record", move |job: &Job| -> HandlerFuture {
        recorder.lock().unwrap().push(job.clone());
        Box::pin(async move { Ok(()) })
    });
    (Arc::new(handler), seen)
}

/// Processor that fails every job with `message`.
pub fn failing_processor(message: &'static str) -> Arc<dyn JobProcessor> {
    Arc::new(FnHandler::new("fail", move |_job: &Job| -> HandlerFuture {
        Box::pin(async move { Err(message.to_string()) })
    }))
}
