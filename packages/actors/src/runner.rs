//! Runner actor that keeps a pool of workers at a requested size.

use std::sync::Arc;
use std::time::Duration;

use queue_core::{WorkerEvent, WorkerId};
use ractor::{Actor, ActorProcessingErr, ActorRef, SupervisionEvent};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::config::WorkerConfig;
use crate::error::QueueError;
use crate::handler::JobProcessor;
use crate::messages::{RunnerMessage, ScaleTarget};
use crate::queue::Queue;
use crate::worker_actor::{Worker, WorkerHandle};

/// Creates the workers of a pool.
pub trait WorkerFactory: Send + Sync + 'static {
    fn create_worker(&self, id: WorkerId) -> Result<Worker, QueueError>;
}

impl<F> WorkerFactory for F
where
    F: Fn(WorkerId) -> Result<Worker, QueueError> + Send + Sync + 'static,
{
    fn create_worker(&self, id: WorkerId) -> Result<Worker, QueueError> {
        self(id)
    }
}

/// Factory for workers that all serve one queue with one processor.
#[derive(Clone)]
pub struct QueueWorkerFactory {
    queue: Queue,
    processor: Arc<dyn JobProcessor>,
    config: WorkerConfig,
}

impl QueueWorkerFactory {
    /// Factory for workers on `queue` running `processor`, with the default config.
    pub fn new(queue: Queue, processor: Arc<dyn JobProcessor>) -> Self {
        Self {
            queue,
            processor,
            config: WorkerConfig::default(),
        }
    }

    /// Configuration given to every worker.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }
}

impl WorkerFactory for QueueWorkerFactory {
    fn create_worker(&self, id: WorkerId) -> Result<Worker, QueueError> {
        Ok(Worker::new(id, self.queue.clone(), self.processor.clone())
            .with_config(self.config.clone()))
    }
}

/// Delay before another attempt to fill a pool left short by a failed
/// replacement.
const REFILL_DELAY: Duration = Duration::from_millis(500);

/// State for the runner actor.
pub struct RunnerState {
    /// Pool members, oldest first.
    workers: Vec<WorkerHandle>,
    /// Pool size the runner converges to.
    target: usize,
    refill_scheduled: bool,
    /// Last worker number handed out.
    worker_counter: u64,
    factory: Arc<dyn WorkerFactory>,
    event_tx: broadcast::Sender<WorkerEvent>,
    diagnostics: JoinHandle<()>,
    shutting_down: bool,
}

impl RunnerState {
    fn next_worker_id(&mut self) -> WorkerId {
        self.worker_counter += 1;
        WorkerId(self.worker_counter)
    }

    fn position(&self, actor_id: ractor::ActorId) -> Option<usize> {
        self.workers
            .iter()
            .position(|worker| worker.actor().get_id() == actor_id)
    }

    /// Create, link and start `count` workers.
    async fn grow(
        &mut self,
        myself: &ActorRef<RunnerMessage>,
        count: usize,
    ) -> Result<Vec<WorkerHandle>, QueueError> {
        let mut added = Vec::with_capacity(count);
        for _ in 0..count {
            let id = self.next_worker_id();
            let worker = self
                .factory
                .create_worker(id)?
                .with_event_tx(self.event_tx.clone());
            let handle = worker.spawn_linked(myself.get_cell()).await?;
            handle.request_start()?;
            self.workers.push(handle.clone());
            added.push(handle);
        }
        Ok(added)
    }

    /// Evict the `count` oldest workers and stop them in the background.
    ///
    /// `reply` receives the evicted handles once every one of them stopped.
    fn shrink(
        &mut self,
        count: usize,
        reply: ractor::RpcReplyPort<Result<Vec<WorkerHandle>, QueueError>>,
    ) {
        let removed: Vec<WorkerHandle> = self.workers.drain(..count).collect();
        tokio::spawn(async move {
            futures_util::future::join_all(removed.iter().map(|worker| worker.stop())).await;
            let _ = reply.send(Ok(removed));
        });
    }

    /// Drop a failed pool member and start one worker in its place.
    async fn replace(&mut self, myself: &ActorRef<RunnerMessage>, index: usize, reason: &str) {
        let failed = self.workers.remove(index);
        tracing::warn!("Worker {} {}; replacing it", failed.id(), reason);
        self.refill(myself).await;
    }

    /// Start workers until the pool is back at its target size. On failure
    /// the pool stays short and another attempt is scheduled.
    async fn refill(&mut self, myself: &ActorRef<RunnerMessage>) {
        let missing = self.target.saturating_sub(self.workers.len());
        if missing == 0 {
            return;
        }
        match self.grow(myself, missing).await {
            Ok(added) => {
                for worker in added {
                    tracing::info!("Worker {} joined the pool as a replacement", worker.id());
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Pool has {} of {} workers, replacement failed: {}; retrying in {:?}",
                    self.workers.len(),
                    self.target,
                    e,
                    REFILL_DELAY
                );
                self.schedule_refill(myself);
            }
        }
    }

    fn schedule_refill(&mut self, myself: &ActorRef<RunnerMessage>) {
        if self.refill_scheduled {
            return;
        }
        self.refill_scheduled = true;
        let myself = myself.clone();
        tokio::spawn(async move {
            tokio::time::sleep(REFILL_DELAY).await;
            let _ = myself.send_message(RunnerMessage::Refill);
        });
    }
}

/// Log the events worth seeing at a glance.
fn spawn_diagnostics(mut rx: broadcast::Receiver<WorkerEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(
                    event @ (WorkerEvent::Started { .. }
                    | WorkerEvent::Failed { .. }
                    | WorkerEvent::Idle { .. }),
                ) => tracing::info!("{}", event.description()),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Runner diagnostics skipped {} events", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Runner actor arguments.
pub struct RunnerArgs {
    pub factory: Arc<dyn WorkerFactory>,
    pub event_tx: broadcast::Sender<WorkerEvent>,
}

/// Runner actor that manages a worker pool.
pub struct Runner;

impl Actor for Runner {
    type Msg = RunnerMessage;
    type State = RunnerState;
    type Arguments = RunnerArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting worker runner");
        let diagnostics = spawn_diagnostics(args.event_tx.subscribe());
        Ok(RunnerState {
            workers: Vec::new(),
            target: 0,
            refill_scheduled: false,
            worker_counter: 0,
            factory: args.factory,
            event_tx: args.event_tx,
            diagnostics,
            shutting_down: false,
        })
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.diagnostics.abort();
        tracing::info!("Worker runner stopped");
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            RunnerMessage::Scale { target, reply } => {
                if state.shutting_down {
                    let _ = reply.send(Err(QueueError::RunnerStopped));
                    return Ok(());
                }
                let current = state.workers.len();
                let wanted = target.resolve(current);
                if wanted != current {
                    tracing::info!("Scaling workers from {} to {}", current, wanted);
                }
                state.target = wanted;
                if wanted < current {
                    state.shrink(current - wanted, reply);
                } else {
                    let result = state.grow(&myself, wanted - current).await;
                    if result.is_err() {
                        state.target = state.workers.len();
                    }
                    let _ = reply.send(result);
                }
            }

            RunnerMessage::Refill => {
                state.refill_scheduled = false;
                if !state.shutting_down {
                    state.refill(&myself).await;
                }
            }

            RunnerMessage::ListWorkers { reply } => {
                let _ = reply.send(state.workers.clone());
            }

            RunnerMessage::Shutdown { reply } => {
                tracing::info!("Shutting down worker runner");
                state.shutting_down = true;
                state.target = 0;
                let workers: Vec<WorkerHandle> = state.workers.drain(..).collect();
                tokio::spawn(async move {
                    futures_util::future::join_all(workers.iter().map(|worker| worker.stop())).await;
                    myself.stop(None);
                    let _ = reply.send(());
                });
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if state.shutting_down {
            return Ok(());
        }
        match message {
            SupervisionEvent::ActorFailed(cell, err) => {
                if let Some(index) = state.position(cell.get_id()) {
                    let reason = format!("failed: {}", err);
                    state.replace(&myself, index, &reason).await;
                }
            }
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                if let Some(index) = state.position(cell.get_id()) {
                    let reason = format!("terminated unexpectedly: {:?}", reason);
                    state.replace(&myself, index, &reason).await;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Handle on a running runner.
#[derive(Clone)]
pub struct RunnerHandle {
    actor: ActorRef<RunnerMessage>,
    events: broadcast::Sender<WorkerEvent>,
}

impl RunnerHandle {
    /// The runner's actor reference.
    pub fn actor(&self) -> &ActorRef<RunnerMessage> {
        &self.actor
    }

    /// Receive every event emitted by the pool's workers.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    async fn scale(&self, target: ScaleTarget) -> Result<Vec<WorkerHandle>, QueueError> {
        let (tx, rx) = ractor::concurrency::oneshot();
        self.actor
            .send_message(RunnerMessage::Scale {
                target,
                reply: tx.into(),
            })
            .map_err(|_| QueueError::RunnerStopped)?;
        rx.await.map_err(|_| QueueError::RunnerStopped)?
    }

    /// Grow or shrink the pool to `count` workers.
    ///
    /// When growing, resolves with the new workers as soon as they are
    /// started. When shrinking, the oldest workers are evicted and the call
    /// resolves with them once all of them stopped.
    pub async fn set_number_of_workers(
        &self,
        count: usize,
    ) -> Result<Vec<WorkerHandle>, QueueError> {
        self.scale(ScaleTarget::Absolute(count)).await
    }

    /// Add `count` workers. Resolves with the new workers.
    pub async fn increment_workers(&self, count: usize) -> Result<Vec<WorkerHandle>, QueueError> {
        self.scale(ScaleTarget::Increment(count)).await
    }

    /// Remove up to `count` workers, oldest first. Resolves with the removed
    /// workers once they stopped.
    pub async fn decrement_workers(&self, count: usize) -> Result<Vec<WorkerHandle>, QueueError> {
        self.scale(ScaleTarget::Decrement(count)).await
    }

    /// Shrink the pool to zero. The runner keeps running.
    pub async fn stop_all_workers(&self) -> Result<Vec<WorkerHandle>, QueueError> {
        self.set_number_of_workers(0).await
    }

    /// Pool members, oldest first.
    pub async fn workers(&self) -> Result<Vec<WorkerHandle>, QueueError> {
        let (tx, rx) = ractor::concurrency::oneshot();
        self.actor
            .send_message(RunnerMessage::ListWorkers { reply: tx.into() })
            .map_err(|_| QueueError::RunnerStopped)?;
        rx.await.map_err(|_| QueueError::RunnerStopped)
    }

    /// Current pool size.
    pub async fn worker_count(&self) -> Result<usize, QueueError> {
        Ok(self.workers().await?.len())
    }

    /// Stop every worker, then the runner.
    pub async fn shutdown(&self) {
        let (tx, rx) = ractor::concurrency::oneshot();
        if self
            .actor
            .send_message(RunnerMessage::Shutdown { reply: tx.into() })
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

/// Start a runner whose workers come from `factory`. The pool starts empty.
pub async fn start_runner(factory: impl WorkerFactory) -> Result<RunnerHandle, QueueError> {
    let (event_tx, _) = broadcast::channel(1024);
    let args = RunnerArgs {
        factory: Arc::new(factory),
        event_tx: event_tx.clone(),
    };
    let (actor, _handle) = Actor::spawn(None, Runner, args).await?;
    Ok(RunnerHandle {
        actor,
        events: event_tx,
    })
}
