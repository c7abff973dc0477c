//! Worker actor for claiming and executing jobs.
//!
//! A worker watches the first job of the pending collection. Whenever it is
//! not busy it tries to claim that job with a conditional delete; the worker
//! whose delete commits is the job's only executor. The job runs outside the
//! actor mailbox and its outcome comes back as a message, so `stop` is
//! handled while a job is in flight.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use db::{Entry, FirstItemSubscription, Transform};
use queue_core::{Job, JobId, WorkerEvent, WorkerId};
use ractor::{Actor, ActorCell, ActorProcessingErr, ActorRef, ActorStatus, RpcReplyPort};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::WorkerConfig;
use crate::error::QueueError;
use crate::handler::{Completion, JobOutcome, JobProcessor, panic_message};
use crate::messages::WorkerMessage;
use crate::queue::Queue;

/// Where a worker is in its run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Created, not yet started.
    Idle,
    /// Subscribed and waiting for a job to claim.
    Watching,
    /// A claim is in progress.
    Claiming,
    /// Executing a claimed job.
    Running,
    Stopped,
}

/// Snapshot of a worker's counters.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStats {
    pub id: WorkerId,
    pub state: WorkerState,
    pub succeeded: u64,
    pub failed: u64,
    pub current_job: Option<JobId>,
}

/// A worker that has not been spawned yet.
///
/// Build one with [`Worker::new`], then [`Worker::spawn`] it and call
/// [`WorkerHandle::start`].
pub struct Worker {
    id: WorkerId,
    queue: Queue,
    processor: Arc<dyn JobProcessor>,
    config: WorkerConfig,
    event_tx: Option<broadcast::Sender<WorkerEvent>>,
}

impl Worker {
    /// Worker `id` that runs jobs from `queue` with `processor`.
    pub fn new(id: WorkerId, queue: Queue, processor: Arc<dyn JobProcessor>) -> Self {
        Self {
            id,
            queue,
            processor,
            config: WorkerConfig::default(),
            event_tx: None,
        }
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the event broadcaster.
    pub fn with_event_tx(mut self, tx: broadcast::Sender<WorkerEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Worker id.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Spawn the worker's actor.
    pub async fn spawn(self) -> Result<WorkerHandle, QueueError> {
        let id = self.id;
        let (actor, _handle) = Actor::spawn(None, WorkerActor, self).await?;
        Ok(WorkerHandle { id, actor })
    }

    /// Spawn the worker's actor under a supervisor.
    pub(crate) async fn spawn_linked(self, supervisor: ActorCell) -> Result<WorkerHandle, QueueError> {
        let id = self.id;
        let (actor, _handle) = Actor::spawn_linked(None, WorkerActor, self, supervisor).await?;
        Ok(WorkerHandle { id, actor })
    }
}

/// Handle on a spawned worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    actor: ActorRef<WorkerMessage>,
}

impl WorkerHandle {
    /// Worker id.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// The underlying actor reference.
    pub fn actor(&self) -> &ActorRef<WorkerMessage> {
        &self.actor
    }

    /// Whether the actor is still running, i.e. not stopping or stopped.
    pub fn is_alive(&self) -> bool {
        !matches!(
            self.actor.get_status(),
            ActorStatus::Stopping | ActorStatus::Stopped
        )
    }

    /// Subscribe to pending jobs. Starting twice is a no-op.
    pub async fn start(&self) -> Result<(), QueueError> {
        let (tx, rx) = ractor::concurrency::oneshot();
        self.actor
            .send_message(WorkerMessage::Start { reply: tx.into() })?;
        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(QueueError::Messaging(format!(
                "{} failed to start: {}",
                self.id, e
            ))),
            Err(_) => Err(QueueError::Messaging(format!("{} stopped", self.id))),
        }
    }

    /// Ask the worker to start without waiting for its subscription.
    pub(crate) fn request_start(&self) -> Result<(), QueueError> {
        let (tx, _rx) = ractor::concurrency::oneshot();
        self.actor
            .send_message(WorkerMessage::Start { reply: tx.into() })?;
        Ok(())
    }

    /// Stop the worker.
    ///
    /// Resolves once the in-flight job, if any, has finished and been
    /// recorded. Stopping a worker that already stopped resolves at once.
    pub async fn stop(&self) {
        let (tx, rx) = ractor::concurrency::oneshot();
        if self
            .actor
            .send_message(WorkerMessage::Stop { reply: tx.into() })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Current state and counters.
    pub async fn stats(&self) -> Result<WorkerStats, QueueError> {
        let (tx, rx) = ractor::concurrency::oneshot();
        self.actor
            .send_message(WorkerMessage::GetStats { reply: tx.into() })?;
        rx.await
            .map_err(|_| QueueError::Messaging(format!("{} stopped", self.id)))
    }
}

/// Live subscription plus the task forwarding it into the mailbox.
struct Watch {
    subscription: FirstItemSubscription,
    forwarder: JoinHandle<()>,
}

impl Watch {
    fn open(subscription: FirstItemSubscription, myself: ActorRef<WorkerMessage>) -> Self {
        let mut rx = subscription.receiver();
        let forwarder = tokio::spawn(async move {
            let first = rx.borrow_and_update().clone();
            if myself.send_message(WorkerMessage::Candidate(first)).is_err() {
                return;
            }
            while rx.changed().await.is_ok() {
                let first = rx.borrow_and_update().clone();
                if myself.send_message(WorkerMessage::Candidate(first)).is_err() {
                    return;
                }
            }
            let _ = myself.send_message(WorkerMessage::WatchClosed);
        });
        Self {
            subscription,
            forwarder,
        }
    }

    fn current(&self) -> Option<Entry> {
        self.subscription.current()
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// State for the worker actor.
pub struct WorkerActorState {
    id: WorkerId,
    queue: Queue,
    processor: Arc<dyn JobProcessor>,
    config: WorkerConfig,
    event_tx: Option<broadcast::Sender<WorkerEvent>>,
    state: WorkerState,
    watch: Option<Watch>,
    /// Latest first pending job seen while unable to claim it.
    candidate: Option<Entry>,
    current_job: Option<Job>,
    requery_scheduled: bool,
    succeeded: u64,
    failed: u64,
    processed_since_start: u64,
    stop_requests: Vec<RpcReplyPort<()>>,
}

impl WorkerActorState {
    fn new(worker: Worker) -> Self {
        Self {
            id: worker.id,
            queue: worker.queue,
            processor: worker.processor,
            config: worker.config,
            event_tx: worker.event_tx,
            state: WorkerState::Idle,
            watch: None,
            candidate: None,
            current_job: None,
            requery_scheduled: false,
            succeeded: 0,
            failed: 0,
            processed_since_start: 0,
            stop_requests: Vec::new(),
        }
    }

    fn emit(&self, event: WorkerEvent) {
        tracing::debug!("{}", event.description());
        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(event);
        }
    }

    fn stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.id,
            state: self.state,
            succeeded: self.succeeded,
            failed: self.failed,
            current_job: self.current_job.as_ref().and_then(|job| job.id.clone()),
        }
    }

    /// Halt on a store error. The returned error fails the actor so its
    /// supervisor can replace it.
    fn halt(&mut self, error: String) -> ActorProcessingErr {
        tracing::error!("Worker {} halted: {}", self.id, error);
        self.emit(WorkerEvent::error(self.id, error.clone()));
        self.watch = None;
        self.candidate = None;
        self.state = WorkerState::Stopped;
        for reply in self.stop_requests.drain(..) {
            let _ = reply.send(());
        }
        ActorProcessingErr::from(error)
    }

    async fn start(&mut self, myself: &ActorRef<WorkerMessage>) -> Result<(), String> {
        if self.state != WorkerState::Idle {
            return Ok(());
        }
        let subscription = self
            .queue
            .store()
            .watch_first(self.queue.pending())
            .await
            .map_err(|e| format!("Failed to watch {}: {}", self.queue.pending(), e))?;
        self.watch = Some(Watch::open(subscription, myself.clone()));
        self.state = WorkerState::Watching;
        tracing::info!("Worker {} watching {}", self.id, self.queue.pending());
        Ok(())
    }

    /// Claim candidates until one is won or none is left.
    async fn claim_candidates(
        &mut self,
        myself: &ActorRef<WorkerMessage>,
    ) -> Result<(), ActorProcessingErr> {
        while self.state == WorkerState::Watching {
            let Some(candidate) = self.candidate.take() else {
                return Ok(());
            };
            self.state = WorkerState::Claiming;

            let claim = |current: Option<&Value>| match current {
                Some(_) => Transform::Delete,
                None => Transform::Abort,
            };
            let outcome = match self
                .queue
                .store()
                .transform(self.queue.pending(), &candidate.key, &claim)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    return Err(self.halt(format!("Claim of job {} failed: {}", candidate.key, e)));
                }
            };

            match outcome.previous {
                Some(value) if outcome.committed => {
                    return self.run_job(myself, &candidate.key, value).await;
                }
                _ => {
                    tracing::debug!("Worker {} lost claim on job {}", self.id, candidate.key);
                    self.state = WorkerState::Watching;
                    match self.watch.as_ref().and_then(Watch::current) {
                        Some(first) if first.key != candidate.key => {
                            self.candidate = Some(first);
                        }
                        Some(_) => self.schedule_requery(myself),
                        None => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// Re-read the first pending job after the requery interval.
    fn schedule_requery(&mut self, myself: &ActorRef<WorkerMessage>) {
        if self.requery_scheduled {
            return;
        }
        self.requery_scheduled = true;
        let interval = self.config.requery_interval;
        let myself = myself.clone();
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let _ = myself.send_message(WorkerMessage::Requery);
        });
    }

    async fn run_job(
        &mut self,
        myself: &ActorRef<WorkerMessage>,
        key: &str,
        value: Value,
    ) -> Result<(), ActorProcessingErr> {
        let job = match Job::from_entry(key, value.clone()) {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!("Job {} has an unexpected shape: {}", key, e);
                Job::new(value).with_id(key)
            }
        };

        self.state = WorkerState::Running;
        self.current_job = Some(job.clone());
        self.emit(WorkerEvent::started(self.id, &job));

        if let Err(e) = self.queue.record_start(&job).await {
            return Err(self.halt(format!("Failed to record start of job {}: {}", key, e)));
        }

        let (done, rx) = Completion::new(job.id.clone());
        dispatch(self.processor.as_ref(), job.clone(), done);

        let myself = myself.clone();
        tokio::spawn(async move {
            let outcome = rx
                .await
                .unwrap_or_else(|_| Err("Job completed without reporting an outcome".to_string()));
            let _ = myself.send_message(WorkerMessage::JobFinished {
                job: Box::new(job),
                outcome,
            });
        });
        Ok(())
    }

    async fn finish_job(
        &mut self,
        myself: &ActorRef<WorkerMessage>,
        job: Job,
        outcome: JobOutcome,
    ) -> Result<(), ActorProcessingErr> {
        let recorded = match outcome {
            Err(error) => {
                self.failed += 1;
                self.emit(WorkerEvent::failed(self.id, &job, error.clone()));
                self.queue.record_failure(&job, &error).await
            }
            Ok(()) => {
                self.succeeded += 1;
                self.emit(WorkerEvent::succeeded(self.id, &job));
                self.queue.record_success(&job).await
            }
        };
        if let Err(e) = recorded {
            let id = job.id.as_ref().map(JobId::as_str).unwrap_or("?");
            return Err(self.halt(format!("Failed to record outcome of job {}: {}", id, e)));
        }

        self.processed_since_start += 1;
        self.current_job = None;
        self.emit(WorkerEvent::finished(self.id, &job));

        if !self.stop_requests.is_empty() {
            self.state = WorkerState::Stopped;
            for reply in self.stop_requests.drain(..) {
                let _ = reply.send(());
            }
            myself.stop(None);
            return Ok(());
        }

        self.state = WorkerState::Watching;
        if let Some(first) = self.watch.as_ref().and_then(Watch::current) {
            self.candidate = Some(first);
        }
        if self.candidate.is_some() {
            self.claim_candidates(myself).await
        } else {
            if self.processed_since_start > 0 {
                self.emit(WorkerEvent::idle(self.id));
            }
            Ok(())
        }
    }
}

/// Hand a job to the processor. A panic inside `process` fails the job.
fn dispatch(processor: &dyn JobProcessor, job: Job, done: Completion) {
    let reporter = done.clone();
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| processor.process(job, done))) {
        reporter.fail(panic_message(payload));
    }
}

/// Worker actor that claims and executes jobs.
pub struct WorkerActor;

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerActorState;
    type Arguments = Worker;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting worker: {}", args.id);
        Ok(WorkerActorState::new(args))
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.watch = None;
        tracing::info!(
            "Worker {} stopped ({} succeeded, {} failed)",
            state.id,
            state.succeeded,
            state.failed
        );
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Start { reply } => {
                if let Err(e) = state.start(&myself).await {
                    let _ = reply.send(Err(e.clone()));
                    return Err(state.halt(e));
                }
                let _ = reply.send(Ok(()));
            }

            WorkerMessage::Candidate(first) => {
                if state.watch.is_none() {
                    return Ok(());
                }
                state.candidate = first;
                state.claim_candidates(&myself).await?;
            }

            WorkerMessage::Requery => {
                state.requery_scheduled = false;
                if state.state == WorkerState::Watching && state.candidate.is_none() {
                    state.candidate = state.watch.as_ref().and_then(Watch::current);
                    state.claim_candidates(&myself).await?;
                }
            }

            WorkerMessage::WatchClosed => {
                if state.watch.is_some() {
                    let error = format!("Subscription to {} closed", state.queue.pending());
                    return Err(state.halt(error));
                }
            }

            WorkerMessage::JobFinished { job, outcome } => {
                state.finish_job(&myself, *job, outcome).await?;
            }

            WorkerMessage::Stop { reply } => {
                state.watch = None;
                state.candidate = None;
                if state.state == WorkerState::Running {
                    tracing::info!(
                        "Stopping worker {} after its current job",
                        state.id
                    );
                    state.stop_requests.push(reply);
                } else {
                    tracing::info!("Stopping worker: {}", state.id);
                    state.state = WorkerState::Stopped;
                    let _ = reply.send(());
                    myself.stop(None);
                }
            }

            WorkerMessage::GetStats { reply } => {
                let _ = reply.send(state.stats());
            }
        }

        Ok(())
    }
}
