//! Job processors, the completion callback, and the handler registry.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use queue_core::{Job, JobId};
use serde_json::Value;
use tokio::sync::oneshot;

/// Outcome of a job: `Err` carries the failure message.
pub type JobOutcome = Result<(), String>;

pub type HandlerResult = JobOutcome;

pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Executes claimed jobs.
///
/// `process` must not block: start the work and report through `done`, from
/// any task, exactly once. Dropping every clone of `done` without reporting
/// counts as a failure.
pub trait JobProcessor: Send + Sync + 'static {
    fn process(&self, job: Job, done: Completion);
}

impl<F> JobProcessor for F
where
    F: Fn(Job, Completion) + Send + Sync + 'static,
{
    fn process(&self, job: Job, done: Completion) {
        self(job, done)
    }
}

/// Single-use callback reporting a job's outcome to its worker.
///
/// Only the first report counts. Later reports are logged and ignored.
#[derive(Clone)]
pub struct Completion {
    job_id: Option<JobId>,
    tx: Arc<Mutex<Option<oneshot::Sender<JobOutcome>>>>,
}

impl Completion {
    pub(crate) fn new(job_id: Option<JobId>) -> (Self, oneshot::Receiver<JobOutcome>) {
        let (tx, rx) = oneshot::channel();
        let completion = Self {
            job_id,
            tx: Arc::new(Mutex::new(Some(tx))),
        };
        (completion, rx)
    }

    /// Report success. Returns `false` if an outcome was already reported.
    pub fn succeed(&self) -> bool {
        self.complete(Ok(()))
    }

    /// Report failure. Returns `false` if an outcome was already reported.
    pub fn fail(&self, error: impl Into<String>) -> bool {
        self.complete(Err(error.into()))
    }

    /// Report `outcome`. Returns `false` if an outcome was already reported.
    pub fn complete(&self, outcome: JobOutcome) -> bool {
        let sender = self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match sender {
            Some(tx) => {
                // The worker may already be gone; the outcome is moot then.
                let _ = tx.send(outcome);
                true
            }
            None => {
                tracing::error!(
                    "Completion for job {} reported more than once; ignoring {:?}",
                    self.job_label(),
                    outcome
                );
                false
            }
        }
    }

    /// Whether an outcome has been reported.
    pub fn is_complete(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }

    fn job_label(&self) -> String {
        self.job_id
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "?".to_string())
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("job_id", &self.job_id)
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Describe a panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("Job panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("Job panicked: {}", message)
    } else {
        "Job panicked".to_string()
    }
}

/// Run a handler future on its own task and report its outcome.
fn spawn_handler(future: HandlerFuture, done: Completion) {
    tokio::spawn(async move {
        let outcome = match tokio::spawn(future).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => Err(panic_message(e.into_panic())),
            Err(e) => Err(format!("Job task cancelled: {}", e)),
        };
        done.complete(outcome);
    });
}

/// Async handler for one job type, selected by the job's `type` field.
pub trait JobHandler: Send + Sync + 'static {
    fn job_type(&self) -> &str;

    /// Build the future that runs `job`. The future is spawned on its own task.
    fn handle(&self, job: &Job) -> HandlerFuture;
}

/// Registry for job handlers.
///
/// Maps the `type` field of a job to its handler. Jobs of unknown type fail.
#[derive(Default)]
pub struct JobHandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Add `handler`, replacing any handler for the same job type.
    pub fn register<H: JobHandler>(&mut self, handler: H) {
        let job_type = handler.job_type().to_string();
        self.handlers.insert(job_type, Arc::new(handler));
    }

    /// Handler registered for `job_type`.
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn has_handler(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }
}

impl JobProcessor for JobHandlerRegistry {
    fn process(&self, job: Job, done: Completion) {
        let job_type = job.field("type").and_then(Value::as_str).unwrap_or_default();
        match self.get(job_type) {
            Some(handler) => spawn_handler(handler.handle(&job), done),
            None => {
                done.fail(format!("No handler for job type: {}", job_type));
            }
        }
    }
}

/// Handler backed by a closure.
///
/// Usable on its own as a processor for every job, or registered under its
/// job type.
pub struct FnHandler<F>
where
    F: Fn(&Job) -> HandlerFuture + Send + Sync + 'static,
{
    job_type: String,
    handler: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&Job) -> HandlerFuture + Send + Sync + 'static,
{
    pub fn new(job_type: impl Into<String>, handler: F) -> Self {
        Self {
            job_type: job_type.into(),
            handler,
        }
    }
}

impl<F> JobHandler for FnHandler<F>
where
    F: Fn(&Job) -> HandlerFuture + Send + Sync + 'static,
{
    fn job_type(&self) -> &str {
        &self.job_type
    }

    fn handle(&self, job: &Job) -> HandlerFuture {
        (self.handler)(job)
    }
}

impl<F> JobProcessor for FnHandler<F>
where
    F: Fn(&Job) -> HandlerFuture + Send + Sync + 'static,
{
    fn process(&self, job: Job, done: Completion) {
        spawn_handler(self.handle(&job), done);
    }
}

/// Build a [`FnHandler`] whose body runs in an `async move` block over an
/// owned copy of the job.
#[macro_export]
macro_rules! job_handler {
    ($job_type:expr, |$job:ident| $body:expr) => {
        $crate::FnHandler::new($job_type, |$job: &$crate::Job| -> $crate::HandlerFuture {
            let $job = $job.clone();
            Box::pin(async move { $body })
        })
    };
}
