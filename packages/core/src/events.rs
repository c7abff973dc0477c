//! Worker lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Job, JobId};

/// Identifier for a worker, unique within the process that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Events emitted by a worker as it claims and executes jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// The worker won the claim for a job and is about to run it.
    Started {
        worker_id: WorkerId,
        job: Job,
        timestamp: DateTime<Utc>,
    },
    /// The job function reported success.
    Succeeded {
        worker_id: WorkerId,
        job: Job,
        timestamp: DateTime<Utc>,
    },
    /// The job function reported a failure.
    Failed {
        worker_id: WorkerId,
        job: Job,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// The job's outcome has been handled, whatever it was.
    Finished {
        worker_id: WorkerId,
        job: Job,
        timestamp: DateTime<Utc>,
    },
    /// No candidate was waiting after a job finished.
    Idle {
        worker_id: WorkerId,
        timestamp: DateTime<Utc>,
    },
    /// A store error halted the worker.
    Error {
        worker_id: WorkerId,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl WorkerEvent {
    /// A worker claimed `job` and is about to run it.
    pub fn started(worker_id: WorkerId, job: &Job) -> Self {
        Self::Started {
            worker_id,
            job: job.clone(),
            timestamp: Utc::now(),
        }
    }

    /// `job` reported success.
    pub fn succeeded(worker_id: WorkerId, job: &Job) -> Self {
        Self::Succeeded {
            worker_id,
            job: job.clone(),
            timestamp: Utc::now(),
        }
    }

    /// `job` reported failure with `error`.
    pub fn failed(worker_id: WorkerId, job: &Job, error: impl Into<String>) -> Self {
        Self::Failed {
            worker_id,
            job: job.clone(),
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    /// The outcome of `job` has been recorded.
    pub fn finished(worker_id: WorkerId, job: &Job) -> Self {
        Self::Finished {
            worker_id,
            job: job.clone(),
            timestamp: Utc::now(),
        }
    }

    /// The worker ran out of pending jobs.
    pub fn idle(worker_id: WorkerId) -> Self {
        Self::Idle {
            worker_id,
            timestamp: Utc::now(),
        }
    }

    /// The worker halted on a store error.
    pub fn error(worker_id: WorkerId, error: impl Into<String>) -> Self {
        Self::Error {
            worker_id,
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    /// Get the worker that emitted the event.
    pub fn worker_id(&self) -> WorkerId {
        match self {
            WorkerEvent::Started { worker_id, .. }
            | WorkerEvent::Succeeded { worker_id, .. }
            | WorkerEvent::Failed { worker_id, .. }
            | WorkerEvent::Finished { worker_id, .. }
            | WorkerEvent::Idle { worker_id, .. }
            | WorkerEvent::Error { worker_id, .. } => *worker_id,
        }
    }

    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            WorkerEvent::Started { timestamp, .. }
            | WorkerEvent::Succeeded { timestamp, .. }
            | WorkerEvent::Failed { timestamp, .. }
            | WorkerEvent::Finished { timestamp, .. }
            | WorkerEvent::Idle { timestamp, .. }
            | WorkerEvent::Error { timestamp, .. } => *timestamp,
        }
    }

    /// Get the job the event refers to, if any.
    pub fn job(&self) -> Option<&Job> {
        match self {
            WorkerEvent::Started { job, .. }
            | WorkerEvent::Succeeded { job, .. }
            | WorkerEvent::Failed { job, .. }
            | WorkerEvent::Finished { job, .. } => Some(job),
            WorkerEvent::Idle { .. } | WorkerEvent::Error { .. } => None,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<&JobId> {
        self.job().and_then(|job| job.id.as_ref())
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        let job = self
            .job_id()
            .map(ToString::to_string)
            .unwrap_or_else(|| "?".to_string());
        match self {
            WorkerEvent::Started { worker_id, .. } => {
                format!("Job {} started by {}", job, worker_id)
            }
            WorkerEvent::Succeeded { worker_id, .. } => {
                format!("Job {} succeeded on {}", job, worker_id)
            }
            WorkerEvent::Failed {
                worker_id, error, ..
            } => format!("Job {} failed on {}: {}", job, worker_id, error),
            WorkerEvent::Finished { worker_id, .. } => {
                format!("Job {} finished on {}", job, worker_id)
            }
            WorkerEvent::Idle { worker_id, .. } => format!("{} is idle", worker_id),
            WorkerEvent::Error {
                worker_id, error, ..
            } => format!("{} halted: {}", worker_id, error),
        }
    }
}
