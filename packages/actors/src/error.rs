//! Error types for queue, worker and runner operations.

use db::StoreError;
use queue_core::JobError;

/// Error type for queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Job has no id")]
    MissingJobId,

    #[error("Failed to create worker: {0}")]
    Factory(String),

    #[error("Failed to spawn actor: {0}")]
    Spawn(#[from] ractor::SpawnErr),

    #[error("Actor error: {0}")]
    Messaging(String),

    #[error("Runner is not running")]
    RunnerStopped,
}

impl<T> From<ractor::MessagingErr<T>> for QueueError {
    fn from(err: ractor::MessagingErr<T>) -> Self {
        QueueError::Messaging(err.to_string())
    }
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}
