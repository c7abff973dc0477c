//! Actor system for the job queue.
//!
//! This crate provides the queue handle, the Ractor-based workers that
//! claim and execute jobs, and the runner that manages a pool of them.
//!
//! # Architecture
//!
//! - `Queue` - Handle on the pending and started collections of a store
//! - `WorkerActor` - Watches the first pending job, claims it, runs it
//! - `Runner` - Keeps a pool of linked workers at a requested size and
//!   replaces workers that fail
//!
//! # Usage
//!
//! ```ignore
//! use actors::{Queue, QueueWorkerFactory, start_runner};
//!
//! let queue = Queue::new(store, "jobs");
//! let runner = start_runner(QueueWorkerFactory::new(queue, processor)).await?;
//! runner.set_number_of_workers(4).await?;
//! ```

mod config;
mod error;
mod handler;
mod messages;
mod queue;
mod runner;
mod worker_actor;

pub use config::{RunnerConfig, WorkerConfig};
pub use error::{ConfigError, QueueError};
pub use handler::{
    Completion, FnHandler, HandlerFuture, HandlerResult, JobHandler, JobHandlerRegistry,
    JobOutcome, JobProcessor,
};
pub use messages::{RunnerMessage, ScaleTarget, WorkerMessage};
pub use queue::Queue;
pub use runner::{
    QueueWorkerFactory, Runner, RunnerArgs, RunnerHandle, WorkerFactory, start_runner,
};
pub use worker_actor::{Worker, WorkerActor, WorkerHandle, WorkerState, WorkerStats};

pub use queue_core::{Job, JobId, WorkerEvent, WorkerId};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort, concurrency};
