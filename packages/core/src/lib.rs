//! Core domain types for the work queue.
//!
//! This crate contains shared types used across all packages:
//! - Job and JobId for work items, including the reserved lifecycle fields
//! - WorkerId and WorkerEvent for worker lifecycle notifications

mod events;
mod job;

pub use events::{WorkerEvent, WorkerId};
pub use job::{
    ERROR, FAILED_AT, Job, JobError, JobId, RESERVED_FIELDS, RETRYING_AT, STARTED_AT, SUCCEEDED_AT,
};
