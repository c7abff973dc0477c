//! Message types for actor communication.

use db::Entry;
use queue_core::Job;
use ractor::RpcReplyPort;

use crate::error::QueueError;
use crate::handler::JobOutcome;
use crate::worker_actor::{WorkerHandle, WorkerStats};

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Subscribe to the pending collection and begin claiming jobs.
    Start {
        reply: RpcReplyPort<Result<(), String>>,
    },

    /// The first pending job changed.
    Candidate(Option<Entry>),

    /// Re-read the first pending job after a lost claim.
    Requery,

    /// The pending subscription ended on its own.
    WatchClosed,

    /// The job processor reported an outcome.
    JobFinished {
        job: Box<Job>,
        outcome: JobOutcome,
    },

    /// Stop after the in-flight job, if any, has finished.
    Stop { reply: RpcReplyPort<()> },

    /// Get worker counters and state.
    GetStats { reply: RpcReplyPort<WorkerStats> },
}

/// Requested pool size, absolute or relative to the current size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleTarget {
    Absolute(usize),
    Increment(usize),
    Decrement(usize),
}

impl ScaleTarget {
    /// Resolve against the current pool size.
    pub fn resolve(self, current: usize) -> usize {
        match self {
            ScaleTarget::Absolute(n) => n,
            ScaleTarget::Increment(k) => current.saturating_add(k),
            ScaleTarget::Decrement(k) => current.saturating_sub(k),
        }
    }
}

/// Messages for the Runner.
#[derive(Debug)]
pub enum RunnerMessage {
    /// Grow or shrink the pool. Replies with the added or removed workers.
    Scale {
        target: ScaleTarget,
        reply: RpcReplyPort<Result<Vec<WorkerHandle>, QueueError>>,
    },

    /// List the pool, oldest first.
    ListWorkers { reply: RpcReplyPort<Vec<WorkerHandle>> },

    /// Try again to bring a short pool back to its target size.
    Refill,

    /// Stop every worker, then the runner itself.
    Shutdown { reply: RpcReplyPort<()> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_targets_resolve_against_current_size() {
        assert_eq!(ScaleTarget::Absolute(2).resolve(5), 2);
        assert_eq!(ScaleTarget::Increment(3).resolve(1), 4);
        assert_eq!(ScaleTarget::Decrement(3).resolve(1), 0);
    }
}
