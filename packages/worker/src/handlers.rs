//! Demo job handlers, selected by the job's `type` field.

use std::time::Duration;

use actors::{FnHandler, HandlerFuture, Job, JobHandlerRegistry, job_handler};
use serde_json::Value;

/// Registry with the `echo`, `sleep` and `fail` handlers.
pub fn demo_handlers() -> JobHandlerRegistry {
    let mut handlers = JobHandlerRegistry::new();

    handlers.register(job_handler!("echo", |job| {
        tracing::info!("Echo job: {:?}", job.payload);
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(())
    }));

    handlers.register(FnHandler::new("sleep", |job: &Job| -> HandlerFuture {
        let seconds = job.field("seconds").and_then(Value::as_u64).unwrap_or(5);
        Box::pin(async move {
            tracing::info!("Sleeping for {} seconds", seconds);
            tokio::time::sleep(Duration::from_secs(seconds)).await;
            Ok(())
        })
    }));

    // Fails unless the job sets `"fail": false`, for exercising retries
    handlers.register(FnHandler::new("fail", |job: &Job| -> HandlerFuture {
        let should_fail = job.field("fail").and_then(Value::as_bool).unwrap_or(true);
        Box::pin(async move {
            if should_fail {
                Err("Intentional failure".into())
            } else {
                Ok(())
            }
        })
    }));

    handlers
}
