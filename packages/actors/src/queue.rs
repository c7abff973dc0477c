//! Handle on a job queue stored in a backing store.
//!
//! A queue is two collections under one base location: `pending` holds jobs
//! waiting to be claimed, `started` holds jobs that a worker claimed along
//! with their outcome. The handle caches nothing; every call goes to the
//! store.

use std::sync::Arc;

use db::{BackingStore, Collection, FieldUpdate, Transform, format_timestamp};
use queue_core::{ERROR, FAILED_AT, Job, JobId, RETRYING_AT, STARTED_AT, SUCCEEDED_AT};
use serde_json::Value;

use crate::error::QueueError;

/// Age after which another retry may take over a job marked `retryingAt`.
const STALE_RETRY_MINUTES: i64 = 5;

/// A job queue bound to one base location.
#[derive(Clone)]
pub struct Queue {
    store: Arc<dyn BackingStore>,
    base: Collection,
    pending: Collection,
    started: Collection,
}

impl Queue {
    /// Queue rooted at `base`, with `base/pending` and `base/started`.
    pub fn new(store: Arc<dyn BackingStore>, base: impl Into<String>) -> Self {
        let base = Collection::new(base);
        Self {
            pending: base.child("pending"),
            started: base.child("started"),
            store,
            base,
        }
    }

    /// Base location of the queue.
    pub fn base(&self) -> &Collection {
        &self.base
    }

    /// Collection of jobs waiting to be claimed.
    pub fn pending(&self) -> &Collection {
        &self.pending
    }

    /// Collection of claimed jobs and their outcomes.
    pub fn started(&self) -> &Collection {
        &self.started
    }

    /// Backing store shared by every clone of this queue.
    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    /// Add a job to the pending collection.
    ///
    /// Lifecycle metadata is stripped first. Jobs without an id get a
    /// store-generated one; a job with an id overwrites any pending job with
    /// the same id.
    pub async fn enqueue(&self, job: Job) -> Result<JobId, QueueError> {
        let mut job = job.sanitized();
        let id = job.id.take();
        let value = job.to_value()?;

        let id = match id {
            Some(id) => {
                self.store.set(&self.pending, id.as_str(), Some(value)).await?;
                id
            }
            None => JobId::new(self.store.push(&self.pending, value).await?),
        };
        tracing::debug!("Enqueued job {} in {}", id, self.base);
        Ok(id)
    }

    /// Delete a pending job. Missing jobs are ignored.
    pub async fn remove_pending(&self, id: &JobId) -> Result<(), QueueError> {
        self.store.set(&self.pending, id.as_str(), None).await?;
        Ok(())
    }

    /// Delete a started job. Missing jobs are ignored.
    pub async fn remove_started(&self, id: &JobId) -> Result<(), QueueError> {
        self.store.set(&self.started, id.as_str(), None).await?;
        Ok(())
    }

    /// Remove every job, pending and started.
    pub async fn clear(&self) -> Result<(), QueueError> {
        self.store.clear(&self.pending).await?;
        self.store.clear(&self.started).await?;
        Ok(())
    }

    /// Number of pending jobs right now.
    pub async fn count_pending(&self) -> Result<u64, QueueError> {
        Ok(self.store.count(&self.pending).await?)
    }

    /// Number of started jobs right now.
    pub async fn count_started(&self) -> Result<u64, QueueError> {
        Ok(self.store.count(&self.started).await?)
    }

    /// Pending jobs in claim order.
    pub async fn pending_jobs(&self) -> Result<Vec<Job>, QueueError> {
        self.jobs_in(&self.pending).await
    }

    /// Claimed jobs, finished or not.
    pub async fn started_jobs(&self) -> Result<Vec<Job>, QueueError> {
        self.jobs_in(&self.started).await
    }

    /// Claimed jobs whose last run failed.
    pub async fn failed_jobs(&self) -> Result<Vec<Job>, QueueError> {
        let jobs = self.started_jobs().await?;
        Ok(jobs.into_iter().filter(Job::is_failed).collect())
    }

    async fn jobs_in(&self, collection: &Collection) -> Result<Vec<Job>, QueueError> {
        let entries = self.store.snapshot(collection).await?;
        let mut jobs = Vec::with_capacity(entries.len());
        for entry in entries {
            jobs.push(Job::from_entry(&entry.key, entry.value)?);
        }
        Ok(jobs)
    }

    /// Move failed jobs back to pending with their metadata reset.
    ///
    /// Works from one snapshot of the started collection, in its order, and
    /// stops after `max_jobs` jobs (`None` or `0` means no limit). Returns the
    /// number of jobs retried.
    ///
    /// Each job is first marked with `retryingAt` by a conditional transform
    /// that only succeeds while the record is failed and unmarked, so
    /// concurrent calls never requeue the same job twice. The job is then
    /// written to pending, and only after that succeeds is the marked record
    /// deleted from started. A marker older than five minutes is left by a
    /// retry that never finished and may be taken over.
    pub async fn retry_failed_jobs(&self, max_jobs: Option<usize>) -> Result<usize, QueueError> {
        let limit = max_jobs.filter(|n| *n > 0);
        let now = self.store.server_time().await?;
        let marker = format_timestamp(now);
        let stale_before = format_timestamp(now - chrono::Duration::minutes(STALE_RETRY_MINUTES));
        let mut retried = 0;

        for entry in self.store.snapshot(&self.started).await? {
            if limit.is_some_and(|n| retried >= n) {
                break;
            }
            if !is_retryable(&entry.value, &stale_before) {
                continue;
            }
            if let Err(e) = Job::from_entry(&entry.key, entry.value.clone()) {
                tracing::warn!("Skipping unreadable started job {}: {}", entry.key, e);
                continue;
            }

            let mark = {
                let marker = marker.clone();
                let stale_before = stale_before.clone();
                move |current: Option<&Value>| match current {
                    Some(value) if is_retryable(value, &stale_before) => {
                        Transform::Set(with_marker(value, Some(marker.as_str())))
                    }
                    _ => Transform::Abort,
                }
            };
            let outcome = self
                .store
                .transform(&self.started, &entry.key, &mark)
                .await?;
            let record = match outcome.previous {
                Some(record) if outcome.committed => record,
                _ => {
                    tracing::debug!("Job {} no longer failed, not retrying", entry.key);
                    continue;
                }
            };

            if let Err(e) = self.requeue(&entry.key, &record).await {
                self.unmark(&entry.key, &marker).await;
                return Err(e);
            }

            let release = {
                let marker = marker.clone();
                move |current: Option<&Value>| match current {
                    Some(value) if holds_marker(value, &marker) => Transform::Delete,
                    _ => Transform::Abort,
                }
            };
            let outcome = self
                .store
                .transform(&self.started, &entry.key, &release)
                .await?;
            if !outcome.committed {
                tracing::debug!("Job {} restarted before its retry finished", entry.key);
            }
            retried += 1;
        }

        if retried > 0 {
            tracing::info!("Retried {} failed jobs in {}", retried, self.base);
        }
        Ok(retried)
    }

    async fn requeue(&self, key: &str, record: &Value) -> Result<(), QueueError> {
        let mut job = Job::from_entry(key, record.clone())?.sanitized();
        job.id = None;
        self.store
            .set(&self.pending, key, Some(job.to_value()?))
            .await?;
        Ok(())
    }

    /// Drop our retry marker after a failed requeue so the job stays retryable.
    async fn unmark(&self, key: &str, marker: &str) {
        let unmark = {
            let marker = marker.to_string();
            move |current: Option<&Value>| match current {
                Some(value) if holds_marker(value, &marker) => {
                    Transform::Set(with_marker(value, None))
                }
                _ => Transform::Abort,
            }
        };
        if let Err(e) = self.store.transform(&self.started, key, &unmark).await {
            tracing::error!(
                "Failed to clear retry marker of job {}; it is retried again after {} minutes: {}",
                key,
                STALE_RETRY_MINUTES,
                e
            );
        }
    }

    /// Write the job into `started` and stamp `startedAt`.
    pub async fn record_start(&self, job: &Job) -> Result<(), QueueError> {
        let id = job.id.as_ref().ok_or(QueueError::MissingJobId)?;
        let mut fields: Vec<FieldUpdate> = job
            .payload
            .iter()
            .map(|(name, value)| FieldUpdate::set(name.clone(), value.clone()))
            .collect();
        if let Some(priority) = job.priority {
            fields.push(FieldUpdate::set("priority", priority));
        }
        fields.push(FieldUpdate::server_timestamp(STARTED_AT));
        fields.push(FieldUpdate::remove(SUCCEEDED_AT));
        fields.push(FieldUpdate::remove(FAILED_AT));
        fields.push(FieldUpdate::remove(ERROR));
        fields.push(FieldUpdate::remove(RETRYING_AT));

        self.store.update(&self.started, id.as_str(), fields).await?;
        Ok(())
    }

    /// Stamp `failedAt` and the error message on a started job.
    pub async fn record_failure(&self, job: &Job, error: &str) -> Result<(), QueueError> {
        let id = job.id.as_ref().ok_or(QueueError::MissingJobId)?;
        let fields = vec![
            FieldUpdate::server_timestamp(FAILED_AT),
            FieldUpdate::set(ERROR, error),
            FieldUpdate::remove(SUCCEEDED_AT),
        ];
        self.store.update(&self.started, id.as_str(), fields).await?;
        Ok(())
    }

    /// Stamp `succeededAt` on a started job.
    pub async fn record_success(&self, job: &Job) -> Result<(), QueueError> {
        let id = job.id.as_ref().ok_or(QueueError::MissingJobId)?;
        let fields = vec![
            FieldUpdate::server_timestamp(SUCCEEDED_AT),
            FieldUpdate::remove(FAILED_AT),
            FieldUpdate::remove(ERROR),
        ];
        self.store.update(&self.started, id.as_str(), fields).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").field("base", &self.base).finish()
    }
}

fn is_failed_record(value: &Value) -> bool {
    value.get(FAILED_AT).is_some_and(|v| !v.is_null())
        && value.get(SUCCEEDED_AT).is_none_or(Value::is_null)
}

/// Failed, and not marked by a retry newer than `stale_before`.
///
/// Markers are RFC3339 UTC timestamps of one fixed format, so they compare
/// as strings.
fn is_retryable(value: &Value, stale_before: &str) -> bool {
    value.is_object()
        && is_failed_record(value)
        && match value.get(RETRYING_AT) {
            Some(Value::String(at)) => at.as_str() < stale_before,
            _ => true,
        }
}

fn holds_marker(value: &Value, marker: &str) -> bool {
    value.get(RETRYING_AT).and_then(Value::as_str) == Some(marker)
}

fn with_marker(value: &Value, marker: Option<&str>) -> Value {
    let mut value = value.clone();
    if let Some(record) = value.as_object_mut() {
        match marker {
            Some(marker) => {
                record.insert(RETRYING_AT.to_string(), Value::String(marker.to_string()));
            }
            None => {
                record.remove(RETRYING_AT);
            }
        }
    }
    value
}
