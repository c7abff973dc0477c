//! Job domain types for work items in the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved field names that only the claim protocol may write.
pub const STARTED_AT: &str = "startedAt";
pub const SUCCEEDED_AT: &str = "succeededAt";
pub const FAILED_AT: &str = "failedAt";
pub const ERROR: &str = "error";
/// Set on a failed job while a retry moves it back to pending.
pub const RETRYING_AT: &str = "retryingAt";

/// All reserved lifecycle fields, in the order they are written.
pub const RESERVED_FIELDS: [&str; 5] = [STARTED_AT, SUCCEEDED_AT, FAILED_AT, ERROR, RETRYING_AT];

/// Unique identifier for a job within a queue.
///
/// Store-generated ids are ULIDs, so they sort by creation time, but callers
/// may supply any string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Errors raised while decoding stored job records.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job record is not an object")]
    NotAnObject,

    #[error("Failed to decode job: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A job represents a unit of work to be executed by a worker.
///
/// User fields live in `payload` and are flattened next to the reserved
/// metadata when the job is written to the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, assigned at enqueue or claim time when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<JobId>,
    /// Ordering key in the pending partition; lower sorts first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<f64>,
    /// When a worker claimed the job.
    #[serde(
        rename = "startedAt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job completed successfully.
    #[serde(
        rename = "succeededAt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub succeeded_at: Option<DateTime<Utc>>,
    /// When the job failed.
    #[serde(rename = "failedAt", default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    /// Failure message, only present alongside `failed_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// User-defined fields.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Job {
    /// Create a job from a JSON payload.
    ///
    /// Non-object payloads are stored under a single `data` field.
    pub fn new(payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        Self {
            payload,
            ..Default::default()
        }
    }

    /// Set the id for this job.
    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the priority for this job.
    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Add a user field to this job.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(name.into(), value.into());
        self
    }

    /// Look up a user field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// A failed job has `failedAt` set and no `succeededAt`.
    pub fn is_failed(&self) -> bool {
        self.failed_at.is_some() && self.succeeded_at.is_none()
    }

    /// Check whether the job has finished, successfully or not.
    pub fn is_finished(&self) -> bool {
        self.failed_at.is_some() || self.succeeded_at.is_some()
    }

    /// Copy of the job with every reserved lifecycle field cleared.
    ///
    /// Reserved names that slipped into the payload are dropped as well.
    pub fn sanitized(&self) -> Self {
        let mut payload = self.payload.clone();
        for name in RESERVED_FIELDS {
            payload.remove(name);
        }
        Self {
            id: self.id.clone(),
            priority: self.priority,
            started_at: None,
            succeeded_at: None,
            failed_at: None,
            error: None,
            payload,
        }
    }

    /// Serialize into the object stored in a partition.
    pub fn to_value(&self) -> Result<Value, JobError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode a stored record.
    pub fn from_value(value: Value) -> Result<Self, JobError> {
        if !value.is_object() {
            return Err(JobError::NotAnObject);
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Decode a stored record, taking the id from the record key when the
    /// record does not carry one.
    pub fn from_entry(key: &str, value: Value) -> Result<Self, JobError> {
        let mut job = Self::from_value(value)?;
        if job.id.is_none() {
            job.id = Some(JobId::new(key));
        }
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use serde_json::json;

    #[test]
    fn reserved_fields_use_camel_case_names() {
        let now = Utc::now();
        let mut job = Job::new(json!({ "task": "resize" })).with_id("a1");
        job.started_at = Some(now);
        job.failed_at = Some(now);
        job.error = Some("boom".into());

        let value = job.to_value().unwrap();
        assert_eq!(value["task"], "resize");
        assert_eq!(value["id"], "a1");
        assert!(value.get("startedAt").is_some());
        assert!(value.get("failedAt").is_some());
        assert!(value.get("succeededAt").is_none());
        assert_eq!(value["error"], "boom");
    }

    #[test]
    fn decoding_keeps_user_fields_out_of_metadata() {
        let value = json!({
            "task": "thumbnail",
            "size": 128,
            "priority": 3,
            "startedAt": "2024-05-01T12:00:00.000Z",
        });
        let job = Job::from_entry("k-1", value).unwrap();
        assert_eq!(job.id, Some(JobId::new("k-1")));
        assert_eq!(job.priority, Some(3.0));
        assert!(job.started_at.is_some());
        assert_eq!(job.payload.len(), 2);
        assert_eq!(job.field("size"), Some(&json!(128)));
    }

    #[test]
    fn failed_predicate_requires_missing_success() {
        let now = Utc::now();
        let mut job = Job::new(json!({}));
        assert!(!job.is_failed());

        job.failed_at = Some(now);
        assert!(job.is_failed());

        job.succeeded_at = Some(now);
        assert!(!job.is_failed());
        assert!(job.is_finished());
    }

    #[test]
    fn sanitized_strips_lifecycle_metadata() {
        let now = Utc::now();
        let mut job = Job::new(json!({ "n": 1, "error": "smuggled" }))
            .with_id("x")
            .with_priority(2.0);
        job.started_at = Some(now);
        job.failed_at = Some(now);
        job.error = Some("boom".into());

        let clean = job.sanitized();
        assert_eq!(clean.id, Some(JobId::new("x")));
        assert_eq!(clean.priority, Some(2.0));
        assert!(clean.started_at.is_none());
        assert!(clean.failed_at.is_none());
        assert!(clean.error.is_none());
        assert!(clean.field("error").is_none());
        assert_eq!(clean.field("n"), Some(&json!(1)));
    }

    #[test]
    fn non_object_records_are_rejected() {
        assert!(matches!(
            Job::from_value(json!("nope")),
            Err(JobError::NotAnObject)
        ));
    }
}
