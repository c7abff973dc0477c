//! The backing store contract shared by every store implementation.
//!
//! A store holds named, ordered collections of JSON records. The work queue
//! needs only this primitive set: generated-key push, overwrite/delete,
//! field merge, a live "first item" subscription, an optimistic conditional
//! transform, one-shot snapshots and counts, and the store's own clock.

use std::cmp::Ordering;

use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = BoxFuture<'a, Result<T, StoreError>>;

/// Transform function evaluated against the current value of a record.
pub type TransformFn = dyn Fn(Option<&Value>) -> Transform + Send + Sync;

/// How many times a conditional transform is re-evaluated after losing a
/// version conflict before it reports `committed: false`.
pub const MAX_TRANSFORM_ATTEMPTS: usize = 25;

/// Store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid record {key} in {collection}: {reason}")]
    InvalidRecord {
        collection: String,
        key: String,
        reason: String,
    },

    #[error("Subscription to {0} closed")]
    SubscriptionClosed(String),

    #[error("Injected failure: {0}")]
    Injected(String),

    #[error("Query error: {0}")]
    Query(String),
}

/// Path of a collection inside the store, e.g. `jobs/pending`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Collection(String);

impl Collection {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into().trim_matches('/').to_string())
    }

    /// Path of a nested collection.
    pub fn child(&self, name: &str) -> Self {
        Self::new(format!("{}/{}", self.0, name.trim_matches('/')))
    }

    pub fn path(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A keyed record read from a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub key: String,
    pub value: Value,
}

impl Entry {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Decision returned by a transform function.
#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    /// Write this value.
    Set(Value),
    /// Delete the record.
    Delete,
    /// Leave the record untouched and report `committed: false`.
    Abort,
}

/// Result of a conditional transform.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutcome {
    /// Whether the transform's decision was applied.
    pub committed: bool,
    /// Value the committed decision was computed from.
    pub previous: Option<Value>,
    /// Value stored after the transform.
    pub value: Option<Value>,
}

impl TransformOutcome {
    pub(crate) fn aborted(current: Option<Value>) -> Self {
        Self {
            committed: false,
            previous: current.clone(),
            value: current,
        }
    }
}

/// New value for a single field in a partial update.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Value(Value),
    /// Replaced by the store's current time when the update commits.
    ServerTimestamp,
    Remove,
}

/// One field assignment in a partial update.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
    pub field: String,
    pub value: FieldValue,
}

impl FieldUpdate {
    /// Set `field` to `value`.
    pub fn set(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: FieldValue::Value(value.into()),
        }
    }

    /// Set `field` to the store's current time.
    pub fn server_timestamp(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: FieldValue::ServerTimestamp,
        }
    }

    /// Remove `field`.
    pub fn remove(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: FieldValue::Remove,
        }
    }
}

/// Render a store timestamp the way it is written into records.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Merge field updates into a record, creating it when absent.
pub fn apply_field_updates(
    current: Option<&Value>,
    updates: &[FieldUpdate],
    now: DateTime<Utc>,
) -> Value {
    let mut record = match current {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    for update in updates {
        match &update.value {
            FieldValue::Value(value) => {
                record.insert(update.field.clone(), value.clone());
            }
            FieldValue::ServerTimestamp => {
                record.insert(update.field.clone(), Value::String(format_timestamp(now)));
            }
            FieldValue::Remove => {
                record.remove(&update.field);
            }
        }
    }
    Value::Object(record)
}

/// Sort key of a record inside an ordered collection.
///
/// Records without a numeric `priority` come first, then ascending priority,
/// then ascending key.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderKey {
    pub rank: i64,
    pub priority: f64,
    pub key: String,
}

impl OrderKey {
    /// Order key of the record `key` holding `value`.
    pub fn of(key: &str, value: &Value) -> Self {
        match value.get("priority").and_then(Value::as_f64) {
            Some(priority) => Self {
                rank: 1,
                priority,
                key: key.to_string(),
            },
            None => Self {
                rank: 0,
                priority: 0.0,
                key: key.to_string(),
            },
        }
    }
}

impl Eq for OrderKey {}

impl PartialOrd for OrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank
            .cmp(&other.rank)
            .then_with(|| self.priority.total_cmp(&other.priority))
            .then_with(|| self.key.cmp(&other.key))
    }
}

/// Live view of the lowest-ordered record in a collection.
///
/// The watched value changes whenever the key of the first record changes.
/// Dropping the subscription unsubscribes.
pub struct FirstItemSubscription {
    rx: watch::Receiver<Option<Entry>>,
    task: Option<JoinHandle<()>>,
}

impl FirstItemSubscription {
    pub fn new(rx: watch::Receiver<Option<Entry>>) -> Self {
        Self { rx, task: None }
    }

    /// Subscription fed by a background task, aborted when dropped.
    pub fn with_task(rx: watch::Receiver<Option<Entry>>, task: JoinHandle<()>) -> Self {
        Self {
            rx,
            task: Some(task),
        }
    }

    /// The first item as currently known.
    pub fn current(&self) -> Option<Entry> {
        self.rx.borrow().clone()
    }

    /// Another receiver on the same feed.
    pub fn receiver(&self) -> watch::Receiver<Option<Entry>> {
        self.rx.clone()
    }

    /// Wait for the first item to change. Returns `None` once the feed closed.
    pub async fn changed(&mut self) -> Option<Option<Entry>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

impl Drop for FirstItemSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for FirstItemSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirstItemSubscription")
            .field("current", &*self.rx.borrow())
            .finish()
    }
}

/// Publish a new first item, notifying watchers only when its key changed.
pub(crate) fn publish_first(tx: &watch::Sender<Option<Entry>>, first: Option<Entry>) {
    tx.send_if_modified(|current| {
        let changed = current.as_ref().map(|e| &e.key) != first.as_ref().map(|e| &e.key);
        *current = first;
        changed
    });
}

/// An ordered, shared, concurrently accessible key/value store.
pub trait BackingStore: Send + Sync + 'static {
    /// Append a record under a newly generated, order-preserving key.
    fn push<'a>(&'a self, collection: &'a Collection, value: Value) -> StoreFuture<'a, String>;

    /// Atomically read a record, evaluate `f` and apply its decision only if
    /// nobody else wrote the record in between.
    fn transform<'a>(
        &'a self,
        collection: &'a Collection,
        key: &'a str,
        f: &'a TransformFn,
    ) -> StoreFuture<'a, TransformOutcome>;

    /// Subscribe to the lowest-ordered record of a collection.
    fn watch_first<'a>(&'a self, collection: &'a Collection)
    -> StoreFuture<'a, FirstItemSubscription>;

    /// One consistent read of every record, in order.
    fn snapshot<'a>(&'a self, collection: &'a Collection) -> StoreFuture<'a, Vec<Entry>>;

    /// Number of records in a collection.
    fn count<'a>(&'a self, collection: &'a Collection) -> StoreFuture<'a, u64>;

    /// The store's authoritative current time.
    fn server_time(&self) -> StoreFuture<'_, DateTime<Utc>>;

    /// Overwrite a record, or delete it when `value` is `None`.
    fn set<'a>(
        &'a self,
        collection: &'a Collection,
        key: &'a str,
        value: Option<Value>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let write = move |_: Option<&Value>| match &value {
                Some(value) => Transform::Set(value.clone()),
                None => Transform::Delete,
            };
            let outcome = self.transform(collection, key, &write).await?;
            if outcome.committed {
                Ok(())
            } else {
                Err(StoreError::Query(format!(
                    "write to {}/{} kept conflicting",
                    collection, key
                )))
            }
        })
    }

    /// Merge fields into a record, creating it when absent.
    fn update<'a>(
        &'a self,
        collection: &'a Collection,
        key: &'a str,
        fields: Vec<FieldUpdate>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let now = self.server_time().await?;
            let merge = move |current: Option<&Value>| {
                Transform::Set(apply_field_updates(current, &fields, now))
            };
            let outcome = self.transform(collection, key, &merge).await?;
            if outcome.committed {
                Ok(())
            } else {
                Err(StoreError::Query(format!(
                    "update of {}/{} kept conflicting",
                    collection, key
                )))
            }
        })
    }

    /// Delete every record in a collection.
    fn clear<'a>(&'a self, collection: &'a Collection) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            for entry in self.snapshot(collection).await? {
                self.set(collection, &entry.key, None).await?;
            }
            Ok(())
        })
    }
}
