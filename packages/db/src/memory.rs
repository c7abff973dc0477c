//! In-process backing store.
//!
//! Every operation runs under a single lock, so conditional transforms never
//! conflict. Useful for tests and single-process deployments.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use ulid::Generator;

use crate::store::{
    BackingStore, Collection, Entry, FirstItemSubscription, OrderKey, StoreError, StoreFuture,
    Transform, TransformFn, TransformOutcome, publish_first,
};

/// Operations that can be made to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Push,
    Transform,
    Watch,
    Snapshot,
    Count,
}

struct StoredRecord {
    value: Value,
    order: OrderKey,
}

struct MemoryCollection {
    records: BTreeMap<String, StoredRecord>,
    /// Claim order of `records`.
    order: BTreeSet<OrderKey>,
    first_tx: watch::Sender<Option<Entry>>,
}

impl MemoryCollection {
    fn new() -> Self {
        let (first_tx, _) = watch::channel(None);
        Self {
            records: BTreeMap::new(),
            order: BTreeSet::new(),
            first_tx,
        }
    }

    fn entry(&self, order: &OrderKey) -> Option<Entry> {
        self.records
            .get(&order.key)
            .map(|record| Entry::new(order.key.clone(), record.value.clone()))
    }

    fn first(&self) -> Option<Entry> {
        self.order.first().and_then(|order| self.entry(order))
    }

    fn ordered(&self) -> Vec<Entry> {
        self.order.iter().filter_map(|order| self.entry(order)).collect()
    }

    fn write(&mut self, key: &str, value: Option<Value>) {
        let replaced = match value {
            Some(value) => {
                let order = OrderKey::of(key, &value);
                self.order.insert(order.clone());
                self.records
                    .insert(key.to_string(), StoredRecord { value, order })
            }
            None => self.records.remove(key),
        };
        if let Some(old) = replaced {
            let current = self.records.get(key).map(|record| &record.order);
            if current != Some(&old.order) {
                self.order.remove(&old.order);
            }
        }
        publish_first(&self.first_tx, self.first());
    }

    fn clear(&mut self) {
        self.records.clear();
        self.order.clear();
        publish_first(&self.first_tx, None);
    }
}

/// Pending failures for one operation.
#[derive(Default)]
struct Injection {
    skip: usize,
    count: usize,
}

struct MemoryState {
    collections: HashMap<Collection, MemoryCollection>,
    keys: Generator,
    failures: HashMap<FailPoint, Injection>,
}

impl MemoryState {
    fn collection(&mut self, collection: &Collection) -> &mut MemoryCollection {
        self.collections
            .entry(collection.clone())
            .or_insert_with(MemoryCollection::new)
    }

    fn check(&mut self, point: FailPoint) -> Result<(), StoreError> {
        let Some(injection) = self.failures.get_mut(&point) else {
            return Ok(());
        };
        if injection.count == 0 {
            Ok(())
        } else if injection.skip > 0 {
            injection.skip -= 1;
            Ok(())
        } else {
            injection.count -= 1;
            Err(StoreError::Injected(format!("{:?}", point)))
        }
    }
}

/// In-memory store; clones share the same data.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                collections: HashMap::new(),
                keys: Generator::new(),
                failures: HashMap::new(),
            })),
        }
    }

    /// Make the next `count` calls of an operation fail.
    pub async fn inject_failure(&self, point: FailPoint, count: usize) {
        self.inject_failure_after(point, 0, count).await;
    }

    /// Let `skip` calls of an operation through, then fail the next `count`.
    pub async fn inject_failure_after(&self, point: FailPoint, skip: usize, count: usize) {
        let mut state = self.state.lock().await;
        let injection = state.failures.entry(point).or_default();
        injection.skip = skip;
        injection.count += count;
    }

    /// Read a single record.
    pub async fn get(&self, collection: &Collection, key: &str) -> Option<Value> {
        let state = self.state.lock().await;
        state
            .collections
            .get(collection)
            .and_then(|c| c.records.get(key))
            .map(|record| record.value.clone())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BackingStore for MemoryStore {
    fn push<'a>(&'a self, collection: &'a Collection, value: Value) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.check(FailPoint::Push)?;
            let key = state
                .keys
                .generate()
                .map_err(|e| StoreError::Query(format!("Key generation failed: {}", e)))?
                .to_string();
            state.collection(collection).write(&key, Some(value));
            Ok(key)
        })
    }

    fn transform<'a>(
        &'a self,
        collection: &'a Collection,
        key: &'a str,
        f: &'a TransformFn,
    ) -> StoreFuture<'a, TransformOutcome> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.check(FailPoint::Transform)?;
            let target = state.collection(collection);
            let current = target.records.get(key).map(|record| record.value.clone());

            let outcome = match f(current.as_ref()) {
                Transform::Abort => TransformOutcome::aborted(current),
                Transform::Delete => {
                    if current.is_some() {
                        target.write(key, None);
                    }
                    TransformOutcome {
                        committed: true,
                        previous: current,
                        value: None,
                    }
                }
                Transform::Set(value) => {
                    target.write(key, Some(value.clone()));
                    TransformOutcome {
                        committed: true,
                        previous: current,
                        value: Some(value),
                    }
                }
            };
            Ok(outcome)
        })
    }

    fn watch_first<'a>(
        &'a self,
        collection: &'a Collection,
    ) -> StoreFuture<'a, FirstItemSubscription> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.check(FailPoint::Watch)?;
            let rx = state.collection(collection).first_tx.subscribe();
            Ok(FirstItemSubscription::new(rx))
        })
    }

    fn snapshot<'a>(&'a self, collection: &'a Collection) -> StoreFuture<'a, Vec<Entry>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.check(FailPoint::Snapshot)?;
            Ok(state.collection(collection).ordered())
        })
    }

    fn count<'a>(&'a self, collection: &'a Collection) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.check(FailPoint::Count)?;
            Ok(state.collection(collection).records.len() as u64)
        })
    }

    fn server_time(&self) -> StoreFuture<'_, DateTime<Utc>> {
        Box::pin(async move { Ok(Utc::now()) })
    }

    fn clear<'a>(&'a self, collection: &'a Collection) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.collection(collection).clear();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use crate::store::FieldUpdate;
    use serde_json::json;

    fn pending() -> Collection {
        Collection::new("jobs/pending")
    }

    #[tokio::test]
    async fn push_keys_preserve_insertion_order() {
        let store = MemoryStore::new();
        let first = store.push(&pending(), json!({ "n": 1 })).await.unwrap();
        let second = store.push(&pending(), json!({ "n": 2 })).await.unwrap();
        assert!(first < second);

        let entries = store.snapshot(&pending()).await.unwrap();
        let ns: Vec<i64> = entries.iter().map(|e| e.value["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![1, 2]);
        assert_eq!(store.count(&pending()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn first_item_follows_priority_then_key() {
        let store = MemoryStore::new();
        let mut sub = store.watch_first(&pending()).await.unwrap();
        assert!(sub.current().is_none());

        store.push(&pending(), json!({ "priority": 5 })).await.unwrap();
        let first = sub.changed().await.unwrap().unwrap();
        assert_eq!(first.value["priority"], 5);

        let low = store.push(&pending(), json!({ "priority": 1 })).await.unwrap();
        let first = sub.changed().await.unwrap().unwrap();
        assert_eq!(first.key, low);

        store.set(&pending(), &low, None).await.unwrap();
        let first = sub.changed().await.unwrap().unwrap();
        assert_eq!(first.value["priority"], 5);
    }

    #[tokio::test]
    async fn rewriting_a_record_moves_it_in_claim_order() {
        let store = MemoryStore::new();
        let a = store.push(&pending(), json!({ "priority": 1 })).await.unwrap();
        let b = store.push(&pending(), json!({ "priority": 2 })).await.unwrap();
        let sub = store.watch_first(&pending()).await.unwrap();
        assert_eq!(sub.current().unwrap().key, a);

        store
            .set(&pending(), &a, Some(json!({ "priority": 3 })))
            .await
            .unwrap();
        assert_eq!(sub.current().unwrap().key, b);

        let keys: Vec<String> = store
            .snapshot(&pending())
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.key)
            .collect();
        assert_eq!(keys, vec![b.clone(), a.clone()]);

        store.set(&pending(), &b, None).await.unwrap();
        store.set(&pending(), &a, None).await.unwrap();
        assert!(sub.current().is_none());
        assert!(store.snapshot(&pending()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transform_reports_previous_and_committed_values() {
        let store = MemoryStore::new();
        let key = store.push(&pending(), json!({ "n": 1 })).await.unwrap();

        let claim = |current: Option<&Value>| match current {
            Some(_) => Transform::Delete,
            None => Transform::Abort,
        };
        let won = store.transform(&pending(), &key, &claim).await.unwrap();
        assert!(won.committed);
        assert_eq!(won.previous, Some(json!({ "n": 1 })));
        assert_eq!(won.value, None);

        let lost = store.transform(&pending(), &key, &claim).await.unwrap();
        assert!(!lost.committed);
        assert_eq!(lost.previous, None);
    }

    #[tokio::test]
    async fn update_merges_fields_with_store_timestamp() {
        let store = MemoryStore::new();
        let started = Collection::new("jobs/started");
        store
            .update(
                &started,
                "job-1",
                vec![
                    FieldUpdate::set("n", 7),
                    FieldUpdate::server_timestamp("startedAt"),
                ],
            )
            .await
            .unwrap();

        let record = store.get(&started, "job-1").await.unwrap();
        assert_eq!(record["n"], 7);
        assert!(record["startedAt"].is_string());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryStore::new();
        store.inject_failure(FailPoint::Count, 1).await;
        assert!(matches!(
            store.count(&pending()).await,
            Err(StoreError::Injected(_))
        ));
        assert_eq!(store.count(&pending()).await.unwrap(), 0);

        store.inject_failure_after(FailPoint::Count, 1, 1).await;
        assert!(store.count(&pending()).await.is_ok());
        assert!(store.count(&pending()).await.is_err());
        assert!(store.count(&pending()).await.is_ok());
    }

    #[tokio::test]
    async fn clear_empties_collection_and_notifies() {
        let store = MemoryStore::new();
        store.push(&pending(), json!({})).await.unwrap();
        let mut sub = store.watch_first(&pending()).await.unwrap();
        assert!(sub.current().is_some());

        store.clear(&pending()).await.unwrap();
        assert_eq!(sub.changed().await.unwrap(), None);
        assert_eq!(store.count(&pending()).await.unwrap(), 0);
    }
}
