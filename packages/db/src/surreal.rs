//! SurrealDB-backed store.
//!
//! Each collection lives in its own table. Records keep the JSON value as
//! text next to the ordering columns and a `revision` counter; conditional
//! transforms compare that counter on write and retry when it moved.
//!
//! A single statement does not make read-compute-write atomic: two racers
//! can both read revision `n` and both see their conditional write succeed.
//! Transforms on one table are therefore serialized per store handle. Handles
//! in other processes are separated by the engine's own transaction conflict
//! detection, and a conflict counts as a lost attempt.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as SyncMutex};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use ulid::Generator;

use crate::connection::{Database, DbConfig, connect};
use crate::schema::{define_collection, table_name};
use crate::store::{
    BackingStore, Collection, Entry, FirstItemSubscription, MAX_TRANSFORM_ATTEMPTS, OrderKey,
    StoreError, StoreFuture, Transform, TransformFn, TransformOutcome, publish_first,
};

/// Row written to a collection table.
#[derive(Debug, Serialize)]
struct StoredRecord {
    entry_key: String,
    body: String,
    rank: i64,
    priority: f64,
    revision: i64,
}

impl StoredRecord {
    fn new(key: &str, value: &Value, revision: i64) -> Result<Self, StoreError> {
        let order = OrderKey::of(key, value);
        Ok(Self {
            entry_key: key.to_string(),
            body: serde_json::to_string(value)?,
            rank: order.rank,
            priority: order.priority,
            revision,
        })
    }
}

/// Row read back from a collection table.
#[derive(Debug, Deserialize)]
struct RecordRow {
    entry_key: String,
    body: String,
    revision: i64,
}

impl RecordRow {
    fn decode(&self) -> Result<Value, StoreError> {
        Ok(serde_json::from_str(&self.body)?)
    }

    fn into_entry(self) -> Result<Entry, StoreError> {
        let value = self.decode()?;
        Ok(Entry::new(self.entry_key, value))
    }
}

#[derive(Debug, Deserialize)]
struct CountRow {
    total: u64,
}

/// Store persisted in SurrealDB.
pub struct SurrealStore {
    db: Database,
    keys: SyncMutex<Generator>,
    defined: Mutex<HashSet<String>>,
    /// One lock per table, held for a whole transform.
    writers: SyncMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SurrealStore {
    /// Store on an open connection.
    pub fn new(db: Database) -> Self {
        Self {
            db,
            keys: SyncMutex::new(Generator::new()),
            defined: Mutex::new(HashSet::new()),
            writers: SyncMutex::new(HashMap::new()),
        }
    }

    /// Connect using `config` and wrap the connection.
    pub async fn connect(config: &DbConfig) -> Result<Self, StoreError> {
        Ok(Self::new(connect(config).await?))
    }

    /// The underlying connection.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Table for a collection, defined on first use.
    async fn table(&self, collection: &Collection) -> Result<String, StoreError> {
        let table = table_name(collection);
        let mut defined = self.defined.lock().await;
        if !defined.contains(&table) {
            define_collection(&self.db, &table).await?;
            defined.insert(table.clone());
        }
        Ok(table)
    }

    fn writer(&self, table: &str) -> Arc<Mutex<()>> {
        let mut writers = self
            .writers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        writers.entry(table.to_string()).or_default().clone()
    }

    fn next_key(&self) -> Result<String, StoreError> {
        let mut keys = self
            .keys
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        keys.generate()
            .map(|key| key.to_string())
            .map_err(|e| StoreError::Query(format!("Key generation failed: {}", e)))
    }

    async fn read(&self, table: &str, key: &str) -> Result<Option<RecordRow>, StoreError> {
        let mut response = self
            .db
            .query("SELECT * FROM type::thing($tb, $key)")
            .bind(("tb", table.to_string()))
            .bind(("key", key.to_string()))
            .await?;
        let rows: Vec<RecordRow> = response.take(0)?;
        Ok(rows.into_iter().next())
    }

    async fn create(&self, table: &str, record: StoredRecord) -> Result<bool, StoreError> {
        let key = record.entry_key.clone();
        let mut response = self
            .db
            .query("CREATE type::thing($tb, $key) CONTENT $content")
            .bind(("tb", table.to_string()))
            .bind(("key", key))
            .bind(("content", record))
            .await?;
        match response.take::<Vec<RecordRow>>(0) {
            Ok(rows) => Ok(!rows.is_empty()),
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Overwrite or delete a record only if its revision is still `revision`.
    async fn write_if_unchanged(
        &self,
        table: &str,
        key: &str,
        revision: i64,
        value: Option<&Value>,
    ) -> Result<bool, StoreError> {
        let query = match value {
            Some(value) => {
                let record = StoredRecord::new(key, value, revision + 1)?;
                self.db
                    .query(
                        "UPDATE type::thing($tb, $key) \
                         SET body = $body, rank = $rank, priority = $priority, revision = $next \
                         WHERE revision = $revision RETURN AFTER",
                    )
                    .bind(("body", record.body))
                    .bind(("rank", record.rank))
                    .bind(("priority", record.priority))
                    .bind(("next", record.revision))
            }
            None => self
                .db
                .query("DELETE type::thing($tb, $key) WHERE revision = $revision RETURN BEFORE"),
        };
        let mut response = query
            .bind(("tb", table.to_string()))
            .bind(("key", key.to_string()))
            .bind(("revision", revision))
            .await?;
        match response.take::<Vec<RecordRow>>(0) {
            Ok(rows) => Ok(!rows.is_empty()),
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Whether a failed write lost a race rather than hit a real fault.
fn is_conflict(err: &surrealdb::Error) -> bool {
    let message = err.to_string().to_lowercase();
    message.contains("already exists")
        || message.contains("conflict")
        || message.contains("can be retried")
}

async fn first_of(db: &Database, table: &str) -> Result<Option<Entry>, StoreError> {
    let mut response = db
        .query("SELECT * FROM type::table($tb) ORDER BY rank, priority, entry_key LIMIT 1")
        .bind(("tb", table.to_string()))
        .await?;
    let rows: Vec<RecordRow> = response.take(0)?;
    rows.into_iter().next().map(RecordRow::into_entry).transpose()
}

impl BackingStore for SurrealStore {
    fn push<'a>(&'a self, collection: &'a Collection, value: Value) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let table = self.table(collection).await?;
            let key = self.next_key()?;
            let record = StoredRecord::new(&key, &value, 1)?;
            if !self.create(&table, record).await? {
                return Err(StoreError::Query(format!(
                    "Generated key {} already exists in {}",
                    key, collection
                )));
            }
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
            let table = self.table(collection).await?;
            let writer = self.writer(&table);
            let _exclusive = writer.lock().await;

            for attempt in 1..=MAX_TRANSFORM_ATTEMPTS {
                let row = self.read(&table, key).await?;
                let current = row.as_ref().map(RecordRow::decode).transpose()?;

                let next = match f(current.as_ref()) {
                    Transform::Abort => return Ok(TransformOutcome::aborted(current)),
                    Transform::Delete => None,
                    Transform::Set(value) => Some(value),
                };

                let written = match (&row, &next) {
                    (None, None) => true,
                    (None, Some(value)) => {
                        self.create(&table, StoredRecord::new(key, value, 1)?)
                            .await?
                    }
                    (Some(row), next) => {
                        self.write_if_unchanged(&table, key, row.revision, next.as_ref())
                            .await?
                    }
                };

                if written {
                    return Ok(TransformOutcome {
                        committed: true,
                        previous: current,
                        value: next,
                    });
                }
                tracing::debug!(
                    "Transform of {}/{} conflicted (attempt {})",
                    collection,
                    key,
                    attempt
                );
            }

            tracing::warn!(
                "Transform of {}/{} gave up after {} attempts",
                collection,
                key,
                MAX_TRANSFORM_ATTEMPTS
            );
            let current = self
                .read(&table, key)
                .await?
                .as_ref()
                .map(RecordRow::decode)
                .transpose()?;
            Ok(TransformOutcome::aborted(current))
        })
    }

    fn watch_first<'a>(
        &'a self,
        collection: &'a Collection,
    ) -> StoreFuture<'a, FirstItemSubscription> {
        Box::pin(async move {
            let table = self.table(collection).await?;

            // Subscribe before the initial read so no change slips between them.
            let mut stream = self.db.select::<Vec<RecordRow>>(table.clone()).live().await?;
            let initial = first_of(&self.db, &table).await?;
            let (tx, rx) = watch::channel(initial);

            let db = self.db.clone();
            let name = collection.to_string();
            let task = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tx.closed() => break,
                        notification = stream.next() => {
                            match notification {
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    tracing::warn!("Live query on {} reported: {}", name, e);
                                }
                                None => {
                                    tracing::warn!("Live query on {} ended", name);
                                    break;
                                }
                            }
                            match first_of(&db, &table).await {
                                Ok(first) => publish_first(&tx, first),
                                Err(e) => {
                                    tracing::error!("Failed to read first item of {}: {}", name, e);
                                    break;
                                }
                            }
                        }
                    }
                }
            });

            Ok(FirstItemSubscription::with_task(rx, task))
        })
    }

    fn snapshot<'a>(&'a self, collection: &'a Collection) -> StoreFuture<'a, Vec<Entry>> {
        Box::pin(async move {
            let table = self.table(collection).await?;
            let mut response = self
                .db
                .query("SELECT * FROM type::table($tb) ORDER BY rank, priority, entry_key")
                .bind(("tb", table))
                .await?;
            let rows: Vec<RecordRow> = response.take(0)?;
            rows.into_iter().map(RecordRow::into_entry).collect()
        })
    }

    fn count<'a>(&'a self, collection: &'a Collection) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let table = self.table(collection).await?;
            let mut response = self
                .db
                .query("SELECT count() AS total FROM type::table($tb) GROUP ALL")
                .bind(("tb", table))
                .await?;
            let rows: Vec<CountRow> = response.take(0)?;
            Ok(rows.first().map(|row| row.total).unwrap_or(0))
        })
    }

    fn server_time(&self) -> StoreFuture<'_, DateTime<Utc>> {
        Box::pin(async move {
            let mut response = self.db.query("RETURN <string> time::now()").await?;
            let now: Option<String> = response.take(0)?;
            let now = now.ok_or_else(|| StoreError::Query("Server returned no time".into()))?;
            DateTime::parse_from_rfc3339(now.trim_matches('"'))
                .map(|at| at.with_timezone(&Utc))
                .map_err(|e| StoreError::Query(format!("Invalid server time {}: {}", now, e)))
        })
    }

    fn clear<'a>(&'a self, collection: &'a Collection) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let table = self.table(collection).await?;
            let writer = self.writer(&table);
            let _exclusive = writer.lock().await;
            self.db
                .query("DELETE type::table($tb)")
                .bind(("tb", table))
                .await?
                .check()?;
            Ok(())
        })
    }
}
