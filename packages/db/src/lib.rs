//! Backing stores for the job queue.
//!
//! This crate defines the ordered key/value store contract the queue runs
//! on, plus two implementations: an in-process store and a SurrealDB store.
//!
//! # Features
//!
//! - `memory` (default): Use in-memory storage for testing
//! - `rocksdb`: Use RocksDB for persistent file-based storage

mod connection;
mod memory;
mod schema;
mod store;
mod surreal;

pub use connection::{Database, DbConfig, connect};
pub use memory::{FailPoint, MemoryStore};
pub use schema::table_name;
pub use store::{
    BackingStore, Collection, Entry, FieldUpdate, FieldValue, FirstItemSubscription,
    MAX_TRANSFORM_ATTEMPTS, OrderKey, StoreError, StoreFuture, Transform, TransformFn,
    TransformOutcome, apply_field_updates, format_timestamp,
};
pub use surreal::SurrealStore;
