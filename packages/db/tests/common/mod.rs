use db::{Collection, DbConfig, StoreError, SurrealStore};

/// A store on a fresh in-memory database.
pub async fn setup_store() -> Result<SurrealStore, StoreError> {
    SurrealStore::connect(&DbConfig::memory().with_database("test")).await
}

pub fn pending() -> Collection {
    Collection::new("jobs").child("pending")
}
