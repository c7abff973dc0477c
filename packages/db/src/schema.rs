//! Table definitions for store collections, using SurrealQL.

use crate::connection::Database;
use crate::store::{Collection, StoreError};

/// Table name backing a collection.
///
/// Path separators and any other non-identifier characters become `_`, so
/// `jobs/pending` is stored in `jobs_pending`.
pub fn table_name(collection: &Collection) -> String {
    let name: String = collection
        .path()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        format!("c_{}", name)
    } else {
        name
    }
}

/// Define the table and ordering index for a collection.
///
/// `table` must come from [`table_name`], which only yields identifier
/// characters.
pub async fn define_collection(db: &Database, table: &str) -> Result<(), StoreError> {
    tracing::debug!("Defining collection table {}", table);
    db.query(collection_schema(table)).await?.check()?;
    Ok(())
}

fn collection_schema(table: &str) -> String {
    format!(
        r#"
DEFINE TABLE IF NOT EXISTS {table} SCHEMALESS;

DEFINE FIELD IF NOT EXISTS entry_key ON {table} TYPE string;
DEFINE FIELD IF NOT EXISTS body ON {table} TYPE string;
DEFINE FIELD IF NOT EXISTS revision ON {table} TYPE int;
DEFINE FIELD IF NOT EXISTS rank ON {table} TYPE int;
DEFINE FIELD IF NOT EXISTS priority ON {table} TYPE float;

-- Ordering used by first-item lookups and snapshots
DEFINE INDEX IF NOT EXISTS {table}_order ON {table} FIELDS rank, priority, entry_key;
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_identifiers() {
        assert_eq!(table_name(&Collection::new("jobs/pending")), "jobs_pending");
        assert_eq!(table_name(&Collection::new("a-b.c")), "a_b_c");
        assert_eq!(table_name(&Collection::new("9lives")), "c_9lives");
    }
}
