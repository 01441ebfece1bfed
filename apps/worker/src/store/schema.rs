//! SQLite schema for the document store.
//!
//! Per-collection tables are created by `DocumentStore::add_collection`;
//! this is only the fixed metadata layout.

/// Metadata tables shared by all collections.
pub const BASE_SCHEMA: &str = r#"
-- Registered collections and their schema versions
CREATE TABLE IF NOT EXISTS collections (
    name TEXT PRIMARY KEY,
    schema_version INTEGER NOT NULL,
    replication TEXT NOT NULL
);

-- Per-collection pull cursor: the last replication-applied document.
-- Local writes never touch this, so their wall-clock stamps cannot
-- inflate the next pull's lower bound.
CREATE TABLE IF NOT EXISTS sync_state (
    collection TEXT PRIMARY KEY,
    last_id TEXT NOT NULL,
    last_updated_at INTEGER NOT NULL
);

-- Staging area for bulk export downloads and pending uploads
CREATE TABLE IF NOT EXISTS blob_cache (
    key TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    created_at INTEGER NOT NULL
);

-- Small key-value store for credentials and per-feature settings
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Table name for a collection's documents.
pub fn doc_table(collection: &str) -> String {
    format!("doc_{}", collection)
}

/// DDL for one collection table. Documents are stored as JSON text with the
/// replication-relevant fields mirrored into real columns.
pub fn collection_ddl(collection: &str) -> String {
    let table = doc_table(collection);
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {table} (
    id TEXT PRIMARY KEY,
    updated_at INTEGER NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    dirty INTEGER NOT NULL DEFAULT 0,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_{table}_cursor ON {table}(updated_at, id);
CREATE INDEX IF NOT EXISTS idx_{table}_dirty ON {table}(dirty);
"#
    )
}

/// DDL for one secondary index over a JSON field.
pub fn index_ddl(collection: &str, field: &str) -> String {
    let table = doc_table(collection);
    format!(
        "CREATE INDEX IF NOT EXISTS idx_{table}_{field} ON {table}(json_extract(body, '$.{field}'));"
    )
}
