//! Schema-driven local document store over SQLite.
//!
//! Collections are registered with a schema version and a replication mode;
//! documents are JSON objects keyed by a string `id` and carrying an
//! `updatedAt` millisecond timestamp that doubles as the replication cursor.

pub mod blob_cache;
pub mod error;
pub mod schema;
pub mod selector;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;

pub use error::StoreError;
pub use selector::{Cmp, Selector, SortSpec};

type Result<T> = std::result::Result<T, StoreError>;

/// How a collection is synchronized with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    /// Never replicated; documents may be physically removed.
    None,
    /// Server to client only.
    PullOnly,
    /// Bidirectional.
    PushPull,
}

impl ReplicationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::PullOnly => "pull_only",
            Self::PushPull => "push_pull",
        }
    }
}

/// Registration record for one collection.
#[derive(Debug, Clone)]
pub struct CollectionSpec {
    pub name: String,
    pub schema_version: i64,
    /// JSON fields to index beyond the primary key and cursor.
    pub indexes: Vec<String>,
    pub replication: ReplicationMode,
    /// Critical collections abort instead of being dropped on migration
    /// failure (client storage is not authoritative, but losing these
    /// silently would corrupt the learner's state).
    pub critical: bool,
    /// Live collections re-pull on change notices; others poll.
    pub live: bool,
    /// Initial sync runs in the background instead of blocking startup.
    pub background_initial: bool,
}

impl CollectionSpec {
    pub fn new(name: &str, schema_version: i64, replication: ReplicationMode) -> Self {
        Self {
            name: name.to_string(),
            schema_version,
            indexes: Vec::new(),
            replication,
            critical: false,
            live: true,
            background_initial: false,
        }
    }

    pub fn with_indexes(mut self, indexes: &[&str]) -> Self {
        self.indexes = indexes.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn polled(mut self) -> Self {
        self.live = false;
        self
    }

    pub fn background_initial(mut self) -> Self {
        self.background_initial = true;
        self
    }
}

/// Outcome of `add_collection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Created,
    Opened,
    Migrated,
    /// Incompatible schema was dropped and recreated; the process-wide
    /// reload flag has been raised.
    Recreated,
}

/// Versioned migration step: transforms a collection table in place.
pub type Migration = fn(&Connection, &str) -> Result<()>;

/// Whether a write originates locally or from replication. Local writes are
/// stamped and marked dirty for push; replication writes preserve
/// server-assigned timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    Local,
    Replication,
}

/// Replication cursor: the last successfully applied document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Checkpoint {
    pub last_id: String,
    pub last_updated_at: i64,
}

pub struct DocumentStore {
    conn: Connection,
    collections: HashMap<String, CollectionSpec>,
    reload_required: Arc<AtomicBool>,
}

impl DocumentStore {
    /// Open or create the durable store at `path`. Idempotent.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(schema::BASE_SCHEMA)?;
        Ok(Self {
            conn,
            collections: HashMap::new(),
            reload_required: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Deterministic, storage-safe database file name for a user on a host.
    pub fn file_name(username: &str, host: &str) -> String {
        let sanitize = |s: &str| -> String {
            s.chars()
                .map(|c| {
                    let c = c.to_ascii_lowercase();
                    if c.is_ascii_alphanumeric() {
                        c
                    } else {
                        '_'
                    }
                })
                .collect()
        };
        format!("lexisync_{}_{}.db", sanitize(username), sanitize(host))
    }

    /// Process-wide flag raised when a collection had to be dropped and the
    /// application must reload.
    pub fn reload_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.reload_required)
    }

    pub fn is_reload_required(&self) -> bool {
        self.reload_required.load(Ordering::SeqCst)
    }

    /// Register a collection, creating or migrating its table.
    ///
    /// On a schema version mismatch the migration is attempted first; if no
    /// migration is registered or it fails, non-critical collections are
    /// dropped and recreated with the reload flag raised, and critical
    /// collections return `SchemaMismatch`.
    pub fn add_collection(
        &mut self,
        spec: CollectionSpec,
        migration: Option<Migration>,
    ) -> Result<AddOutcome> {
        selector::field_expr(&spec.name)?;
        let stored: Option<i64> = self
            .conn
            .query_row(
                "SELECT schema_version FROM collections WHERE name = ?1",
                params![spec.name],
                |row| row.get(0),
            )
            .optional()?;

        let outcome = match stored {
            None => {
                self.create_collection_table(&spec)?;
                AddOutcome::Created
            }
            Some(version) if version == spec.schema_version => {
                // Re-run DDL so new indexes appear; IF NOT EXISTS throughout.
                self.create_collection_table(&spec)?;
                AddOutcome::Opened
            }
            Some(version) => match migration {
                Some(migrate) if self.try_migrate(&spec, migrate).is_ok() => AddOutcome::Migrated,
                _ => {
                    if spec.critical {
                        return Err(StoreError::SchemaMismatch {
                            collection: spec.name.clone(),
                            stored: version,
                            requested: spec.schema_version,
                        });
                    }
                    tracing::warn!(
                        collection = %spec.name,
                        stored = version,
                        requested = spec.schema_version,
                        "dropping collection with incompatible schema, reload required"
                    );
                    self.conn
                        .execute_batch(&format!("DROP TABLE IF EXISTS {}", schema::doc_table(&spec.name)))?;
                    self.create_collection_table(&spec)?;
                    self.reload_required.store(true, Ordering::SeqCst);
                    AddOutcome::Recreated
                }
            },
        };

        self.conn.execute(
            "INSERT OR REPLACE INTO collections (name, schema_version, replication) VALUES (?1, ?2, ?3)",
            params![spec.name, spec.schema_version, spec.replication.as_str()],
        )?;
        self.collections.insert(spec.name.clone(), spec);
        Ok(outcome)
    }

    fn try_migrate(&self, spec: &CollectionSpec, migrate: Migration) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        migrate(&tx, &spec.name)?;
        tx.commit()?;
        Ok(())
    }

    fn create_collection_table(&self, spec: &CollectionSpec) -> Result<()> {
        self.conn.execute_batch(&schema::collection_ddl(&spec.name))?;
        for field in &spec.indexes {
            selector::field_expr(field)?;
            self.conn.execute_batch(&schema::index_ddl(&spec.name, field))?;
        }
        Ok(())
    }

    pub fn collection(&self, name: &str) -> Result<&CollectionSpec> {
        self.collections
            .get(name)
            .ok_or_else(|| StoreError::UnknownCollection(name.to_string()))
    }

    /// Names of registered collections with the given replication mode.
    pub fn collections_with_mode(&self, mode: ReplicationMode) -> Vec<CollectionSpec> {
        let mut specs: Vec<_> = self
            .collections
            .values()
            .filter(|s| s.replication == mode)
            .cloned()
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// All registered server-synced collections.
    pub fn synced_collections(&self) -> Vec<CollectionSpec> {
        let mut specs: Vec<_> = self
            .collections
            .values()
            .filter(|s| s.replication != ReplicationMode::None)
            .cloned()
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    // === document operations ===

    pub fn insert(&self, collection: &str, doc: &Value) -> Result<()> {
        let table = self.table(collection)?;
        let prepared = prepare_doc(doc, WriteOrigin::Local)?;
        let result = self.conn.execute(
            &format!(
                "INSERT INTO {table} (id, updated_at, deleted, dirty, body) VALUES (?1, ?2, ?3, 1, ?4)"
            ),
            params![prepared.id, prepared.updated_at, prepared.deleted, prepared.body],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(StoreError::Conflict {
                collection: collection.to_string(),
                id: prepared.id,
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn bulk_insert(&self, collection: &str, docs: &[Value]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        for doc in docs {
            self.insert(collection, doc)?;
        }
        tx.commit()?;
        Ok(docs.len())
    }

    /// Insert or replace, stamping `updatedAt` unless the caller set one.
    pub fn upsert(&self, collection: &str, doc: &Value) -> Result<()> {
        let table = self.table(collection)?;
        let prepared = prepare_doc(doc, WriteOrigin::Local)?;
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {table} (id, updated_at, deleted, dirty, body) VALUES (?1, ?2, ?3, 1, ?4)"
            ),
            params![prepared.id, prepared.updated_at, prepared.deleted, prepared.body],
        )?;
        Ok(())
    }

    /// Partial update: fields present in `partial` replace the stored ones,
    /// everything else is preserved. Stamps `updatedAt` unless `partial`
    /// carries one.
    pub fn patch(&self, collection: &str, id: &str, partial: &Value) -> Result<Value> {
        let table = self.table(collection)?;
        let body: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT body FROM {table} WHERE id = ?1"),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let body = body.ok_or_else(|| StoreError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        })?;

        let mut doc: Value = serde_json::from_str(&body)?;
        let stamp = partial.get("updatedAt").and_then(Value::as_i64).is_none();
        if let (Some(target), Some(fields)) = (doc.as_object_mut(), partial.as_object()) {
            for (k, v) in fields {
                target.insert(k.clone(), v.clone());
            }
        }
        if stamp {
            doc["updatedAt"] = Value::from(now_ms());
        }

        let prepared = prepare_doc(&doc, WriteOrigin::Replication)?;
        self.conn.execute(
            &format!(
                "UPDATE {table} SET updated_at = ?1, deleted = ?2, dirty = 1, body = ?3 WHERE id = ?4"
            ),
            params![prepared.updated_at, prepared.deleted, prepared.body, id],
        )?;
        self.find_by_id(collection, id)?.ok_or_else(|| StoreError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        })
    }

    /// Remove a document. Synced collections soft-delete (the deletion is
    /// itself a change that replicates upstream); local-only collections
    /// physically remove the row.
    pub fn remove(&self, collection: &str, id: &str) -> Result<()> {
        let mode = self.collection(collection)?.replication;
        if mode == ReplicationMode::None {
            let table = self.table(collection)?;
            self.conn
                .execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![id])?;
            Ok(())
        } else {
            self.patch(collection, id, &serde_json::json!({ "deleted": true }))?;
            Ok(())
        }
    }

    pub fn bulk_remove(&self, collection: &str, ids: &[String]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for id in ids {
            self.remove(collection, id)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let table = self.table(collection)?;
        let body: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT body FROM {table} WHERE id = ?1"),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match body {
            Some(b) => Some(serde_json::from_str(&b)?),
            None => None,
        })
    }

    pub fn find_by_ids(&self, collection: &str, ids: &[String]) -> Result<Vec<Value>> {
        let values = ids.iter().map(|id| Value::String(id.clone())).collect();
        self.find(
            collection,
            &Selector::all().in_values("id", values),
            None,
            None,
        )
    }

    pub fn find(
        &self,
        collection: &str,
        selector: &Selector,
        sort: Option<SortSpec>,
        limit: Option<usize>,
    ) -> Result<Vec<Value>> {
        let table = self.table(collection)?;
        let (clause, sql_params) = selector.to_sql()?;
        let mut sql = format!("SELECT body FROM {table} WHERE {clause}");
        if let Some(sort) = sort {
            let expr = selector::field_expr(&sort.field)?;
            let dir = if sort.ascending { "ASC" } else { "DESC" };
            sql.push_str(&format!(" ORDER BY {expr} {dir}"));
        }
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let bodies = stmt
            .query_map(params_from_iter(sql_params), |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(Into::into))
            .collect()
    }

    pub fn count(&self, collection: &str, selector: &Selector) -> Result<usize> {
        let table = self.table(collection)?;
        let (clause, sql_params) = selector.to_sql()?;
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {table} WHERE {clause}"),
            params_from_iter(sql_params),
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // === replication support ===

    /// Locally-changed documents awaiting push, oldest first.
    pub fn dirty_docs(&self, collection: &str, limit: usize) -> Result<Vec<Value>> {
        let table = self.table(collection)?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT body FROM {table} WHERE dirty = 1 ORDER BY updated_at, id LIMIT ?1"
        ))?;
        let bodies = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(Into::into))
            .collect()
    }

    pub fn mark_clean(&self, collection: &str, ids: &[String]) -> Result<()> {
        let table = self.table(collection)?;
        let tx = self.conn.unchecked_transaction()?;
        for id in ids {
            tx.execute(
                &format!("UPDATE {table} SET dirty = 0 WHERE id = ?1"),
                params![id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Apply a pulled page. Documents are reordered by cursor before
    /// application and upserted by primary key, so re-applying a page is
    /// idempotent. A dirty local document newer than the incoming one is
    /// kept (it is about to be pushed).
    pub fn apply_remote_batch(&self, collection: &str, docs: &[Value]) -> Result<usize> {
        let table = self.table(collection)?;
        let mut ordered: Vec<&Value> = docs.iter().collect();
        ordered.sort_by_key(|d| {
            (
                d.get("updatedAt").and_then(Value::as_i64).unwrap_or(0),
                d.get("id").and_then(Value::as_str).unwrap_or("").to_string(),
            )
        });

        let tx = self.conn.unchecked_transaction()?;
        let mut applied = 0;
        for &doc in &ordered {
            let prepared = prepare_doc(doc, WriteOrigin::Replication)?;
            let local: Option<(i64, i64)> = tx
                .query_row(
                    &format!("SELECT dirty, updated_at FROM {table} WHERE id = ?1"),
                    params![prepared.id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            if let Some((dirty, local_updated)) = local {
                if dirty != 0 && local_updated >= prepared.updated_at {
                    continue;
                }
            }
            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO {table} (id, updated_at, deleted, dirty, body) VALUES (?1, ?2, ?3, 0, ?4)"
                ),
                params![prepared.id, prepared.updated_at, prepared.deleted, prepared.body],
            )?;
            applied += 1;
        }
        // advance the pull cursor to the end of this page; an old page
        // re-applied after a crash must not move it backwards
        if let Some(last) = ordered.last() {
            let last_id = last.get("id").and_then(Value::as_str).unwrap_or("");
            let last_updated_at = last.get("updatedAt").and_then(Value::as_i64).unwrap_or(0);
            tx.execute(
                "INSERT INTO sync_state (collection, last_id, last_updated_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(collection) DO UPDATE SET \
                     last_id = excluded.last_id, last_updated_at = excluded.last_updated_at \
                 WHERE excluded.last_updated_at > last_updated_at \
                    OR (excluded.last_updated_at = last_updated_at AND excluded.last_id > last_id)",
                params![collection, last_id, last_updated_at],
            )?;
        }
        tx.commit()?;
        Ok(applied)
    }

    /// Current pull cursor: the last replication-applied document. Local
    /// writes carry wall-clock stamps and must not move this, or the next
    /// pull's lower bound would skip server changes made in between.
    pub fn checkpoint(&self, collection: &str) -> Result<Checkpoint> {
        self.collection(collection)?;
        let row: Option<(String, i64)> = self
            .conn
            .query_row(
                "SELECT last_id, last_updated_at FROM sync_state WHERE collection = ?1",
                params![collection],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row
            .map(|(last_id, last_updated_at)| Checkpoint {
                last_id,
                last_updated_at,
            })
            .unwrap_or_default())
    }

    /// Drop all document data and staged blobs, keeping registrations.
    /// Used by explicit reinitialization.
    pub fn clear_all_data(&self) -> Result<()> {
        for name in self.collections.keys() {
            let table = schema::doc_table(name);
            self.conn.execute(&format!("DELETE FROM {table}"), [])?;
        }
        self.conn.execute("DELETE FROM sync_state", [])?;
        self.conn.execute("DELETE FROM blob_cache", [])?;
        Ok(())
    }

    // === settings key-value store ===

    pub fn settings_get(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn settings_set(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn settings_delete(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn table(&self, collection: &str) -> Result<String> {
        self.collection(collection)?;
        Ok(schema::doc_table(collection))
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}

struct PreparedDoc {
    id: String,
    updated_at: i64,
    deleted: bool,
    body: String,
}

/// Validate and normalize a document before writing. Local writes get the
/// current time as `updatedAt` unless the caller set one; replication
/// writes keep the server-assigned value.
fn prepare_doc(doc: &Value, origin: WriteOrigin) -> Result<PreparedDoc> {
    let id = doc
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::MissingId(doc.to_string()))?
        .to_string();

    let mut doc = doc.clone();
    let updated_at = match doc.get("updatedAt").and_then(Value::as_i64) {
        Some(ts) => ts,
        None => {
            let now = match origin {
                WriteOrigin::Local => now_ms(),
                WriteOrigin::Replication => 0,
            };
            doc["updatedAt"] = Value::from(now);
            now
        }
    };
    let deleted = doc.get("deleted").and_then(Value::as_bool).unwrap_or(false);

    Ok(PreparedDoc {
        id,
        updated_at,
        deleted,
        body: serde_json::to_string(&doc)?,
    })
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn store_with(name: &str, mode: ReplicationMode) -> DocumentStore {
        let mut store = DocumentStore::open_in_memory().unwrap();
        store
            .add_collection(CollectionSpec::new(name, 1, mode), None)
            .unwrap();
        store
    }

    #[test]
    fn insert_duplicate_is_conflict() {
        let store = store_with("cards", ReplicationMode::PushPull);
        let doc = json!({"id": "1-1", "known": false});
        store.insert("cards", &doc).unwrap();
        let err = store.insert("cards", &doc).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[test]
    fn patch_missing_is_not_found() {
        let store = store_with("cards", ReplicationMode::PushPull);
        let err = store
            .patch("cards", "nope", &json!({"known": true}))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn patch_preserves_unspecified_fields() {
        let store = store_with("cards", ReplicationMode::PushPull);
        store
            .insert("cards", &json!({"id": "1-1", "interval": 6, "known": false}))
            .unwrap();
        let patched = store
            .patch("cards", "1-1", &json!({"known": true}))
            .unwrap();
        assert_eq!(patched["interval"], json!(6));
        assert_eq!(patched["known"], json!(true));
        assert!(patched["updatedAt"].as_i64().unwrap() > 0);
    }

    #[test]
    fn local_write_is_stamped_and_dirty() {
        let store = store_with("cards", ReplicationMode::PushPull);
        store.insert("cards", &json!({"id": "1-1"})).unwrap();
        let dirty = store.dirty_docs("cards", 10).unwrap();
        assert_eq!(dirty.len(), 1);
        assert!(dirty[0]["updatedAt"].as_i64().unwrap() > 0);
        store.mark_clean("cards", &["1-1".to_string()]).unwrap();
        assert!(store.dirty_docs("cards", 10).unwrap().is_empty());
    }

    #[test]
    fn caller_supplied_timestamp_is_preserved() {
        let store = store_with("cards", ReplicationMode::PushPull);
        store
            .insert("cards", &json!({"id": "1-1", "updatedAt": 12345}))
            .unwrap();
        let doc = store.find_by_id("cards", "1-1").unwrap().unwrap();
        assert_eq!(doc["updatedAt"], json!(12345));
    }

    #[test]
    fn remote_reapply_is_idempotent() {
        let store = store_with("definitions", ReplicationMode::PullOnly);
        let page = vec![
            json!({"id": "1", "graph": "的", "updatedAt": 10}),
            json!({"id": "2", "graph": "是", "updatedAt": 20}),
        ];
        store.apply_remote_batch("definitions", &page).unwrap();
        store.apply_remote_batch("definitions", &page).unwrap();
        assert_eq!(store.count("definitions", &Selector::all()).unwrap(), 2);
        let cp = store.checkpoint("definitions").unwrap();
        assert_eq!(cp.last_updated_at, 20);
        assert_eq!(cp.last_id, "2");
    }

    #[test]
    fn local_writes_do_not_advance_pull_cursor() {
        let store = store_with("cards", ReplicationMode::PushPull);
        store
            .apply_remote_batch("cards", &[json!({"id": "1-1", "updatedAt": 50})])
            .unwrap();
        // a locally graded card gets a wall-clock stamp far past the
        // server position; the next pull must still start at 50
        store.insert("cards", &json!({"id": "2-1", "known": false})).unwrap();
        let cp = store.checkpoint("cards").unwrap();
        assert_eq!(cp.last_updated_at, 50);
        assert_eq!(cp.last_id, "1-1");
    }

    #[test]
    fn pull_cursor_never_moves_backwards() {
        let store = store_with("definitions", ReplicationMode::PullOnly);
        store
            .apply_remote_batch("definitions", &[json!({"id": "2", "updatedAt": 20})])
            .unwrap();
        store
            .apply_remote_batch("definitions", &[json!({"id": "1", "updatedAt": 10})])
            .unwrap();
        let cp = store.checkpoint("definitions").unwrap();
        assert_eq!(cp.last_updated_at, 20);
    }

    #[test]
    fn remote_apply_keeps_newer_dirty_local() {
        let store = store_with("cards", ReplicationMode::PushPull);
        store
            .insert("cards", &json!({"id": "1-1", "known": true, "updatedAt": 100}))
            .unwrap();
        store
            .apply_remote_batch("cards", &[json!({"id": "1-1", "known": false, "updatedAt": 50})])
            .unwrap();
        let doc = store.find_by_id("cards", "1-1").unwrap().unwrap();
        assert_eq!(doc["known"], json!(true));
    }

    #[test]
    fn soft_delete_for_synced_physical_for_local() {
        let store = {
            let mut s = DocumentStore::open_in_memory().unwrap();
            s.add_collection(CollectionSpec::new("cards", 1, ReplicationMode::PushPull), None)
                .unwrap();
            s.add_collection(CollectionSpec::new("event_queue", 1, ReplicationMode::None), None)
                .unwrap();
            s
        };
        store.insert("cards", &json!({"id": "1-1"})).unwrap();
        store.remove("cards", "1-1").unwrap();
        let doc = store.find_by_id("cards", "1-1").unwrap().unwrap();
        assert_eq!(doc["deleted"], json!(true));
        // soft-deleted docs are excluded from default finds
        assert_eq!(store.count("cards", &Selector::all()).unwrap(), 0);

        store.insert("event_queue", &json!({"id": "e1"})).unwrap();
        store.remove("event_queue", "e1").unwrap();
        assert!(store.find_by_id("event_queue", "e1").unwrap().is_none());
    }

    #[test]
    fn schema_mismatch_drops_noncritical_and_flags_reload() {
        let mut store = DocumentStore::open_in_memory().unwrap();
        store
            .add_collection(CollectionSpec::new("contents", 1, ReplicationMode::PullOnly), None)
            .unwrap();
        store
            .insert("contents", &json!({"id": "c1", "title": "t"}))
            .unwrap();

        let outcome = store
            .add_collection(CollectionSpec::new("contents", 2, ReplicationMode::PullOnly), None)
            .unwrap();
        assert_eq!(outcome, AddOutcome::Recreated);
        assert!(store.is_reload_required());
        assert_eq!(store.count("contents", &Selector::all()).unwrap(), 0);
    }

    #[test]
    fn schema_mismatch_aborts_for_critical() {
        let mut store = DocumentStore::open_in_memory().unwrap();
        store
            .add_collection(CollectionSpec::new("definitions", 1, ReplicationMode::PullOnly), None)
            .unwrap();
        let err = store
            .add_collection(
                CollectionSpec::new("definitions", 2, ReplicationMode::PullOnly).critical(),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch { .. }));
    }

    #[test]
    fn migration_runs_when_registered() {
        fn bump(conn: &Connection, collection: &str) -> std::result::Result<(), StoreError> {
            let table = schema::doc_table(collection);
            conn.execute(
                &format!("UPDATE {table} SET body = json_set(body, '$.migrated', 1)"),
                [],
            )?;
            Ok(())
        }

        let mut store = DocumentStore::open_in_memory().unwrap();
        store
            .add_collection(CollectionSpec::new("cards", 1, ReplicationMode::PushPull), None)
            .unwrap();
        store.insert("cards", &json!({"id": "1-1"})).unwrap();

        let outcome = store
            .add_collection(
                CollectionSpec::new("cards", 2, ReplicationMode::PushPull),
                Some(bump),
            )
            .unwrap();
        assert_eq!(outcome, AddOutcome::Migrated);
        let doc = store.find_by_id("cards", "1-1").unwrap().unwrap();
        assert_eq!(doc["migrated"], json!(1));
        assert!(!store.is_reload_required());
    }

    #[test]
    fn find_with_selector_sort_and_limit() {
        let store = store_with("cards", ReplicationMode::PushPull);
        for (id, due) in [("1-1", 30), ("2-1", 10), ("3-1", 20)] {
            store
                .insert("cards", &json!({"id": id, "dueDate": due, "known": false}))
                .unwrap();
        }
        let found = store
            .find(
                "cards",
                &Selector::all().lt("dueDate", json!(25)),
                Some(SortSpec::asc("dueDate")),
                Some(1),
            )
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["id"], json!("2-1"));
    }
}
