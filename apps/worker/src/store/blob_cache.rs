//! Key-to-blob staging store for bulk download/upload files.
//!
//! The bootstrap loader stages export files here so an interrupted run can
//! resume without re-downloading, and deletes each file after import.

use rusqlite::{params, OptionalExtension};

use crate::store::error::StoreError;
use crate::store::{now_ms, DocumentStore};

type Result<T> = std::result::Result<T, StoreError>;

impl DocumentStore {
    pub fn blob_put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO blob_cache (key, data, created_at) VALUES (?1, ?2, ?3)",
            params![key, data, now_ms()],
        )?;
        Ok(())
    }

    pub fn blob_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.conn()
            .query_row(
                "SELECT data FROM blob_cache WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn blob_contains(&self, key: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM blob_cache WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn blob_delete(&self, key: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM blob_cache WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// All staged keys, oldest first.
    pub fn blob_keys(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT key FROM blob_cache ORDER BY created_at, key")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}
