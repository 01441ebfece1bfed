//! Document store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("duplicate primary key in {collection}: {id}")]
    Conflict { collection: String, id: String },

    #[error("document not found in {collection}: {id}")]
    NotFound { collection: String, id: String },

    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("invalid field name: {0}")]
    InvalidField(String),

    #[error("document has no string id: {0}")]
    MissingId(String),

    #[error("schema mismatch for {collection}: stored v{stored}, requested v{requested}")]
    SchemaMismatch {
        collection: String,
        stored: i64,
        requested: i64,
    },

    #[error("storage integrity violation: {0}")]
    DataIntegrity(String),
}
