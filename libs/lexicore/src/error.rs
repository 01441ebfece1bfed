//! Error types for lexicore.

use thiserror::Error;

/// Result type alias using CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid grade value: {0}")]
    InvalidGrade(i64),

    #[error("invalid card type value: {0}")]
    InvalidCardType(i64),

    #[error("malformed card id: {0}")]
    MalformedCardId(String),
}
