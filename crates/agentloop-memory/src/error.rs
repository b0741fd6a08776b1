//! Error taxonomy for the memory engine.
//!
//! Write paths (`load_session`, `add_memory`) surface these to the caller.
//! Read and maintenance paths with a safe degraded answer log them instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    /// An operation needed an active session and none was loaded.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A required argument was missing or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The tokenizer or embedding provider failed.
    #[error("provider failure: {0}")]
    ProviderFailure(String),

    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("connection pool failure: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("metadata serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
}

impl MemoryError {
    pub fn no_active_session() -> Self {
        MemoryError::InvalidState("no active session - call load_session() first".to_string())
    }

    /// True for every variant that originates in the persistence layer.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            MemoryError::Storage(_) | MemoryError::Pool(_) | MemoryError::Serialization(_) | MemoryError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;
