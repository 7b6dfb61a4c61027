//! # Errors
//!
//! One error type for the memory store and everything layered on it.
//!
//! | Variant | Raised by | Caller's move |
//! |---------|-----------|---------------|
//! | [`MemoryError::DimensionMismatch`] | index add/search | abort the operation |
//! | [`MemoryError::OutOfRange`] | record lookup | abort the operation |
//! | [`MemoryError::Persistence`] | save/load | keep serving from memory, warn |
//! | [`MemoryError::Upstream`] | embedding/generation ports | fail the query, no commit |
//! | [`MemoryError::Config`] | configuration validation | fix the config file |

use thiserror::Error;

/// Errors produced by the memory store, its persistence layer, and its ports.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// A vector handed to the index does not have the store's dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A record lookup past the end of the store.
    #[error("record {id} out of range (store holds {len})")]
    OutOfRange { id: usize, len: usize },

    /// The durable artifact could not be written or read back.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// The embedding model or generation backend failed or timed out.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// A configuration value is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl MemoryError {
    pub(crate) fn persistence(context: &str, err: impl std::fmt::Display) -> Self {
        MemoryError::Persistence(format!("{context}: {err}"))
    }

    pub(crate) fn upstream(context: &str, err: impl std::fmt::Display) -> Self {
        MemoryError::Upstream(format!("{context}: {err}"))
    }
}

/// Result alias for memory store operations.
pub type Result<T> = std::result::Result<T, MemoryError>;
