//! Error types for cache backends.

use thiserror::Error;

/// Convenience result type using [`CacheError`].
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by cache backends.
///
/// Backend failures never abort graph execution: the scheduler logs the
/// failure and falls back to executing the node.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Underlying storage I/O failed (disk backend).
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored entry could not be serialized or deserialized.
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-specific failure.
    #[error("cache backend error: {0}")]
    Backend(String),
}
