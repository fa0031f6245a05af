//! Error types for FluxSeries

use thiserror::Error;

/// Result type alias for FluxSeries operations
pub type Result<T> = std::result::Result<T, SeriesError>;

/// FluxSeries error types
#[derive(Error, Debug)]
pub enum SeriesError {
    /// Database or document does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Shutdown requested twice for the same actor
    #[error("already closed")]
    AlreadyClosed,

    /// Bundle deadline elapsed before processing, or query ran past its deadline
    #[error("query timeout")]
    Timeout,

    /// Malformed query or request
    #[error("validation error: {0}")]
    Validation(String),

    /// Unrecognized mailbox item
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Compaction or the file swap that follows it failed
    #[error("compaction failed: {0}")]
    CompactionFailed(String),

    /// Storage handle could not be reopened after a successful compaction
    #[error("reopen after compaction failed: {0}")]
    ReopenFailed(String),

    /// Data corruption detected
    #[error("data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Document key is not a recognizable timestamp
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// JSON encoding or decoding failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Cache backend failure
    #[error("cache error: {0}")]
    Cache(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl SeriesError {
    /// Check if the error means the target does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, SeriesError::NotFound(_))
    }

    /// Check if the error is a deadline expiry
    pub fn is_timeout(&self) -> bool {
        matches!(self, SeriesError::Timeout)
    }

    /// Check if the error was caused by the caller's input
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SeriesError::Validation(_) | SeriesError::InvalidKey(_)
        )
    }

    /// Short machine-readable name, used as the `error` field of API responses
    pub fn kind(&self) -> &'static str {
        match self {
            SeriesError::NotFound(_) => "not_found",
            SeriesError::Io(_) => "io_error",
            SeriesError::AlreadyClosed => "already_closed",
            SeriesError::Timeout => "timeout",
            SeriesError::Validation(_) => "bad_request",
            SeriesError::UnsupportedOperation(_) => "unsupported_operation",
            SeriesError::CompactionFailed(_) => "compaction_failed",
            SeriesError::ReopenFailed(_) => "reopen_failed",
            SeriesError::Corruption(_) | SeriesError::ChecksumMismatch { .. } => "corruption",
            SeriesError::InvalidKey(_) => "invalid_key",
            SeriesError::Json(_) => "bad_json",
            SeriesError::Cache(_) => "cache_error",
            SeriesError::Internal(_) => "internal_error",
        }
    }
}
