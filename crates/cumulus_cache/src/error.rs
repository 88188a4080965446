//! Error types for the domain caches.

use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors surfaced by the domain caches and services.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A database core operation failed.
    #[error(transparent)]
    Database(#[from] cumulus_db::DbError),

    /// An artifact download failed.
    ///
    /// Per-artifact and non-fatal: the corresponding row keeps an empty path
    /// and the artifact is retried on next access.
    #[error("download failed: {message}")]
    Download {
        /// Description of the failure.
        message: String,
    },

    /// The cache worker thread has shut down.
    #[error("cache worker is no longer running")]
    WorkerClosed,

    /// A bounded wait on a completion expired.
    #[error("timed out waiting for the cache worker")]
    Timeout,
}

impl CacheError {
    /// Creates a download error.
    pub fn download(message: impl Into<String>) -> Self {
        Self::Download {
            message: message.into(),
        }
    }

    /// Creates an invalid-argument error (rejected before any I/O).
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::Database(cumulus_db::DbError::invalid_argument(message))
    }
}
