//! Error types for artifact downloads.

use thiserror::Error;

/// Errors that can occur while downloading an artifact.
///
/// Download failures are per-artifact: the caller leaves the corresponding
/// row's path empty and retries on next access, so these never abort a
/// surrounding reconciliation pass.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The server answered with a non-success status.
    #[error("server returned status {code}")]
    Status {
        /// HTTP status code.
        code: u16,
    },

    /// The request or body transfer failed below the HTTP layer.
    #[error("transfer failed: {message}")]
    Transport {
        /// Description of the failure.
        message: String,
    },

    /// Writing the artifact to disk failed. The partial file is discarded.
    #[error("artifact write failed: {0}")]
    Io(#[from] std::io::Error),

    /// No bytes arrived within the inactivity window.
    #[error("download timed out waiting for data")]
    TimedOut,
}

impl FetchError {
    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }
}
