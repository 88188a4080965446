//! Error types for the database core.

use thiserror::Error;

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors that can occur in database core operations.
///
/// Every database operation reports a structured error rather than
/// panicking; callers see one of these kinds plus a message.
#[derive(Debug, Error)]
pub enum DbError {
    /// An operation was attempted before the database was opened.
    #[error("database is not open")]
    NotOpen,

    /// The database was asked to open while already open.
    #[error("database is already open")]
    AlreadyOpen,

    /// Creating a fresh database file failed. The partial file is removed.
    #[error("database creation failed: {message}")]
    Create {
        /// Description of the failure.
        message: String,
    },

    /// Opening an existing database file failed.
    #[error("database open failed: {message}")]
    Open {
        /// Description of the failure.
        message: String,
    },

    /// Applying connection pragmas failed.
    #[error("database configuration failed: {message}")]
    Configuration {
        /// Description of the failure.
        message: String,
    },

    /// The on-disk database failed its integrity check.
    #[error("database integrity check failed: {message}")]
    IntegrityCheck {
        /// Output of the failed check.
        message: String,
    },

    /// A schema upgrade step failed or did not advance the version.
    #[error("database upgrade failed: {message}")]
    Upgrade {
        /// Description of the failure.
        message: String,
    },

    /// The cross-process mutex could not be set up or operated.
    #[error("process mutex error: {0}")]
    ProcessMutex(#[from] cumulus_lock::LockError),

    /// The stored schema version could not be read.
    #[error("schema version query failed: {message}")]
    VersionQuery {
        /// Description of the failure.
        message: String,
    },

    /// The stored schema version does not match the expected version.
    ///
    /// Reported by non-authority processes; it usually means another process
    /// is still blocking the schema upgrade.
    #[error("schema version mismatch: found {found}, expected {expected}")]
    VersionMismatch {
        /// Version stored in the database file.
        found: u32,
        /// Version this build expects.
        expected: u32,
    },

    /// A transaction operation was invalid in the current state.
    #[error("transaction error: {message}")]
    Transaction {
        /// Description of the failure.
        message: String,
    },

    /// A transaction operation required the write lock, which was not held.
    #[error("transaction lock is not held")]
    TransactionLock,

    /// Preparing a statement failed.
    #[error("statement preparation failed: {message}")]
    PrepareQuery {
        /// Description of the failure.
        message: String,
    },

    /// Executing a query or mapping its rows failed.
    #[error("query failed: {message}")]
    Query {
        /// Description of the failure.
        message: String,
    },

    /// A caller-supplied argument was rejected before any I/O.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the rejected argument.
        message: String,
    },
}

impl DbError {
    /// Creates a creation error.
    pub fn create(message: impl Into<String>) -> Self {
        Self::Create {
            message: message.into(),
        }
    }

    /// Creates an open error.
    pub fn open(message: impl Into<String>) -> Self {
        Self::Open {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates an integrity check error.
    pub fn integrity_check(message: impl Into<String>) -> Self {
        Self::IntegrityCheck {
            message: message.into(),
        }
    }

    /// Creates an upgrade error.
    pub fn upgrade(message: impl Into<String>) -> Self {
        Self::Upgrade {
            message: message.into(),
        }
    }

    /// Creates a version query error.
    pub fn version_query(message: impl Into<String>) -> Self {
        Self::VersionQuery {
            message: message.into(),
        }
    }

    /// Creates a transaction error.
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    /// Creates a statement preparation error.
    pub fn prepare_query(message: impl Into<String>) -> Self {
        Self::PrepareQuery {
            message: message.into(),
        }
    }

    /// Creates a query error.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_the_message() {
        let err = DbError::upgrade("step 2 failed");
        assert_eq!(err.to_string(), "database upgrade failed: step 2 failed");

        let err = DbError::VersionMismatch {
            found: 2,
            expected: 3,
        };
        assert!(err.to_string().contains("found 2"));
        assert!(err.to_string().contains("expected 3"));
    }

    #[test]
    fn lock_errors_convert() {
        let lock_err = cumulus_lock::LockError::NotHeld;
        let err: DbError = lock_err.into();
        assert!(matches!(err, DbError::ProcessMutex(_)));
    }
}
