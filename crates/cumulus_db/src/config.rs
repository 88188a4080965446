//! Database configuration.

use std::time::Duration;

/// Configuration for opening a cache database.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Whether to create the database file if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to use write-ahead logging.
    ///
    /// WAL lets sibling processes keep reading while the lock holder writes.
    pub wal: bool,

    /// Whether to enforce foreign keys at the SQL level.
    pub foreign_keys: bool,

    /// SQLite busy timeout for the rare statement that races a reader.
    ///
    /// Writes are serialized by the external process mutex, not by this.
    pub busy_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            wal: true,
            foreign_keys: true,
            busy_timeout: Duration::from_secs(2),
        }
    }
}

impl DbConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the database file if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to use write-ahead logging.
    #[must_use]
    pub const fn wal(mut self, value: bool) -> Self {
        self.wal = value;
        self
    }

    /// Sets whether to enforce foreign keys.
    #[must_use]
    pub const fn foreign_keys(mut self, value: bool) -> Self {
        self.foreign_keys = value;
        self
    }

    /// Sets the SQLite busy timeout.
    #[must_use]
    pub const fn busy_timeout(mut self, value: Duration) -> Self {
        self.busy_timeout = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = DbConfig::default();
        assert!(config.create_if_missing);
        assert!(config.wal);
        assert!(config.foreign_keys);
    }

    #[test]
    fn builder_pattern() {
        let config = DbConfig::new()
            .create_if_missing(false)
            .wal(false)
            .busy_timeout(Duration::from_millis(100));

        assert!(!config.create_if_missing);
        assert!(!config.wal);
        assert_eq!(config.busy_timeout, Duration::from_millis(100));
    }
}
