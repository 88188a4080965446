//! Cache configuration.

use crate::paths::{IMAGES_DB, POSTS_DB};
use cumulus_db::DbConfig;
use cumulus_fetch::DownloadConfig;
use directories::ProjectDirs;
use std::path::PathBuf;

/// Configuration for a cache service instance.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Private application-data root holding databases and artifacts.
    pub data_dir: PathBuf,
    /// Database-core configuration.
    pub db: DbConfig,
    /// Download-manager configuration.
    pub download: DownloadConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            db: DbConfig::default(),
            download: DownloadConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the application-data root. Tests point this at a scratch
    /// directory.
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Sets the database-core configuration.
    #[must_use]
    pub fn with_db(mut self, db: DbConfig) -> Self {
        self.db = db;
        self
    }

    /// Sets the download-manager configuration.
    #[must_use]
    pub fn with_download(mut self, download: DownloadConfig) -> Self {
        self.download = download;
        self
    }

    /// Path of the images cache database.
    #[must_use]
    pub fn images_db_path(&self) -> PathBuf {
        self.data_dir.join(IMAGES_DB)
    }

    /// Path of the posts/events cache database.
    #[must_use]
    pub fn posts_db_path(&self) -> PathBuf {
        self.data_dir.join(POSTS_DB)
    }
}

/// Platform application-data directory, falling back to the working
/// directory when the OS provides none (containers, stripped-down targets).
fn default_data_dir() -> PathBuf {
    ProjectDirs::from("org", "Cumulus", "cumulus")
        .map(|dirs| dirs.data_local_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}
