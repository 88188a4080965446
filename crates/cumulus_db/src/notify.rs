//! Cross-process "data changed" broadcast.
//!
//! Sibling processes sharing a cache database need to know when the file
//! changed underneath them without polling the tables. The broadcast is a
//! marker file next to the database; a committing process bumps it, and
//! every other process watches the marker at a coarse interval. Delivery is
//! at-least-once with no payload: listeners reload whatever they care about.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Suffix appended to the database file name for the marker file.
const MARKER_SUFFIX: &str = ".changed";

/// Per-process bump counter so consecutive announcements differ.
static ANNOUNCE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Announces commits to sibling processes via the marker file.
#[derive(Debug, Clone)]
pub struct ChangeSignal {
    marker: PathBuf,
}

impl ChangeSignal {
    /// Creates the signal for the given database file.
    #[must_use]
    pub fn for_database(db_path: &Path) -> Self {
        let mut os = db_path.as_os_str().to_os_string();
        os.push(MARKER_SUFFIX);
        Self {
            marker: PathBuf::from(os),
        }
    }

    /// Bumps the marker so watchers in other processes fire.
    ///
    /// The payload identifies the announcing process so a process does not
    /// react to its own commits.
    pub fn announce(&self) -> io::Result<()> {
        let stamp = format!(
            "{}:{}",
            std::process::id(),
            ANNOUNCE_SEQ.fetch_add(1, Ordering::SeqCst)
        );
        fs::write(&self.marker, stamp)
    }

    /// Returns the marker file path.
    #[must_use]
    pub fn marker_path(&self) -> &Path {
        &self.marker
    }
}

/// Watches a database's change marker and invokes a callback on foreign bumps.
///
/// The watcher runs on its own named thread, polling the marker at the given
/// interval. Bumps announced by this same process are filtered out; everything
/// else triggers the callback once per observed change (coalescing is fine;
/// delivery is at-least-once, not once-per-commit).
pub struct ChangeWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ChangeWatcher {
    /// Spawns a watcher for the given database file.
    pub fn spawn<F>(db_path: &Path, poll_interval: Duration, callback: F) -> io::Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let marker = ChangeSignal::for_database(db_path).marker.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let own_pid = std::process::id();

        let handle = thread::Builder::new()
            .name("cumulus-change-watcher".into())
            .spawn(move || {
                let mut last = fs::read_to_string(&marker).ok();
                while !stop_flag.load(Ordering::SeqCst) {
                    thread::sleep(poll_interval);
                    if stop_flag.load(Ordering::SeqCst) {
                        break;
                    }
                    let current = fs::read_to_string(&marker).ok();
                    if current != last {
                        let foreign = current
                            .as_deref()
                            .and_then(|s| s.split(':').next())
                            .and_then(|pid| pid.parse::<u32>().ok())
                            .is_none_or(|pid| pid != own_pid);
                        if foreign {
                            debug!(marker = %marker.display(), "observed foreign change");
                            callback();
                        }
                        last = current;
                    }
                }
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("change watcher thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use tempfile::tempdir;

    #[test]
    fn marker_path_derivation() {
        let signal = ChangeSignal::for_database(Path::new("/data/images.db"));
        assert_eq!(
            signal.marker_path(),
            Path::new("/data/images.db.changed")
        );
    }

    #[test]
    fn announce_writes_the_marker() {
        let temp = tempdir().unwrap();
        let db_path = temp.path().join("cache.db");
        let signal = ChangeSignal::for_database(&db_path);

        signal.announce().unwrap();
        let contents = fs::read_to_string(signal.marker_path()).unwrap();
        assert!(contents.starts_with(&std::process::id().to_string()));
    }

    #[test]
    fn watcher_fires_on_foreign_bump() {
        let temp = tempdir().unwrap();
        let db_path = temp.path().join("cache.db");
        let marker = ChangeSignal::for_database(&db_path).marker_path().to_path_buf();

        let (tx, rx) = mpsc::channel();
        let _watcher = ChangeWatcher::spawn(&db_path, Duration::from_millis(10), move || {
            let _ = tx.send(());
        })
        .unwrap();

        // A bump attributed to some other process.
        fs::write(&marker, format!("{}:0", std::process::id() + 1)).unwrap();

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn watcher_ignores_own_announcements() {
        let temp = tempdir().unwrap();
        let db_path = temp.path().join("cache.db");
        let signal = ChangeSignal::for_database(&db_path);

        let (tx, rx) = mpsc::channel();
        let _watcher = ChangeWatcher::spawn(&db_path, Duration::from_millis(10), move || {
            let _ = tx.send(());
        })
        .unwrap();

        signal.announce().unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
    }
}
