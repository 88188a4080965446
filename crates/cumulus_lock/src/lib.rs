//! # Cumulus Lock
//!
//! Cross-process mutual exclusion for Cumulus cache databases.
//!
//! Several OS processes (the sync daemon, the UI, transfer helpers) share one
//! SQLite file per cache. SQLite's own busy-handler backoff is not a fair
//! arbiter for this write pattern, so all transactional writes go through an
//! external mutex keyed by the database file path.
//!
//! The mutex is backed by a lock directory next to the database file:
//!
//! ```text
//! <db-file>.lock.d/
//! ├─ init.lock          # serializes handle construction across processes
//! ├─ conn-<pid>-<n>.lock # one per live handle; flock held for its lifetime
//! └─ write.lock         # exclusive flock = write access
//! ```
//!
//! Advisory locks are released by the kernel when the holding process dies,
//! so a crashed writer never wedges the database. The first handle to find no
//! live connections becomes the *initial process* for that database file and
//! is the only one allowed to run schema upgrades.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use fs2::FileExt;
use parking_lot::{Condvar, Mutex};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors that can occur while setting up or operating the process mutex.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock directory or one of its files could not be created or opened.
    #[error("lock setup failed: {message}")]
    Setup {
        /// Description of the failure.
        message: String,
    },

    /// Acquiring the shared write lock failed with a real error (not contention).
    #[error("lock acquisition failed: {message}")]
    Acquire {
        /// Description of the failure.
        message: String,
    },

    /// Releasing the shared write lock failed.
    #[error("lock release failed: {message}")]
    Release {
        /// Description of the failure.
        message: String,
    },

    /// `unlock` was called without the lock being held by this handle.
    #[error("lock is not held by this handle")]
    NotHeld,
}

impl LockError {
    /// Creates a setup error.
    pub fn setup(message: impl Into<String>) -> Self {
        Self::Setup {
            message: message.into(),
        }
    }

    /// Creates an acquisition error.
    pub fn acquire(message: impl Into<String>) -> Self {
        Self::Acquire {
            message: message.into(),
        }
    }

    /// Creates a release error.
    pub fn release(message: impl Into<String>) -> Self {
        Self::Release {
            message: message.into(),
        }
    }
}

/// File names within the lock directory.
const INIT_LOCK: &str = "init.lock";
const WRITE_LOCK: &str = "write.lock";
const CONN_PREFIX: &str = "conn-";

/// Distinguishes per-process handles so one process can open several caches.
static CONN_SEQ: AtomicU64 = AtomicU64::new(0);

/// Poll interval for the timed lock variant.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A named, database-file-keyed mutual exclusion handle shared across processes.
///
/// One `ProcessMutex` exists per open database handle. `lock()` grants
/// exclusive write access database-wide: same-process callers are serialized
/// through an in-process gate, other processes through an exclusive advisory
/// lock on `write.lock`.
///
/// # Crash safety
///
/// All advisory locks held by a process are released by the kernel when the
/// process exits, however it exits. Stale connection markers left behind by a
/// crash are reaped by the next handle to be constructed.
///
/// # Example
///
/// ```rust,ignore
/// let mutex = ProcessMutex::new(Path::new("/data/cache/images.db"))?;
/// mutex.lock()?;
/// // ... exclusive write access ...
/// mutex.unlock()?;
/// ```
pub struct ProcessMutex {
    /// Lock directory derived from the database file path.
    lock_dir: PathBuf,
    /// Handle to `write.lock`; flocked while the mutex is held.
    write_file: File,
    /// Connection marker; flocked for this handle's whole lifetime.
    _conn_file: File,
    /// Path of the connection marker, removed on drop.
    conn_path: PathBuf,
    /// Whether this handle found no live peers at construction time.
    initial_process: bool,
    /// In-process gate: true while some thread in this process holds the lock.
    gate: Mutex<bool>,
    /// Wakes same-process waiters when the gate opens.
    gate_cv: Condvar,
}

impl ProcessMutex {
    /// Creates a mutex handle for the given database file.
    ///
    /// Construction is serialized across processes through `init.lock` so
    /// that the first-process determination and the stale-marker reaping
    /// cannot race. The handle registers itself as a live connection before
    /// the initialization lock is released.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Setup`] if the lock directory or its files cannot
    /// be created, opened, or locked.
    pub fn new(db_path: &Path) -> LockResult<Self> {
        let lock_dir = lock_dir_for(db_path);
        fs::create_dir_all(&lock_dir).map_err(|e| {
            LockError::setup(format!(
                "cannot create lock directory {}: {e}",
                lock_dir.display()
            ))
        })?;

        // Serialize construction against peer processes.
        let init_file = open_lock_file(&lock_dir.join(INIT_LOCK))?;
        init_file
            .lock_exclusive()
            .map_err(|e| LockError::setup(format!("cannot acquire init lock: {e}")))?;

        let live_peers = reap_stale_connections(&lock_dir)?;
        let initial_process = live_peers == 0;

        // Register this handle as a live connection. The flock is held until
        // the handle is dropped (or the process dies).
        let conn_path = lock_dir.join(format!(
            "{CONN_PREFIX}{}-{}.lock",
            std::process::id(),
            CONN_SEQ.fetch_add(1, Ordering::SeqCst)
        ));
        let conn_file = open_lock_file(&conn_path)?;
        conn_file.try_lock_exclusive().map_err(|e| {
            LockError::setup(format!(
                "cannot lock connection marker {}: {e}",
                conn_path.display()
            ))
        })?;

        let write_file = open_lock_file(&lock_dir.join(WRITE_LOCK))?;

        // Releases the flock as well.
        drop(init_file);

        debug!(
            lock_dir = %lock_dir.display(),
            initial_process,
            live_peers,
            "process mutex initialized"
        );

        Ok(Self {
            lock_dir,
            write_file,
            _conn_file: conn_file,
            conn_path,
            initial_process,
            gate: Mutex::new(false),
            gate_cv: Condvar::new(),
        })
    }

    /// Whether this handle was the first live connection to the database file.
    ///
    /// The initial process is the schema-upgrade authority: it alone may
    /// migrate the database, while later processes only verify the version.
    #[must_use]
    pub fn is_initial_process(&self) -> bool {
        self.initial_process
    }

    /// Acquires exclusive write access, blocking indefinitely.
    ///
    /// Same-process callers queue on the in-process gate; cross-process
    /// contention blocks on the advisory lock.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Acquire`] if the underlying lock operation fails
    /// with a real error. Contention is not an error; it blocks.
    pub fn lock(&self) -> LockResult<()> {
        let mut held = self.gate.lock();
        while *held {
            self.gate_cv.wait(&mut held);
        }
        *held = true;
        drop(held);

        if let Err(e) = self.write_file.lock_exclusive() {
            *self.gate.lock() = false;
            self.gate_cv.notify_one();
            return Err(LockError::acquire(e.to_string()));
        }
        Ok(())
    }

    /// Attempts to acquire write access without waiting.
    ///
    /// Returns `false` when the lock is held elsewhere (in this process or
    /// another); this is not an error.
    pub fn try_lock(&self) -> LockResult<bool> {
        let mut held = self.gate.lock();
        if *held {
            return Ok(false);
        }
        match self.write_file.try_lock_exclusive() {
            Ok(()) => {
                *held = true;
                Ok(true)
            }
            Err(e) if is_contention(&e) => Ok(false),
            Err(e) => Err(LockError::acquire(e.to_string())),
        }
    }

    /// Attempts to acquire write access, waiting at most `timeout`.
    ///
    /// Returns `false` if the lock could not be acquired within the timeout.
    /// The advisory-lock primitive has no native timed wait, so this polls
    /// [`Self::try_lock`] at a short interval until the deadline passes.
    pub fn lock_timeout(&self, timeout: Duration) -> LockResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_lock()? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(LOCK_POLL_INTERVAL);
        }
    }

    /// Releases write access previously acquired by this handle.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotHeld`] if this handle does not hold the lock,
    /// or [`LockError::Release`] if the underlying unlock fails (in which
    /// case the lock is still considered held).
    pub fn unlock(&self) -> LockResult<()> {
        let mut held = self.gate.lock();
        if !*held {
            return Err(LockError::NotHeld);
        }
        self.write_file
            .unlock()
            .map_err(|e| LockError::release(e.to_string()))?;
        *held = false;
        drop(held);
        self.gate_cv.notify_one();
        Ok(())
    }

    /// Reports whether write access is currently held by anyone.
    ///
    /// When this handle does not hold the lock itself, the answer comes from
    /// a non-blocking probe on a separate file description, so a `true` can
    /// be stale by the time the caller acts on it.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        if *self.gate.lock() {
            return true;
        }
        let probe = match open_lock_file(&self.lock_dir.join(WRITE_LOCK)) {
            Ok(f) => f,
            Err(_) => return false,
        };
        match probe.try_lock_exclusive() {
            Ok(()) => {
                let _ = probe.unlock();
                false
            }
            Err(_) => true,
        }
    }

    /// Returns the lock directory backing this mutex.
    #[must_use]
    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }
}

impl Drop for ProcessMutex {
    fn drop(&mut self) {
        if *self.gate.lock() {
            let _ = self.write_file.unlock();
        }
        // The connection flock dies with the file handle; removing the marker
        // keeps the lock directory from accumulating files across restarts.
        let _ = fs::remove_file(&self.conn_path);
    }
}

impl std::fmt::Debug for ProcessMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessMutex")
            .field("lock_dir", &self.lock_dir)
            .field("initial_process", &self.initial_process)
            .field("held", &*self.gate.lock())
            .finish()
    }
}

/// Whether an I/O error means "somebody else holds the lock".
fn is_contention(e: &std::io::Error) -> bool {
    e.kind() == fs2::lock_contended_error().kind()
}

/// Derives the lock directory path for a database file.
fn lock_dir_for(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_os_string();
    os.push(".lock.d");
    PathBuf::from(os)
}

/// Opens (creating if needed) a lock file without truncating it.
fn open_lock_file(path: &Path) -> LockResult<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| LockError::setup(format!("cannot open {}: {e}", path.display())))
}

/// Counts live connection markers, removing any whose owner has died.
///
/// A marker is live exactly while its owner still holds the flock; a marker
/// we can re-lock belongs to a dead process and is reaped.
fn reap_stale_connections(lock_dir: &Path) -> LockResult<usize> {
    let entries = fs::read_dir(lock_dir)
        .map_err(|e| LockError::setup(format!("cannot scan {}: {e}", lock_dir.display())))?;

    let mut live = 0usize;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(CONN_PREFIX) {
            continue;
        }
        let path = entry.path();
        let file = match open_lock_file(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable connection marker");
                continue;
            }
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                drop(file);
                if fs::remove_file(&path).is_ok() {
                    debug!(path = %path.display(), "reaped stale connection marker");
                }
            }
            Err(_) => live += 1,
        }
    }
    Ok(live)
}
