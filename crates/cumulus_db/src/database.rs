//! Database facade: open-or-create, upgrades, transactions, query pipeline.

use crate::config::DbConfig;
use crate::error::{DbError, DbResult};
use crate::hooks::SchemaHooks;
use crate::migration::{read_user_version, write_user_version, SchemaDef};
use crate::notify::ChangeSignal;
use cumulus_lock::ProcessMutex;
use rusqlite::{Connection, Params, Row};
use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A single-file cache database with cross-process write serialization.
///
/// `Database` owns the SQLite connection, the [`ProcessMutex`] guarding the
/// file, and a schema-specific [`SchemaHooks`] value it calls around commit
/// and rollback. The core never sees concrete schema types; everything
/// domain-specific flows through the hooks and through the caller-supplied
/// SQL and row mappers of the query pipeline.
///
/// # Opening
///
/// ```rust,ignore
/// let db = Database::open(&path, &IMAGES_SCHEMA, ImagesHooks::new(), DbConfig::default())?;
/// ```
///
/// A missing file is created with the schema's full DDL and stamped with the
/// current version. For an existing file, the first process to connect (the
/// upgrade authority) checks integrity and applies pending upgrade steps
/// under the write lock; any other process only verifies that the stored
/// version matches and fails with [`DbError::VersionMismatch`] otherwise.
///
/// # Transactions
///
/// All mutations happen inside a transaction serialized by the process
/// mutex. [`store`](Self::store) and [`delete_value`](Self::delete_value)
/// open an implicit transaction when the caller has not; multi-statement
/// work uses [`begin_transaction`](Self::begin_transaction) /
/// [`commit_transaction`](Self::commit_transaction) /
/// [`rollback_transaction`](Self::rollback_transaction) explicitly.
pub struct Database<H: SchemaHooks> {
    /// The underlying connection.
    conn: Connection,
    /// Cross-process write mutex keyed by the database file path.
    mutex: ProcessMutex,
    /// Schema description used at open time.
    schema: &'static SchemaDef,
    /// Schema-specific commit/rollback behavior.
    hooks: H,
    /// Path of the database file.
    path: PathBuf,
    /// Whether an explicit or implicit transaction is active.
    in_transaction: Cell<bool>,
    /// Whether this handle currently holds the process write lock.
    lock_held: Cell<bool>,
    /// Cross-process "data changed" broadcast for this file.
    signal: ChangeSignal,
}

impl<H: SchemaHooks> Database<H> {
    /// Opens or creates the database file for the given schema.
    ///
    /// # Errors
    ///
    /// - [`DbError::Create`] if a fresh file cannot be fully initialized
    ///   (the partial file is removed);
    /// - [`DbError::Open`] / [`DbError::Configuration`] for open and pragma
    ///   failures;
    /// - [`DbError::IntegrityCheck`] when the authority finds corruption;
    /// - [`DbError::Upgrade`] when an upgrade step fails or does not advance
    ///   the version;
    /// - [`DbError::VersionMismatch`] when a non-authority process finds an
    ///   unexpected stored version (a peer is still blocking the upgrade).
    pub fn open(
        path: &Path,
        schema: &'static SchemaDef,
        hooks: H,
        config: DbConfig,
    ) -> DbResult<Self> {
        schema.validate()?;

        let existed = path.exists();
        if !existed && !config.create_if_missing {
            return Err(DbError::open(format!(
                "database file does not exist: {}",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                DbError::create(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let mutex = ProcessMutex::new(path)?;
        let conn = Connection::open(path)
            .map_err(|e| DbError::open(format!("cannot open {}: {e}", path.display())))?;

        if existed {
            configure(&conn, &config)?;
            if mutex.is_initial_process() {
                mutex.lock()?;
                let upgraded = upgrade_existing(&conn, schema);
                mutex.unlock()?;
                upgraded?;
            } else {
                let found = read_user_version(&conn)?;
                if found != schema.version {
                    return Err(DbError::VersionMismatch {
                        found,
                        expected: schema.version,
                    });
                }
            }
            debug!(schema = schema.name, path = %path.display(), "opened existing database");
        } else if let Err(e) = initialize_new(&conn, schema, &config) {
            drop(conn);
            let _ = fs::remove_file(path);
            return Err(DbError::create(format!(
                "cannot initialize {}: {e}",
                path.display()
            )));
        } else {
            info!(schema = schema.name, path = %path.display(), "created database");
        }

        Ok(Self {
            signal: ChangeSignal::for_database(path),
            conn,
            mutex,
            schema,
            hooks,
            path: path.to_path_buf(),
            in_transaction: Cell::new(false),
            lock_held: Cell::new(false),
        })
    }

    /// Returns the schema hooks attached to this database.
    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Returns the database file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this process is the schema-upgrade authority for the file.
    #[must_use]
    pub fn is_initial_process(&self) -> bool {
        self.mutex.is_initial_process()
    }

    /// Whether a transaction is currently active on this handle.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.in_transaction.get()
    }

    /// Reads the schema version currently stored in the file.
    pub fn stored_version(&self) -> DbResult<u32> {
        read_user_version(&self.conn)
    }

    /// Begins a transaction, acquiring the cross-process write lock first.
    ///
    /// Blocks until the lock is available. Fails with
    /// [`DbError::Transaction`] if this handle is already inside a
    /// transaction.
    pub fn begin_transaction(&self) -> DbResult<()> {
        if self.in_transaction.get() {
            return Err(DbError::transaction("transaction already in progress"));
        }
        self.mutex.lock()?;
        self.lock_held.set(true);
        if let Err(e) = self.conn.execute_batch("BEGIN IMMEDIATE") {
            self.lock_held.set(false);
            let _ = self.mutex.unlock();
            return Err(DbError::transaction(format!("cannot begin: {e}")));
        }
        self.in_transaction.set(true);
        Ok(())
    }

    /// Commits the active transaction.
    ///
    /// Runs the schema's `prepare_commit` hook inside the transaction, then
    /// the SQL commit, then `on_committed_pre_unlock` while the write lock
    /// is still held, releases the lock, and finally runs
    /// `on_committed_post_unlock` and announces the cross-process change
    /// signal. A failing hook or SQL commit leaves the transaction open so
    /// the caller can roll back.
    pub fn commit_transaction(&self) -> DbResult<()> {
        if !self.in_transaction.get() {
            return Err(DbError::transaction("no transaction in progress"));
        }
        if !self.lock_held.get() {
            return Err(DbError::TransactionLock);
        }

        self.hooks.prepare_commit(&self.conn)?;
        self.conn
            .execute_batch("COMMIT")
            .map_err(|e| DbError::transaction(format!("cannot commit: {e}")))?;
        self.in_transaction.set(false);

        self.hooks.on_committed_pre_unlock();
        self.mutex.unlock()?;
        self.lock_held.set(false);
        self.hooks.on_committed_post_unlock();

        if let Err(e) = self.signal.announce() {
            warn!(path = %self.path.display(), error = %e, "change signal not announced");
        }
        Ok(())
    }

    /// Rolls back the active transaction.
    ///
    /// The SQL rollback is issued regardless of lock state and pending
    /// side-effect lists are discarded through `on_rolled_back`. Fails with
    /// [`DbError::TransactionLock`] if no write lock was held.
    pub fn rollback_transaction(&self) -> DbResult<()> {
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            warn!(path = %self.path.display(), error = %e, "rollback statement failed");
        }
        self.in_transaction.set(false);
        self.hooks.on_rolled_back();

        if self.lock_held.get() {
            self.mutex.unlock()?;
            self.lock_held.set(false);
            Ok(())
        } else {
            Err(DbError::TransactionLock)
        }
    }

    /// Fetches at most one row, mapped by `map`.
    pub fn fetch<T, P, F>(&self, sql: &str, params: P, map: F) -> DbResult<Option<T>>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| DbError::prepare_query(format!("{sql}: {e}")))?;
        let mut rows = stmt
            .query(params)
            .map_err(|e| DbError::query(e.to_string()))?;
        match rows.next().map_err(|e| DbError::query(e.to_string()))? {
            Some(row) => Ok(Some(map(row).map_err(|e| DbError::query(e.to_string()))?)),
            None => Ok(None),
        }
    }

    /// Fetches all matching rows, mapped by `map`.
    pub fn fetch_multiple<T, P, F>(&self, sql: &str, params: P, mut map: F) -> DbResult<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| DbError::prepare_query(format!("{sql}: {e}")))?;
        let mut rows = stmt
            .query(params)
            .map_err(|e| DbError::query(e.to_string()))?;
        let mut values = Vec::new();
        while let Some(row) = rows.next().map_err(|e| DbError::query(e.to_string()))? {
            values.push(map(row).map_err(|e| DbError::query(e.to_string()))?);
        }
        Ok(values)
    }

    /// Executes an INSERT or UPDATE, returning the number of affected rows.
    ///
    /// Opens an implicit transaction if the caller has none, committing on
    /// success and rolling back on failure.
    pub fn store<P: Params>(&self, sql: &str, params: P) -> DbResult<usize> {
        self.mutate(sql, params)
    }

    /// Executes a DELETE, returning the number of affected rows.
    ///
    /// Same implicit-transaction behavior as [`store`](Self::store).
    pub fn delete_value<P: Params>(&self, sql: &str, params: P) -> DbResult<usize> {
        self.mutate(sql, params)
    }

    fn mutate<P: Params>(&self, sql: &str, params: P) -> DbResult<usize> {
        let implicit = !self.in_transaction.get();
        if implicit {
            self.begin_transaction()?;
        }
        match self.execute(sql, params) {
            Ok(affected) => {
                if implicit {
                    if let Err(e) = self.commit_transaction() {
                        let _ = self.rollback_transaction();
                        return Err(e);
                    }
                }
                Ok(affected)
            }
            Err(e) => {
                if implicit {
                    let _ = self.rollback_transaction();
                }
                Err(e)
            }
        }
    }

    fn execute<P: Params>(&self, sql: &str, params: P) -> DbResult<usize> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| DbError::prepare_query(format!("{sql}: {e}")))?;
        stmt.execute(params).map_err(|e| DbError::query(e.to_string()))
    }
}

impl<H: SchemaHooks> std::fmt::Debug for Database<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("schema", &self.schema.name)
            .field("path", &self.path)
            .field("in_transaction", &self.in_transaction.get())
            .finish_non_exhaustive()
    }
}

/// Applies connection pragmas per the configuration.
fn configure(conn: &Connection, config: &DbConfig) -> DbResult<()> {
    let mut pragmas = String::new();
    if config.wal {
        pragmas.push_str("PRAGMA journal_mode = WAL;\n");
    }
    pragmas.push_str("PRAGMA synchronous = NORMAL;\n");
    pragmas.push_str("PRAGMA temp_store = MEMORY;\n");
    if config.foreign_keys {
        pragmas.push_str("PRAGMA foreign_keys = ON;\n");
    }
    pragmas.push_str(&format!(
        "PRAGMA busy_timeout = {};\n",
        config.busy_timeout.as_millis()
    ));
    conn.execute_batch(&pragmas)
        .map_err(|e| DbError::configuration(e.to_string()))
}

/// Creates the full schema in a fresh file and stamps the current version.
fn initialize_new(conn: &Connection, schema: &SchemaDef, config: &DbConfig) -> DbResult<()> {
    configure(conn, config)?;
    for statement in schema.create_statements {
        conn.execute_batch(statement)
            .map_err(|e| DbError::create(format!("{}: {e}", schema.name)))?;
    }
    write_user_version(conn, schema.version)
}

/// Authority-side handling of an existing file: integrity check + upgrades.
fn upgrade_existing(conn: &Connection, schema: &SchemaDef) -> DbResult<()> {
    let verdict: String = conn
        .query_row("PRAGMA integrity_check", [], |row| row.get(0))
        .map_err(|e| DbError::integrity_check(e.to_string()))?;
    if verdict != "ok" {
        return Err(DbError::integrity_check(verdict));
    }

    let current = read_user_version(conn)?;
    if current != schema.version {
        info!(
            schema = schema.name,
            from = current,
            to = schema.version,
            "upgrading database schema"
        );
        schema.apply_upgrades(conn, current)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::NoHooks;
    use crate::migration::UpgradeStep;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    const CREATE: &[&str] = &[
        "CREATE TABLE IF NOT EXISTS notes (
            id INTEGER NOT NULL,
            body TEXT NOT NULL DEFAULT '',
            starred INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (id)
        )",
    ];

    static STEPS: &[UpgradeStep] = &[UpgradeStep {
        to_version: 2,
        statements: &["ALTER TABLE notes ADD COLUMN starred INTEGER NOT NULL DEFAULT 0"],
        backfill: None,
    }];

    static SCHEMA: SchemaDef = SchemaDef {
        name: "notes",
        version: 2,
        create_statements: CREATE,
        upgrades: STEPS,
    };

    fn open(path: &Path) -> Database<NoHooks> {
        Database::open(path, &SCHEMA, NoHooks, DbConfig::default()).unwrap()
    }

    #[test]
    fn creates_fresh_database_at_current_version() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("notes.db");

        let db = open(&path);
        assert!(path.exists());
        assert_eq!(db.stored_version().unwrap(), 2);
        assert!(db.is_initial_process());
    }

    #[test]
    fn missing_file_without_create_flag_fails() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("absent.db");
        let config = DbConfig::default().create_if_missing(false);

        let result = Database::open(&path, &SCHEMA, NoHooks, config);
        assert!(matches!(result, Err(DbError::Open { .. })));
        assert!(!path.exists());
    }

    #[test]
    fn store_and_fetch_round_trip() {
        let temp = tempdir().unwrap();
        let db = open(&temp.path().join("notes.db"));

        db.store(
            "INSERT INTO notes (id, body) VALUES (?1, ?2)",
            rusqlite::params![1i64, "hello"],
        )
        .unwrap();

        let body = db
            .fetch(
                "SELECT body FROM notes WHERE id = ?1",
                rusqlite::params![1i64],
                |row| row.get::<_, String>(0),
            )
            .unwrap();
        assert_eq!(body.as_deref(), Some("hello"));
    }

    #[test]
    fn fetch_multiple_maps_every_row() {
        let temp = tempdir().unwrap();
        let db = open(&temp.path().join("notes.db"));

        for i in 0..5i64 {
            db.store(
                "INSERT INTO notes (id, body) VALUES (?1, ?2)",
                rusqlite::params![i, format!("note {i}")],
            )
            .unwrap();
        }

        let bodies = db
            .fetch_multiple("SELECT body FROM notes ORDER BY id", [], |row| {
                row.get::<_, String>(0)
            })
            .unwrap();
        assert_eq!(bodies.len(), 5);
        assert_eq!(bodies[3], "note 3");
    }

    #[test]
    fn nested_begin_is_rejected() {
        let temp = tempdir().unwrap();
        let db = open(&temp.path().join("notes.db"));

        db.begin_transaction().unwrap();
        assert!(matches!(
            db.begin_transaction(),
            Err(DbError::Transaction { .. })
        ));
        db.rollback_transaction().unwrap();
    }

    #[test]
    fn rollback_without_lock_is_an_error() {
        let temp = tempdir().unwrap();
        let db = open(&temp.path().join("notes.db"));
        assert!(matches!(
            db.rollback_transaction(),
            Err(DbError::TransactionLock)
        ));
    }

    #[test]
    fn rollback_discards_writes() {
        let temp = tempdir().unwrap();
        let db = open(&temp.path().join("notes.db"));

        db.begin_transaction().unwrap();
        db.store(
            "INSERT INTO notes (id, body) VALUES (?1, ?2)",
            rusqlite::params![1i64, "doomed"],
        )
        .unwrap();
        db.rollback_transaction().unwrap();

        let found = db
            .fetch("SELECT body FROM notes WHERE id = 1", [], |row| {
                row.get::<_, String>(0)
            })
            .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn implicit_transaction_rolls_back_failed_mutation() {
        let temp = tempdir().unwrap();
        let db = open(&temp.path().join("notes.db"));

        let result = db.store("INSERT INTO nonexistent (id) VALUES (1)", []);
        assert!(result.is_err());
        assert!(!db.in_transaction());

        // The handle is still usable afterwards.
        db.store(
            "INSERT INTO notes (id, body) VALUES (1, 'ok')",
            [],
        )
        .unwrap();
    }

    #[test]
    fn upgrade_applies_pending_steps_on_reopen() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("notes.db");

        // Stamp a version-1 file without the starred column.
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE notes (
                    id INTEGER NOT NULL,
                    body TEXT NOT NULL DEFAULT '',
                    PRIMARY KEY (id)
                );
                INSERT INTO notes (id, body) VALUES (1, 'old');
                PRAGMA user_version = 1;",
            )
            .unwrap();
        }

        let db = open(&path);
        assert_eq!(db.stored_version().unwrap(), 2);

        // Old rows got the new column's default.
        let starred = db
            .fetch("SELECT starred FROM notes WHERE id = 1", [], |row| {
                row.get::<_, i64>(0)
            })
            .unwrap();
        assert_eq!(starred, Some(0));
    }

    #[test]
    fn non_authority_process_rejects_version_mismatch() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("notes.db");

        // Keep the authority handle alive so the second open is not initial.
        let authority = open(&path);
        assert!(authority.is_initial_process());

        // Regress the stored version behind the authority's back.
        authority
            .conn
            .execute_batch("PRAGMA user_version = 1")
            .unwrap();

        let result = Database::open(&path, &SCHEMA, NoHooks, DbConfig::default());
        assert!(matches!(
            result,
            Err(DbError::VersionMismatch {
                found: 1,
                expected: 2
            })
        ));
    }

    #[test]
    fn failed_creation_removes_partial_file() {
        static BAD_CREATE: &[&str] = &["CREATE TABLE broken ("];
        static BAD: SchemaDef = SchemaDef {
            name: "bad",
            version: 1,
            create_statements: BAD_CREATE,
            upgrades: &[],
        };

        let temp = tempdir().unwrap();
        let path = temp.path().join("bad.db");

        let result = Database::open(&path, &BAD, NoHooks, DbConfig::default());
        assert!(matches!(result, Err(DbError::Create { .. })));
        assert!(!path.exists());
    }

    #[test]
    fn concurrent_transactions_are_serialized() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("notes.db");

        let a = open(&path);
        let b = open(&path);

        a.begin_transaction().unwrap();
        a.store(
            "INSERT INTO notes (id, body) VALUES (1, 'from a')",
            [],
        )
        .unwrap();

        let (tx, rx) = mpsc::channel();
        let writer = thread::spawn(move || {
            b.begin_transaction().unwrap();
            b.store(
                "INSERT INTO notes (id, body) VALUES (2, 'from b')",
                [],
            )
            .unwrap();
            b.commit_transaction().unwrap();
            tx.send(()).unwrap();
        });

        // B must be blocked on the write lock while A's transaction is open.
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());

        a.commit_transaction().unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        writer.join().unwrap();

        let count = a
            .fetch("SELECT COUNT(*) FROM notes", [], |row| row.get::<_, i64>(0))
            .unwrap();
        assert_eq!(count, Some(2));
    }

    /// Hooks that record the order of lifecycle callbacks.
    struct RecordingHooks {
        calls: Rc<RefCell<Vec<&'static str>>>,
        fail_prepare: bool,
    }

    impl SchemaHooks for RecordingHooks {
        fn prepare_commit(&self, _conn: &Connection) -> DbResult<()> {
            self.calls.borrow_mut().push("prepare");
            if self.fail_prepare {
                return Err(DbError::query("prepare refused"));
            }
            Ok(())
        }

        fn on_committed_pre_unlock(&self) {
            self.calls.borrow_mut().push("pre_unlock");
        }

        fn on_committed_post_unlock(&self) {
            self.calls.borrow_mut().push("post_unlock");
        }

        fn on_rolled_back(&self) {
            self.calls.borrow_mut().push("rolled_back");
        }
    }

    #[test]
    fn commit_invokes_hooks_in_order() {
        let temp = tempdir().unwrap();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let hooks = RecordingHooks {
            calls: Rc::clone(&calls),
            fail_prepare: false,
        };
        let db = Database::open(
            &temp.path().join("notes.db"),
            &SCHEMA,
            hooks,
            DbConfig::default(),
        )
        .unwrap();

        db.begin_transaction().unwrap();
        db.commit_transaction().unwrap();

        assert_eq!(*calls.borrow(), vec!["prepare", "pre_unlock", "post_unlock"]);
    }

    #[test]
    fn failing_prepare_hook_leaves_transaction_open_for_rollback() {
        let temp = tempdir().unwrap();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let hooks = RecordingHooks {
            calls: Rc::clone(&calls),
            fail_prepare: true,
        };
        let db = Database::open(
            &temp.path().join("notes.db"),
            &SCHEMA,
            hooks,
            DbConfig::default(),
        )
        .unwrap();

        db.begin_transaction().unwrap();
        assert!(db.commit_transaction().is_err());
        assert!(db.in_transaction());

        db.rollback_transaction().unwrap();
        assert_eq!(*calls.borrow(), vec!["prepare", "rolled_back"]);
    }
}
