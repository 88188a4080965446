//! The posts/events cache: notification events with tombstones.
//!
//! Deletion is two-phase: the UI flags an event (`deleted_locally`), the row
//! survives as a tombstone, and only after the server acknowledges (by no
//! longer listing the event) does the delta engine hard-delete the row. A
//! hard delete schedules the event's image artifact for removal, flushed on
//! commit like every other stale file.

use crate::error::{CacheError, CacheResult};
use crate::feed::{CacheChange, CacheFeed};
use crate::model::{Event, EventFilter, EventKey, StoreOutcome};
use cumulus_db::rusqlite::{self, types::Value, Row};
use cumulus_db::{Database, DbConfig, SchemaDef, SchemaHooks, UpgradeStep};
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Current events schema version.
pub const EVENTS_SCHEMA_VERSION: u32 = 2;

const CREATE_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS events (
        account_id INTEGER NOT NULL,
        event_id TEXT NOT NULL,
        event_subject TEXT NOT NULL DEFAULT '',
        event_text TEXT NOT NULL DEFAULT '',
        event_url TEXT NOT NULL DEFAULT '',
        image_url TEXT NOT NULL DEFAULT '',
        image_path TEXT NOT NULL DEFAULT '',
        timestamp INTEGER NOT NULL DEFAULT 0,
        deleted_locally INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (account_id, event_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_events_account ON events (account_id)",
];

static UPGRADES: &[UpgradeStep] = &[UpgradeStep {
    to_version: 2,
    statements: &[
        "ALTER TABLE events ADD COLUMN deleted_locally INTEGER NOT NULL DEFAULT 0",
        "CREATE INDEX IF NOT EXISTS idx_events_account ON events (account_id)",
    ],
    backfill: None,
}];

/// Schema definition for the posts/events cache database.
pub static EVENTS_SCHEMA: SchemaDef = SchemaDef {
    name: "posts",
    version: EVENTS_SCHEMA_VERSION,
    create_statements: CREATE_STATEMENTS,
    upgrades: UPGRADES,
};

const EVENT_COLUMNS: &str = "account_id, event_id, event_subject, event_text, event_url, \
     image_url, image_path, timestamp, deleted_locally";

fn map_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        account_id: row.get(0)?,
        event_id: row.get(1)?,
        event_subject: row.get(2)?,
        event_text: row.get(3)?,
        event_url: row.get(4)?,
        image_url: row.get(5)?,
        image_path: row.get(6)?,
        timestamp: row.get(7)?,
        deleted_locally: row.get(8)?,
    })
}

#[derive(Default)]
struct PendingLists {
    doomed_files: Vec<PathBuf>,
    stored_events: Vec<Event>,
    deleted_events: Vec<EventKey>,
}

#[derive(Default)]
struct FlushLists {
    files: Vec<PathBuf>,
    changes: Vec<CacheChange>,
}

/// Commit-time behavior of the events schema.
#[derive(Default)]
pub struct EventsHooks {
    pending: RefCell<PendingLists>,
    flush: RefCell<FlushLists>,
    feed: CacheFeed,
}

impl EventsHooks {
    /// The feed carrying aggregate stored/deleted events for this cache.
    pub fn feed(&self) -> &CacheFeed {
        &self.feed
    }

    fn schedule_file_delete(&self, path: &str) {
        if !path.is_empty() {
            self.pending
                .borrow_mut()
                .doomed_files
                .push(PathBuf::from(path));
        }
    }
}

impl SchemaHooks for EventsHooks {
    fn on_committed_pre_unlock(&self) {
        let mut pending = self.pending.borrow_mut();
        let mut flush = self.flush.borrow_mut();
        flush.files.append(&mut pending.doomed_files);
        if !pending.stored_events.is_empty() {
            flush.changes.push(CacheChange::EventsStored(std::mem::take(
                &mut pending.stored_events,
            )));
        }
        if !pending.deleted_events.is_empty() {
            flush.changes.push(CacheChange::EventsDeleted(std::mem::take(
                &mut pending.deleted_events,
            )));
        }
    }

    fn on_committed_post_unlock(&self) {
        let FlushLists { files, changes } = std::mem::take(&mut *self.flush.borrow_mut());
        for file in files {
            if !file.exists() {
                continue;
            }
            match fs::remove_file(&file) {
                Ok(()) => debug!(path = %file.display(), "removed stale artifact"),
                Err(e) => warn!(path = %file.display(), error = %e, "stale artifact not removed"),
            }
        }
        for change in changes {
            self.feed.emit(change);
        }
    }

    fn on_rolled_back(&self) {
        *self.pending.borrow_mut() = PendingLists::default();
    }
}

/// The posts/events cache database.
pub struct EventDatabase {
    db: Database<EventsHooks>,
}

impl EventDatabase {
    /// Opens or creates the events database at `path`.
    pub fn open(path: &Path, config: DbConfig) -> CacheResult<Self> {
        let db = Database::open(path, &EVENTS_SCHEMA, EventsHooks::default(), config)?;
        Ok(Self { db })
    }

    /// The feed carrying aggregate stored/deleted events for this cache.
    pub fn feed(&self) -> &CacheFeed {
        self.db.hooks().feed()
    }

    /// Begins an explicit transaction (blocks on the cross-process lock).
    pub fn begin_transaction(&self) -> CacheResult<()> {
        Ok(self.db.begin_transaction()?)
    }

    /// Commits the explicit transaction.
    pub fn commit_transaction(&self) -> CacheResult<()> {
        Ok(self.db.commit_transaction()?)
    }

    /// Rolls back the explicit transaction.
    pub fn rollback_transaction(&self) -> CacheResult<()> {
        Ok(self.db.rollback_transaction()?)
    }

    fn with_transaction<T>(&self, f: impl FnOnce() -> CacheResult<T>) -> CacheResult<T> {
        if self.db.in_transaction() {
            return f();
        }
        self.db.begin_transaction()?;
        match f() {
            Ok(value) => {
                if let Err(e) = self.db.commit_transaction() {
                    let _ = self.db.rollback_transaction();
                    return Err(e.into());
                }
                Ok(value)
            }
            Err(e) => {
                let _ = self.db.rollback_transaction();
                Err(e)
            }
        }
    }

    /// Fetches events matching the filter, newest first.
    pub fn events(&self, filter: &EventFilter) -> CacheResult<Vec<Event>> {
        let mut clauses = Vec::new();
        let mut params: Vec<Value> = Vec::new();
        if let Some(account_id) = filter.account_id {
            clauses.push("account_id = ?");
            params.push(Value::Integer(account_id));
        }
        if !filter.include_tombstones {
            clauses.push("deleted_locally = 0");
        }
        let mut sql = format!("SELECT {EVENT_COLUMNS} FROM events");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY timestamp DESC, event_id");
        Ok(self
            .db
            .fetch_multiple(&sql, rusqlite::params_from_iter(params), map_event)?)
    }

    /// Fetches one event by key.
    pub fn event(&self, key: &EventKey) -> CacheResult<Option<Event>> {
        key.validate()?;
        Ok(self.db.fetch(
            &format!(
                "SELECT {EVENT_COLUMNS} FROM events WHERE account_id = ?1 AND event_id = ?2"
            ),
            rusqlite::params![key.account_id, key.event_id],
            map_event,
        )?)
    }

    /// Inserts or updates an event row.
    ///
    /// A replaced `image_path` schedules the old artifact for deletion,
    /// flushed after commit like every other stale file.
    pub fn store_event(&self, event: &Event) -> CacheResult<StoreOutcome> {
        event.key().validate()?;
        self.with_transaction(|| {
            let hooks = self.db.hooks();
            let outcome = match self.event(&event.key())? {
                None => {
                    self.db.store(
                        &format!(
                            "INSERT INTO events ({EVENT_COLUMNS})
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                        ),
                        rusqlite::params![
                            event.account_id,
                            event.event_id,
                            event.event_subject,
                            event.event_text,
                            event.event_url,
                            event.image_url,
                            event.image_path,
                            event.timestamp,
                            event.deleted_locally
                        ],
                    )?;
                    StoreOutcome::Inserted
                }
                Some(old) if old == *event => return Ok(StoreOutcome::Unchanged),
                Some(old) => {
                    if old.image_path != event.image_path {
                        hooks.schedule_file_delete(&old.image_path);
                    }
                    self.db.store(
                        "UPDATE events SET event_subject = ?3, event_text = ?4, event_url = ?5,
                             image_url = ?6, image_path = ?7, timestamp = ?8,
                             deleted_locally = ?9
                         WHERE account_id = ?1 AND event_id = ?2",
                        rusqlite::params![
                            event.account_id,
                            event.event_id,
                            event.event_subject,
                            event.event_text,
                            event.event_url,
                            event.image_url,
                            event.image_path,
                            event.timestamp,
                            event.deleted_locally
                        ],
                    )?;
                    StoreOutcome::Updated
                }
            };
            hooks.pending.borrow_mut().stored_events.push(event.clone());
            Ok(outcome)
        })
    }

    /// Hard-deletes an event, scheduling its image artifact for removal.
    ///
    /// Returns `false` when no such row existed.
    pub fn delete_event(&self, key: &EventKey) -> CacheResult<bool> {
        key.validate()?;
        self.with_transaction(|| {
            let Some(event) = self.event(key)? else {
                return Ok(false);
            };
            let hooks = self.db.hooks();
            hooks.schedule_file_delete(&event.image_path);
            self.db.delete_value(
                "DELETE FROM events WHERE account_id = ?1 AND event_id = ?2",
                rusqlite::params![key.account_id, key.event_id],
            )?;
            hooks.pending.borrow_mut().deleted_events.push(key.clone());
            Ok(true)
        })
    }

    /// Marks an event as deleted locally (a tombstone, not a hard delete).
    ///
    /// The row survives until the remote side no longer lists the event.
    pub fn flag_event_for_deletion(&self, key: &EventKey) -> CacheResult<bool> {
        key.validate()?;
        self.with_transaction(|| {
            let Some(mut event) = self.event(key)? else {
                return Ok(false);
            };
            if event.deleted_locally {
                return Ok(true);
            }
            self.db.store(
                "UPDATE events SET deleted_locally = 1
                 WHERE account_id = ?1 AND event_id = ?2",
                rusqlite::params![key.account_id, key.event_id],
            )?;
            event.deleted_locally = true;
            self.db.hooks().pending.borrow_mut().stored_events.push(event);
            Ok(true)
        })
    }

    /// Persists a freshly downloaded event image path.
    pub fn set_event_image_path(&self, key: &EventKey, path: &str) -> CacheResult<()> {
        key.validate()?;
        self.with_transaction(|| {
            let Some(old) = self.event(key)? else {
                return Err(CacheError::invalid_argument("event does not exist"));
            };
            if old.image_path != path {
                self.db.hooks().schedule_file_delete(&old.image_path);
            }
            self.db.store(
                "UPDATE events SET image_path = ?3 WHERE account_id = ?1 AND event_id = ?2",
                rusqlite::params![key.account_id, key.event_id, path],
            )?;
            let mut updated = old;
            updated.image_path = path.to_string();
            self.db.hooks().pending.borrow_mut().stored_events.push(updated);
            Ok(())
        })
    }

    /// Removes every event belonging to `account_id`, scheduling all of the
    /// account's image artifacts for deletion, in one transaction.
    pub fn purge_account(&self, account_id: i64) -> CacheResult<()> {
        if account_id == 0 {
            return Err(CacheError::invalid_argument("account id is required"));
        }
        self.with_transaction(|| {
            let events = self.events(&EventFilter {
                account_id: Some(account_id),
                include_tombstones: true,
            })?;
            for event in &events {
                self.delete_event(&event.key())?;
            }
            Ok(())
        })
    }
}

impl std::fmt::Debug for EventDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDatabase")
            .field("path", &self.db.path())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_db(dir: &tempfile::TempDir) -> EventDatabase {
        EventDatabase::open(&dir.path().join("posts.db"), DbConfig::default()).unwrap()
    }

    fn sample_event(account_id: i64, event_id: &str) -> Event {
        Event {
            account_id,
            event_id: event_id.into(),
            event_subject: format!("Subject {event_id}"),
            event_text: "Body".into(),
            timestamp: 1_700_000_000,
            ..Event::default()
        }
    }

    #[test]
    fn event_store_fetch_round_trip() {
        let temp = tempdir().unwrap();
        let db = open_db(&temp);

        let event = sample_event(7, "e1");
        assert_eq!(db.store_event(&event).unwrap(), StoreOutcome::Inserted);
        assert_eq!(db.event(&event.key()).unwrap().unwrap(), event);
        assert_eq!(db.store_event(&event).unwrap(), StoreOutcome::Unchanged);
    }

    #[test]
    fn tombstone_flagging_is_not_a_hard_delete() {
        let temp = tempdir().unwrap();
        let db = open_db(&temp);

        let event = sample_event(7, "e1");
        db.store_event(&event).unwrap();
        assert!(db.flag_event_for_deletion(&event.key()).unwrap());

        let stored = db.event(&event.key()).unwrap().unwrap();
        assert!(stored.deleted_locally);

        // Tombstones are excluded only when the filter says so.
        let visible = db
            .events(&EventFilter {
                account_id: Some(7),
                include_tombstones: false,
            })
            .unwrap();
        assert!(visible.is_empty());
        let all = db.events(&EventFilter::default()).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn hard_delete_flushes_the_image_artifact_after_commit() {
        let temp = tempdir().unwrap();
        let db = open_db(&temp);

        let artifact = temp.path().join("event-img");
        std::fs::write(&artifact, b"bytes").unwrap();

        let mut event = sample_event(7, "e1");
        event.image_path = artifact.to_string_lossy().into_owned();
        db.store_event(&event).unwrap();

        db.begin_transaction().unwrap();
        db.delete_event(&event.key()).unwrap();
        db.rollback_transaction().unwrap();
        assert!(artifact.exists());

        assert!(db.delete_event(&event.key()).unwrap());
        assert!(!artifact.exists());
        assert!(db.event(&event.key()).unwrap().is_none());
    }

    #[test]
    fn changed_image_url_schedules_the_old_artifact() {
        let temp = tempdir().unwrap();
        let db = open_db(&temp);

        let artifact = temp.path().join("old-img");
        std::fs::write(&artifact, b"old").unwrap();

        let mut event = sample_event(7, "e1");
        event.image_url = "https://cloud/img-v1".into();
        event.image_path = artifact.to_string_lossy().into_owned();
        db.store_event(&event).unwrap();

        let mut updated = event.clone();
        updated.image_url = "https://cloud/img-v2".into();
        updated.image_path = String::new();
        assert_eq!(db.store_event(&updated).unwrap(), StoreOutcome::Updated);
        assert!(!artifact.exists());
    }

    #[test]
    fn purge_account_only_touches_that_account() {
        let temp = tempdir().unwrap();
        let db = open_db(&temp);

        db.store_event(&sample_event(7, "e1")).unwrap();
        db.store_event(&sample_event(7, "e2")).unwrap();
        db.store_event(&sample_event(9, "e3")).unwrap();

        db.purge_account(7).unwrap();

        assert!(db
            .events(&EventFilter {
                account_id: Some(7),
                include_tombstones: true,
            })
            .unwrap()
            .is_empty());
        assert_eq!(db.events(&EventFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn opening_a_version_one_file_gains_the_tombstone_column() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("posts.db");

        {
            let conn = rusqlite::Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE events (
                    account_id INTEGER NOT NULL,
                    event_id TEXT NOT NULL,
                    event_subject TEXT NOT NULL DEFAULT '',
                    event_text TEXT NOT NULL DEFAULT '',
                    event_url TEXT NOT NULL DEFAULT '',
                    image_url TEXT NOT NULL DEFAULT '',
                    image_path TEXT NOT NULL DEFAULT '',
                    timestamp INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (account_id, event_id)
                );
                INSERT INTO events (account_id, event_id) VALUES (7, 'old');
                PRAGMA user_version = 1;",
            )
            .unwrap();
        }

        let db = open_db(&temp);
        let event = db.event(&EventKey::new(7, "old")).unwrap().unwrap();
        assert!(!event.deleted_locally);
    }
}
