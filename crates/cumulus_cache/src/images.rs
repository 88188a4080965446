//! The images cache: users, albums and photos.
//!
//! Concrete schema over the generic database core. Besides typed CRUD this
//! module owns the three behaviors with real invariants:
//!
//! - **Application-level cascades**: deleting a user deletes its albums,
//!   which delete their photos, explicitly and before the parent row's
//!   DELETE statement runs.
//! - **Stale-artifact scheduling**: whenever a local `thumbnail_path` /
//!   `image_path` is replaced or its row removed, the old file is queued for
//!   deletion. The queue flushes only after the transaction commits and is
//!   discarded on rollback.
//! - **Album thumbnail repair**: albums not pinned to their own
//!   `thumbnail_url` re-derive their thumbnail from their photos in the
//!   `prepare_commit` hook whenever any photo in the album changed.

use crate::error::CacheResult;
use crate::feed::{CacheChange, CacheFeed};
use crate::model::{
    Album, AlbumFilter, AlbumKey, Photo, PhotoFilter, PhotoKey, StoreOutcome, User, UserFilter,
    UserKey,
};
use cumulus_db::rusqlite::{self, types::Value, Connection, OptionalExtension, Row};
use cumulus_db::{Database, DbConfig, DbError, DbResult, SchemaDef, SchemaHooks, UpgradeStep};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Current images schema version.
pub const IMAGES_SCHEMA_VERSION: u32 = 3;

const CREATE_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        account_id INTEGER NOT NULL,
        user_id TEXT NOT NULL,
        display_name TEXT NOT NULL DEFAULT '',
        thumbnail_url TEXT NOT NULL DEFAULT '',
        thumbnail_path TEXT NOT NULL DEFAULT '',
        thumbnail_file_name TEXT NOT NULL DEFAULT '',
        PRIMARY KEY (account_id, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS albums (
        account_id INTEGER NOT NULL,
        user_id TEXT NOT NULL,
        album_id TEXT NOT NULL,
        parent_album_id TEXT NOT NULL DEFAULT '',
        album_name TEXT NOT NULL DEFAULT '',
        photo_count INTEGER NOT NULL DEFAULT 0,
        thumbnail_url TEXT NOT NULL DEFAULT '',
        thumbnail_path TEXT NOT NULL DEFAULT '',
        thumbnail_file_name TEXT NOT NULL DEFAULT '',
        etag TEXT NOT NULL DEFAULT '',
        PRIMARY KEY (account_id, user_id, album_id),
        FOREIGN KEY (account_id, user_id)
            REFERENCES users (account_id, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS photos (
        account_id INTEGER NOT NULL,
        user_id TEXT NOT NULL,
        album_id TEXT NOT NULL,
        photo_id TEXT NOT NULL,
        file_name TEXT NOT NULL DEFAULT '',
        album_path TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        created_timestamp INTEGER NOT NULL DEFAULT 0,
        updated_timestamp INTEGER NOT NULL DEFAULT 0,
        thumbnail_url TEXT NOT NULL DEFAULT '',
        thumbnail_path TEXT NOT NULL DEFAULT '',
        image_url TEXT NOT NULL DEFAULT '',
        image_path TEXT NOT NULL DEFAULT '',
        width INTEGER NOT NULL DEFAULT 0,
        height INTEGER NOT NULL DEFAULT 0,
        file_size INTEGER NOT NULL DEFAULT 0,
        file_type TEXT NOT NULL DEFAULT '',
        etag TEXT NOT NULL DEFAULT '',
        PRIMARY KEY (account_id, user_id, album_id, photo_id),
        FOREIGN KEY (account_id, user_id, album_id)
            REFERENCES albums (account_id, user_id, album_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_albums_account_user
        ON albums (account_id, user_id)",
    "CREATE INDEX IF NOT EXISTS idx_photos_account_user
        ON photos (account_id, user_id)",
];

/// Rows written before the column existed get a type derived from the name.
fn backfill_photo_file_types(conn: &Connection) -> DbResult<()> {
    let mut stmt = conn
        .prepare("SELECT rowid, file_name FROM photos WHERE file_type = '' AND file_name != ''")
        .map_err(|e| DbError::query(e.to_string()))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(|e| DbError::query(e.to_string()))?;

    let mut pending = Vec::new();
    for row in rows {
        let (rowid, file_name) = row.map_err(|e| DbError::query(e.to_string()))?;
        if let Some((_, suffix)) = file_name.rsplit_once('.') {
            pending.push((rowid, suffix.to_ascii_lowercase()));
        }
    }
    for (rowid, file_type) in pending {
        conn.execute(
            "UPDATE photos SET file_type = ?1 WHERE rowid = ?2",
            rusqlite::params![file_type, rowid],
        )
        .map_err(|e| DbError::query(e.to_string()))?;
    }
    Ok(())
}

static UPGRADES: &[UpgradeStep] = &[
    UpgradeStep {
        to_version: 2,
        statements: &[
            "ALTER TABLE photos ADD COLUMN file_size INTEGER NOT NULL DEFAULT 0",
            "ALTER TABLE photos ADD COLUMN file_type TEXT NOT NULL DEFAULT ''",
        ],
        backfill: Some(backfill_photo_file_types),
    },
    UpgradeStep {
        to_version: 3,
        statements: &[
            "ALTER TABLE albums ADD COLUMN etag TEXT NOT NULL DEFAULT ''",
            "ALTER TABLE photos ADD COLUMN etag TEXT NOT NULL DEFAULT ''",
            "CREATE INDEX IF NOT EXISTS idx_albums_account_user
                ON albums (account_id, user_id)",
            "CREATE INDEX IF NOT EXISTS idx_photos_account_user
                ON photos (account_id, user_id)",
        ],
        backfill: None,
    },
];

/// Schema definition for the images cache database.
pub static IMAGES_SCHEMA: SchemaDef = SchemaDef {
    name: "images",
    version: IMAGES_SCHEMA_VERSION,
    create_statements: CREATE_STATEMENTS,
    upgrades: UPGRADES,
};

const USER_COLUMNS: &str =
    "account_id, user_id, display_name, thumbnail_url, thumbnail_path, thumbnail_file_name";

const ALBUM_COLUMNS: &str = "account_id, user_id, album_id, parent_album_id, album_name, \
     photo_count, thumbnail_url, thumbnail_path, thumbnail_file_name, etag";

const PHOTO_COLUMNS: &str = "account_id, user_id, album_id, photo_id, file_name, album_path, \
     description, created_timestamp, updated_timestamp, thumbnail_url, thumbnail_path, \
     image_url, image_path, width, height, file_size, file_type, etag";

fn map_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        account_id: row.get(0)?,
        user_id: row.get(1)?,
        display_name: row.get(2)?,
        thumbnail_url: row.get(3)?,
        thumbnail_path: row.get(4)?,
        thumbnail_file_name: row.get(5)?,
    })
}

fn map_album(row: &Row<'_>) -> rusqlite::Result<Album> {
    Ok(Album {
        account_id: row.get(0)?,
        user_id: row.get(1)?,
        album_id: row.get(2)?,
        parent_album_id: row.get(3)?,
        album_name: row.get(4)?,
        photo_count: row.get(5)?,
        thumbnail_url: row.get(6)?,
        thumbnail_path: row.get(7)?,
        thumbnail_file_name: row.get(8)?,
        etag: row.get(9)?,
    })
}

fn map_photo(row: &Row<'_>) -> rusqlite::Result<Photo> {
    Ok(Photo {
        account_id: row.get(0)?,
        user_id: row.get(1)?,
        album_id: row.get(2)?,
        photo_id: row.get(3)?,
        file_name: row.get(4)?,
        album_path: row.get(5)?,
        description: row.get(6)?,
        created_timestamp: row.get(7)?,
        updated_timestamp: row.get(8)?,
        thumbnail_url: row.get(9)?,
        thumbnail_path: row.get(10)?,
        image_url: row.get(11)?,
        image_path: row.get(12)?,
        width: row.get(13)?,
        height: row.get(14)?,
        file_size: row.get(15)?,
        file_type: row.get(16)?,
        etag: row.get(17)?,
    })
}

#[derive(Default)]
struct PendingLists {
    doomed_files: Vec<PathBuf>,
    dirty_albums: BTreeSet<AlbumKey>,
    stored_users: Vec<User>,
    deleted_users: Vec<UserKey>,
    stored_albums: Vec<Album>,
    deleted_albums: Vec<AlbumKey>,
    stored_photos: Vec<Photo>,
    deleted_photos: Vec<PhotoKey>,
}

#[derive(Default)]
struct FlushLists {
    files: Vec<PathBuf>,
    changes: Vec<CacheChange>,
}

/// Commit-time behavior of the images schema.
///
/// Collects per-transaction side-effect lists (stale files, dirty albums,
/// aggregate change events) and plays them out around commit per the
/// [`SchemaHooks`] contract.
#[derive(Default)]
pub struct ImagesHooks {
    pending: RefCell<PendingLists>,
    flush: RefCell<FlushLists>,
    feed: CacheFeed,
}

impl ImagesHooks {
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

    fn mark_album_dirty(&self, key: AlbumKey) {
        self.pending.borrow_mut().dirty_albums.insert(key);
    }

    fn unmark_album_dirty(&self, key: &AlbumKey) {
        self.pending.borrow_mut().dirty_albums.remove(key);
    }
}

impl SchemaHooks for ImagesHooks {
    fn prepare_commit(&self, conn: &Connection) -> DbResult<()> {
        let dirty: Vec<AlbumKey> = {
            let mut pending = self.pending.borrow_mut();
            std::mem::take(&mut pending.dirty_albums).into_iter().collect()
        };
        for key in dirty {
            repair_album_thumbnail(conn, &key)?;
        }
        Ok(())
    }

    fn on_committed_pre_unlock(&self) {
        let mut pending = self.pending.borrow_mut();
        let mut flush = self.flush.borrow_mut();
        flush.files.append(&mut pending.doomed_files);

        let mut push = |change: CacheChange| flush.changes.push(change);
        if !pending.stored_users.is_empty() {
            push(CacheChange::UsersStored(std::mem::take(
                &mut pending.stored_users,
            )));
        }
        if !pending.stored_albums.is_empty() {
            push(CacheChange::AlbumsStored(std::mem::take(
                &mut pending.stored_albums,
            )));
        }
        if !pending.stored_photos.is_empty() {
            push(CacheChange::PhotosStored(std::mem::take(
                &mut pending.stored_photos,
            )));
        }
        if !pending.deleted_photos.is_empty() {
            push(CacheChange::PhotosDeleted(std::mem::take(
                &mut pending.deleted_photos,
            )));
        }
        if !pending.deleted_albums.is_empty() {
            push(CacheChange::AlbumsDeleted(std::mem::take(
                &mut pending.deleted_albums,
            )));
        }
        if !pending.deleted_users.is_empty() {
            push(CacheChange::UsersDeleted(std::mem::take(
                &mut pending.deleted_users,
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

/// Re-derives an album's thumbnail from its photos unless it is pinned.
fn repair_album_thumbnail(conn: &Connection, key: &AlbumKey) -> DbResult<()> {
    let pinned: Option<String> = conn
        .query_row(
            "SELECT thumbnail_url FROM albums
             WHERE account_id = ?1 AND user_id = ?2 AND album_id = ?3",
            rusqlite::params![key.account_id, key.user_id, key.album_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| DbError::query(e.to_string()))?;
    let Some(thumbnail_url) = pinned else {
        // The album itself was deleted in this transaction.
        return Ok(());
    };
    if !thumbnail_url.is_empty() {
        return Ok(());
    }

    let derived: Option<(String, String)> = conn
        .query_row(
            "SELECT thumbnail_path, file_name FROM photos
             WHERE account_id = ?1 AND user_id = ?2 AND album_id = ?3
             ORDER BY updated_timestamp DESC, photo_id ASC
             LIMIT 1",
            rusqlite::params![key.account_id, key.user_id, key.album_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| DbError::query(e.to_string()))?;

    let (thumbnail_path, file_name) = derived.unwrap_or_default();
    conn.execute(
        "UPDATE albums SET thumbnail_path = ?4, thumbnail_file_name = ?5
         WHERE account_id = ?1 AND user_id = ?2 AND album_id = ?3",
        rusqlite::params![
            key.account_id,
            key.user_id,
            key.album_id,
            thumbnail_path,
            file_name
        ],
    )
    .map_err(|e| DbError::query(e.to_string()))?;
    Ok(())
}

/// The images cache database.
pub struct ImageDatabase {
    db: Database<ImagesHooks>,
}

impl ImageDatabase {
    /// Opens or creates the images database at `path`.
    pub fn open(path: &Path, config: DbConfig) -> CacheResult<Self> {
        let db = Database::open(path, &IMAGES_SCHEMA, ImagesHooks::default(), config)?;
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

    /// Runs `f` inside the caller's transaction, or a fresh one when the
    /// caller has none (committed on success, rolled back on failure).
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

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Fetches users, optionally restricted to one account.
    pub fn users(&self, filter: &UserFilter) -> CacheResult<Vec<User>> {
        let mut sql = format!("SELECT {USER_COLUMNS} FROM users");
        let mut params: Vec<Value> = Vec::new();
        if let Some(account_id) = filter.account_id {
            sql.push_str(" WHERE account_id = ?");
            params.push(Value::Integer(account_id));
        }
        sql.push_str(" ORDER BY account_id, user_id");
        Ok(self
            .db
            .fetch_multiple(&sql, rusqlite::params_from_iter(params), map_user)?)
    }

    /// Fetches one user by key.
    pub fn user(&self, key: &UserKey) -> CacheResult<Option<User>> {
        key.validate()?;
        Ok(self.db.fetch(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE account_id = ?1 AND user_id = ?2"),
            rusqlite::params![key.account_id, key.user_id],
            map_user,
        )?)
    }

    /// Inserts or updates a user row.
    pub fn store_user(&self, user: &User) -> CacheResult<StoreOutcome> {
        user.key().validate()?;
        self.with_transaction(|| {
            let hooks = self.db.hooks();
            let outcome = match self.user(&user.key())? {
                None => {
                    self.db.store(
                        &format!(
                            "INSERT INTO users ({USER_COLUMNS})
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                        ),
                        rusqlite::params![
                            user.account_id,
                            user.user_id,
                            user.display_name,
                            user.thumbnail_url,
                            user.thumbnail_path,
                            user.thumbnail_file_name
                        ],
                    )?;
                    StoreOutcome::Inserted
                }
                Some(old) if old == *user => return Ok(StoreOutcome::Unchanged),
                Some(old) => {
                    if old.thumbnail_path != user.thumbnail_path {
                        hooks.schedule_file_delete(&old.thumbnail_path);
                    }
                    self.db.store(
                        "UPDATE users SET display_name = ?3, thumbnail_url = ?4,
                             thumbnail_path = ?5, thumbnail_file_name = ?6
                         WHERE account_id = ?1 AND user_id = ?2",
                        rusqlite::params![
                            user.account_id,
                            user.user_id,
                            user.display_name,
                            user.thumbnail_url,
                            user.thumbnail_path,
                            user.thumbnail_file_name
                        ],
                    )?;
                    StoreOutcome::Updated
                }
            };
            hooks.pending.borrow_mut().stored_users.push(user.clone());
            Ok(outcome)
        })
    }

    /// Deletes a user and, first, all of its albums and photos.
    ///
    /// Returns `false` when no such row existed.
    pub fn delete_user(&self, key: &UserKey) -> CacheResult<bool> {
        key.validate()?;
        self.with_transaction(|| {
            let Some(user) = self.user(key)? else {
                return Ok(false);
            };
            let albums = self.albums(&AlbumFilter {
                account_id: Some(key.account_id),
                user_id: Some(key.user_id.clone()),
            })?;
            for album in &albums {
                self.delete_album(&album.key())?;
            }

            let hooks = self.db.hooks();
            hooks.schedule_file_delete(&user.thumbnail_path);
            self.db.delete_value(
                "DELETE FROM users WHERE account_id = ?1 AND user_id = ?2",
                rusqlite::params![key.account_id, key.user_id],
            )?;
            hooks.pending.borrow_mut().deleted_users.push(key.clone());
            Ok(true)
        })
    }

    /// Persists a freshly downloaded avatar path.
    pub fn set_user_thumbnail(&self, key: &UserKey, path: &str) -> CacheResult<()> {
        key.validate()?;
        self.with_transaction(|| {
            let Some(old) = self.user(key)? else {
                return Err(crate::error::CacheError::invalid_argument(
                    "user does not exist",
                ));
            };
            if old.thumbnail_path != path {
                self.db.hooks().schedule_file_delete(&old.thumbnail_path);
            }
            self.db.store(
                "UPDATE users SET thumbnail_path = ?3
                 WHERE account_id = ?1 AND user_id = ?2",
                rusqlite::params![key.account_id, key.user_id, path],
            )?;
            let mut updated = old;
            updated.thumbnail_path = path.to_string();
            self.db.hooks().pending.borrow_mut().stored_users.push(updated);
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Albums
    // ------------------------------------------------------------------

    /// Fetches albums matching the filter.
    pub fn albums(&self, filter: &AlbumFilter) -> CacheResult<Vec<Album>> {
        let mut clauses = Vec::new();
        let mut params: Vec<Value> = Vec::new();
        if let Some(account_id) = filter.account_id {
            clauses.push("account_id = ?");
            params.push(Value::Integer(account_id));
        }
        if let Some(user_id) = &filter.user_id {
            clauses.push("user_id = ?");
            params.push(Value::Text(user_id.clone()));
        }
        let mut sql = format!("SELECT {ALBUM_COLUMNS} FROM albums");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY account_id, user_id, album_id");
        Ok(self
            .db
            .fetch_multiple(&sql, rusqlite::params_from_iter(params), map_album)?)
    }

    /// Fetches one album by key.
    pub fn album(&self, key: &AlbumKey) -> CacheResult<Option<Album>> {
        key.validate()?;
        Ok(self.db.fetch(
            &format!(
                "SELECT {ALBUM_COLUMNS} FROM albums
                 WHERE account_id = ?1 AND user_id = ?2 AND album_id = ?3"
            ),
            rusqlite::params![key.account_id, key.user_id, key.album_id],
            map_album,
        )?)
    }

    /// Inserts or updates an album row.
    pub fn store_album(&self, album: &Album) -> CacheResult<StoreOutcome> {
        album.key().validate()?;
        self.with_transaction(|| {
            let hooks = self.db.hooks();
            let outcome = match self.album(&album.key())? {
                None => {
                    self.db.store(
                        &format!(
                            "INSERT INTO albums ({ALBUM_COLUMNS})
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                        ),
                        rusqlite::params![
                            album.account_id,
                            album.user_id,
                            album.album_id,
                            album.parent_album_id,
                            album.album_name,
                            album.photo_count,
                            album.thumbnail_url,
                            album.thumbnail_path,
                            album.thumbnail_file_name,
                            album.etag
                        ],
                    )?;
                    StoreOutcome::Inserted
                }
                Some(old) if old == *album => return Ok(StoreOutcome::Unchanged),
                Some(old) => {
                    if old.thumbnail_path != album.thumbnail_path {
                        hooks.schedule_file_delete(&old.thumbnail_path);
                    }
                    self.db.store(
                        "UPDATE albums SET parent_album_id = ?4, album_name = ?5,
                             photo_count = ?6, thumbnail_url = ?7, thumbnail_path = ?8,
                             thumbnail_file_name = ?9, etag = ?10
                         WHERE account_id = ?1 AND user_id = ?2 AND album_id = ?3",
                        rusqlite::params![
                            album.account_id,
                            album.user_id,
                            album.album_id,
                            album.parent_album_id,
                            album.album_name,
                            album.photo_count,
                            album.thumbnail_url,
                            album.thumbnail_path,
                            album.thumbnail_file_name,
                            album.etag
                        ],
                    )?;
                    StoreOutcome::Updated
                }
            };
            hooks.pending.borrow_mut().stored_albums.push(album.clone());
            Ok(outcome)
        })
    }

    /// Deletes an album and, first, all of its photos.
    ///
    /// The album's own thumbnail artifact is scheduled for deletion only when
    /// the album was pinned to its own `thumbnail_url`; a derived thumbnail
    /// points at a photo artifact, which the owning photo row schedules.
    ///
    /// Returns `false` when no such row existed.
    pub fn delete_album(&self, key: &AlbumKey) -> CacheResult<bool> {
        key.validate()?;
        self.with_transaction(|| {
            let Some(album) = self.album(key)? else {
                return Ok(false);
            };
            let photos = self.photos(&PhotoFilter {
                account_id: Some(key.account_id),
                user_id: Some(key.user_id.clone()),
                album_id: Some(key.album_id.clone()),
            })?;
            for photo in &photos {
                self.delete_photo(&photo.key())?;
            }

            let hooks = self.db.hooks();
            if !album.thumbnail_url.is_empty() {
                hooks.schedule_file_delete(&album.thumbnail_path);
            }
            self.db.delete_value(
                "DELETE FROM albums
                 WHERE account_id = ?1 AND user_id = ?2 AND album_id = ?3",
                rusqlite::params![key.account_id, key.user_id, key.album_id],
            )?;
            hooks.unmark_album_dirty(key);
            hooks.pending.borrow_mut().deleted_albums.push(key.clone());
            Ok(true)
        })
    }

    // ------------------------------------------------------------------
    // Photos
    // ------------------------------------------------------------------

    /// Fetches photos matching the filter.
    pub fn photos(&self, filter: &PhotoFilter) -> CacheResult<Vec<Photo>> {
        let (where_clause, params) = photo_filter_clause(filter);
        let sql = format!(
            "SELECT {PHOTO_COLUMNS} FROM photos{where_clause} \
             ORDER BY account_id, user_id, album_id, photo_id"
        );
        Ok(self
            .db
            .fetch_multiple(&sql, rusqlite::params_from_iter(params), map_photo)?)
    }

    /// Fetches one photo by key.
    pub fn photo(&self, key: &PhotoKey) -> CacheResult<Option<Photo>> {
        key.validate()?;
        Ok(self.db.fetch(
            &format!(
                "SELECT {PHOTO_COLUMNS} FROM photos
                 WHERE account_id = ?1 AND user_id = ?2 AND album_id = ?3 AND photo_id = ?4"
            ),
            rusqlite::params![key.account_id, key.user_id, key.album_id, key.photo_id],
            map_photo,
        )?)
    }

    /// Counts photos matching the filter without materializing rows.
    pub fn photo_count(&self, filter: &PhotoFilter) -> CacheResult<i64> {
        let (where_clause, params) = photo_filter_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM photos{where_clause}");
        let count = self
            .db
            .fetch(&sql, rusqlite::params_from_iter(params), |row| row.get(0))?;
        Ok(count.unwrap_or(0))
    }

    /// Inserts or updates a photo row.
    ///
    /// Replaced artifact paths are scheduled for deletion and the owning
    /// album is marked for thumbnail repair.
    pub fn store_photo(&self, photo: &Photo) -> CacheResult<StoreOutcome> {
        photo.key().validate()?;
        self.with_transaction(|| {
            let hooks = self.db.hooks();
            let outcome = match self.photo(&photo.key())? {
                None => {
                    self.db.store(
                        &format!(
                            "INSERT INTO photos ({PHOTO_COLUMNS})
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                                     ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
                        ),
                        rusqlite::params_from_iter(photo_params(photo)),
                    )?;
                    StoreOutcome::Inserted
                }
                Some(old) if old == *photo => return Ok(StoreOutcome::Unchanged),
                Some(old) => {
                    if old.thumbnail_path != photo.thumbnail_path {
                        hooks.schedule_file_delete(&old.thumbnail_path);
                    }
                    if old.image_path != photo.image_path {
                        hooks.schedule_file_delete(&old.image_path);
                    }
                    self.db.store(
                        "UPDATE photos SET file_name = ?5, album_path = ?6, description = ?7,
                             created_timestamp = ?8, updated_timestamp = ?9,
                             thumbnail_url = ?10, thumbnail_path = ?11, image_url = ?12,
                             image_path = ?13, width = ?14, height = ?15, file_size = ?16,
                             file_type = ?17, etag = ?18
                         WHERE account_id = ?1 AND user_id = ?2
                           AND album_id = ?3 AND photo_id = ?4",
                        rusqlite::params_from_iter(photo_params(photo)),
                    )?;
                    StoreOutcome::Updated
                }
            };
            hooks.mark_album_dirty(AlbumKey::new(
                photo.account_id,
                photo.user_id.clone(),
                photo.album_id.clone(),
            ));
            hooks.pending.borrow_mut().stored_photos.push(photo.clone());
            Ok(outcome)
        })
    }

    /// Deletes a photo, scheduling its artifacts for removal.
    ///
    /// Returns `false` when no such row existed.
    pub fn delete_photo(&self, key: &PhotoKey) -> CacheResult<bool> {
        key.validate()?;
        self.with_transaction(|| {
            let Some(photo) = self.photo(key)? else {
                return Ok(false);
            };
            let hooks = self.db.hooks();
            hooks.schedule_file_delete(&photo.thumbnail_path);
            hooks.schedule_file_delete(&photo.image_path);
            self.db.delete_value(
                "DELETE FROM photos
                 WHERE account_id = ?1 AND user_id = ?2 AND album_id = ?3 AND photo_id = ?4",
                rusqlite::params![key.account_id, key.user_id, key.album_id, key.photo_id],
            )?;
            hooks.mark_album_dirty(AlbumKey::new(
                key.account_id,
                key.user_id.clone(),
                key.album_id.clone(),
            ));
            hooks.pending.borrow_mut().deleted_photos.push(key.clone());
            Ok(true)
        })
    }

    /// Re-keys a photo into another album, preserving its cached artifacts.
    pub fn move_photo(
        &self,
        key: &PhotoKey,
        new_album_id: &str,
        new_album_path: &str,
    ) -> CacheResult<()> {
        key.validate()?;
        if new_album_id.is_empty() {
            return Err(crate::error::CacheError::invalid_argument(
                "album id is required",
            ));
        }
        self.with_transaction(|| {
            self.db.store(
                "UPDATE photos SET album_id = ?5, album_path = ?6
                 WHERE account_id = ?1 AND user_id = ?2 AND album_id = ?3 AND photo_id = ?4",
                rusqlite::params![
                    key.account_id,
                    key.user_id,
                    key.album_id,
                    key.photo_id,
                    new_album_id,
                    new_album_path
                ],
            )?;
            let hooks = self.db.hooks();
            hooks.mark_album_dirty(AlbumKey::new(
                key.account_id,
                key.user_id.clone(),
                key.album_id.clone(),
            ));
            hooks.mark_album_dirty(AlbumKey::new(
                key.account_id,
                key.user_id.clone(),
                new_album_id.to_string(),
            ));
            let moved_key = PhotoKey::new(
                key.account_id,
                key.user_id.clone(),
                new_album_id.to_string(),
                key.photo_id.clone(),
            );
            if let Some(moved) = self.photo(&moved_key)? {
                hooks.pending.borrow_mut().stored_photos.push(moved);
            }
            Ok(())
        })
    }

    /// Persists a freshly downloaded photo thumbnail path.
    pub fn set_photo_thumbnail_path(&self, key: &PhotoKey, path: &str) -> CacheResult<()> {
        self.set_photo_path(key, "thumbnail_path", path)
    }

    /// Persists a freshly downloaded full-size image path.
    pub fn set_photo_image_path(&self, key: &PhotoKey, path: &str) -> CacheResult<()> {
        self.set_photo_path(key, "image_path", path)
    }

    fn set_photo_path(&self, key: &PhotoKey, column: &str, path: &str) -> CacheResult<()> {
        key.validate()?;
        self.with_transaction(|| {
            let Some(old) = self.photo(key)? else {
                return Err(crate::error::CacheError::invalid_argument(
                    "photo does not exist",
                ));
            };
            let old_path = if column == "thumbnail_path" {
                &old.thumbnail_path
            } else {
                &old.image_path
            };
            if old_path != path {
                self.db.hooks().schedule_file_delete(old_path);
            }
            self.db.store(
                &format!(
                    "UPDATE photos SET {column} = ?5
                     WHERE account_id = ?1 AND user_id = ?2 AND album_id = ?3 AND photo_id = ?4"
                ),
                rusqlite::params![key.account_id, key.user_id, key.album_id, key.photo_id, path],
            )?;
            let hooks = self.db.hooks();
            hooks.mark_album_dirty(AlbumKey::new(
                key.account_id,
                key.user_id.clone(),
                key.album_id.clone(),
            ));
            if let Some(updated) = self.photo(key)? {
                hooks.pending.borrow_mut().stored_photos.push(updated);
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Account purge
    // ------------------------------------------------------------------

    /// Removes every row belonging to `account_id` and schedules all of the
    /// account's artifact files for deletion, in one transaction.
    pub fn purge_account(&self, account_id: i64) -> CacheResult<()> {
        if account_id == 0 {
            return Err(crate::error::CacheError::invalid_argument(
                "account id is required",
            ));
        }
        self.with_transaction(|| {
            let users = self.users(&UserFilter {
                account_id: Some(account_id),
            })?;
            for user in &users {
                self.delete_user(&user.key())?;
            }
            Ok(())
        })
    }
}

impl std::fmt::Debug for ImageDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageDatabase")
            .field("path", &self.db.path())
            .finish_non_exhaustive()
    }
}

/// Builds the WHERE clause and parameters for a photo filter.
fn photo_filter_clause(filter: &PhotoFilter) -> (String, Vec<Value>) {
    let mut clauses = Vec::new();
    let mut params: Vec<Value> = Vec::new();
    if let Some(account_id) = filter.account_id {
        clauses.push("account_id = ?");
        params.push(Value::Integer(account_id));
    }
    if let Some(user_id) = &filter.user_id {
        clauses.push("user_id = ?");
        params.push(Value::Text(user_id.clone()));
    }
    if let Some(album_id) = &filter.album_id {
        clauses.push("album_id = ?");
        params.push(Value::Text(album_id.clone()));
    }
    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    (where_clause, params)
}

fn photo_params(photo: &Photo) -> [&dyn rusqlite::ToSql; 18] {
    [
        &photo.account_id,
        &photo.user_id,
        &photo.album_id,
        &photo.photo_id,
        &photo.file_name,
        &photo.album_path,
        &photo.description,
        &photo.created_timestamp,
        &photo.updated_timestamp,
        &photo.thumbnail_url,
        &photo.thumbnail_path,
        &photo.image_url,
        &photo.image_path,
        &photo.width,
        &photo.height,
        &photo.file_size,
        &photo.file_type,
        &photo.etag,
    ]
}
