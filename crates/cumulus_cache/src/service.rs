//! Asynchronous service façades over the domain caches.
//!
//! `GalleryService` and `PostsService` are what the protocol, sign-in and UI
//! layers talk to. Each owns one worker thread ([`TaskRunner`]) whose
//! state holds the database, the download manager and the change feed;
//! every public call enqueues a job and returns a [`Completion`] the caller
//! can wait on or poll. Artifact population is keyed by a caller-supplied
//! idempotency token so overlapping requests for different resources cannot
//! cross-deliver.

use crate::config::CacheConfig;
use crate::error::CacheResult;
use crate::events::EventDatabase;
use crate::feed::CacheChange;
use crate::images::ImageDatabase;
use crate::model::{
    Album, AlbumFilter, AlbumKey, Event, EventFilter, EventKey, EventListing, GalleryListing,
    Photo, PhotoFilter, PhotoKey, User, UserFilter, UserKey,
};
use crate::paths;
use crate::reconcile::{
    reconcile_events, reconcile_gallery, EventRemote, EventsDelta, GalleryDelta,
};
use crate::worker::{Completion, TaskRunner};
use cumulus_db::DbError;
use cumulus_fetch::{ChunkSource, DownloadManager, DownloadRequest, HttpSource};
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::mpsc;

/// Completion payload of a populate call.
///
/// The token is echoed back verbatim so the caller can match the outcome to
/// the UI element that asked for the artifact.
#[derive(Debug)]
pub struct PopulateOutcome {
    /// Caller-supplied correlation token.
    pub token: u64,
    /// Final local path on success, an error message on failure.
    pub result: Result<PathBuf, String>,
}

impl PopulateOutcome {
    fn success(token: u64, path: PathBuf) -> Self {
        Self {
            token,
            result: Ok(path),
        }
    }

    fn failure(token: u64, message: impl Into<String>) -> Self {
        Self {
            token,
            result: Err(message.into()),
        }
    }
}

#[derive(Clone, Copy)]
enum PhotoArtifact {
    Thumbnail,
    Image,
}

struct GalleryState {
    config: CacheConfig,
    db: Option<Rc<ImageDatabase>>,
    downloads: DownloadManager,
}

impl GalleryState {
    fn db(&self) -> CacheResult<Rc<ImageDatabase>> {
        self.db.clone().ok_or_else(|| DbError::NotOpen.into())
    }
}

/// Runs a batch mutation inside one transaction.
fn in_gallery_txn(
    db: &ImageDatabase,
    f: impl FnOnce() -> CacheResult<()>,
) -> CacheResult<()> {
    db.begin_transaction()?;
    match f() {
        Ok(()) => {
            if let Err(e) = db.commit_transaction() {
                let _ = db.rollback_transaction();
                return Err(e);
            }
            Ok(())
        }
        Err(e) => {
            let _ = db.rollback_transaction();
            Err(e)
        }
    }
}

fn in_posts_txn(db: &EventDatabase, f: impl FnOnce() -> CacheResult<()>) -> CacheResult<()> {
    db.begin_transaction()?;
    match f() {
        Ok(()) => {
            if let Err(e) = db.commit_transaction() {
                let _ = db.rollback_transaction();
                return Err(e);
            }
            Ok(())
        }
        Err(e) => {
            let _ = db.rollback_transaction();
            Err(e)
        }
    }
}

/// Asynchronous façade over the images cache.
pub struct GalleryService {
    runner: TaskRunner<GalleryState>,
}

impl GalleryService {
    /// Starts the service with the real HTTP byte source.
    pub fn start(config: CacheConfig) -> io::Result<Self> {
        Self::start_with_source(config, || Rc::new(HttpSource::new()) as Rc<dyn ChunkSource>)
    }

    /// Starts the service with a caller-supplied byte source.
    ///
    /// The factory runs on the worker thread, so the source may be
    /// thread-bound. Tests use this to script downloads.
    pub fn start_with_source<F>(config: CacheConfig, make_source: F) -> io::Result<Self>
    where
        F: FnOnce() -> Rc<dyn ChunkSource> + Send + 'static,
    {
        let download_config = config.download.clone();
        let runner = TaskRunner::spawn("cumulus-gallery", move || GalleryState {
            downloads: DownloadManager::new(make_source(), download_config),
            config,
            db: None,
        })?;
        Ok(Self { runner })
    }

    /// Opens (or creates) the images database.
    pub fn open_database(&self) -> Completion<CacheResult<()>> {
        self.runner.dispatch(|state| {
            if state.db.is_some() {
                return Err(DbError::AlreadyOpen.into());
            }
            let db = ImageDatabase::open(&state.config.images_db_path(), state.config.db.clone())?;
            state.db = Some(Rc::new(db));
            Ok(())
        })
    }

    /// Subscribes to the cache's aggregate stored/deleted change feed.
    pub fn subscribe(&self) -> Completion<CacheResult<mpsc::Receiver<CacheChange>>> {
        self.runner.dispatch(|state| Ok(state.db()?.feed().subscribe()))
    }

    /// Fetches users matching the filter.
    pub fn request_users(&self, filter: UserFilter) -> Completion<CacheResult<Vec<User>>> {
        self.runner.dispatch(move |state| state.db()?.users(&filter))
    }

    /// Fetches albums matching the filter.
    pub fn request_albums(&self, filter: AlbumFilter) -> Completion<CacheResult<Vec<Album>>> {
        self.runner.dispatch(move |state| state.db()?.albums(&filter))
    }

    /// Fetches photos matching the filter.
    pub fn request_photos(&self, filter: PhotoFilter) -> Completion<CacheResult<Vec<Photo>>> {
        self.runner.dispatch(move |state| state.db()?.photos(&filter))
    }

    /// Counts photos matching the filter.
    pub fn request_photo_count(&self, filter: PhotoFilter) -> Completion<CacheResult<i64>> {
        self.runner
            .dispatch(move |state| state.db()?.photo_count(&filter))
    }

    /// Stores a batch of users in one transaction.
    pub fn store_users(&self, users: Vec<User>) -> Completion<CacheResult<()>> {
        self.runner.dispatch(move |state| {
            let db = state.db()?;
            in_gallery_txn(&db, || {
                for user in &users {
                    db.store_user(user)?;
                }
                Ok(())
            })
        })
    }

    /// Stores a batch of albums in one transaction.
    pub fn store_albums(&self, albums: Vec<Album>) -> Completion<CacheResult<()>> {
        self.runner.dispatch(move |state| {
            let db = state.db()?;
            in_gallery_txn(&db, || {
                for album in &albums {
                    db.store_album(album)?;
                }
                Ok(())
            })
        })
    }

    /// Stores a batch of photos in one transaction.
    pub fn store_photos(&self, photos: Vec<Photo>) -> Completion<CacheResult<()>> {
        self.runner.dispatch(move |state| {
            let db = state.db()?;
            in_gallery_txn(&db, || {
                for photo in &photos {
                    db.store_photo(photo)?;
                }
                Ok(())
            })
        })
    }

    /// Deletes a batch of users (cascading) in one transaction.
    pub fn delete_users(&self, keys: Vec<UserKey>) -> Completion<CacheResult<()>> {
        self.runner.dispatch(move |state| {
            let db = state.db()?;
            in_gallery_txn(&db, || {
                for key in &keys {
                    db.delete_user(key)?;
                }
                Ok(())
            })
        })
    }

    /// Deletes a batch of albums (cascading) in one transaction.
    pub fn delete_albums(&self, keys: Vec<AlbumKey>) -> Completion<CacheResult<()>> {
        self.runner.dispatch(move |state| {
            let db = state.db()?;
            in_gallery_txn(&db, || {
                for key in &keys {
                    db.delete_album(key)?;
                }
                Ok(())
            })
        })
    }

    /// Deletes a batch of photos in one transaction.
    pub fn delete_photos(&self, keys: Vec<PhotoKey>) -> Completion<CacheResult<()>> {
        self.runner.dispatch(move |state| {
            let db = state.db()?;
            in_gallery_txn(&db, || {
                for key in &keys {
                    db.delete_photo(key)?;
                }
                Ok(())
            })
        })
    }

    /// Reconciles one remote gallery listing against the cache.
    pub fn reconcile(&self, listing: GalleryListing) -> Completion<CacheResult<GalleryDelta>> {
        self.runner.dispatch(move |state| {
            let db = state.db()?;
            reconcile_gallery(&db, &listing)
        })
    }

    /// Wipes one account's rows and owned artifacts.
    pub fn purge_account(&self, account_id: i64) -> Completion<CacheResult<()>> {
        self.runner
            .dispatch(move |state| state.db()?.purge_account(account_id))
    }

    /// Ensures a photo's thumbnail artifact exists locally.
    ///
    /// Replies immediately with the cached path when present; otherwise
    /// downloads the artifact, persists the path into the row, and replies
    /// once done. Failures leave the path empty for retry on next access.
    pub fn populate_photo_thumbnail(
        &self,
        token: u64,
        key: PhotoKey,
    ) -> Completion<PopulateOutcome> {
        self.populate_photo(token, key, PhotoArtifact::Thumbnail)
    }

    /// Ensures a photo's full-size artifact exists locally.
    pub fn populate_photo_image(&self, token: u64, key: PhotoKey) -> Completion<PopulateOutcome> {
        self.populate_photo(token, key, PhotoArtifact::Image)
    }

    fn populate_photo(
        &self,
        token: u64,
        key: PhotoKey,
        artifact: PhotoArtifact,
    ) -> Completion<PopulateOutcome> {
        self.runner.dispatch_deferred(move |state, reply| {
            let db = match state.db() {
                Ok(db) => db,
                Err(e) => return reply.send(PopulateOutcome::failure(token, e.to_string())),
            };
            let photo = match db.photo(&key) {
                Ok(Some(photo)) => photo,
                Ok(None) => {
                    return reply.send(PopulateOutcome::failure(token, "photo does not exist"))
                }
                Err(e) => return reply.send(PopulateOutcome::failure(token, e.to_string())),
            };

            let (url, cached) = match artifact {
                PhotoArtifact::Thumbnail => (photo.thumbnail_url, photo.thumbnail_path),
                PhotoArtifact::Image => (photo.image_url, photo.image_path),
            };
            if !cached.is_empty() && Path::new(&cached).exists() {
                return reply.send(PopulateOutcome::success(token, PathBuf::from(cached)));
            }
            if url.is_empty() {
                return reply.send(PopulateOutcome::failure(token, "no remote url for artifact"));
            }

            let dest = match artifact {
                PhotoArtifact::Thumbnail => {
                    paths::photo_thumbnail_path(&state.config.data_dir, &key, &photo.file_name)
                }
                PhotoArtifact::Image => {
                    paths::photo_image_path(&state.config.data_dir, &key, &photo.file_name)
                }
            };
            let rx = state.downloads.enqueue(DownloadRequest { url, dest });
            tokio::task::spawn_local(async move {
                let outcome = match rx.await {
                    Ok(Ok(path)) => {
                        let path_str = path.to_string_lossy().into_owned();
                        let persisted = match artifact {
                            PhotoArtifact::Thumbnail => db.set_photo_thumbnail_path(&key, &path_str),
                            PhotoArtifact::Image => db.set_photo_image_path(&key, &path_str),
                        };
                        match persisted {
                            Ok(()) => PopulateOutcome::success(token, path),
                            Err(e) => PopulateOutcome::failure(token, e.to_string()),
                        }
                    }
                    Ok(Err(e)) => PopulateOutcome::failure(token, e.to_string()),
                    Err(_) => PopulateOutcome::failure(token, "download manager shut down"),
                };
                reply.send(outcome);
            });
        })
    }

    /// Ensures a user's avatar artifact exists locally.
    pub fn populate_user_thumbnail(
        &self,
        token: u64,
        key: UserKey,
    ) -> Completion<PopulateOutcome> {
        self.runner.dispatch_deferred(move |state, reply| {
            let db = match state.db() {
                Ok(db) => db,
                Err(e) => return reply.send(PopulateOutcome::failure(token, e.to_string())),
            };
            let user = match db.user(&key) {
                Ok(Some(user)) => user,
                Ok(None) => {
                    return reply.send(PopulateOutcome::failure(token, "user does not exist"))
                }
                Err(e) => return reply.send(PopulateOutcome::failure(token, e.to_string())),
            };

            if !user.thumbnail_path.is_empty() && Path::new(&user.thumbnail_path).exists() {
                return reply.send(PopulateOutcome::success(
                    token,
                    PathBuf::from(user.thumbnail_path),
                ));
            }
            if user.thumbnail_url.is_empty() {
                return reply.send(PopulateOutcome::failure(token, "no remote url for artifact"));
            }

            let dest = paths::user_thumbnail_path(&state.config.data_dir, &key);
            let rx = state.downloads.enqueue(DownloadRequest {
                url: user.thumbnail_url,
                dest,
            });
            tokio::task::spawn_local(async move {
                let outcome = match rx.await {
                    Ok(Ok(path)) => {
                        let path_str = path.to_string_lossy().into_owned();
                        match db.set_user_thumbnail(&key, &path_str) {
                            Ok(()) => PopulateOutcome::success(token, path),
                            Err(e) => PopulateOutcome::failure(token, e.to_string()),
                        }
                    }
                    Ok(Err(e)) => PopulateOutcome::failure(token, e.to_string()),
                    Err(_) => PopulateOutcome::failure(token, "download manager shut down"),
                };
                reply.send(outcome);
            });
        })
    }
}

struct PostsState {
    config: CacheConfig,
    db: Option<Rc<EventDatabase>>,
    downloads: DownloadManager,
}

impl PostsState {
    fn db(&self) -> CacheResult<Rc<EventDatabase>> {
        self.db.clone().ok_or_else(|| DbError::NotOpen.into())
    }
}

/// Asynchronous façade over the posts/events cache.
pub struct PostsService {
    runner: TaskRunner<PostsState>,
}

impl PostsService {
    /// Starts the service with the real HTTP byte source.
    pub fn start(config: CacheConfig) -> io::Result<Self> {
        Self::start_with_source(config, || Rc::new(HttpSource::new()) as Rc<dyn ChunkSource>)
    }

    /// Starts the service with a caller-supplied byte source.
    pub fn start_with_source<F>(config: CacheConfig, make_source: F) -> io::Result<Self>
    where
        F: FnOnce() -> Rc<dyn ChunkSource> + Send + 'static,
    {
        let download_config = config.download.clone();
        let runner = TaskRunner::spawn("cumulus-posts", move || PostsState {
            downloads: DownloadManager::new(make_source(), download_config),
            config,
            db: None,
        })?;
        Ok(Self { runner })
    }

    /// Opens (or creates) the posts database.
    pub fn open_database(&self) -> Completion<CacheResult<()>> {
        self.runner.dispatch(|state| {
            if state.db.is_some() {
                return Err(DbError::AlreadyOpen.into());
            }
            let db = EventDatabase::open(&state.config.posts_db_path(), state.config.db.clone())?;
            state.db = Some(Rc::new(db));
            Ok(())
        })
    }

    /// Subscribes to the cache's aggregate stored/deleted change feed.
    pub fn subscribe(&self) -> Completion<CacheResult<mpsc::Receiver<CacheChange>>> {
        self.runner.dispatch(|state| Ok(state.db()?.feed().subscribe()))
    }

    /// Fetches events matching the filter.
    pub fn request_events(&self, filter: EventFilter) -> Completion<CacheResult<Vec<Event>>> {
        self.runner.dispatch(move |state| state.db()?.events(&filter))
    }

    /// Stores a batch of events in one transaction.
    pub fn store_events(&self, events: Vec<Event>) -> Completion<CacheResult<()>> {
        self.runner.dispatch(move |state| {
            let db = state.db()?;
            in_posts_txn(&db, || {
                for event in &events {
                    db.store_event(event)?;
                }
                Ok(())
            })
        })
    }

    /// Hard-deletes a batch of events in one transaction.
    pub fn delete_events(&self, keys: Vec<EventKey>) -> Completion<CacheResult<()>> {
        self.runner.dispatch(move |state| {
            let db = state.db()?;
            in_posts_txn(&db, || {
                for key in &keys {
                    db.delete_event(key)?;
                }
                Ok(())
            })
        })
    }

    /// Tombstones an event pending remote-side deletion.
    pub fn flag_event_for_deletion(&self, key: EventKey) -> Completion<CacheResult<bool>> {
        self.runner
            .dispatch(move |state| state.db()?.flag_event_for_deletion(&key))
    }

    /// Reconciles the full remote notification list against the cache.
    ///
    /// `remote` receives the per-ID or delete-all calls after the local
    /// transaction commits.
    pub fn reconcile(
        &self,
        listing: EventListing,
        remote: Box<dyn EventRemote>,
    ) -> Completion<CacheResult<EventsDelta>> {
        self.runner.dispatch(move |state| {
            let db = state.db()?;
            reconcile_events(&db, &listing, remote.as_ref())
        })
    }

    /// Wipes one account's rows and owned artifacts.
    pub fn purge_account(&self, account_id: i64) -> Completion<CacheResult<()>> {
        self.runner
            .dispatch(move |state| state.db()?.purge_account(account_id))
    }

    /// Ensures an event's image artifact exists locally.
    pub fn populate_event_image(&self, token: u64, key: EventKey) -> Completion<PopulateOutcome> {
        self.runner.dispatch_deferred(move |state, reply| {
            let db = match state.db() {
                Ok(db) => db,
                Err(e) => return reply.send(PopulateOutcome::failure(token, e.to_string())),
            };
            let event = match db.event(&key) {
                Ok(Some(event)) => event,
                Ok(None) => {
                    return reply.send(PopulateOutcome::failure(token, "event does not exist"))
                }
                Err(e) => return reply.send(PopulateOutcome::failure(token, e.to_string())),
            };

            if !event.image_path.is_empty() && Path::new(&event.image_path).exists() {
                return reply.send(PopulateOutcome::success(
                    token,
                    PathBuf::from(event.image_path),
                ));
            }
            if event.image_url.is_empty() {
                return reply.send(PopulateOutcome::failure(token, "no remote url for artifact"));
            }

            let dest =
                paths::event_image_path(&state.config.data_dir, key.account_id, &key.event_id);
            let rx = state.downloads.enqueue(DownloadRequest {
                url: event.image_url,
                dest,
            });
            tokio::task::spawn_local(async move {
                let outcome = match rx.await {
                    Ok(Ok(path)) => {
                        let path_str = path.to_string_lossy().into_owned();
                        match db.set_event_image_path(&key, &path_str) {
                            Ok(()) => PopulateOutcome::success(token, path),
                            Err(e) => PopulateOutcome::failure(token, e.to_string()),
                        }
                    }
                    Ok(Err(e)) => PopulateOutcome::failure(token, e.to_string()),
                    Err(_) => PopulateOutcome::failure(token, "download manager shut down"),
                };
                reply.send(outcome);
            });
        })
    }
}
