//! Delta reconciliation of remote listings against the local cache.
//!
//! One call applies one freshly fetched listing inside a single transaction:
//! the minimal set of inserts, updates, moves and deletes that makes the
//! cache match the server. The server is authoritative: local rows are
//! overwritten, not merged. Any error rolls the whole pass back; a delta is
//! never partially applied.
//!
//! Identity is the composite key; `etag` is metadata the protocol layer uses
//! to skip redundant fetches and is never compared here.

use crate::error::{CacheError, CacheResult};
use crate::events::EventDatabase;
use crate::images::ImageDatabase;
use crate::model::{
    Album, AlbumFilter, Event, EventFilter, EventKey, EventListing, GalleryListing, Photo,
    PhotoFilter, RemotePhoto, StoreOutcome, User, UserKey,
};
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Summary of one gallery reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GalleryDelta {
    /// Albums inserted.
    pub albums_inserted: usize,
    /// Albums updated (photo count changed).
    pub albums_updated: usize,
    /// Albums deleted (absent remotely), cascading to their photos.
    pub albums_deleted: usize,
    /// Photos inserted.
    pub photos_inserted: usize,
    /// Photos whose content changed (cached artifacts cleared).
    pub photos_updated: usize,
    /// Photos re-keyed into another album with artifacts preserved.
    pub photos_moved: usize,
    /// Photos deleted.
    pub photos_deleted: usize,
}

impl GalleryDelta {
    /// Whether the pass changed nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

/// Reconciles one remote gallery subtree against the images cache.
///
/// Runs entirely inside one transaction; on any error the transaction is
/// rolled back and the single failure surfaced, never a partial delta.
pub fn reconcile_gallery(
    db: &ImageDatabase,
    listing: &GalleryListing,
) -> CacheResult<GalleryDelta> {
    UserKey::new(listing.account_id, listing.user_id.clone()).validate()?;

    db.begin_transaction()?;
    let delta = match apply_gallery(db, listing) {
        Ok(delta) => delta,
        Err(e) => {
            let _ = db.rollback_transaction();
            return Err(e);
        }
    };
    if let Err(e) = db.commit_transaction() {
        let _ = db.rollback_transaction();
        return Err(e);
    }

    info!(
        account_id = listing.account_id,
        user_id = %listing.user_id,
        ?delta,
        "gallery reconciled"
    );
    Ok(delta)
}

fn apply_gallery(db: &ImageDatabase, listing: &GalleryListing) -> CacheResult<GalleryDelta> {
    let account_id = listing.account_id;
    let user_id = &listing.user_id;
    let mut delta = GalleryDelta::default();

    // Albums reference their user; make sure the row exists.
    let user_key = UserKey::new(account_id, user_id.clone());
    if db.user(&user_key)?.is_none() {
        db.store_user(&User {
            account_id,
            user_id: user_id.clone(),
            display_name: user_id.clone(),
            ..User::default()
        })?;
    }

    let local_albums = db.albums(&AlbumFilter {
        account_id: Some(account_id),
        user_id: Some(user_id.clone()),
    })?;
    let local_photos = db.photos(&PhotoFilter {
        account_id: Some(account_id),
        user_id: Some(user_id.clone()),
        album_id: None,
    })?;

    let remote_album_ids: BTreeSet<&str> =
        listing.albums.iter().map(|a| a.album_id.as_str()).collect();
    let remote_photo_ids: BTreeSet<&str> =
        listing.photos.iter().map(|p| p.photo_id.as_str()).collect();

    // Albums the server no longer has, cascading to their photos.
    for album in &local_albums {
        if !remote_album_ids.contains(album.album_id.as_str()) {
            let cascaded = local_photos
                .iter()
                .filter(|p| p.album_id == album.album_id)
                .count();
            db.delete_album(&album.key())?;
            delta.albums_deleted += 1;
            delta.photos_deleted += cascaded;
        }
    }

    // New and changed albums. Local thumbnail state survives an update.
    for remote in &listing.albums {
        match local_albums.iter().find(|a| a.album_id == remote.album_id) {
            None => {
                db.store_album(&Album {
                    account_id,
                    user_id: user_id.clone(),
                    album_id: remote.album_id.clone(),
                    parent_album_id: remote.parent_album_id.clone(),
                    album_name: remote.album_name.clone(),
                    photo_count: remote.photo_count,
                    thumbnail_url: remote.thumbnail_url.clone(),
                    etag: remote.etag.clone(),
                    ..Album::default()
                })?;
                delta.albums_inserted += 1;
            }
            Some(local) if local.photo_count != remote.photo_count => {
                let mut updated = local.clone();
                updated.parent_album_id = remote.parent_album_id.clone();
                updated.album_name = remote.album_name.clone();
                updated.photo_count = remote.photo_count;
                updated.thumbnail_url = remote.thumbnail_url.clone();
                updated.etag = remote.etag.clone();
                db.store_album(&updated)?;
                delta.albums_updated += 1;
            }
            Some(_) => {}
        }
    }

    // Photos the server no longer has anywhere for this user.
    for photo in &local_photos {
        if !remote_photo_ids.contains(photo.photo_id.as_str()) {
            // Cascaded album deletions above may have removed the row already.
            if db.delete_photo(&photo.key())? {
                delta.photos_deleted += 1;
            }
        }
    }

    // New, changed and moved photos.
    for remote in &listing.photos {
        // The snapshot can be stale after the album cascade, so a candidate
        // match only counts while its row still exists.
        let mut local = None;
        if let Some(candidate) = local_photos.iter().find(|p| p.photo_id == remote.photo_id) {
            if db.photo(&candidate.key())?.is_some() {
                local = Some(candidate);
            }
        }
        match local {
            None => {
                db.store_photo(&photo_from_remote(account_id, user_id, remote))?;
                delta.photos_inserted += 1;
            }
            Some(local) => {
                let content_changed = local.updated_timestamp != remote.updated_timestamp
                    || local.image_url != remote.image_url;
                let moved = local.album_id != remote.album_id;

                if moved {
                    db.move_photo(&local.key(), &remote.album_id, &remote.album_path)?;
                    delta.photos_moved += 1;
                }
                if content_changed {
                    // Cached artifact paths are cleared so the changed
                    // content is re-downloaded; the old files get scheduled
                    // for deletion by the store.
                    db.store_photo(&photo_from_remote(account_id, user_id, remote))?;
                    delta.photos_updated += 1;
                }
            }
        }
    }

    Ok(delta)
}

fn photo_from_remote(account_id: i64, user_id: &str, remote: &RemotePhoto) -> Photo {
    Photo {
        account_id,
        user_id: user_id.to_string(),
        album_id: remote.album_id.clone(),
        photo_id: remote.photo_id.clone(),
        file_name: remote.file_name.clone(),
        album_path: remote.album_path.clone(),
        description: remote.description.clone(),
        created_timestamp: remote.created_timestamp,
        updated_timestamp: remote.updated_timestamp,
        thumbnail_url: remote.thumbnail_url.clone(),
        thumbnail_path: String::new(),
        image_url: remote.image_url.clone(),
        image_path: String::new(),
        width: remote.width,
        height: remote.height,
        file_size: remote.file_size,
        file_type: remote.file_type.clone(),
        etag: remote.etag.clone(),
    }
}

/// Issues the remote-side deletions a reconciliation pass decided on.
///
/// Implemented by the protocol layer; called strictly after the local
/// transaction has committed.
pub trait EventRemote: Send {
    /// Asks the server to delete one event.
    fn delete_event(&self, account_id: i64, event_id: &str) -> Result<(), String>;

    /// Asks the server to delete every event for the account.
    fn delete_all_events(&self, account_id: i64) -> Result<(), String>;
}

/// Summary of one events reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventsDelta {
    /// Events inserted locally.
    pub inserted: usize,
    /// Events updated locally.
    pub updated: usize,
    /// Events hard-deleted locally (gone from the server).
    pub deleted: usize,
    /// Event IDs for which per-ID remote deletes were issued.
    pub remote_deletes: Vec<String>,
    /// Whether a single delete-all remote call was issued instead.
    pub remote_delete_all: bool,
}

enum RemotePlan {
    Nothing,
    DeleteEach(Vec<String>),
    DeleteAll,
}

/// Reconciles the full remote notification list against the events cache.
///
/// Local work happens in one transaction. Remote delete calls (per
/// tombstoned ID, or one delete-all when the tombstones cover exactly the
/// whole remote set) are issued only after the commit succeeds, and their
/// failures are non-fatal (the tombstones survive for the next pass).
pub fn reconcile_events(
    db: &EventDatabase,
    listing: &EventListing,
    remote: &dyn EventRemote,
) -> CacheResult<EventsDelta> {
    if listing.account_id == 0 {
        return Err(CacheError::invalid_argument("account id is required"));
    }

    db.begin_transaction()?;
    let (mut delta, plan) = match apply_events(db, listing) {
        Ok(applied) => applied,
        Err(e) => {
            let _ = db.rollback_transaction();
            return Err(e);
        }
    };
    if let Err(e) = db.commit_transaction() {
        let _ = db.rollback_transaction();
        return Err(e);
    }

    match plan {
        RemotePlan::Nothing => {}
        RemotePlan::DeleteAll => {
            if let Err(e) = remote.delete_all_events(listing.account_id) {
                warn!(account_id = listing.account_id, error = %e, "remote delete-all failed");
            }
            delta.remote_delete_all = true;
        }
        RemotePlan::DeleteEach(ids) => {
            for event_id in &ids {
                if let Err(e) = remote.delete_event(listing.account_id, event_id) {
                    warn!(account_id = listing.account_id, event_id = %event_id, error = %e,
                        "remote delete failed");
                }
            }
            delta.remote_deletes = ids;
        }
    }

    info!(account_id = listing.account_id, ?delta, "events reconciled");
    Ok(delta)
}

fn apply_events(
    db: &EventDatabase,
    listing: &EventListing,
) -> CacheResult<(EventsDelta, RemotePlan)> {
    let account_id = listing.account_id;
    let mut delta = EventsDelta::default();

    let local = db.events(&EventFilter {
        account_id: Some(account_id),
        include_tombstones: true,
    })?;
    let remote_ids: BTreeSet<&str> = listing.events.iter().map(|e| e.event_id.as_str()).collect();

    // The server already dropped these; acknowledge the removal locally.
    for event in &local {
        if !remote_ids.contains(event.event_id.as_str()) {
            db.delete_event(&event.key())?;
            delta.deleted += 1;
        }
    }

    // Tombstones still present on the server need remote-side deletion.
    let tombstone_ids: BTreeSet<&str> = local
        .iter()
        .filter(|e| e.deleted_locally && remote_ids.contains(e.event_id.as_str()))
        .map(|e| e.event_id.as_str())
        .collect();

    // When the tombstones cover the entire remote set, one delete-all call
    // replaces the per-ID requests.
    let all_tombstoned = !remote_ids.is_empty() && tombstone_ids == remote_ids;
    let plan = if all_tombstoned {
        RemotePlan::DeleteAll
    } else if tombstone_ids.is_empty() {
        RemotePlan::Nothing
    } else {
        RemotePlan::DeleteEach(tombstone_ids.iter().map(|id| (*id).to_string()).collect())
    };

    if !all_tombstoned {
        for remote_event in &listing.events {
            if tombstone_ids.contains(remote_event.event_id.as_str()) {
                continue;
            }
            let key = EventKey::new(account_id, remote_event.event_id.clone());
            let existing = db.event(&key)?;

            let mut row = Event {
                account_id,
                event_id: remote_event.event_id.clone(),
                event_subject: remote_event.event_subject.clone(),
                event_text: remote_event.event_text.clone(),
                event_url: remote_event.event_url.clone(),
                image_url: remote_event.image_url.clone(),
                image_path: String::new(),
                timestamp: remote_event.timestamp,
                deleted_locally: false,
            };
            // An unchanged image keeps its cached artifact.
            if let Some(old) = &existing {
                if old.image_url == row.image_url {
                    row.image_path = old.image_path.clone();
                }
            }

            match db.store_event(&row)? {
                StoreOutcome::Inserted => delta.inserted += 1,
                StoreOutcome::Updated => delta.updated += 1,
                StoreOutcome::Unchanged => {}
            }
        }
    }

    Ok((delta, plan))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlbumKey, PhotoKey, RemoteAlbum, RemoteEvent};
    use cumulus_db::DbConfig;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    fn open_images(dir: &tempfile::TempDir) -> ImageDatabase {
        ImageDatabase::open(&dir.path().join("images.db"), DbConfig::default()).unwrap()
    }

    fn open_events(dir: &tempfile::TempDir) -> EventDatabase {
        EventDatabase::open(&dir.path().join("posts.db"), DbConfig::default()).unwrap()
    }

    fn remote_album(album_id: &str, photo_count: i64) -> RemoteAlbum {
        RemoteAlbum {
            album_id: album_id.into(),
            album_name: format!("Album {album_id}"),
            photo_count,
            ..RemoteAlbum::default()
        }
    }

    fn remote_photo(album_id: &str, photo_id: &str) -> RemotePhoto {
        RemotePhoto {
            album_id: album_id.into(),
            photo_id: photo_id.into(),
            file_name: format!("{photo_id}.jpg"),
            updated_timestamp: 1_000,
            thumbnail_url: format!("https://cloud/thumb/{photo_id}"),
            image_url: format!("https://cloud/img/{photo_id}"),
            ..RemotePhoto::default()
        }
    }

    fn remote_event(event_id: &str) -> RemoteEvent {
        RemoteEvent {
            event_id: event_id.into(),
            event_subject: format!("Subject {event_id}"),
            timestamp: 1_700_000_000,
            ..RemoteEvent::default()
        }
    }

    #[test]
    fn first_pass_populates_an_empty_cache() {
        let temp = tempdir().unwrap();
        let db = open_images(&temp);

        let listing = GalleryListing {
            account_id: 7,
            user_id: "alice".into(),
            albums: vec![remote_album("a1", 2)],
            photos: vec![remote_photo("a1", "p1"), remote_photo("a1", "p2")],
        };

        let delta = reconcile_gallery(&db, &listing).unwrap();
        assert_eq!(delta.albums_inserted, 1);
        assert_eq!(delta.photos_inserted, 2);
        assert_eq!(delta.albums_deleted + delta.photos_deleted, 0);

        // The user row was created implicitly.
        assert!(db
            .user(&UserKey::new(7, "alice"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn applying_the_same_listing_twice_is_a_noop() {
        let temp = tempdir().unwrap();
        let db = open_images(&temp);

        let listing = GalleryListing {
            account_id: 7,
            user_id: "alice".into(),
            albums: vec![remote_album("a1", 1), remote_album("a2", 1)],
            photos: vec![remote_photo("a1", "p1"), remote_photo("a2", "p2")],
        };

        let first = reconcile_gallery(&db, &listing).unwrap();
        assert!(!first.is_noop());

        let second = reconcile_gallery(&db, &listing).unwrap();
        assert!(second.is_noop(), "second pass must change nothing: {second:?}");
    }

    #[test]
    fn full_reconciliation_scenario() {
        let temp = tempdir().unwrap();
        let db = open_images(&temp);

        // Local cache: album A with photos p1 and p_old, empty album C.
        // A's derived thumbnail points at p_old's artifact.
        let seed = GalleryListing {
            account_id: 7,
            user_id: "alice".into(),
            albums: vec![remote_album("A", 2), remote_album("C", 0)],
            photos: vec![remote_photo("A", "p1"), {
                let mut p = remote_photo("A", "p_old");
                p.updated_timestamp = 2_000;
                p
            }],
        };
        reconcile_gallery(&db, &seed).unwrap();
        db.set_photo_thumbnail_path(&PhotoKey::new(7, "alice", "A", "p_old"), "/thumbs/p_old")
            .unwrap();
        db.set_photo_thumbnail_path(&PhotoKey::new(7, "alice", "A", "p1"), "/thumbs/p1")
            .unwrap();
        let album_a = db.album(&AlbumKey::new(7, "alice", "A")).unwrap().unwrap();
        assert_eq!(album_a.thumbnail_path, "/thumbs/p_old");

        // Remote now has albums A and B with photos p1 and p2; p_old and C
        // are gone.
        let listing = GalleryListing {
            account_id: 7,
            user_id: "alice".into(),
            albums: vec![remote_album("A", 1), remote_album("B", 1)],
            photos: vec![remote_photo("A", "p1"), remote_photo("B", "p2")],
        };
        let delta = reconcile_gallery(&db, &listing).unwrap();

        assert_eq!(delta.albums_inserted, 1, "album B inserted");
        assert_eq!(delta.albums_deleted, 1, "album C deleted");
        assert_eq!(delta.photos_inserted, 1, "photo p2 inserted");
        assert_eq!(delta.photos_deleted, 1, "photo p_old deleted");

        let albums = db.albums(&AlbumFilter::default()).unwrap();
        let album_ids: Vec<&str> = albums.iter().map(|a| a.album_id.as_str()).collect();
        assert_eq!(album_ids, vec!["A", "B"]);

        let photos = db.photos(&PhotoFilter::default()).unwrap();
        let photo_ids: Vec<&str> = photos.iter().map(|p| p.photo_id.as_str()).collect();
        assert_eq!(photo_ids, vec!["p1", "p2"]);

        // A's derived thumbnail no longer points at the deleted photo.
        let album_a = db.album(&AlbumKey::new(7, "alice", "A")).unwrap().unwrap();
        assert_eq!(album_a.thumbnail_path, "/thumbs/p1");
    }

    #[test]
    fn content_change_clears_cached_artifacts() {
        let temp = tempdir().unwrap();
        let db = open_images(&temp);

        let mut listing = GalleryListing {
            account_id: 7,
            user_id: "alice".into(),
            albums: vec![remote_album("a1", 1)],
            photos: vec![remote_photo("a1", "p1")],
        };
        reconcile_gallery(&db, &listing).unwrap();

        let key = PhotoKey::new(7, "alice", "a1", "p1");
        let thumb = temp.path().join("p1-thumb");
        std::fs::write(&thumb, b"bytes").unwrap();
        db.set_photo_thumbnail_path(&key, &thumb.to_string_lossy())
            .unwrap();

        // The server re-encoded the photo: new timestamp.
        listing.photos[0].updated_timestamp = 9_999;
        let delta = reconcile_gallery(&db, &listing).unwrap();
        assert_eq!(delta.photos_updated, 1);

        let photo = db.photo(&key).unwrap().unwrap();
        assert_eq!(photo.thumbnail_path, "");
        assert_eq!(photo.updated_timestamp, 9_999);
        assert!(!thumb.exists(), "replaced artifact flushed after commit");
    }

    #[test]
    fn album_change_alone_is_a_move_preserving_artifacts() {
        let temp = tempdir().unwrap();
        let db = open_images(&temp);

        let mut listing = GalleryListing {
            account_id: 7,
            user_id: "alice".into(),
            albums: vec![remote_album("a1", 1), remote_album("a2", 0)],
            photos: vec![remote_photo("a1", "p1")],
        };
        reconcile_gallery(&db, &listing).unwrap();

        db.set_photo_thumbnail_path(&PhotoKey::new(7, "alice", "a1", "p1"), "/thumbs/p1")
            .unwrap();

        // Same content, different album.
        listing.albums[0].photo_count = 0;
        listing.albums[1].photo_count = 1;
        listing.photos[0].album_id = "a2".into();
        let delta = reconcile_gallery(&db, &listing).unwrap();

        assert_eq!(delta.photos_moved, 1);
        assert_eq!(delta.photos_updated, 0);
        assert_eq!(delta.photos_inserted, 0);
        assert_eq!(delta.photos_deleted, 0);

        let moved = db
            .photo(&PhotoKey::new(7, "alice", "a2", "p1"))
            .unwrap()
            .unwrap();
        assert_eq!(moved.thumbnail_path, "/thumbs/p1");
    }

    #[test]
    fn failing_pass_applies_nothing() {
        let temp = tempdir().unwrap();
        let db = open_images(&temp);

        let seed = GalleryListing {
            account_id: 7,
            user_id: "alice".into(),
            albums: vec![remote_album("a1", 1)],
            photos: vec![remote_photo("a1", "p1")],
        };
        reconcile_gallery(&db, &seed).unwrap();

        // A listing with an invalid photo fails partway through.
        let bad = GalleryListing {
            account_id: 7,
            user_id: "alice".into(),
            albums: vec![remote_album("a1", 2), remote_album("a2", 0)],
            photos: vec![remote_photo("a1", "p2"), remote_photo("a1", "")],
        };
        assert!(reconcile_gallery(&db, &bad).is_err());

        // Nothing from the failed pass is visible.
        let albums = db.albums(&AlbumFilter::default()).unwrap();
        assert_eq!(albums.len(), 1);
        assert_eq!(albums[0].photo_count, 1);
        let photos = db.photos(&PhotoFilter::default()).unwrap();
        assert_eq!(photos.len(), 1);
        assert_eq!(photos[0].photo_id, "p1");
    }

    #[derive(Default)]
    struct MockRemote {
        deletes: Mutex<Vec<String>>,
        delete_all_calls: Mutex<usize>,
    }

    impl EventRemote for MockRemote {
        fn delete_event(&self, _account_id: i64, event_id: &str) -> Result<(), String> {
            self.deletes.lock().push(event_id.to_string());
            Ok(())
        }

        fn delete_all_events(&self, _account_id: i64) -> Result<(), String> {
            *self.delete_all_calls.lock() += 1;
            Ok(())
        }
    }

    fn seed_events(db: &EventDatabase, ids: &[&str]) {
        let listing = EventListing {
            account_id: 7,
            events: ids.iter().map(|id| remote_event(id)).collect(),
        };
        reconcile_events(db, &listing, &MockRemote::default()).unwrap();
    }

    #[test]
    fn events_first_pass_and_idempotence() {
        let temp = tempdir().unwrap();
        let db = open_events(&temp);
        let remote = MockRemote::default();

        let listing = EventListing {
            account_id: 7,
            events: vec![remote_event("e1"), remote_event("e2")],
        };

        let first = reconcile_events(&db, &listing, &remote).unwrap();
        assert_eq!(first.inserted, 2);

        let second = reconcile_events(&db, &listing, &remote).unwrap();
        assert_eq!(second, EventsDelta::default());
        assert!(remote.deletes.lock().is_empty());
        assert_eq!(*remote.delete_all_calls.lock(), 0);
    }

    #[test]
    fn remote_removals_are_applied_locally() {
        let temp = tempdir().unwrap();
        let db = open_events(&temp);
        seed_events(&db, &["e1", "e2", "e3"]);

        let listing = EventListing {
            account_id: 7,
            events: vec![remote_event("e2")],
        };
        let delta = reconcile_events(&db, &listing, &MockRemote::default()).unwrap();
        assert_eq!(delta.deleted, 2);

        let remaining = db.events(&EventFilter::default()).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].event_id, "e2");
    }

    #[test]
    fn tombstones_covering_the_whole_remote_set_use_delete_all() {
        let temp = tempdir().unwrap();
        let db = open_events(&temp);
        seed_events(&db, &["e1", "e2", "e3"]);
        for id in ["e1", "e2", "e3"] {
            db.flag_event_for_deletion(&EventKey::new(7, id)).unwrap();
        }

        let remote = MockRemote::default();
        let listing = EventListing {
            account_id: 7,
            events: vec![remote_event("e1"), remote_event("e2"), remote_event("e3")],
        };
        let delta = reconcile_events(&db, &listing, &remote).unwrap();

        assert!(delta.remote_delete_all);
        assert!(delta.remote_deletes.is_empty());
        assert_eq!(*remote.delete_all_calls.lock(), 1);
        assert!(remote.deletes.lock().is_empty());
        // Tombstones survive until the server stops listing the events.
        assert_eq!(db.events(&EventFilter::default()).unwrap().len(), 3);
    }

    #[test]
    fn partial_tombstones_use_per_id_deletes_and_upsert_the_rest() {
        let temp = tempdir().unwrap();
        let db = open_events(&temp);
        seed_events(&db, &["e1", "e2"]);
        db.flag_event_for_deletion(&EventKey::new(7, "e1")).unwrap();
        db.flag_event_for_deletion(&EventKey::new(7, "e2")).unwrap();

        let remote = MockRemote::default();
        let listing = EventListing {
            account_id: 7,
            events: vec![remote_event("e1"), remote_event("e2"), remote_event("e3")],
        };
        let delta = reconcile_events(&db, &listing, &remote).unwrap();

        assert!(!delta.remote_delete_all);
        assert_eq!(delta.remote_deletes, vec!["e1", "e2"]);
        assert_eq!(delta.inserted, 1, "e3 upserted locally");
        assert_eq!(*remote.delete_all_calls.lock(), 0);
        assert_eq!(*remote.deletes.lock(), vec!["e1", "e2"]);

        // The tombstoned rows were not resurrected by the upsert loop.
        let e1 = db.event(&EventKey::new(7, "e1")).unwrap().unwrap();
        assert!(e1.deleted_locally);
    }

    #[test]
    fn unchanged_image_url_keeps_the_cached_artifact() {
        let temp = tempdir().unwrap();
        let db = open_events(&temp);

        let mut listing = EventListing {
            account_id: 7,
            events: vec![{
                let mut e = remote_event("e1");
                e.image_url = "https://cloud/img".into();
                e
            }],
        };
        reconcile_events(&db, &listing, &MockRemote::default()).unwrap();
        db.set_event_image_path(&EventKey::new(7, "e1"), "/imgs/e1")
            .unwrap();

        // Subject changed, image did not.
        listing.events[0].event_subject = "Edited".into();
        let delta = reconcile_events(&db, &listing, &MockRemote::default()).unwrap();
        assert_eq!(delta.updated, 1);

        let event = db.event(&EventKey::new(7, "e1")).unwrap().unwrap();
        assert_eq!(event.image_path, "/imgs/e1");
        assert_eq!(event.event_subject, "Edited");
    }

    #[test]
    fn empty_remote_set_never_triggers_delete_all() {
        let temp = tempdir().unwrap();
        let db = open_events(&temp);
        seed_events(&db, &["e1"]);
        db.flag_event_for_deletion(&EventKey::new(7, "e1")).unwrap();

        let remote = MockRemote::default();
        let listing = EventListing {
            account_id: 7,
            events: vec![],
        };
        let delta = reconcile_events(&db, &listing, &remote).unwrap();

        assert_eq!(delta.deleted, 1);
        assert!(!delta.remote_delete_all);
        assert_eq!(*remote.delete_all_calls.lock(), 0);
        assert!(remote.deletes.lock().is_empty());
    }
}
