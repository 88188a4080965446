//! Row types, composite keys, filters and remote-listing inputs.
//!
//! Rows mirror the cache tables one to one; the remote types mirror what the
//! protocol client parses out of server responses and feeds to the delta
//! engines. Keys are composite; `etag` is carried as metadata but is never
//! part of identity.

use crate::error::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};

/// Identity of a user row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserKey {
    /// OS account the row belongs to.
    pub account_id: i64,
    /// Cloud-side user identifier.
    pub user_id: String,
}

impl UserKey {
    /// Creates a user key.
    pub fn new(account_id: i64, user_id: impl Into<String>) -> Self {
        Self {
            account_id,
            user_id: user_id.into(),
        }
    }

    /// Rejects empty key fields before any I/O happens.
    pub fn validate(&self) -> CacheResult<()> {
        if self.account_id == 0 {
            return Err(CacheError::invalid_argument("account id is required"));
        }
        if self.user_id.is_empty() {
            return Err(CacheError::invalid_argument("user id is required"));
        }
        Ok(())
    }
}

/// Identity of an album row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlbumKey {
    /// OS account the row belongs to.
    pub account_id: i64,
    /// Cloud-side user identifier.
    pub user_id: String,
    /// Cloud-side album identifier.
    pub album_id: String,
}

impl AlbumKey {
    /// Creates an album key.
    pub fn new(account_id: i64, user_id: impl Into<String>, album_id: impl Into<String>) -> Self {
        Self {
            account_id,
            user_id: user_id.into(),
            album_id: album_id.into(),
        }
    }

    /// Rejects empty key fields before any I/O happens.
    pub fn validate(&self) -> CacheResult<()> {
        UserKey::new(self.account_id, self.user_id.clone()).validate()?;
        if self.album_id.is_empty() {
            return Err(CacheError::invalid_argument("album id is required"));
        }
        Ok(())
    }
}

/// Identity of a photo row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhotoKey {
    /// OS account the row belongs to.
    pub account_id: i64,
    /// Cloud-side user identifier.
    pub user_id: String,
    /// Album the photo currently belongs to.
    pub album_id: String,
    /// Cloud-side photo identifier.
    pub photo_id: String,
}

impl PhotoKey {
    /// Creates a photo key.
    pub fn new(
        account_id: i64,
        user_id: impl Into<String>,
        album_id: impl Into<String>,
        photo_id: impl Into<String>,
    ) -> Self {
        Self {
            account_id,
            user_id: user_id.into(),
            album_id: album_id.into(),
            photo_id: photo_id.into(),
        }
    }

    /// Rejects empty key fields before any I/O happens.
    pub fn validate(&self) -> CacheResult<()> {
        AlbumKey::new(self.account_id, self.user_id.clone(), self.album_id.clone()).validate()?;
        if self.photo_id.is_empty() {
            return Err(CacheError::invalid_argument("photo id is required"));
        }
        Ok(())
    }
}

/// Identity of a notification event row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKey {
    /// OS account the row belongs to.
    pub account_id: i64,
    /// Cloud-side event identifier.
    pub event_id: String,
}

impl EventKey {
    /// Creates an event key.
    pub fn new(account_id: i64, event_id: impl Into<String>) -> Self {
        Self {
            account_id,
            event_id: event_id.into(),
        }
    }

    /// Rejects empty key fields before any I/O happens.
    pub fn validate(&self) -> CacheResult<()> {
        if self.account_id == 0 {
            return Err(CacheError::invalid_argument("account id is required"));
        }
        if self.event_id.is_empty() {
            return Err(CacheError::invalid_argument("event id is required"));
        }
        Ok(())
    }
}

/// A cached cloud user.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct User {
    /// OS account the row belongs to.
    pub account_id: i64,
    /// Cloud-side user identifier.
    pub user_id: String,
    /// Display name shown in the UI.
    pub display_name: String,
    /// Remote avatar URL.
    pub thumbnail_url: String,
    /// Local avatar artifact path; empty until downloaded.
    pub thumbnail_path: String,
    /// Remote avatar file name.
    pub thumbnail_file_name: String,
}

impl User {
    /// Returns the row's key.
    #[must_use]
    pub fn key(&self) -> UserKey {
        UserKey::new(self.account_id, self.user_id.clone())
    }
}

/// A cached photo album.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Album {
    /// OS account the row belongs to.
    pub account_id: i64,
    /// Cloud-side user identifier.
    pub user_id: String,
    /// Cloud-side album identifier.
    pub album_id: String,
    /// Parent album, empty at the root.
    pub parent_album_id: String,
    /// Display name.
    pub album_name: String,
    /// Number of photos the server reports for this album.
    pub photo_count: i64,
    /// Remote thumbnail URL when the album is pinned to its own cover.
    /// Empty means the thumbnail is derived from the album's photos.
    pub thumbnail_url: String,
    /// Local thumbnail artifact path; empty until downloaded or derived.
    pub thumbnail_path: String,
    /// File name backing the thumbnail.
    pub thumbnail_file_name: String,
    /// Server version tag; metadata only, never compared here.
    pub etag: String,
}

impl Album {
    /// Returns the row's key.
    #[must_use]
    pub fn key(&self) -> AlbumKey {
        AlbumKey::new(self.account_id, self.user_id.clone(), self.album_id.clone())
    }
}

/// A cached photo.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Photo {
    /// OS account the row belongs to.
    pub account_id: i64,
    /// Cloud-side user identifier.
    pub user_id: String,
    /// Album the photo currently belongs to.
    pub album_id: String,
    /// Cloud-side photo identifier.
    pub photo_id: String,
    /// Remote file name.
    pub file_name: String,
    /// Human-readable album path for display.
    pub album_path: String,
    /// Free-form description.
    pub description: String,
    /// Creation time, Unix seconds.
    pub created_timestamp: i64,
    /// Last modification time, Unix seconds.
    pub updated_timestamp: i64,
    /// Remote thumbnail URL.
    pub thumbnail_url: String,
    /// Local thumbnail artifact path; empty until downloaded.
    pub thumbnail_path: String,
    /// Remote full-size image URL.
    pub image_url: String,
    /// Local full-size artifact path; empty until downloaded.
    pub image_path: String,
    /// Pixel width.
    pub width: i64,
    /// Pixel height.
    pub height: i64,
    /// File size in bytes.
    pub file_size: i64,
    /// Lowercased file type suffix, e.g. `jpg`.
    pub file_type: String,
    /// Server version tag; metadata only, never compared here.
    pub etag: String,
}

impl Photo {
    /// Returns the row's key.
    #[must_use]
    pub fn key(&self) -> PhotoKey {
        PhotoKey::new(
            self.account_id,
            self.user_id.clone(),
            self.album_id.clone(),
            self.photo_id.clone(),
        )
    }
}

/// A cached notification event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Event {
    /// OS account the row belongs to.
    pub account_id: i64,
    /// Cloud-side event identifier.
    pub event_id: String,
    /// Subject line.
    pub event_subject: String,
    /// Body text.
    pub event_text: String,
    /// Link target for the event.
    pub event_url: String,
    /// Remote image URL, if the event carries one.
    pub image_url: String,
    /// Local image artifact path; empty until downloaded.
    pub image_path: String,
    /// Event time, Unix seconds.
    pub timestamp: i64,
    /// Tombstone flag: deleted locally, awaiting remote acknowledgment.
    pub deleted_locally: bool,
}

impl Event {
    /// Returns the row's key.
    #[must_use]
    pub fn key(&self) -> EventKey {
        EventKey::new(self.account_id, self.event_id.clone())
    }
}

/// Outcome of a store call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// No row existed for the key; one was inserted.
    Inserted,
    /// A row existed and differed; it was updated.
    Updated,
    /// A row existed and was already identical; nothing was written.
    Unchanged,
}

/// Filter for user queries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserFilter {
    /// Restrict to one OS account.
    pub account_id: Option<i64>,
}

/// Filter for album queries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlbumFilter {
    /// Restrict to one OS account.
    pub account_id: Option<i64>,
    /// Restrict to one cloud user.
    pub user_id: Option<String>,
}

/// Filter for photo queries and photo counting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhotoFilter {
    /// Restrict to one OS account.
    pub account_id: Option<i64>,
    /// Restrict to one cloud user.
    pub user_id: Option<String>,
    /// Restrict to one album.
    pub album_id: Option<String>,
}

/// Filter for event queries.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFilter {
    /// Restrict to one OS account.
    pub account_id: Option<i64>,
    /// Whether tombstoned rows are included. Defaults to `true`; the UI
    /// typically turns this off.
    pub include_tombstones: bool,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            account_id: None,
            include_tombstones: true,
        }
    }
}

/// An album as parsed from a remote gallery listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteAlbum {
    /// Cloud-side album identifier.
    pub album_id: String,
    /// Parent album, empty at the root.
    #[serde(default)]
    pub parent_album_id: String,
    /// Display name.
    #[serde(default)]
    pub album_name: String,
    /// Number of photos the server reports.
    #[serde(default)]
    pub photo_count: i64,
    /// Remote thumbnail URL when the album has its own cover.
    #[serde(default)]
    pub thumbnail_url: String,
    /// Server version tag.
    #[serde(default)]
    pub etag: String,
}

/// A photo as parsed from a remote gallery listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemotePhoto {
    /// Album the photo belongs to.
    pub album_id: String,
    /// Cloud-side photo identifier.
    pub photo_id: String,
    /// Remote file name.
    #[serde(default)]
    pub file_name: String,
    /// Human-readable album path.
    #[serde(default)]
    pub album_path: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Creation time, Unix seconds.
    #[serde(default)]
    pub created_timestamp: i64,
    /// Last modification time, Unix seconds.
    #[serde(default)]
    pub updated_timestamp: i64,
    /// Remote thumbnail URL.
    #[serde(default)]
    pub thumbnail_url: String,
    /// Remote full-size image URL.
    #[serde(default)]
    pub image_url: String,
    /// Pixel width.
    #[serde(default)]
    pub width: i64,
    /// Pixel height.
    #[serde(default)]
    pub height: i64,
    /// File size in bytes.
    #[serde(default)]
    pub file_size: i64,
    /// Lowercased file type suffix.
    #[serde(default)]
    pub file_type: String,
    /// Server version tag.
    #[serde(default)]
    pub etag: String,
}

/// One fully-parsed gallery subtree for one account/user pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GalleryListing {
    /// OS account the listing was fetched for.
    pub account_id: i64,
    /// Cloud user the listing was fetched for.
    pub user_id: String,
    /// The queried album, its direct sub-albums, and any others merged in.
    pub albums: Vec<RemoteAlbum>,
    /// Every photo contained in the listed albums.
    pub photos: Vec<RemotePhoto>,
}

/// A notification event as parsed from the remote notification list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteEvent {
    /// Cloud-side event identifier.
    pub event_id: String,
    /// Subject line.
    #[serde(default)]
    pub event_subject: String,
    /// Body text.
    #[serde(default)]
    pub event_text: String,
    /// Link target.
    #[serde(default)]
    pub event_url: String,
    /// Remote image URL, if any.
    #[serde(default)]
    pub image_url: String,
    /// Event time, Unix seconds.
    #[serde(default)]
    pub timestamp: i64,
}

/// The full remote notification list for one account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventListing {
    /// OS account the listing was fetched for.
    pub account_id: i64,
    /// Every event currently on the server.
    pub events: Vec<RemoteEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_validation_rejects_empty_fields() {
        assert!(UserKey::new(7, "alice").validate().is_ok());
        assert!(UserKey::new(0, "alice").validate().is_err());
        assert!(UserKey::new(7, "").validate().is_err());

        assert!(PhotoKey::new(7, "alice", "a1", "p1").validate().is_ok());
        assert!(PhotoKey::new(7, "alice", "", "p1").validate().is_err());
        assert!(PhotoKey::new(7, "alice", "a1", "").validate().is_err());

        assert!(EventKey::new(7, "e1").validate().is_ok());
        assert!(EventKey::new(7, "").validate().is_err());
    }

    #[test]
    fn rows_expose_their_keys() {
        let photo = Photo {
            account_id: 7,
            user_id: "alice".into(),
            album_id: "a1".into(),
            photo_id: "p1".into(),
            ..Photo::default()
        };
        assert_eq!(photo.key(), PhotoKey::new(7, "alice", "a1", "p1"));
    }

    #[test]
    fn remote_listing_deserializes_with_defaults() {
        let listing: GalleryListing = serde_json::from_str(
            r#"{
                "account_id": 7,
                "user_id": "alice",
                "albums": [{"album_id": "a1", "photo_count": 2}],
                "photos": [{"album_id": "a1", "photo_id": "p1"}]
            }"#,
        )
        .unwrap();

        assert_eq!(listing.albums[0].album_id, "a1");
        assert_eq!(listing.albums[0].photo_count, 2);
        assert_eq!(listing.albums[0].etag, "");
        assert_eq!(listing.photos[0].photo_id, "p1");
        assert_eq!(listing.photos[0].updated_timestamp, 0);
    }
}
