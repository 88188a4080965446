//! On-disk layout for cache databases and downloaded artifacts.
//!
//! Everything lives under one private application-data root:
//!
//! ```text
//! <root>/
//! ├─ images.db
//! ├─ images/<account>/<user>/<album>/thumbnails/<file>
//! ├─ images/<account>/<user>/<album>/photos/<file>
//! ├─ images/<account>/<user>/avatar
//! ├─ posts.db
//! └─ posts/<account>/<event>.img
//! ```

use crate::model::{PhotoKey, UserKey};
use std::path::{Path, PathBuf};

/// Database file name for the images cache.
pub const IMAGES_DB: &str = "images.db";
/// Database file name for the posts/events cache.
pub const POSTS_DB: &str = "posts.db";

/// Replaces path separators so remote identifiers stay inside one segment.
fn segment(id: &str) -> String {
    id.replace(['/', '\\'], "_")
}

/// Directory holding artifacts for one album.
fn album_dir(root: &Path, key: &PhotoKey) -> PathBuf {
    root.join("images")
        .join(key.account_id.to_string())
        .join(segment(&key.user_id))
        .join(segment(&key.album_id))
}

/// Local path for a photo's thumbnail artifact.
#[must_use]
pub fn photo_thumbnail_path(root: &Path, key: &PhotoKey, file_name: &str) -> PathBuf {
    let name = if file_name.is_empty() {
        segment(&key.photo_id)
    } else {
        segment(file_name)
    };
    album_dir(root, key).join("thumbnails").join(name)
}

/// Local path for a photo's full-size artifact.
#[must_use]
pub fn photo_image_path(root: &Path, key: &PhotoKey, file_name: &str) -> PathBuf {
    let name = if file_name.is_empty() {
        segment(&key.photo_id)
    } else {
        segment(file_name)
    };
    album_dir(root, key).join("photos").join(name)
}

/// Local path for a user's avatar artifact.
#[must_use]
pub fn user_thumbnail_path(root: &Path, key: &UserKey) -> PathBuf {
    root.join("images")
        .join(key.account_id.to_string())
        .join(segment(&key.user_id))
        .join("avatar")
}

/// Local path for an event's image artifact.
#[must_use]
pub fn event_image_path(root: &Path, account_id: i64, event_id: &str) -> PathBuf {
    root.join("posts")
        .join(account_id.to_string())
        .join(format!("{}.img", segment(event_id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn photo_paths_are_keyed_by_account_user_album() {
        let key = PhotoKey::new(7, "alice", "holiday", "p1");
        let thumb = photo_thumbnail_path(Path::new("/data"), &key, "beach.jpg");
        assert_eq!(
            thumb,
            Path::new("/data/images/7/alice/holiday/thumbnails/beach.jpg")
        );

        let image = photo_image_path(Path::new("/data"), &key, "");
        assert_eq!(image, Path::new("/data/images/7/alice/holiday/photos/p1"));
    }

    #[test]
    fn identifiers_cannot_escape_their_segment() {
        let key = PhotoKey::new(7, "../etc", "a/b", "p1");
        let path = photo_thumbnail_path(Path::new("/data"), &key, "x.jpg");
        assert_eq!(
            path,
            Path::new("/data/images/7/.._etc/a_b/thumbnails/x.jpg")
        );
    }

    #[test]
    fn event_image_path_layout() {
        let path = event_image_path(Path::new("/data"), 7, "ev-1");
        assert_eq!(path, Path::new("/data/posts/7/ev-1.img"));
    }
}
