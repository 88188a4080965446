//! In-process change feed for committed cache mutations.
//!
//! UI list models subscribe to a cache's feed and reconcile incrementally
//! instead of re-querying whole tables. Events are aggregates (one event per
//! entity kind per committed transaction, carrying the affected rows) and
//! are emitted only after the commit, never for rolled-back work.

use crate::model::{Album, AlbumKey, Event, EventKey, Photo, PhotoKey, User, UserKey};
use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver, Sender};

/// A committed cache mutation, delivered to feed subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheChange {
    /// Users inserted or updated.
    UsersStored(Vec<User>),
    /// Users removed.
    UsersDeleted(Vec<UserKey>),
    /// Albums inserted or updated.
    AlbumsStored(Vec<Album>),
    /// Albums removed.
    AlbumsDeleted(Vec<AlbumKey>),
    /// Photos inserted or updated.
    PhotosStored(Vec<Photo>),
    /// Photos removed.
    PhotosDeleted(Vec<PhotoKey>),
    /// Events inserted or updated.
    EventsStored(Vec<Event>),
    /// Events removed.
    EventsDeleted(Vec<EventKey>),
}

/// Distributes committed changes to subscribers.
///
/// Thread-safe; emission order follows commit order because all commits for
/// one cache happen on its single worker thread.
#[derive(Debug, Default)]
pub struct CacheFeed {
    subscribers: RwLock<Vec<Sender<CacheChange>>>,
}

impl CacheFeed {
    /// Creates an empty feed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to the feed.
    ///
    /// Returns a receiver that observes every change committed after this
    /// call. Dropping the receiver unsubscribes on the next emission.
    pub fn subscribe(&self) -> Receiver<CacheChange> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Emits one change to all live subscribers.
    pub fn emit(&self, change: CacheChange) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(change.clone()).is_ok());
    }

    /// Returns the number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn emit_and_receive() {
        let feed = CacheFeed::new();
        let rx = feed.subscribe();

        let change = CacheChange::UsersDeleted(vec![UserKey::new(7, "alice")]);
        feed.emit(change.clone());

        let received = rx.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(received, change);
    }

    #[test]
    fn multiple_subscribers_see_every_change() {
        let feed = CacheFeed::new();
        let rx1 = feed.subscribe();
        let rx2 = feed.subscribe();

        feed.emit(CacheChange::PhotosDeleted(vec![]));

        assert!(rx1.recv_timeout(Duration::from_millis(100)).is_ok());
        assert!(rx2.recv_timeout(Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn dropped_subscribers_are_cleaned_up() {
        let feed = CacheFeed::new();
        let rx = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 1);

        drop(rx);
        feed.emit(CacheChange::AlbumsDeleted(vec![]));
        assert_eq!(feed.subscriber_count(), 0);
    }
}
