//! # Cumulus Cache
//!
//! Domain caches, delta reconciliation and service façades for Cumulus.
//!
//! This crate provides:
//! - The images cache (users, albums, photos) and the posts/events cache,
//!   as concrete schemas over the `cumulus_db` core
//! - Delta reconciliation of remote listings (server-authoritative, one
//!   transaction per pass, never partially applied)
//! - Album thumbnail consistency and stale-artifact cleanup tied to commit
//! - A per-cache worker thread with an asynchronous request/reply API
//! - Idempotency-token-keyed artifact population backed by `cumulus_fetch`
//!
//! ## Architecture
//!
//! ```text
//! protocol client ──listing──▶ reconcile ──▶ ImageDatabase / EventDatabase
//!                                                   │
//!                                             cumulus_db core
//!                                  (process mutex, hooks, change signal)
//! ```
//!
//! All calls for one cache instance run on its single worker thread;
//! downloads multiplex cooperatively on that thread's event loop.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod events;
mod feed;
mod images;
mod model;
pub mod paths;
mod reconcile;
mod service;
mod worker;

pub use config::CacheConfig;
pub use error::{CacheError, CacheResult};
pub use events::{EventDatabase, EventsHooks, EVENTS_SCHEMA, EVENTS_SCHEMA_VERSION};
pub use feed::{CacheChange, CacheFeed};
pub use images::{ImageDatabase, ImagesHooks, IMAGES_SCHEMA, IMAGES_SCHEMA_VERSION};
pub use model::{
    Album, AlbumFilter, AlbumKey, Event, EventFilter, EventKey, EventListing, GalleryListing,
    Photo, PhotoFilter, PhotoKey, RemoteAlbum, RemoteEvent, RemotePhoto, StoreOutcome, User,
    UserFilter, UserKey,
};
pub use reconcile::{
    reconcile_events, reconcile_gallery, EventRemote, EventsDelta, GalleryDelta,
};
pub use service::{GalleryService, PopulateOutcome, PostsService};
pub use worker::{Completion, Reply, TaskRunner};
