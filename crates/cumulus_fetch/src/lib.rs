//! # Cumulus Fetch
//!
//! Bounded-concurrency artifact downloads for Cumulus caches.
//!
//! This crate provides:
//! - A single-threaded download queue with an at-most-N-active invariant
//! - A per-download inactivity timeout (reset on every received chunk)
//! - Atomic save-then-commit artifact writes (no half-written files)
//! - A swappable byte source so tests run without a network
//!
//! Downloads complete with either the final artifact path or a structured
//! error; the caller persists the path into the owning cache row.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod manager;
mod source;

pub use error::FetchError;
pub use manager::{DownloadConfig, DownloadManager, DownloadRequest, DownloadResult};
pub use source::{ByteStream, ChunkSource, HttpSource};
