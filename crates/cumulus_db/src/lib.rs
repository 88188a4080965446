//! # Cumulus DB
//!
//! Generic transactional SQLite core for Cumulus caches.
//!
//! This crate provides:
//! - Open-or-create of a single-file cache database with pragma configuration
//! - Schema versioning with ordered, monotonic upgrade steps
//! - ACID transactions serialized by a cross-process write mutex
//! - Schema-specific commit/rollback hooks ([`SchemaHooks`])
//! - A templated fetch/store/delete query pipeline
//! - A cross-process "data changed" broadcast
//!
//! ## Key invariants
//!
//! - Exactly one process writes at a time, database-wide; serialization comes
//!   from [`cumulus_lock::ProcessMutex`], not from SQLite's busy handler.
//! - Only the upgrade-authority process (the first to connect) migrates the
//!   schema; everyone else verifies the stored version and fails hard on a
//!   mismatch.
//! - Per-commit side effects (stale-file deletion, change notifications) are
//!   ordered around the lock release: snapshotting happens while the lock is
//!   held, emission after it is released.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod database;
mod error;
mod hooks;
mod migration;
mod notify;

pub use config::DbConfig;
pub use database::Database;
pub use error::{DbError, DbResult};
pub use hooks::{NoHooks, SchemaHooks};
pub use migration::{read_user_version, write_user_version, SchemaDef, UpgradeStep};
pub use notify::{ChangeSignal, ChangeWatcher};

// Re-exported so schema crates use the same rusqlite version for row mapping.
pub use rusqlite;
