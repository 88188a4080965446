//! Schema-specific transaction hooks.
//!
//! The generic core knows nothing about users, albums or events; concrete
//! schemas attach their commit-time behavior (thumbnail repair, stale-file
//! flushing, change signals) through this capability interface. The core
//! holds the hooks value and calls it at fixed points in the transaction
//! lifecycle; it never sees concrete schema types.

use crate::error::DbResult;
use rusqlite::Connection;

/// Commit and rollback hooks implemented by each concrete schema.
///
/// Call ordering for a successful commit:
///
/// 1. [`prepare_commit`](Self::prepare_commit): still inside the SQL
///    transaction; may read and write.
/// 2. SQL `COMMIT`.
/// 3. [`on_committed_pre_unlock`](Self::on_committed_pre_unlock): the
///    cross-process write lock is still held, so no peer can start a
///    conflicting transaction while per-commit side-effect lists are
///    snapshotted.
/// 4. The write lock is released.
/// 5. [`on_committed_post_unlock`](Self::on_committed_post_unlock): runs
///    without the lock so notification listeners can immediately start their
///    own transactions without deadlocking.
///
/// On rollback only [`on_rolled_back`](Self::on_rolled_back) runs, which must
/// discard any pending side-effect lists.
pub trait SchemaHooks {
    /// Runs inside the transaction, immediately before the SQL commit.
    ///
    /// This is where schemas do consistency repair that depends on the full
    /// set of changes in the transaction (for example re-deriving album
    /// thumbnails after photo deletions).
    fn prepare_commit(&self, conn: &Connection) -> DbResult<()> {
        let _ = conn;
        Ok(())
    }

    /// Runs after the SQL commit while the write lock is still held.
    fn on_committed_pre_unlock(&self) {}

    /// Runs after the write lock has been released.
    fn on_committed_post_unlock(&self) {}

    /// Runs after a SQL rollback; pending side effects must be discarded.
    fn on_rolled_back(&self) {}
}

/// Hooks implementation that does nothing.
///
/// Useful for schemas without commit-time side effects and for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl SchemaHooks for NoHooks {}
