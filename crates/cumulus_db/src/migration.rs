//! Schema definitions and versioned upgrades.
//!
//! Each cache database carries its schema version in SQLite's `user_version`
//! field. A [`SchemaDef`] describes the full current schema plus the ordered
//! list of [`UpgradeStep`]s that bring an older file up to date. Steps are
//! applied strictly in sequence by the upgrade-authority process; a step that
//! fails, or a sequence that does not monotonically advance the version,
//! aborts the open with an upgrade error. Old files are never silently
//! skipped past.

use crate::error::{DbError, DbResult};
use rusqlite::Connection;
use tracing::info;

/// A single versioned upgrade step.
///
/// `statements` run first (typically `ALTER TABLE … ADD COLUMN`), then the
/// optional `backfill` function rewrites rows that predate the new columns.
#[derive(Clone, Copy)]
pub struct UpgradeStep {
    /// The schema version this step upgrades the database *to*.
    pub to_version: u32,
    /// DDL statements applied in order.
    pub statements: &'static [&'static str],
    /// Optional row rewrite run after the DDL.
    pub backfill: Option<fn(&Connection) -> DbResult<()>>,
}

impl std::fmt::Debug for UpgradeStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeStep")
            .field("to_version", &self.to_version)
            .field("statements", &self.statements.len())
            .field("backfill", &self.backfill.is_some())
            .finish()
    }
}

/// Full description of a concrete schema.
#[derive(Debug, Clone, Copy)]
pub struct SchemaDef {
    /// Schema name, used in logging.
    pub name: &'static str,
    /// Current schema version; fresh databases are stamped with this.
    pub version: u32,
    /// DDL creating the full current schema from scratch.
    pub create_statements: &'static [&'static str],
    /// Ordered upgrade steps for files stamped at older versions.
    pub upgrades: &'static [UpgradeStep],
}

impl SchemaDef {
    /// Validates that the upgrade steps are strictly increasing and end at
    /// the current version.
    pub fn validate(&self) -> DbResult<()> {
        let mut previous = 0u32;
        for step in self.upgrades {
            if step.to_version <= previous {
                return Err(DbError::upgrade(format!(
                    "{}: upgrade step to version {} does not advance past {}",
                    self.name, step.to_version, previous
                )));
            }
            previous = step.to_version;
        }
        if let Some(last) = self.upgrades.last() {
            if last.to_version != self.version {
                return Err(DbError::upgrade(format!(
                    "{}: upgrade steps end at version {}, expected {}",
                    self.name, last.to_version, self.version
                )));
            }
        }
        Ok(())
    }

    /// Applies every upgrade step past `from`, returning the final version.
    ///
    /// Each step runs its DDL, then its backfill, then stamps the new
    /// version. Failure of any part aborts with [`DbError::Upgrade`]; so does
    /// a step that would not advance the stored version (cycle detected).
    pub fn apply_upgrades(&self, conn: &Connection, from: u32) -> DbResult<u32> {
        if from > self.version {
            return Err(DbError::upgrade(format!(
                "{}: database version {} is newer than supported version {}",
                self.name, from, self.version
            )));
        }

        let mut current = from;
        for step in self.upgrades {
            if step.to_version <= from {
                // Already applied before this file was last stamped.
                continue;
            }
            if step.to_version <= current {
                return Err(DbError::upgrade(format!(
                    "{}: upgrade cycle detected at version {}",
                    self.name, step.to_version
                )));
            }

            for statement in step.statements {
                conn.execute_batch(statement).map_err(|e| {
                    DbError::upgrade(format!(
                        "{}: step to version {} failed: {e}",
                        self.name, step.to_version
                    ))
                })?;
            }
            if let Some(backfill) = step.backfill {
                backfill(conn).map_err(|e| {
                    DbError::upgrade(format!(
                        "{}: backfill for version {} failed: {e}",
                        self.name, step.to_version
                    ))
                })?;
            }

            write_user_version(conn, step.to_version)?;
            info!(
                schema = self.name,
                from = current,
                to = step.to_version,
                "applied schema upgrade step"
            );
            current = step.to_version;
        }

        if current != self.version {
            return Err(DbError::upgrade(format!(
                "{}: upgrades ended at version {}, expected {}",
                self.name, current, self.version
            )));
        }
        Ok(current)
    }
}

/// Reads the schema version stored in the database file.
pub fn read_user_version(conn: &Connection) -> DbResult<u32> {
    let version: i64 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| DbError::version_query(e.to_string()))?;
    u32::try_from(version).map_err(|_| {
        DbError::version_query(format!("stored user_version {version} is out of range"))
    })
}

/// Stamps the schema version into the database file.
pub fn write_user_version(conn: &Connection, version: u32) -> DbResult<()> {
    conn.execute_batch(&format!("PRAGMA user_version = {version}"))
        .map_err(|e| DbError::upgrade(format!("cannot stamp user_version {version}: {e}")))
}
