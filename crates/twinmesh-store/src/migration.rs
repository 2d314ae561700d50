//! SQLite schema migrations.
//!
//! Entry `i` of [`MIGRATIONS`] takes the schema from version `i` to `i + 1`.
//! Applied versions are recorded in `schema_migrations`.

use rusqlite::{params, Connection};
use tracing::debug;

use crate::error::{Result, StoreError};

const MIGRATIONS: &[&str] = &[
    // v1: sealed blobs, opaque to the store
    "CREATE TABLE blobs (
        key TEXT PRIMARY KEY,
        value BLOB NOT NULL
    );",
    // v2: write timestamps, for spotting stale snapshots
    "ALTER TABLE blobs ADD COLUMN updated_at INTEGER NOT NULL DEFAULT 0;",
];

/// Schema version this build writes.
pub const CURRENT_VERSION: u32 = MIGRATIONS.len() as u32;

/// Bring the schema up to [`CURRENT_VERSION`]. Safe to run on every open.
///
/// A database written by a newer build is refused rather than touched.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        );",
    )?;
    let found: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if found > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "schema v{} is newer than supported v{}",
            found, CURRENT_VERSION
        )));
    }
    if found == CURRENT_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for (version, sql) in (1u32..).zip(MIGRATIONS).skip(found as usize) {
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, twinmesh_core::now_millis()],
        )?;
    }
    tx.commit()?;
    debug!(from = found, to = CURRENT_VERSION, "migrated store schema");
    Ok(())
}
