//! SQLite schema, versioned.
//!
//! `MIGRATIONS[i]` moves the schema from version `i` to `i + 1`. The applied
//! version lives in SQLite's `user_version` pragma, so an opened database
//! needs no bookkeeping table.

use rusqlite::Connection;
use tracing::debug;

use crate::error::{Result, StoreError};

/// Ordered schema steps. Append only; never edit a shipped step.
const MIGRATIONS: &[&str] = &[
    // v1: friends, the message log and string settings.
    r#"
    CREATE TABLE friends (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        peer_key BLOB NOT NULL UNIQUE,
        added_at INTEGER NOT NULL
    );

    CREATE TABLE messages (
        hash BLOB PRIMARY KEY,
        peer BLOB NOT NULL,
        timestamp INTEGER NOT NULL,
        canonical_bytes BLOB NOT NULL,
        stored_at INTEGER NOT NULL
    );

    CREATE TABLE settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    "#,
    // v2: conversation windows are read newest-first per peer.
    r#"
    CREATE INDEX idx_messages_peer_time ON messages(peer, timestamp DESC, hash DESC);
    "#,
];

/// Schema version this build writes.
pub const CURRENT_VERSION: u32 = MIGRATIONS.len() as u32;

fn user_version(conn: &Connection) -> Result<u32> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

/// Bring `conn` up to [`CURRENT_VERSION`]. Safe to call on every open.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    let found = user_version(conn)?;
    if found > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "schema version {} is newer than this build ({})",
            found, CURRENT_VERSION
        )));
    }

    let tx = conn.transaction()?;
    for (index, step) in MIGRATIONS.iter().enumerate().skip(found as usize) {
        tx.execute_batch(step)?;
        debug!(version = index + 1, "applied schema step");
    }
    tx.pragma_update(None, "user_version", CURRENT_VERSION)?;
    tx.commit()?;
    Ok(())
}

/// Wall-clock milliseconds, for bookkeeping columns only.
pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type IN ('table', 'index') ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_fresh_database_reaches_current_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        assert_eq!(user_version(&conn).unwrap(), CURRENT_VERSION);
        let names = tables(&conn);
        for expected in ["friends", "messages", "settings", "idx_messages_peer_time"] {
            assert!(names.iter().any(|n| n == expected), "missing {}", expected);
        }
    }

    #[test]
    fn test_migrate_twice_is_noop() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();
        assert_eq!(user_version(&conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn test_partial_database_is_upgraded() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(MIGRATIONS[0]).unwrap();
        conn.pragma_update(None, "user_version", 1u32).unwrap();

        migrate(&mut conn).unwrap();
        assert!(tables(&conn).iter().any(|n| n == "idx_messages_peer_time"));
    }

    #[test]
    fn test_newer_schema_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", CURRENT_VERSION + 1)
            .unwrap();
        assert!(matches!(migrate(&mut conn), Err(StoreError::Migration(_))));
    }
}
