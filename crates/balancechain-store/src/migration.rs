//! Database schema migrations for SQLite.
//!
//! A simple versioned migration system. Each migration transforms the
//! schema from version N to N+1; upgrading creates missing tables and
//! indices without data loss.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }

        tx.commit()?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {version}"
        ))),
    }
}

/// Migration v1: the eight core collections.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Meta: chain head/len, read-only latch, subscriptions, payments
        CREATE TABLE meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL               -- JSON
        );

        -- The chain itself, one row per segment
        CREATE TABLE state_chain (
            seq INTEGER PRIMARY KEY,
            nonce TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL,
            ts INTEGER NOT NULL,
            body TEXT NOT NULL                -- canonical JSON of the segment
        );

        -- Replay protection
        CREATE TABLE sync_log (
            nonce TEXT PRIMARY KEY,
            ts INTEGER NOT NULL
        );

        -- Per-chat message projection
        CREATE TABLE messages (
            id TEXT PRIMARY KEY,              -- "{seq}:{nonce}"
            seq INTEGER NOT NULL,
            peer TEXT NOT NULL,
            ts INTEGER NOT NULL,
            tag TEXT,
            body TEXT NOT NULL                -- JSON MessageRecord
        );

        -- The owning identity, keyed "primary"
        CREATE TABLE identity (
            id TEXT PRIMARY KEY,
            body TEXT NOT NULL
        );

        -- Quota counters, keyed "{period}:{hid}"
        CREATE TABLE caps (
            key TEXT PRIMARY KEY,
            count INTEGER NOT NULL,
            resets_at INTEGER
        );

        -- Capsule records
        CREATE TABLE capsules (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            body TEXT NOT NULL                -- JSON CapsuleRecord
        );

        -- TVM balances
        CREATE TABLE tvm_balance (
            hid TEXT PRIMARY KEY,
            amount REAL NOT NULL
        );

        -- Indexes for common queries
        CREATE INDEX idx_state_chain_kind ON state_chain(kind);
        CREATE INDEX idx_state_chain_ts ON state_chain(ts);
        CREATE INDEX idx_sync_log_ts ON sync_log(ts);
        CREATE INDEX idx_messages_seq ON messages(seq);
        CREATE INDEX idx_messages_peer ON messages(peer);
        CREATE INDEX idx_messages_ts ON messages(ts);
        CREATE INDEX idx_messages_tag ON messages(tag);
        CREATE INDEX idx_capsules_session ON capsules(session_id);
        CREATE INDEX idx_capsules_status ON capsules(status);
        CREATE INDEX idx_capsules_created ON capsules(created_at);
        "#,
    )?;

    Ok(())
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "meta",
            "state_chain",
            "sync_log",
            "messages",
            "identity",
            "caps",
            "capsules",
            "tvm_balance",
            "schema_migrations",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn test_migration_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }
}
