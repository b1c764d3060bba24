//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use rusqlite::Connection;

use cosync_core::now_millis;

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

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

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
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: CoValues, sessions, transactions and signature checkpoints.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE coValues (
            rowID INTEGER PRIMARY KEY,
            id TEXT NOT NULL UNIQUE,          -- co_z...
            header TEXT NOT NULL              -- header JSON
        );

        CREATE TABLE sessions (
            rowID INTEGER PRIMARY KEY,
            coValue INTEGER NOT NULL,
            sessionID TEXT NOT NULL,
            lastIdx INTEGER NOT NULL,         -- number of stored transactions
            lastSignature TEXT NOT NULL,
            bytesSinceLastSignature INTEGER NOT NULL DEFAULT 0,
            UNIQUE (sessionID, coValue)
        );

        CREATE TABLE transactions (
            ses INTEGER NOT NULL,
            idx INTEGER NOT NULL,
            tx TEXT NOT NULL,                 -- transaction JSON
            PRIMARY KEY (ses, idx)
        );

        CREATE TABLE signatureAfter (
            ses INTEGER NOT NULL,
            idx INTEGER NOT NULL,
            signature TEXT NOT NULL,
            PRIMARY KEY (ses, idx)
        );

        CREATE INDEX sessionsByCoValue ON sessions (coValue);
        "#,
    )?;

    Ok(())
}
