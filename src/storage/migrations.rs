//! Schema migrations for the relational event log
//!
//! Versions are tracked per event table, so one database file can hold
//! several logs.

use rusqlite::{params, Connection};

use crate::error::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Run all pending migrations for `table`
///
/// `table` must already be validated as a plain identifier.
pub fn run_migrations(conn: &Connection, table: &str) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            log_name TEXT NOT NULL,
            version INTEGER NOT NULL,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (log_name, version)
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version WHERE log_name = ?1",
        params![table],
        |row| row.get(0),
    )?;

    if current_version < 1 {
        migrate_v1(conn, table)?;
    }

    if current_version < SCHEMA_VERSION {
        migrate_v2(conn, table)?;
    }

    Ok(())
}

fn record_version(conn: &Connection, table: &str, version: i32) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (log_name, version) VALUES (?1, ?2)",
        params![table, version],
    )?;
    Ok(())
}

/// Event table (v1)
fn migrate_v1(conn: &Connection, table: &str) -> Result<()> {
    // AUTOINCREMENT: ids are never reused, even after the newest row is deleted
    conn.execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            category TEXT NOT NULL,
            type TEXT NOT NULL,
            method TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            data TEXT NOT NULL
        );
        "#
    ))?;
    record_version(conn, table, 1)?;
    tracing::info!(table, "Migration v1: created event table");
    Ok(())
}

/// Timestamp index for `from_datetime` reads (v2)
fn migrate_v2(conn: &Connection, table: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{table}_timestamp ON {table}(timestamp);"
    ))?;
    record_version(conn, table, 2)?;
    tracing::info!(table, "Migration v2: indexed event timestamps");
    Ok(())
}
