//! SQLite schema definitions and migrations.

use rusqlite::{params, Connection};
use tracing::info;

use crate::error::{BackendError, StorageError, StorageResult};

use super::backend::quote_identifier;

/// Current schema version of an object table.
pub const SCHEMA_VERSION: i32 = 1;

fn migration_error(message: String) -> StorageError {
    StorageError::Backend(BackendError::MigrationError { message })
}

/// Creates or migrates the object table `table`.
pub fn initialize_schema(conn: &Connection, table: &str) -> StorageResult<()> {
    let current_version = get_schema_version(conn, table)?;

    if current_version == 0 {
        create_schema_v1(conn, table)?;
        set_schema_version(conn, table, SCHEMA_VERSION)?;
        info!(table, version = SCHEMA_VERSION, "Initialized SQLite object table");
    }

    Ok(())
}

/// Get the schema version recorded for a table (0 when none).
fn get_schema_version(conn: &Connection, table: &str) -> StorageResult<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS polystore_schema_version (
            table_name TEXT PRIMARY KEY NOT NULL,
            version INTEGER NOT NULL
        )",
        [],
    )
    .map_err(|e| migration_error(format!("Failed to create schema version table: {}", e)))?;

    let version = conn.query_row(
        "SELECT version FROM polystore_schema_version WHERE table_name = ?1",
        params![table],
        |row| row.get(0),
    );

    match version {
        Ok(version) => Ok(version),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
        Err(e) => Err(migration_error(format!("Failed to read schema version: {}", e))),
    }
}

fn set_schema_version(conn: &Connection, table: &str, version: i32) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO polystore_schema_version (table_name, version) VALUES (?1, ?2)
         ON CONFLICT (table_name) DO UPDATE SET version = excluded.version",
        params![table, version],
    )
    .map_err(|e| migration_error(format!("Failed to set schema version: {}", e)))?;
    Ok(())
}

/// Create the object table (version 1).
///
/// `data` holds the whole object as JSON text, including its id and
/// last-update attributes; `last_updated` mirrors the latter.
fn create_schema_v1(conn: &Connection, table: &str) -> StorageResult<()> {
    let quoted = quote_identifier(table);
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {quoted} (
            id TEXT PRIMARY KEY NOT NULL,
            data TEXT NOT NULL,
            last_updated TEXT NOT NULL,
            tombstoned INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS {index} ON {quoted} (tombstoned, id);",
        index = quote_identifier(&format!("{}_visible_idx", table)),
    ))
    .map_err(|e| migration_error(format!("Failed to create table {}: {}", table, e)))?;
    Ok(())
}
