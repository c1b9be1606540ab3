//! PostgreSQL schema definitions and migrations.

use tracing::info;

use crate::error::{BackendError, StorageError, StorageResult};

use super::backend::PostgresConfig;

/// Current schema version of an object table.
pub const SCHEMA_VERSION: i32 = 1;

/// Key of the advisory lock serialising schema changes across processes.
const SCHEMA_LOCK_KEY: i64 = 0x706f_6c79;

/// RFC 7396 merge patch over JSONB.
const MERGE_PATCH_FUNCTION: &str = r#"
CREATE OR REPLACE FUNCTION polystore_merge_patch(target jsonb, patch jsonb)
RETURNS jsonb LANGUAGE plpgsql IMMUTABLE AS $$
BEGIN
    IF patch IS NULL OR jsonb_typeof(patch) <> 'object' THEN
        RETURN patch;
    END IF;
    IF target IS NULL OR jsonb_typeof(target) <> 'object' THEN
        target := '{}'::jsonb;
    END IF;
    RETURN (
        SELECT COALESCE(jsonb_object_agg(merged.key, merged.value), '{}'::jsonb)
        FROM (
            SELECT t.key, t.value FROM jsonb_each(target) t
            WHERE NOT (patch ? t.key)
            UNION ALL
            SELECT p.key, polystore_merge_patch(target -> p.key, p.value)
            FROM jsonb_each(patch) p
            WHERE jsonb_typeof(p.value) <> 'null'
        ) merged
    );
END
$$;
"#;

fn pg_error(message: String) -> StorageError {
    StorageError::Backend(BackendError::MigrationError { message })
}

/// Creates or migrates the object table described by `config`.
pub async fn initialize_schema(
    client: &mut deadpool_postgres::Client,
    config: &PostgresConfig,
) -> StorageResult<()> {
    let table = config.qualified_table();
    let tx = client
        .transaction()
        .await
        .map_err(|e| pg_error(format!("Failed to begin schema transaction: {}", e)))?;
    tx.execute("SELECT pg_advisory_xact_lock($1)", &[&SCHEMA_LOCK_KEY])
        .await
        .map_err(|e| pg_error(format!("Failed to acquire schema lock: {}", e)))?;

    tx.batch_execute(
        "CREATE TABLE IF NOT EXISTS polystore_schema_version (
            table_name TEXT PRIMARY KEY NOT NULL,
            version INTEGER NOT NULL
        )",
    )
    .await
    .map_err(|e| pg_error(format!("Failed to create schema version table: {}", e)))?;

    let current_version = tx
        .query_opt(
            "SELECT version FROM polystore_schema_version WHERE table_name = $1",
            &[&table],
        )
        .await
        .map_err(|e| pg_error(format!("Failed to query schema version: {}", e)))?
        .map(|row| row.get::<_, i32>(0))
        .unwrap_or(0);

    if current_version == 0 {
        if let Some(schema) = &config.schema_name {
            tx.batch_execute(&format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", schema))
                .await
                .map_err(|e| pg_error(format!("Failed to create schema {}: {}", schema, e)))?;
        }
        tx.batch_execute(MERGE_PATCH_FUNCTION)
            .await
            .map_err(|e| pg_error(format!("Failed to create merge patch function: {}", e)))?;
        tx.batch_execute(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY NOT NULL,
                data JSONB NOT NULL,
                last_updated TIMESTAMPTZ NOT NULL,
                tombstoned BOOLEAN NOT NULL DEFAULT FALSE
            );
            CREATE INDEX IF NOT EXISTS \"{index}\" ON {table} (tombstoned, id);",
            table = table,
            index = format!("{}_visible_idx", config.table_name()),
        ))
        .await
        .map_err(|e| pg_error(format!("Failed to create table {}: {}", table, e)))?;
        tx.execute(
            "INSERT INTO polystore_schema_version (table_name, version) VALUES ($1, $2)
             ON CONFLICT (table_name) DO UPDATE SET version = excluded.version",
            &[&table, &SCHEMA_VERSION],
        )
        .await
        .map_err(|e| pg_error(format!("Failed to set schema version: {}", e)))?;
        info!(table = %table, version = SCHEMA_VERSION, "Initialized PostgreSQL object table");
    }

    tx.commit()
        .await
        .map_err(|e| pg_error(format!("Failed to commit schema: {}", e)))
}
