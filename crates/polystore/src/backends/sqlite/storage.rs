//! [`Store`] implementation for SQLite.
//!
//! Mutations run in `IMMEDIATE` transactions: the row is read, the write
//! condition is checked, a targeted `json_set`/`json_remove`/`json_patch`
//! statement is applied and the new row is read back before commit. The
//! pooled connection is released before the lifecycle event is emitted.

use std::collections::HashMap;

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use tracing::debug;

use crate::core::condition::{check_condition, check_partial_condition};
use crate::core::object::{self, check_mutable_attribute, format_timestamp, parse_timestamp};
use crate::core::{
    execute_find, BackendKind, DeleteMode, LifecycleEvent, NativeScan, ObjectState,
    PartialUpdate, Store, StoreConfig, StoreEvents, StoredObject, WriteCondition,
};
use crate::error::{BackendError, StorageError, StorageResult, ValidationError};
use crate::expr::Expression;
use crate::query::{compile, BackendCapabilities, CompiledQuery, FindResult, OrderBy, Query, QueryDialect};

use super::backend::SqliteStore;
use super::query_builder::{json_path, sql_literal, SqlFragment};

/// Rows per `id IN (...)` lookup in `get_all`.
const ID_CHUNK: usize = 500;

fn internal_error(message: String) -> StorageError {
    StorageError::Backend(BackendError::Internal {
        backend_name: "sqlite".to_string(),
        message,
        source: None,
    })
}

fn serialization_error(message: String) -> StorageError {
    StorageError::Backend(BackendError::SerializationError { message })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Rejects attribute names that cannot be spelled in a quoted JSON path.
fn check_json_label(attribute: &str) -> StorageResult<()> {
    if attribute.contains('"') {
        return Err(ValidationError::InvalidObject {
            message: format!("attribute '{}' cannot be addressed in sqlite", attribute),
        }
        .into());
    }
    Ok(())
}

/// Decodes an `(id, data, last_updated, tombstoned)` row.
fn decode_row(id: String, data: String, last_updated: String, tombstoned: bool) -> StorageResult<StoredObject> {
    let content: Value = serde_json::from_str(&data)
        .map_err(|e| serialization_error(format!("Failed to deserialize object {}: {}", id, e)))?;
    let last_updated = parse_timestamp(&last_updated)
        .ok_or_else(|| internal_error(format!("Failed to parse last_updated '{}'", last_updated)))?;
    let state = if tombstoned {
        ObjectState::Tombstoned
    } else {
        ObjectState::Present
    };
    Ok(StoredObject::new(id, content, last_updated).with_state(state))
}

/// A new `data` value computed in SQL from the current one.
struct DataUpdate {
    expression: String,
    params: Vec<SqlValue>,
}

impl SqliteStore {
    /// JSON path literal of the last-update attribute.
    fn last_update_path(&self) -> String {
        sql_literal(&json_path(&[self.config.store.last_update_field.as_str()]))
    }

    /// Reads a row, tombstones included.
    fn read_row(&self, conn: &Connection, id: &str) -> StorageResult<Option<StoredObject>> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT id, data, last_updated, tombstoned FROM {} WHERE id = ?1",
                    self.table
                ),
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)? != 0,
                    ))
                },
            )
            .optional()
            .map_err(|e| internal_error(format!("Failed to read object: {}", e)))?;
        row.map(|(id, data, last_updated, tombstoned)| decode_row(id, data, last_updated, tombstoned))
            .transpose()
    }

    fn read_visible(&self, conn: &Connection, id: &str) -> StorageResult<StoredObject> {
        self.read_row(conn, id)?
            .filter(|o| !o.is_tombstoned())
            .ok_or_else(|| StorageError::not_found(self.name(), id))
    }

    /// Applies a SQL-computed update to the visible object `id` in one
    /// transaction. `check` sees the current object before anything is
    /// written; `build` derives the statement from it.
    ///
    /// Returns the new state and the previous one.
    fn write_existing<C, B>(
        &self,
        id: &str,
        check: C,
        build: B,
        tombstone: bool,
    ) -> StorageResult<(StoredObject, StoredObject)>
    where
        C: FnOnce(&StoredObject) -> StorageResult<()>,
        B: FnOnce(&StoredObject, String) -> StorageResult<DataUpdate>,
    {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let previous = self.read_visible(&tx, id)?;
        check(&previous)?;

        let now = object::now();
        let timestamp = format_timestamp(now);
        let update = build(&previous, timestamp.clone())?;

        let mut params = update.params;
        params.push(SqlValue::Text(timestamp));
        params.push(SqlValue::Integer(i64::from(tombstone)));
        params.push(SqlValue::Text(id.to_string()));
        tx.execute(
            &format!(
                "UPDATE {} SET data = {}, last_updated = ?, tombstoned = ? WHERE id = ?",
                self.table, update.expression
            ),
            params_from_iter(params),
        )
        .map_err(|e| internal_error(format!("Failed to update object: {}", e)))?;

        let current = self
            .read_row(&tx, id)?
            .ok_or_else(|| internal_error(format!("object {} vanished during update", id)))?;
        tx.commit()?;
        Ok((current, previous))
    }

    /// Renders a targeted update as a `data` expression.
    fn partial_expression(
        &self,
        update: &PartialUpdate,
        previous: &StoredObject,
        timestamp: String,
    ) -> StorageResult<DataUpdate> {
        let attribute = update.attribute();
        let path = json_path(&[attribute]);
        let lu = self.last_update_path();
        let ts = SqlValue::Text(timestamp);

        let (expression, params) = match update {
            PartialUpdate::Increment { delta, .. } => (
                format!(
                    "json_set(data, {p}, IFNULL(json_extract(data, {p}), 0) + ?, {lu}, ?)",
                    p = sql_literal(&path),
                    lu = lu
                ),
                vec![SqlValue::Integer(*delta), ts],
            ),
            PartialUpdate::UpsertItem { item, index, .. } => {
                let item = SqlValue::Text(serde_json::to_string(item)?);
                match index {
                    Some(i) => (
                        format!(
                            "json_set(data, {}, json(?), {}, ?)",
                            sql_literal(&format!("{}[{}]", path, i)),
                            lu
                        ),
                        vec![item, ts],
                    ),
                    None if previous.get(attribute).is_some_and(Value::is_array) => (
                        format!(
                            "json_insert(data, {}, json(?), {}, ?)",
                            sql_literal(&format!("{}[#]", path)),
                            lu
                        ),
                        vec![item, ts],
                    ),
                    None => (
                        format!(
                            "json_set(data, {}, json_array(json(?)), {}, ?)",
                            sql_literal(&path),
                            lu
                        ),
                        vec![item, ts],
                    ),
                }
            }
            PartialUpdate::DeleteItem { index, .. } => (
                format!(
                    "json_set(json_remove(data, {}), {}, ?)",
                    sql_literal(&format!("{}[{}]", path, index)),
                    lu
                ),
                vec![ts],
            ),
            PartialUpdate::RemoveAttribute { .. } => (
                format!("json_set(json_remove(data, {}), {}, ?)", sql_literal(&path), lu),
                vec![ts],
            ),
        };
        Ok(DataUpdate { expression, params })
    }

    async fn partial_update(
        &self,
        id: &str,
        update: PartialUpdate,
        condition: Option<&WriteCondition>,
    ) -> StorageResult<()> {
        check_mutable_attribute(&self.config.store, update.attribute())?;
        check_json_label(update.attribute())?;

        let (object, previous) = self.write_existing(
            id,
            |previous| {
                check_partial_condition(condition, &update, id, previous.content())?;
                // Surface type and bounds errors before touching the row.
                let mut probe = previous.content().clone();
                update.apply(&mut probe)?;
                Ok(())
            },
            |previous, timestamp| self.partial_expression(&update, previous, timestamp),
            false,
        )?;

        debug!(store = %self.name(), id, attribute = update.attribute(), "Partial update");
        self.events
            .emit(LifecycleEvent::PartialUpdated {
                object,
                previous: Some(previous),
                update,
            })
            .await
    }

    fn select_visible(&self, sql_tail: &str, params: Vec<SqlValue>) -> StorageResult<Vec<StoredObject>> {
        let conn = self.get_connection()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT id, data, last_updated FROM {} WHERE tombstoned = 0{}",
                self.table, sql_tail
            ))
            .map_err(|e| internal_error(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map(params_from_iter(params), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|e| internal_error(format!("Failed to execute query: {}", e)))?;

        let mut objects = Vec::new();
        for row in rows {
            let (id, data, last_updated) =
                row.map_err(|e| internal_error(format!("Failed to read row: {}", e)))?;
            objects.push(decode_row(id, data, last_updated, false)?);
        }
        Ok(objects)
    }
}

#[async_trait]
impl NativeScan for SqliteStore {
    type Filter = SqlFragment;

    fn compile_filter(&self, filter: &Expression) -> StorageResult<CompiledQuery<SqlFragment>> {
        Ok(compile(&self.dialect, filter)?)
    }

    async fn scan(
        &self,
        filter: &SqlFragment,
        order: &[OrderBy],
        offset: u64,
        limit: u64,
    ) -> StorageResult<Vec<StoredObject>> {
        let order_by = self.dialect.order_by(order)?;
        let mut params = filter.params.clone();
        params.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        params.push(SqlValue::Integer(i64::try_from(offset).unwrap_or(i64::MAX)));
        self.select_visible(
            &format!(" AND ({}) ORDER BY {} LIMIT ? OFFSET ?", filter.sql, order_by),
            params,
        )
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn config(&self) -> &StoreConfig {
        &self.config.store
    }

    fn capabilities(&self) -> &BackendCapabilities {
        self.dialect.capabilities()
    }

    fn events(&self) -> &StoreEvents {
        &self.events
    }

    async fn get(&self, id: &str) -> StorageResult<Option<StoredObject>> {
        let conn = self.get_connection()?;
        Ok(self.read_row(&conn, id)?.filter(|o| !o.is_tombstoned()))
    }

    async fn save(&self, object: Value) -> StorageResult<StoredObject> {
        let (id, content, now) = object::prepare_new(&self.config.store, object)?;
        let data = serde_json::to_string(&content)
            .map_err(|e| serialization_error(format!("Failed to serialize object: {}", e)))?;
        {
            let conn = self.get_connection()?;
            conn.execute(
                &format!(
                    "INSERT INTO {} (id, data, last_updated, tombstoned) VALUES (?1, ?2, ?3, 0)",
                    self.table
                ),
                params![id, data, format_timestamp(now)],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    StorageError::conflict(self.name(), &id)
                } else {
                    internal_error(format!("Failed to insert object: {}", e))
                }
            })?;
        }

        let stored = StoredObject::new(id, content, now);
        debug!(store = %self.name(), id = stored.id(), "Saved object");
        self.events
            .emit(LifecycleEvent::Saved {
                object: stored.clone(),
            })
            .await?;
        Ok(stored)
    }

    async fn update(
        &self,
        object: Value,
        id: &str,
        condition: Option<&WriteCondition>,
    ) -> StorageResult<StoredObject> {
        let (replacement, _) = object::prepare_replacement(&self.config.store, id, object)?;
        let lu = self.last_update_path();
        let (stored, previous) = self.write_existing(
            id,
            |previous| check_condition(condition, id, previous.content()),
            |_, timestamp| {
                Ok(DataUpdate {
                    expression: format!("json_set(?, {}, ?)", lu),
                    params: vec![
                        SqlValue::Text(serde_json::to_string(&replacement)?),
                        SqlValue::Text(timestamp),
                    ],
                })
            },
            false,
        )?;
        self.events
            .emit(LifecycleEvent::Updated {
                object: stored.clone(),
                previous: Some(previous),
            })
            .await?;
        Ok(stored)
    }

    async fn patch(
        &self,
        partial: Value,
        id: &str,
        condition: Option<&WriteCondition>,
    ) -> StorageResult<StoredObject> {
        let patch = object::prepare_patch(&self.config.store, partial)?;
        let lu = self.last_update_path();
        let (stored, previous) = self.write_existing(
            id,
            |previous| check_condition(condition, id, previous.content()),
            |_, timestamp| {
                Ok(DataUpdate {
                    expression: format!("json_set(json_patch(data, ?), {}, ?)", lu),
                    params: vec![
                        SqlValue::Text(serde_json::to_string(&patch)?),
                        SqlValue::Text(timestamp),
                    ],
                })
            },
            false,
        )?;
        self.events
            .emit(LifecycleEvent::PatchUpdated {
                object: stored.clone(),
                previous: Some(previous),
                patch,
            })
            .await?;
        Ok(stored)
    }

    async fn delete(&self, id: &str, condition: Option<&WriteCondition>) -> StorageResult<()> {
        let object = match self.config.store.delete_mode {
            DeleteMode::Tombstone => {
                let lu = self.last_update_path();
                let (_, previous) = self.write_existing(
                    id,
                    |previous| check_condition(condition, id, previous.content()),
                    |_, timestamp| {
                        Ok(DataUpdate {
                            expression: format!("json_set(data, {}, ?)", lu),
                            params: vec![SqlValue::Text(timestamp)],
                        })
                    },
                    true,
                )?;
                previous
            }
            DeleteMode::Hard => {
                let mut conn = self.get_connection()?;
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let previous = self.read_visible(&tx, id)?;
                check_condition(condition, id, previous.content())?;
                tx.execute(&format!("DELETE FROM {} WHERE id = ?1", self.table), params![id])
                    .map_err(|e| internal_error(format!("Failed to delete object: {}", e)))?;
                tx.commit()?;
                previous
            }
        };

        debug!(store = %self.name(), id, mode = ?self.config.store.delete_mode, "Deleted object");
        self.events
            .emit(LifecycleEvent::Deleted {
                object,
                tombstoned: self.config.store.delete_mode == DeleteMode::Tombstone,
            })
            .await
    }

    async fn purge(&self, id: &str) -> StorageResult<()> {
        let removed = {
            let mut conn = self.get_connection()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let removed = self
                .read_row(&tx, id)?
                .ok_or_else(|| StorageError::not_found(self.name(), id))?;
            tx.execute(&format!("DELETE FROM {} WHERE id = ?1", self.table), params![id])
                .map_err(|e| internal_error(format!("Failed to purge object: {}", e)))?;
            tx.commit()?;
            removed
        };
        if removed.is_tombstoned() {
            return Ok(());
        }
        self.events
            .emit(LifecycleEvent::Deleted {
                object: removed,
                tombstoned: false,
            })
            .await
    }

    async fn increment_attribute(
        &self,
        id: &str,
        attribute: &str,
        delta: i64,
    ) -> StorageResult<()> {
        let update = PartialUpdate::Increment {
            attribute: attribute.to_string(),
            delta,
        };
        self.partial_update(id, update, None).await
    }

    async fn upsert_item_to_collection(
        &self,
        id: &str,
        collection: &str,
        item: Value,
        index: Option<usize>,
        condition: Option<&WriteCondition>,
    ) -> StorageResult<()> {
        let update = PartialUpdate::UpsertItem {
            collection: collection.to_string(),
            item,
            index,
        };
        self.partial_update(id, update, condition).await
    }

    async fn delete_item_from_collection(
        &self,
        id: &str,
        collection: &str,
        index: usize,
        condition: Option<&WriteCondition>,
    ) -> StorageResult<()> {
        let update = PartialUpdate::DeleteItem {
            collection: collection.to_string(),
            index,
        };
        self.partial_update(id, update, condition).await
    }

    async fn remove_attribute(
        &self,
        id: &str,
        attribute: &str,
        condition: Option<&WriteCondition>,
    ) -> StorageResult<()> {
        let update = PartialUpdate::RemoveAttribute {
            attribute: attribute.to_string(),
        };
        self.partial_update(id, update, condition).await
    }

    async fn find(&self, query: &Query) -> StorageResult<FindResult> {
        execute_find(self, &self.config.store, query).await
    }

    async fn get_all(&self, ids: Option<&[String]>) -> StorageResult<Vec<StoredObject>> {
        let Some(ids) = ids else {
            return self.select_visible(" ORDER BY id ASC", Vec::new());
        };

        let mut found: HashMap<String, StoredObject> = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(ID_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let params = chunk.iter().cloned().map(SqlValue::Text).collect();
            for object in self.select_visible(&format!(" AND id IN ({})", placeholders), params)? {
                found.insert(object.id().to_string(), object);
            }
        }
        Ok(ids.iter().filter_map(|id| found.get(id).cloned()).collect())
    }
}
