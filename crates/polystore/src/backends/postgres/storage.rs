//! [`Store`] implementation for PostgreSQL.
//!
//! Each mutation runs in a transaction that locks the row with
//! `SELECT ... FOR UPDATE`, checks the write condition against the locked
//! state and applies one targeted `UPDATE ... RETURNING`. Concurrent
//! writers on the same row queue on the lock, so a condition can never be
//! checked against a state that another transaction is about to replace.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_postgres::types::ToSql;
use tokio_postgres::{GenericClient, Row};
use tracing::debug;

use crate::core::condition::{check_condition, check_partial_condition};
use crate::core::object::{self, check_mutable_attribute};
use crate::core::{
    execute_find, BackendKind, DeleteMode, LifecycleEvent, NativeScan, ObjectState,
    PartialUpdate, Store, StoreConfig, StoreEvents, StoredObject, WriteCondition,
};
use crate::error::{BackendError, StorageError, StorageResult};
use crate::expr::Expression;
use crate::query::{compile, BackendCapabilities, CompiledQuery, FindResult, OrderBy, Query, QueryDialect};

use super::backend::PostgresStore;
use super::query_builder::{number_placeholders, PgFragment, PgParam};

fn internal_error(message: String) -> StorageError {
    StorageError::Backend(BackendError::Internal {
        backend_name: "postgres".to_string(),
        message,
        source: None,
    })
}

fn query_error(context: &str, err: tokio_postgres::Error) -> StorageError {
    StorageError::Backend(BackendError::Internal {
        backend_name: "postgres".to_string(),
        message: format!("{}: {}", context, err),
        source: Some(Box::new(err)),
    })
}

/// Runs a statement written with `$#` placeholders.
async fn query<C: GenericClient + Sync>(
    client: &C,
    sql: &str,
    params: &[PgParam],
    context: &str,
) -> StorageResult<Vec<Row>> {
    let boxed: Vec<Box<dyn ToSql + Sync + Send>> = params.iter().map(PgParam::to_boxed).collect();
    let refs: Vec<&(dyn ToSql + Sync)> = boxed
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect();
    client
        .query(number_placeholders(sql).as_str(), &refs)
        .await
        .map_err(|e| query_error(context, e))
}

/// Decodes an `(id, data, last_updated, tombstoned)` row.
fn decode_row(row: &Row) -> StorageResult<StoredObject> {
    let id: String = row.try_get(0).map_err(|e| query_error("Failed to read id", e))?;
    let data: Value = row.try_get(1).map_err(|e| query_error("Failed to read data", e))?;
    let last_updated: DateTime<Utc> = row
        .try_get(2)
        .map_err(|e| query_error("Failed to read last_updated", e))?;
    let tombstoned: bool = row
        .try_get(3)
        .map_err(|e| query_error("Failed to read tombstoned", e))?;
    let state = if tombstoned {
        ObjectState::Tombstoned
    } else {
        ObjectState::Present
    };
    Ok(StoredObject::new(id, data, last_updated).with_state(state))
}

fn pg_client(client: &deadpool_postgres::Client) -> &tokio_postgres::Client {
    client
}

fn text(value: impl Into<String>) -> PgParam {
    PgParam::Text(value.into())
}

/// A new `data` value computed in SQL from the current one.
struct DataUpdate {
    expression: String,
    params: Vec<PgParam>,
}

impl DataUpdate {
    fn new(expression: impl Into<String>, params: Vec<PgParam>) -> Self {
        Self {
            expression: expression.into(),
            params,
        }
    }
}

const COLUMNS: &str = "id, data, last_updated, tombstoned";

impl PostgresStore {
    async fn lock_row<C: GenericClient + Sync>(
        &self,
        client: &C,
        id: &str,
    ) -> StorageResult<Option<StoredObject>> {
        let rows = query(
            client,
            &format!("SELECT {} FROM {} WHERE id = $#::text FOR UPDATE", COLUMNS, self.table),
            &[text(id)],
            "Failed to read object",
        )
        .await?;
        rows.first().map(decode_row).transpose()
    }

    /// Applies a SQL-computed update to the visible object `id` in one
    /// transaction. `check` sees the locked row before anything is written.
    ///
    /// Returns the new state and the previous one.
    async fn write_existing<C>(
        &self,
        id: &str,
        check: C,
        update: DataUpdate,
        tombstone: bool,
    ) -> StorageResult<(StoredObject, StoredObject)>
    where
        C: FnOnce(&StoredObject) -> StorageResult<()> + Send,
    {
        let mut client = self.get_client().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| query_error("Failed to begin transaction", e))?;

        let previous = self
            .lock_row(&*tx, id)
            .await?
            .filter(|o| !o.is_tombstoned())
            .ok_or_else(|| StorageError::not_found(self.name(), id))?;
        check(&previous)?;

        let now = object::now();
        let mut params = update.params;
        params.push(PgParam::TextArray(vec![
            self.config.store.last_update_field.clone(),
        ]));
        params.push(text(object::format_timestamp(now)));
        params.push(text(object::format_timestamp(now)));
        params.push(PgParam::Text(tombstone.to_string()));
        params.push(text(id));
        let rows = query(
            &*tx,
            &format!(
                "UPDATE {} SET data = jsonb_set({}, $#::text[], to_jsonb($#::text), true), \
                 last_updated = $#::text::timestamptz, tombstoned = $#::text::boolean \
                 WHERE id = $#::text RETURNING {}",
                self.table, update.expression, COLUMNS
            ),
            &params,
            "Failed to update object",
        )
        .await?;
        let current = rows
            .first()
            .map(decode_row)
            .transpose()?
            .ok_or_else(|| internal_error(format!("object {} vanished during update", id)))?;

        tx.commit()
            .await
            .map_err(|e| query_error("Failed to commit", e))?;
        Ok((current, previous))
    }

    fn partial_expression(update: &PartialUpdate) -> StorageResult<DataUpdate> {
        let attribute = update.attribute().to_string();
        Ok(match update {
            PartialUpdate::Increment { delta, .. } => DataUpdate::new(
                "jsonb_set(data, ARRAY[$#::text], to_jsonb(\
                 CASE WHEN jsonb_typeof(data -> $#::text) = 'number' \
                 THEN (data -> $#::text)::numeric ELSE 0 END + $#::bigint), true)",
                vec![
                    text(attribute.clone()),
                    text(attribute.clone()),
                    text(attribute),
                    PgParam::BigInt(*delta),
                ],
            ),
            PartialUpdate::UpsertItem {
                item,
                index: Some(index),
                ..
            } => DataUpdate::new(
                "jsonb_set(data, ARRAY[$#::text, $#::text], $#::jsonb, false)",
                vec![text(attribute), text(index.to_string()), PgParam::Json(item.clone())],
            ),
            PartialUpdate::UpsertItem {
                item, index: None, ..
            } => DataUpdate::new(
                "jsonb_set(data, ARRAY[$#::text], \
                 COALESCE(data -> $#::text, '[]'::jsonb) || jsonb_build_array($#::jsonb), true)",
                vec![text(attribute.clone()), text(attribute), PgParam::Json(item.clone())],
            ),
            PartialUpdate::DeleteItem { index, .. } => DataUpdate::new(
                "(data #- ARRAY[$#::text, $#::text])",
                vec![text(attribute), text(index.to_string())],
            ),
            PartialUpdate::RemoveAttribute { .. } => {
                DataUpdate::new("(data - $#::text)", vec![text(attribute)])
            }
        })
    }

    async fn partial_update(
        &self,
        id: &str,
        update: PartialUpdate,
        condition: Option<&WriteCondition>,
    ) -> StorageResult<()> {
        check_mutable_attribute(&self.config.store, update.attribute())?;
        let expression = Self::partial_expression(&update)?;
        let (object, previous) = self
            .write_existing(
                id,
                |previous| {
                    check_partial_condition(condition, &update, id, previous.content())?;
                    // Surface type and bounds errors before touching the row.
                    let mut probe = previous.content().clone();
                    update.apply(&mut probe)?;
                    Ok(())
                },
                expression,
                false,
            )
            .await?;

        debug!(store = %self.name(), id, attribute = update.attribute(), "Partial update");
        self.events
            .emit(LifecycleEvent::PartialUpdated {
                object,
                previous: Some(previous),
                update,
            })
            .await
    }

    async fn select_visible(
        &self,
        sql_tail: &str,
        params: &[PgParam],
    ) -> StorageResult<Vec<StoredObject>> {
        let client = self.get_client().await?;
        let rows = query(
            pg_client(&client),
            &format!(
                "SELECT {} FROM {} WHERE NOT tombstoned{}",
                COLUMNS, self.table, sql_tail
            ),
            params,
            "Failed to execute query",
        )
        .await?;
        rows.iter().map(decode_row).collect()
    }
}

#[async_trait]
impl NativeScan for PostgresStore {
    type Filter = PgFragment;

    fn compile_filter(&self, filter: &Expression) -> StorageResult<CompiledQuery<PgFragment>> {
        Ok(compile(&self.dialect, filter)?)
    }

    async fn scan(
        &self,
        filter: &PgFragment,
        order: &[OrderBy],
        offset: u64,
        limit: u64,
    ) -> StorageResult<Vec<StoredObject>> {
        let order_by = self.dialect.order_by(order)?;
        let mut params = filter.params.clone();
        params.extend(order_by.params);
        params.push(PgParam::BigInt(i64::try_from(limit).unwrap_or(i64::MAX)));
        params.push(PgParam::BigInt(i64::try_from(offset).unwrap_or(i64::MAX)));
        self.select_visible(
            &format!(
                " AND ({}) ORDER BY {} LIMIT $#::bigint OFFSET $#::bigint",
                filter.sql, order_by.sql
            ),
            &params,
        )
        .await
    }
}

#[async_trait]
impl Store for PostgresStore {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::Postgres
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
        Ok(self
            .select_visible(" AND id = $#::text", &[text(id)])
            .await?
            .into_iter()
            .next())
    }

    async fn save(&self, object: Value) -> StorageResult<StoredObject> {
        let (id, content, now) = object::prepare_new(&self.config.store, object)?;
        let client = self.get_client().await?;
        let rows = query(
            pg_client(&client),
            &format!(
                "INSERT INTO {} (id, data, last_updated, tombstoned) \
                 VALUES ($#::text, $#::jsonb, $#::text::timestamptz, FALSE) \
                 ON CONFLICT (id) DO NOTHING RETURNING id",
                self.table
            ),
            &[
                text(id.clone()),
                PgParam::Json(content.clone()),
                text(object::format_timestamp(now)),
            ],
            "Failed to insert object",
        )
        .await?;
        drop(client);
        if rows.is_empty() {
            return Err(StorageError::conflict(self.name(), &id));
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
        let (stored, previous) = self
            .write_existing(
                id,
                |previous| check_condition(condition, id, previous.content()),
                DataUpdate::new("$#::jsonb", vec![PgParam::Json(replacement)]),
                false,
            )
            .await?;
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
        let (stored, previous) = self
            .write_existing(
                id,
                |previous| check_condition(condition, id, previous.content()),
                DataUpdate::new(
                    "polystore_merge_patch(data, $#::jsonb)",
                    vec![PgParam::Json(patch.clone())],
                ),
                false,
            )
            .await?;
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
                let (_, previous) = self
                    .write_existing(
                        id,
                        |previous| check_condition(condition, id, previous.content()),
                        DataUpdate::new("data", Vec::new()),
                        true,
                    )
                    .await?;
                previous
            }
            DeleteMode::Hard => {
                let mut client = self.get_client().await?;
                let tx = client
                    .transaction()
                    .await
                    .map_err(|e| query_error("Failed to begin transaction", e))?;
                let previous = self
                    .lock_row(&*tx, id)
                    .await?
                    .filter(|o| !o.is_tombstoned())
                    .ok_or_else(|| StorageError::not_found(self.name(), id))?;
                check_condition(condition, id, previous.content())?;
                query(
                    &*tx,
                    &format!("DELETE FROM {} WHERE id = $#::text", self.table),
                    &[text(id)],
                    "Failed to delete object",
                )
                .await?;
                tx.commit()
                    .await
                    .map_err(|e| query_error("Failed to commit", e))?;
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
        let client = self.get_client().await?;
        let rows = query(
            pg_client(&client),
            &format!("DELETE FROM {} WHERE id = $#::text RETURNING {}", self.table, COLUMNS),
            &[text(id)],
            "Failed to purge object",
        )
        .await?;
        drop(client);
        let removed = rows
            .first()
            .map(decode_row)
            .transpose()?
            .ok_or_else(|| StorageError::not_found(self.name(), id))?;
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
            return self.select_visible(" ORDER BY id COLLATE \"C\" ASC", &[]).await;
        };
        let found: HashMap<String, StoredObject> = self
            .select_visible(
                " AND id = ANY($#::text[])",
                &[PgParam::TextArray(ids.to_vec())],
            )
            .await?
            .into_iter()
            .map(|o| (o.id().to_string(), o))
            .collect();
        Ok(ids.iter().filter_map(|id| found.get(id).cloned()).collect())
    }
}
