//! [`Store`] implementation for MongoDB.
//!
//! Single-attribute mutations are one `findOneAndUpdate` with the write
//! condition folded into the filter, so MongoDB checks and writes in one
//! atomic document operation. When the filter does not match, the current
//! document is read back to report why.
//!
//! Merge patches and index-addressed collection splices have no atomic
//! operator; they read, modify and write inside a session transaction.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::error::{ErrorKind, WriteFailure, TRANSIENT_TRANSACTION_ERROR};
use mongodb::options::ReturnDocument;
use mongodb::ClientSession;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::condition::{check_condition, check_partial_condition};
use crate::core::object::{self, check_mutable_attribute, touch};
use crate::core::{
    execute_find, BackendKind, DeleteMode, LifecycleEvent, NativeScan, ObjectState,
    PartialUpdate, Store, StoreConfig, StoreEvents, StoredObject, WriteCondition,
};
use crate::error::{BackendError, StorageError, StorageResult, ValidationError};
use crate::expr::Expression;
use crate::query::{compile, BackendCapabilities, CompiledQuery, FindResult, OrderBy, Query, QueryDialect};

use super::backend::MongoStore;
use super::query_builder::{self, DATA};

const DUPLICATE_KEY: i32 = 11000;

fn internal_error(message: String) -> StorageError {
    StorageError::Backend(BackendError::Internal {
        backend_name: "mongodb".to_string(),
        message,
        source: None,
    })
}

fn serialization_error(message: String) -> StorageError {
    StorageError::Backend(BackendError::SerializationError { message })
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        *err.kind,
        ErrorKind::Write(WriteFailure::WriteError(ref e)) if e.code == DUPLICATE_KEY
    )
}

fn to_document(value: &Value) -> StorageResult<Document> {
    mongodb::bson::to_document(value).map_err(|e| serialization_error(e.to_string()))
}

fn to_bson(value: &Value) -> StorageResult<Bson> {
    Ok(query_builder::to_bson(value)?)
}

fn decode(document: Document) -> StorageResult<StoredObject> {
    let field_error = |e: mongodb::bson::document::ValueAccessError| serialization_error(e.to_string());
    let id = document.get_str("_id").map_err(field_error)?.to_string();
    let data = document.get_document(DATA).map_err(field_error)?.clone();
    let last_updated = document.get_str("last_updated").map_err(field_error)?;
    let last_updated = object::parse_timestamp(last_updated)
        .ok_or_else(|| serialization_error(format!("invalid timestamp '{}'", last_updated)))?;
    let state = if document.get_bool("tombstoned").map_err(field_error)? {
        ObjectState::Tombstoned
    } else {
        ObjectState::Present
    };
    let content = Bson::Document(data).into_relaxed_extjson();
    Ok(StoredObject::new(id, content, last_updated).with_state(state))
}

/// `data.<attribute>`, for attributes the update operators can address.
fn data_field(attribute: &str) -> StorageResult<String> {
    if attribute.contains('.') || attribute.starts_with('$') {
        return Err(ValidationError::InvalidObject {
            message: format!("attribute '{}' cannot be addressed in MongoDB", attribute),
        }
        .into());
    }
    Ok(format!("{}.{}", DATA, attribute))
}

/// `{ $eq: [<field of input>, <expected>] }`
fn condition_expression(condition: &WriteCondition, input: Bson) -> StorageResult<Document> {
    let field = doc! {
        "$getField": { "field": { "$literal": condition.field.as_str() }, "input": input }
    };
    Ok(doc! { "$eq": [field, { "$literal": to_bson(&condition.expected)? }] })
}

fn type_in(field: &str, types: &[&str]) -> Document {
    doc! { "$in": [{ "$type": format!("${}", field) }, types.to_vec()] }
}

fn visible(id: &str) -> Document {
    doc! { "_id": id, "tombstoned": false }
}

impl MongoStore {
    /// The bookkeeping `$set` every write carries.
    fn stamp(&self, now: &str) -> Document {
        let mut set = doc! { "last_updated": now };
        set.insert(format!("{}.{}", DATA, self.config.store.last_update_field), now);
        set
    }

    /// Runs a guarded `findOneAndUpdate` on the visible object `id` and
    /// returns its state before the update.
    ///
    /// When nothing matches, `explain` is run against the current state and
    /// its error returned; if it finds nothing wrong the object changed in
    /// between and the update is retried.
    async fn update_guarded<E>(
        &self,
        id: &str,
        guards: Vec<Document>,
        update: Document,
        explain: E,
    ) -> StorageResult<StoredObject>
    where
        E: Fn(&StoredObject) -> StorageResult<()> + Send + Sync,
    {
        let mut filter = visible(id);
        if !guards.is_empty() {
            filter.insert("$expr", doc! { "$and": guards });
        }
        for _ in 0..=self.config.transaction_retries {
            let previous = self
                .collection
                .find_one_and_update(filter.clone(), update.clone())
                .return_document(ReturnDocument::Before)
                .await?;
            if let Some(previous) = previous {
                return decode(previous);
            }
            let current = self
                .get(id)
                .await?
                .ok_or_else(|| StorageError::not_found(self.name(), id))?;
            explain(&current)?;
            debug!(store = %self.name(), id, "Guarded update raced with another writer, retrying");
        }
        Err(internal_error(format!(
            "update of {} kept racing with concurrent writers",
            id
        )))
    }

    /// Reads, changes and writes back the visible object `id` inside a
    /// session transaction, retrying on transient transaction errors.
    async fn transact<F>(&self, id: &str, change: F) -> StorageResult<(StoredObject, StoredObject)>
    where
        F: Fn(&mut Value) -> StorageResult<()> + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            let mut session = self.client.start_session().await?;
            session.start_transaction().await?;
            let outcome = match self.transact_in(&mut session, id, &change).await {
                Ok(Ok(written)) => session.commit_transaction().await.map(|()| Ok(written)),
                Ok(Err(rejected)) => {
                    session.abort_transaction().await?;
                    return Err(rejected);
                }
                Err(e) => Err(e),
            };
            match outcome {
                Ok(result) => return result,
                Err(e) if e.contains_label(TRANSIENT_TRANSACTION_ERROR)
                    && attempt < self.config.transaction_retries =>
                {
                    attempt += 1;
                    warn!(store = %self.name(), id, attempt, "Retrying transaction: {}", e);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// The transaction body. Driver errors are returned in the outer
    /// result so the caller can retry transient ones.
    async fn transact_in<F>(
        &self,
        session: &mut ClientSession,
        id: &str,
        change: &F,
    ) -> mongodb::error::Result<StorageResult<(StoredObject, StoredObject)>>
    where
        F: Fn(&mut Value) -> StorageResult<()> + Send + Sync,
    {
        let Some(current) = self.collection.find_one(visible(id)).session(&mut *session).await? else {
            return Ok(Err(StorageError::not_found(self.name(), id)));
        };
        let prepared = decode(current).and_then(|previous| {
            let mut content = previous.content().clone();
            change(&mut content)?;
            let now = object::now();
            touch(&self.config.store, &mut content, now);
            let data = to_document(&content)?;
            Ok((previous, content, now, data))
        });
        let (previous, content, now, data) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return Ok(Err(e)),
        };
        let stamp = object::format_timestamp(now);
        self.collection
            .update_one(
                doc! { "_id": id },
                doc! { "$set": { DATA: data, "last_updated": stamp } },
            )
            .session(&mut *session)
            .await?;
        Ok(Ok((StoredObject::new(id, content, now), previous)))
    }

    async fn partial_update(
        &self,
        id: &str,
        update: PartialUpdate,
        condition: Option<&WriteCondition>,
    ) -> StorageResult<()> {
        check_mutable_attribute(&self.config.store, update.attribute())?;
        let (object, previous) = if update.index().is_some() {
            self.transact(id, |content| {
                check_partial_condition(condition, &update, id, content)?;
                update.apply(content)?;
                Ok(())
            })
            .await?
        } else {
            self.partial_native(id, &update, condition).await?
        };

        debug!(store = %self.name(), id, attribute = update.attribute(), "Partial update");
        self.events
            .emit(LifecycleEvent::PartialUpdated {
                object,
                previous: Some(previous),
                update,
            })
            .await
    }

    /// Increment, append and attribute removal through update operators.
    async fn partial_native(
        &self,
        id: &str,
        update: &PartialUpdate,
        condition: Option<&WriteCondition>,
    ) -> StorageResult<(StoredObject, StoredObject)> {
        let field = data_field(update.attribute())?;
        let now = object::now();

        let mut guards = Vec::new();
        if let Some(condition) = condition {
            guards.push(condition_expression(condition, Bson::String(format!("${}", DATA)))?);
        }
        let mut target = Document::new();
        let mut modification = Document::new();
        match update {
            PartialUpdate::Increment { delta, .. } => {
                guards.push(type_in(&field, &["missing", "int", "long", "double", "decimal"]));
                target.insert(field, *delta);
                modification.insert("$inc", target);
            }
            PartialUpdate::UpsertItem {
                item, index: None, ..
            } => {
                guards.push(type_in(&field, &["missing", "array"]));
                target.insert(field, to_bson(item)?);
                modification.insert("$push", target);
            }
            PartialUpdate::RemoveAttribute { .. } => {
                target.insert(field, "");
                modification.insert("$unset", target);
            }
            PartialUpdate::UpsertItem { .. } | PartialUpdate::DeleteItem { .. } => {
                return Err(internal_error(
                    "index-addressed updates run in a transaction".to_string(),
                ));
            }
        }
        modification.insert("$set", self.stamp(&object::format_timestamp(now)));

        let previous = self
            .update_guarded(id, guards, modification, |current| {
                check_partial_condition(condition, update, id, current.content())?;
                let mut probe = current.content().clone();
                update.apply(&mut probe)?;
                Ok(())
            })
            .await?;
        let mut content = previous.content().clone();
        update.apply(&mut content)?;
        touch(&self.config.store, &mut content, now);
        Ok((StoredObject::new(id, content, now), previous))
    }

    async fn find_visible(&self, filter: Document) -> StorageResult<Vec<StoredObject>> {
        let documents: Vec<Document> = self
            .collection
            .find(filter)
            .sort(doc! { "_id": 1 })
            .await?
            .try_collect()
            .await?;
        documents.into_iter().map(decode).collect()
    }
}

#[async_trait]
impl NativeScan for MongoStore {
    type Filter = Bson;

    fn compile_filter(&self, filter: &Expression) -> StorageResult<CompiledQuery<Bson>> {
        Ok(compile(&self.dialect, filter)?)
    }

    async fn scan(
        &self,
        filter: &Bson,
        order: &[OrderBy],
        offset: u64,
        limit: u64,
    ) -> StorageResult<Vec<StoredObject>> {
        let mut pipeline = vec![doc! {
            "$match": { "tombstoned": false, "$expr": filter.clone() }
        }];
        pipeline.extend(self.dialect.order_stages(order)?);
        pipeline.push(doc! { "$skip": i64::try_from(offset).unwrap_or(i64::MAX) });
        pipeline.push(doc! { "$limit": i64::try_from(limit).unwrap_or(i64::MAX) });

        let documents: Vec<Document> = self
            .collection
            .aggregate(pipeline)
            .await?
            .try_collect()
            .await?;
        documents.into_iter().map(decode).collect()
    }
}

#[async_trait]
impl Store for MongoStore {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::MongoDB
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
        self.collection
            .find_one(visible(id))
            .await?
            .map(decode)
            .transpose()
    }

    async fn save(&self, object: Value) -> StorageResult<StoredObject> {
        let (id, content, now) = object::prepare_new(&self.config.store, object)?;
        let document = doc! {
            "_id": id.as_str(),
            DATA: to_document(&content)?,
            "last_updated": object::format_timestamp(now),
            "tombstoned": false,
        };
        match self.collection.insert_one(document).await {
            Ok(_) => {}
            Err(e) if is_duplicate_key(&e) => return Err(StorageError::conflict(self.name(), &id)),
            Err(e) => return Err(e.into()),
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
        let (replacement, now) = object::prepare_replacement(&self.config.store, id, object)?;
        let mut guards = Vec::new();
        if let Some(condition) = condition {
            guards.push(condition_expression(condition, Bson::String(format!("${}", DATA)))?);
        }
        let update = doc! {
            "$set": {
                DATA: to_document(&replacement)?,
                "last_updated": object::format_timestamp(now),
            }
        };
        let previous = self
            .update_guarded(id, guards, update, |current| {
                check_condition(condition, id, current.content())
            })
            .await?;

        let stored = StoredObject::new(id, replacement, now);
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
            .transact(id, |content| {
                check_condition(condition, id, content)?;
                json_patch::merge(content, &patch);
                Ok(())
            })
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
        let mut filter = visible(id);
        if let Some(condition) = condition {
            filter.insert(
                "$expr",
                condition_expression(condition, Bson::String(format!("${}", DATA)))?,
            );
        }

        let tombstoned = self.config.store.delete_mode == DeleteMode::Tombstone;
        let mut object = None;
        for _ in 0..=self.config.transaction_retries {
            let removed = if tombstoned {
                let mut set = self.stamp(&object::format_timestamp(object::now()));
                set.insert("tombstoned", true);
                self.collection
                    .find_one_and_update(filter.clone(), doc! { "$set": set })
                    .return_document(ReturnDocument::Before)
                    .await?
            } else {
                self.collection.find_one_and_delete(filter.clone()).await?
            };
            if let Some(removed) = removed {
                object = Some(decode(removed)?);
                break;
            }
            let current = self
                .get(id)
                .await?
                .ok_or_else(|| StorageError::not_found(self.name(), id))?;
            check_condition(condition, id, current.content())?;
        }
        let object = object
            .ok_or_else(|| internal_error(format!("delete of {} kept racing with concurrent writers", id)))?;

        debug!(store = %self.name(), id, mode = ?self.config.store.delete_mode, "Deleted object");
        self.events
            .emit(LifecycleEvent::Deleted { object, tombstoned })
            .await
    }

    async fn purge(&self, id: &str) -> StorageResult<()> {
        let removed = self
            .collection
            .find_one_and_delete(doc! { "_id": id })
            .await?
            .map(decode)
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
            return self.find_visible(doc! { "tombstoned": false }).await;
        };
        let found: HashMap<String, StoredObject> = self
            .find_visible(doc! { "_id": { "$in": ids.to_vec() }, "tombstoned": false })
            .await?
            .into_iter()
            .map(|o| (o.id().to_string(), o))
            .collect();
        Ok(ids.iter().filter_map(|id| found.get(id).cloned()).collect())
    }
}
