//! In-memory backend.
//!
//! Objects live in a `BTreeMap` behind a `parking_lot` lock, so every
//! conditional write is trivially atomic. The capability table is
//! configurable: the native part of a query is evaluated directly, and a
//! restricted profile (for example an index-restricted document database)
//! reproduces that backend's native/residual split without running it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::condition::{check_condition, check_partial_condition};
use crate::core::executor::window;
use crate::core::object::{self, check_mutable_attribute, touch};
use crate::core::{
    execute_find, BackendKind, DeleteMode, LifecycleEvent, NativeScan, ObjectState,
    PartialUpdate, Store, StoreConfig, StoreEvents, StoredObject, WriteCondition,
};
use crate::error::{StorageError, StorageResult};
use crate::expr::Expression;
use crate::query::{
    compile, BackendCapabilities, CompiledQuery, EvaluatorDialect, FindResult, OrderBy, Query,
};

/// Configuration for [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Common store options.
    #[serde(flatten)]
    pub store: StoreConfig,

    /// Capability table used to compile queries.
    #[serde(default = "default_capabilities")]
    pub capabilities: BackendCapabilities,
}

fn default_capabilities() -> BackendCapabilities {
    BackendCapabilities::full(BackendKind::Memory)
}

impl MemoryConfig {
    /// Creates a configuration with full native capabilities.
    pub fn new(store: StoreConfig) -> Self {
        Self {
            store,
            capabilities: default_capabilities(),
        }
    }

    /// Replaces the capability table.
    pub fn with_capabilities(mut self, capabilities: BackendCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// Store keeping objects in process memory.
#[derive(Debug)]
pub struct MemoryStore {
    config: StoreConfig,
    capabilities: BackendCapabilities,
    objects: RwLock<BTreeMap<String, StoredObject>>,
    events: StoreEvents,
}

impl MemoryStore {
    /// Creates an empty store with full native capabilities.
    pub fn new(config: StoreConfig) -> StorageResult<Self> {
        Self::with_config(MemoryConfig::new(config))
    }

    /// Creates an empty store.
    pub fn with_config(config: MemoryConfig) -> StorageResult<Self> {
        config.store.validate()?;
        Ok(Self {
            events: StoreEvents::new(config.store.name.clone()),
            config: config.store,
            capabilities: config.capabilities,
            objects: RwLock::new(BTreeMap::new()),
        })
    }

    /// Returns the number of stored objects, tombstones included.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Applies `change` to the visible object `id` under the write lock.
    ///
    /// Returns the new state and the previous one.
    fn mutate<F>(&self, id: &str, change: F) -> StorageResult<(StoredObject, StoredObject)>
    where
        F: FnOnce(&mut Value) -> StorageResult<()>,
    {
        let mut objects = self.objects.write();
        let entry = objects
            .get_mut(id)
            .filter(|o| !o.is_tombstoned())
            .ok_or_else(|| StorageError::not_found(self.name(), id))?;

        let previous = entry.clone();
        let mut content = previous.content().clone();
        change(&mut content)?;
        let now = object::now();
        touch(&self.config, &mut content, now);
        *entry = StoredObject::new(id, content, now);
        Ok((entry.clone(), previous))
    }

    async fn partial_update(
        &self,
        id: &str,
        update: PartialUpdate,
        condition: Option<&WriteCondition>,
    ) -> StorageResult<()> {
        check_mutable_attribute(&self.config, update.attribute())?;
        let (object, previous) = self.mutate(id, |content| {
            check_partial_condition(condition, &update, id, content)?;
            update.apply(content)?;
            Ok(())
        })?;
        debug!(store = %self.name(), id, attribute = update.attribute(), "Partial update");
        self.events
            .emit(LifecycleEvent::PartialUpdated {
                object,
                previous: Some(previous),
                update,
            })
            .await
    }
}

#[async_trait]
impl NativeScan for MemoryStore {
    type Filter = Expression;

    fn compile_filter(&self, filter: &Expression) -> StorageResult<CompiledQuery<Expression>> {
        Ok(compile(&EvaluatorDialect::new(&self.capabilities), filter)?)
    }

    async fn scan(
        &self,
        filter: &Expression,
        order: &[OrderBy],
        offset: u64,
        limit: u64,
    ) -> StorageResult<Vec<StoredObject>> {
        let rows = self
            .objects
            .read()
            .values()
            .filter(|o| !o.is_tombstoned() && filter.evaluate(o.content()))
            .cloned()
            .collect();
        Ok(window(rows, order, offset, limit))
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    fn events(&self) -> &StoreEvents {
        &self.events
    }

    async fn get(&self, id: &str) -> StorageResult<Option<StoredObject>> {
        Ok(self
            .objects
            .read()
            .get(id)
            .filter(|o| !o.is_tombstoned())
            .cloned())
    }

    async fn save(&self, object: Value) -> StorageResult<StoredObject> {
        let (id, content, now) = object::prepare_new(&self.config, object)?;
        let stored = {
            let mut objects = self.objects.write();
            if objects.contains_key(&id) {
                return Err(StorageError::conflict(self.name(), &id));
            }
            let stored = StoredObject::new(id.clone(), content, now);
            objects.insert(id, stored.clone());
            stored
        };
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
        let (replacement, _) = object::prepare_replacement(&self.config, id, object)?;
        let (stored, previous) = self.mutate(id, |content| {
            check_condition(condition, id, content)?;
            *content = replacement;
            Ok(())
        })?;
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
        let patch = object::prepare_patch(&self.config, partial)?;
        let (stored, previous) = self.mutate(id, |content| {
            check_condition(condition, id, content)?;
            json_patch::merge(content, &patch);
            Ok(())
        })?;
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
        let removed = {
            let mut objects = self.objects.write();
            let current = objects
                .get(id)
                .filter(|o| !o.is_tombstoned())
                .ok_or_else(|| StorageError::not_found(self.name(), id))?;
            check_condition(condition, id, current.content())?;

            match self.config.delete_mode {
                DeleteMode::Hard => objects.remove(id),
                DeleteMode::Tombstone => {
                    let previous = current.clone();
                    let mut content = previous.content().clone();
                    let now = object::now();
                    touch(&self.config, &mut content, now);
                    objects.insert(
                        id.to_string(),
                        StoredObject::new(id, content, now).with_state(ObjectState::Tombstoned),
                    );
                    Some(previous)
                }
            }
        };

        let Some(object) = removed else {
            return Err(StorageError::not_found(self.name(), id));
        };
        debug!(store = %self.name(), id, mode = ?self.config.delete_mode, "Deleted object");
        self.events
            .emit(LifecycleEvent::Deleted {
                object,
                tombstoned: self.config.delete_mode == DeleteMode::Tombstone,
            })
            .await
    }

    async fn purge(&self, id: &str) -> StorageResult<()> {
        let removed = self
            .objects
            .write()
            .remove(id)
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
        execute_find(self, &self.config, query).await
    }

    async fn get_all(&self, ids: Option<&[String]>) -> StorageResult<Vec<StoredObject>> {
        let objects = self.objects.read();
        let visible = |o: &&StoredObject| !o.is_tombstoned();
        Ok(match ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| objects.get(id).filter(visible).cloned())
                .collect(),
            None => objects.values().filter(visible).cloned().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::query::IndexDefinition;
    use serde_json::json;

    fn store() -> MemoryStore {
        MemoryStore::new(StoreConfig::new("users")).unwrap()
    }

    #[tokio::test]
    async fn test_save_and_get() {
        let store = store();
        let saved = store.save(json!({"uuid": "u1", "name": "ada"})).await.unwrap();
        assert_eq!(saved.id(), "u1");
        assert!(saved.get("_lastUpdate").is_some());

        let read = store.get("u1").await.unwrap().unwrap();
        assert_eq!(read, saved);
        assert!(store.get("missing").await.unwrap().is_none());
        assert!(store.get_or_fail("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_save_generates_id_and_rejects_duplicates() {
        let store = store();
        let saved = store.save(json!({"name": "x"})).await.unwrap();
        assert!(uuid::Uuid::parse_str(saved.id()).is_ok());

        let err = store
            .save(json!({"uuid": saved.id(), "name": "y"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_update_with_condition() {
        let store = store();
        store.save(json!({"uuid": "u1", "version": 3})).await.unwrap();

        let condition = WriteCondition::new("version", 3);
        let updated = store
            .update(json!({"version": 4}), "u1", Some(&condition))
            .await
            .unwrap();
        assert_eq!(updated.get("version"), Some(&json!(4)));
        assert_eq!(updated.get("uuid"), Some(&json!("u1")));

        let err = store
            .update(json!({"version": 5}), "u1", Some(&condition))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpdateConditionFailed);
        assert_eq!(
            store.get("u1").await.unwrap().unwrap().get("version"),
            Some(&json!(4))
        );
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let err = store()
            .update(json!({"a": 1}), "nope", None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_patch_merges() {
        let store = store();
        store
            .save(json!({"uuid": "u1", "a": 1, "nested": {"x": 1, "y": 2}}))
            .await
            .unwrap();
        let patched = store
            .patch(json!({"a": null, "nested": {"y": 3}}), "u1", None)
            .await
            .unwrap();
        assert!(patched.get("a").is_none());
        assert_eq!(patched.get("nested"), Some(&json!({"x": 1, "y": 3})));
    }

    #[tokio::test]
    async fn test_partial_updates() {
        let store = store();
        store.save(json!({"uuid": "u1", "count": 1})).await.unwrap();

        store.increment_attribute("u1", "count", 2).await.unwrap();
        store
            .upsert_item_to_collection("u1", "actions", json!({"type": "plop"}), None, None)
            .await
            .unwrap();
        store.remove_attribute("u1", "count", None).await.unwrap();

        let object = store.get("u1").await.unwrap().unwrap();
        assert!(object.get("count").is_none());
        assert_eq!(object.get("actions"), Some(&json!([{"type": "plop"}])));

        let err = store
            .increment_attribute("u1", "actions", 1)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_collection_condition_checks_current_item() {
        let store = store();
        store
            .save(json!({"uuid": "u1", "actions": [{"type": "other"}]}))
            .await
            .unwrap();

        let condition = WriteCondition::new("type", "plop");
        let err = store
            .upsert_item_to_collection("u1", "actions", json!({"type": "new"}), Some(0), Some(&condition))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpdateConditionFailed);
        assert_eq!(
            store.get("u1").await.unwrap().unwrap().get("actions"),
            Some(&json!([{"type": "other"}]))
        );

        let err = store
            .delete_item_from_collection("u1", "actions", 3, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_bookkeeping_fields_are_protected() {
        let store = store();
        store.save(json!({"uuid": "u1"})).await.unwrap();
        assert!(store.remove_attribute("u1", "uuid", None).await.is_err());
        let patched = store.patch(json!({"uuid": "u2"}), "u1", None).await.unwrap();
        assert_eq!(patched.id(), "u1");
        assert_eq!(patched.get("uuid"), Some(&json!("u1")));
    }

    #[tokio::test]
    async fn test_tombstones() {
        let store = MemoryStore::new(StoreConfig::new("users").with_delete_mode(DeleteMode::Tombstone))
            .unwrap();
        store.save(json!({"uuid": "u1", "a": 1})).await.unwrap();
        store.delete("u1", None).await.unwrap();

        assert!(store.get("u1").await.unwrap().is_none());
        assert!(!store.exists("u1").await.unwrap());
        assert!(store.find(&Query::all()).await.unwrap().results.is_empty());
        assert!(store.get_all(None).await.unwrap().is_empty());
        assert!(store.patch(json!({"a": 2}), "u1", None).await.unwrap_err().is_not_found());
        assert!(store.delete("u1", None).await.unwrap_err().is_not_found());
        assert_eq!(
            store.save(json!({"uuid": "u1"})).await.unwrap_err().kind(),
            ErrorKind::Conflict
        );
        assert_eq!(store.len(), 1);

        store.purge("u1").await.unwrap();
        assert!(store.is_empty());
        store.save(json!({"uuid": "u1"})).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_with_condition() {
        let store = store();
        store.save(json!({"uuid": "u1", "owner": "a"})).await.unwrap();
        let err = store
            .delete("u1", Some(&WriteCondition::new("owner", "b")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpdateConditionFailed);
        store
            .delete("u1", Some(&WriteCondition::new("owner", "a")))
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_get_all_preserves_request_order() {
        let store = store();
        for id in ["a", "b", "c"] {
            store.save(json!({"uuid": id})).await.unwrap();
        }
        let ids = vec!["c".to_string(), "missing".to_string(), "a".to_string()];
        let found: Vec<String> = store
            .get_all(Some(&ids))
            .await
            .unwrap()
            .iter()
            .map(|o| o.id().to_string())
            .collect();
        assert_eq!(found, vec!["c", "a"]);
        assert_eq!(store.get_all(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_restricted_profile_applies_residual() {
        let config = MemoryConfig::new(StoreConfig::new("people")).with_capabilities(
            BackendCapabilities::indexed(
                BackendKind::Memory,
                vec![IndexDefinition::new(["state", "role"], None)],
            ),
        );
        let store = MemoryStore::with_config(config).unwrap();
        for (i, state) in ["CA", "CA", "NY"].iter().enumerate() {
            store
                .save(json!({"uuid": format!("p{}", i), "state": state, "role": i}))
                .await
                .unwrap();
        }

        let exact = store
            .find(&Query::parse("state = 'CA' AND role = 1").unwrap())
            .await
            .unwrap();
        assert!(!exact.residual_applied);
        assert_eq!(exact.results.len(), 1);

        let ranged = store
            .find(&Query::parse("state = 'CA' AND role <= 1").unwrap())
            .await
            .unwrap();
        assert!(ranged.residual_applied);
        assert_eq!(ranged.results.len(), 2);
    }

    #[test]
    fn test_config_deserializes_flat() {
        let config: MemoryConfig = serde_json::from_value(json!({
            "name": "users",
            "delete_mode": "tombstone"
        }))
        .unwrap();
        assert_eq!(config.store.delete_mode, DeleteMode::Tombstone);
        assert_eq!(config.capabilities, BackendCapabilities::full(BackendKind::Memory));
    }
}
