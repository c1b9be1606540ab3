//! Flat-file backend.
//!
//! Each object is one JSON file, `<root>/<directory>/<id>.json`, written
//! through `object_store`'s local file system. Creation uses put-if-absent,
//! so two stores racing to save the same id cannot both succeed. Every other
//! conditional write is advisory: the read, compare and write happen under
//! a lock held by this store instance only, and processes sharing a
//! directory are not coordinated.
//!
//! No query is evaluated natively; every filter is applied in memory over
//! a full directory listing.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::local::LocalFileSystem;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::core::condition::{check_condition, check_partial_condition};
use crate::core::config::{require_identifier, ConfigError};
use crate::core::executor::window;
use crate::core::object::{self, check_mutable_attribute, touch};
use crate::core::{
    execute_find, BackendKind, DeleteMode, LifecycleEvent, NativeScan, ObjectState,
    PartialUpdate, Store, StoreConfig, StoreEvents, StoredObject, WriteCondition,
};
use crate::error::{BackendError, StorageError, StorageResult};
use crate::expr::Expression;
use crate::query::{
    compile, BackendCapabilities, CompiledQuery, EvaluatorDialect, FindResult, OrderBy, Query,
};

const FILE_SUFFIX: &str = ".json";

/// Configuration for [`FileSystemStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSystemConfig {
    /// Common store options.
    #[serde(flatten)]
    pub store: StoreConfig,

    /// Root directory shared by stores.
    pub root: PathBuf,

    /// Sub-directory holding this store's files; defaults to the store name.
    #[serde(default)]
    pub directory: Option<String>,

    /// Create the root directory when it does not exist.
    #[serde(default = "default_true")]
    pub create_root: bool,
}

fn default_true() -> bool {
    true
}

impl FileSystemConfig {
    /// Creates a configuration rooted at `root`.
    pub fn new(store: StoreConfig, root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            root: root.into(),
            directory: None,
            create_root: true,
        }
    }

    /// Returns the store directory name.
    pub fn directory_name(&self) -> &str {
        self.directory.as_deref().unwrap_or(&self.store.name)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.validate()?;
        if self.root.as_os_str().is_empty() {
            return Err(ConfigError::empty("root"));
        }
        require_identifier("directory", self.directory_name())
    }
}

fn serialization_error(message: String) -> StorageError {
    StorageError::Backend(BackendError::SerializationError { message })
}

/// Store keeping one JSON file per object.
pub struct FileSystemStore {
    files: Arc<dyn ObjectStore>,
    directory: Path,
    config: FileSystemConfig,
    capabilities: BackendCapabilities,
    events: StoreEvents,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for FileSystemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystemStore")
            .field("config", &self.config)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl FileSystemStore {
    /// Opens a store under `root`.
    pub fn open(root: impl Into<PathBuf>, store: StoreConfig) -> StorageResult<Self> {
        Self::with_config(FileSystemConfig::new(store, root))
    }

    /// Opens a store with custom configuration.
    pub fn with_config(config: FileSystemConfig) -> StorageResult<Self> {
        config.validate()?;
        if config.create_root {
            std::fs::create_dir_all(&config.root).map_err(|e| {
                StorageError::Backend(BackendError::ConnectionFailed {
                    backend_name: "filesystem".to_string(),
                    message: format!("cannot create {}: {}", config.root.display(), e),
                })
            })?;
        }
        let files = LocalFileSystem::new_with_prefix(&config.root).map_err(|e| {
            StorageError::Backend(BackendError::ConnectionFailed {
                backend_name: "filesystem".to_string(),
                message: e.to_string(),
            })
        })?;
        info!(
            store = %config.store.name,
            root = %config.root.display(),
            directory = config.directory_name(),
            "Opened flat-file store"
        );

        Ok(Self {
            files: Arc::new(files),
            directory: Path::from(config.directory_name()),
            events: StoreEvents::new(config.store.name.clone()),
            capabilities: BackendCapabilities::scan_only(BackendKind::FileSystem),
            config,
            write_lock: Mutex::new(()),
        })
    }

    /// Returns the backend configuration.
    pub fn file_system_config(&self) -> &FileSystemConfig {
        &self.config
    }

    fn location(&self, id: &str) -> Path {
        self.directory.child(format!("{}{}", id, FILE_SUFFIX))
    }

    async fn read_file(&self, location: &Path) -> StorageResult<Option<StoredObject>> {
        let result = match self.files.get(location).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let bytes = result.bytes().await?;
        let object = serde_json::from_slice::<StoredObject>(&bytes).map_err(|e| {
            serialization_error(format!("Failed to deserialize {}: {}", location, e))
        })?;
        Ok(Some(object))
    }

    async fn read(&self, id: &str) -> StorageResult<Option<StoredObject>> {
        object::validate_id(id)?;
        self.read_file(&self.location(id)).await
    }

    async fn read_visible(&self, id: &str) -> StorageResult<StoredObject> {
        self.read(id)
            .await?
            .filter(|o| !o.is_tombstoned())
            .ok_or_else(|| StorageError::not_found(self.name(), id))
    }

    async fn write(&self, object: &StoredObject, mode: PutMode) -> StorageResult<()> {
        let bytes = serde_json::to_vec(object)
            .map_err(|e| serialization_error(format!("Failed to serialize object: {}", e)))?;
        self.files
            .put_opts(
                &self.location(object.id()),
                PutPayload::from(bytes),
                PutOptions::from(mode),
            )
            .await?;
        Ok(())
    }

    /// Reads every file of the store, tombstones included.
    async fn read_all(&self) -> StorageResult<Vec<StoredObject>> {
        let listing: Vec<_> = self
            .files
            .list(Some(&self.directory))
            .try_collect()
            .await?;
        let mut objects = Vec::with_capacity(listing.len());
        for meta in listing {
            if !meta.location.as_ref().ends_with(FILE_SUFFIX) {
                continue;
            }
            // Deleted between listing and reading.
            if let Some(object) = self.read_file(&meta.location).await? {
                objects.push(object);
            }
        }
        Ok(objects)
    }

    /// Applies `change` to the visible object `id` under the write lock.
    ///
    /// Returns the new state and the previous one.
    async fn mutate<F>(&self, id: &str, change: F) -> StorageResult<(StoredObject, StoredObject)>
    where
        F: FnOnce(&mut Value) -> StorageResult<()>,
    {
        let _guard = self.write_lock.lock().await;
        let previous = self.read_visible(id).await?;
        let mut content = previous.content().clone();
        change(&mut content)?;
        let now = object::now();
        touch(&self.config.store, &mut content, now);
        let current = StoredObject::new(id, content, now);
        self.write(&current, PutMode::Overwrite).await?;
        Ok((current, previous))
    }

    async fn partial_update(
        &self,
        id: &str,
        update: PartialUpdate,
        condition: Option<&WriteCondition>,
    ) -> StorageResult<()> {
        check_mutable_attribute(&self.config.store, update.attribute())?;
        let (object, previous) = self
            .mutate(id, |content| {
                check_partial_condition(condition, &update, id, content)?;
                update.apply(content)?;
                Ok(())
            })
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
}

#[async_trait]
impl NativeScan for FileSystemStore {
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
            .read_all()
            .await?
            .into_iter()
            .filter(|o| !o.is_tombstoned() && filter.evaluate(o.content()))
            .collect();
        Ok(window(rows, order, offset, limit))
    }
}

#[async_trait]
impl Store for FileSystemStore {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::FileSystem
    }

    fn config(&self) -> &StoreConfig {
        &self.config.store
    }

    fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    fn events(&self) -> &StoreEvents {
        &self.events
    }

    async fn get(&self, id: &str) -> StorageResult<Option<StoredObject>> {
        if object::validate_id(id).is_err() {
            return Ok(None);
        }
        Ok(self.read(id).await?.filter(|o| !o.is_tombstoned()))
    }

    async fn save(&self, object: Value) -> StorageResult<StoredObject> {
        let (id, content, now) = object::prepare_new(&self.config.store, object)?;
        let stored = StoredObject::new(id, content, now);
        match self.write(&stored, PutMode::Create).await {
            Ok(()) => {}
            Err(StorageError::Backend(BackendError::Internal {
                source: Some(source),
                ..
            })) if matches!(
                source.downcast_ref::<object_store::Error>(),
                Some(object_store::Error::AlreadyExists { .. })
            ) =>
            {
                return Err(StorageError::conflict(self.name(), stored.id()));
            }
            Err(err) => return Err(err),
        }
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
            .mutate(id, |content| {
                check_condition(condition, id, content)?;
                *content = replacement;
                Ok(())
            })
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
            .mutate(id, |content| {
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
        let object = {
            let _guard = self.write_lock.lock().await;
            let previous = self.read_visible(id).await?;
            check_condition(condition, id, previous.content())?;
            match self.config.store.delete_mode {
                DeleteMode::Hard => self.files.delete(&self.location(id)).await?,
                DeleteMode::Tombstone => {
                    let mut content = previous.content().clone();
                    let now = object::now();
                    touch(&self.config.store, &mut content, now);
                    let tombstone =
                        StoredObject::new(id, content, now).with_state(ObjectState::Tombstoned);
                    self.write(&tombstone, PutMode::Overwrite).await?;
                }
            }
            previous
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
            let _guard = self.write_lock.lock().await;
            let removed = self
                .read(id)
                .await?
                .ok_or_else(|| StorageError::not_found(self.name(), id))?;
            self.files.delete(&self.location(id)).await?;
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
        match ids {
            Some(ids) => {
                let mut objects = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(object) = self.get(id).await? {
                        objects.push(object);
                    }
                }
                Ok(objects)
            }
            None => {
                let mut objects: Vec<StoredObject> = self
                    .read_all()
                    .await?
                    .into_iter()
                    .filter(|o| !o.is_tombstoned())
                    .collect();
                objects.sort_by(|a, b| a.id().cmp(b.id()));
                Ok(objects)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn store(dir: &tempfile::TempDir) -> FileSystemStore {
        FileSystemStore::open(dir.path(), StoreConfig::new("users")).unwrap()
    }

    #[tokio::test]
    async fn test_one_file_per_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.save(json!({"uuid": "u1", "name": "ada"})).await.unwrap();

        let file = dir.path().join("users").join("u1.json");
        assert!(file.exists());
        let persisted: StoredObject =
            serde_json::from_slice(&std::fs::read(file).unwrap()).unwrap();
        assert_eq!(persisted.get("name"), Some(&json!("ada")));
    }

    #[tokio::test]
    async fn test_save_is_put_if_absent() {
        let dir = tempfile::tempdir().unwrap();
        let first = store(&dir);
        let second = store(&dir);
        first.save(json!({"uuid": "u1"})).await.unwrap();

        let err = second.save(json!({"uuid": "u1"})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_mutations_and_conditions() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.save(json!({"uuid": "u1", "type": "plop"})).await.unwrap();

        store.increment_attribute("u1", "hits", 2).await.unwrap();
        store
            .upsert_item_to_collection("u1", "actions", json!({"type": "a"}), None, None)
            .await
            .unwrap();
        let err = store
            .patch(json!({"type": "x"}), "u1", Some(&WriteCondition::new("type", "other")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpdateConditionFailed);

        let object = store.get_or_fail("u1").await.unwrap();
        assert_eq!(object.get("hits"), Some(&json!(2)));
        assert_eq!(object.get("type"), Some(&json!("plop")));
        assert_eq!(object.get("actions"), Some(&json!([{"type": "a"}])));
    }

    #[tokio::test]
    async fn test_every_query_is_residual() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        for (id, age) in [("a", 10), ("b", 20), ("c", 30)] {
            store.save(json!({"uuid": id, "age": age})).await.unwrap();
        }

        let page = store
            .find(&Query::parse("age > 15").unwrap().with_limit(1))
            .await
            .unwrap();
        assert!(page.residual_applied);
        assert_eq!(page.results[0].id(), "b");

        let token = page.continuation_token.unwrap();
        let page = store
            .find(&Query::parse("age > 15").unwrap().with_limit(1).with_continuation(token))
            .await
            .unwrap();
        assert_eq!(page.results[0].id(), "c");
    }

    #[tokio::test]
    async fn test_delete_modes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSystemStore::open(
            dir.path(),
            StoreConfig::new("users").with_delete_mode(DeleteMode::Tombstone),
        )
        .unwrap();
        store.save(json!({"uuid": "u1"})).await.unwrap();
        store.delete("u1", None).await.unwrap();

        assert!(store.get("u1").await.unwrap().is_none());
        assert!(dir.path().join("users").join("u1.json").exists());

        store.purge("u1").await.unwrap();
        assert!(!dir.path().join("users").join("u1.json").exists());
        assert!(store.purge("u1").await.unwrap_err().is_not_found());
    }

    #[test]
    fn test_config_validation() {
        let config = FileSystemConfig::new(StoreConfig::new("users"), "");
        assert!(matches!(config.validate(), Err(ConfigError::Empty { .. })));

        let mut config = FileSystemConfig::new(StoreConfig::new("users"), "/tmp/x");
        config.directory = Some("../escape".to_string());
        assert!(config.validate().is_err());
    }
}
