//! Denormalization of source objects into target collections.
//!
//! A [`Mapper`] binds one [`MapperLink`] to a source and a target store.
//! It listens to the source store and replays every committed change of a
//! source object into the projection list of the target object it points
//! at:
//!
//! | Source event | Replay |
//! |--------------|--------|
//! | `Saved` | add the projection to the target |
//! | update, key unchanged, copied field changed | replace the projection in place |
//! | update, key changed | remove from the old target, add to the new one |
//! | `Deleted` | remove the projection |
//!
//! With `cascade_delete`, the mapper also listens to the target store and
//! deletes the listed source objects when a target is deleted.
//!
//! Projections are located by id and rewritten with an index-addressed,
//! conditional collection update, so a concurrent change to the list is
//! detected and the replay re-reads and retries. Writes made by a mapper
//! run under its [`ReplayTag`]; the mapper skips events carrying its own
//! tag.
//!
//! Replays run inline with the triggering write. A failure is returned to
//! the caller of that write, except during a cascade, where each failed
//! delete is logged and the cascade moves on.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use polystore::backends::memory::MemoryStore;
//! use polystore::core::{Store, StoreConfig};
//! use polystore::mapper::{Mapper, MapperLink};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let users: Arc<dyn Store> = Arc::new(MemoryStore::new(StoreConfig::new("users"))?);
//! let idents: Arc<dyn Store> = Arc::new(MemoryStore::new(StoreConfig::new("idents"))?);
//!
//! let link = MapperLink::new("idents", "user", "users", "idents").with_copied_fields(["kind"]);
//! let mapper = Mapper::new(link, idents.clone(), users.clone())?;
//! mapper.attach();
//!
//! users.save(json!({"uuid": "u1"})).await?;
//! idents.save(json!({"uuid": "i1", "user": "u1", "kind": "email"})).await?;
//!
//! let user = users.get_or_fail("u1").await?;
//! assert_eq!(user.content()["idents"], json!([{"uuid": "i1", "kind": "email"}]));
//! # Ok::<_, polystore::StorageError>(())
//! # }).unwrap();
//! ```

mod link;

pub use link::MapperLink;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::core::config::ConfigError;
use crate::core::{
    replaying, LifecycleEvent, ReplayTag, Store, StoreEvent, StoreListener, StoredObject,
    WriteCondition,
};
use crate::error::{StorageError, StorageResult, ValidationError};

/// Replays one [`MapperLink`] between two stores.
pub struct Mapper {
    name: String,
    link: MapperLink,
    source: Arc<dyn Store>,
    target: Arc<dyn Store>,
    tag: ReplayTag,
}

impl std::fmt::Debug for Mapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapper")
            .field("name", &self.name)
            .field("link", &self.link)
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

impl Mapper {
    /// Binds a link to its stores.
    ///
    /// Fails when the link is invalid, when the store names disagree with
    /// the link, or when the target collection would overwrite a field the
    /// target store maintains itself.
    pub fn new(
        link: MapperLink,
        source: Arc<dyn Store>,
        target: Arc<dyn Store>,
    ) -> StorageResult<Arc<Self>> {
        link.validate()?;
        for (option, expected, actual) in [
            ("source_store", &link.source_store, source.name()),
            ("target_store", &link.target_store, target.name()),
        ] {
            if expected != actual {
                return Err(ConfigError::Invalid {
                    option: option.to_string(),
                    message: format!("link names '{}' but the store is '{}'", expected, actual),
                }
                .into());
            }
        }
        let target_config = target.config();
        if link.target_collection_field == target_config.id_field
            || link.target_collection_field == target_config.last_update_field
        {
            return Err(ConfigError::Conflict(format!(
                "'{}' is maintained by store '{}'",
                link.target_collection_field, link.target_store
            ))
            .into());
        }

        let name = format!(
            "mapper:{}.{}->{}.{}",
            link.source_store,
            link.source_key_field,
            link.target_store,
            link.target_collection_field
        );
        Ok(Arc::new(Self {
            tag: ReplayTag::unique(&name),
            name,
            link,
            source,
            target,
        }))
    }

    /// Starts listening to the source store, and to the target store when
    /// the link cascades deletes.
    pub fn attach(self: &Arc<Self>) {
        self.source.events().subscribe(self.clone());
        if self.link.cascade_delete {
            self.target.events().subscribe(self.clone());
        }
    }

    /// Stops listening.
    pub fn detach(&self) {
        self.source.events().unsubscribe(&self.name);
        self.target.events().unsubscribe(&self.name);
    }

    /// Returns the link.
    pub fn link(&self) -> &MapperLink {
        &self.link
    }

    /// Returns the tag of this mapper's writes.
    pub fn tag(&self) -> &ReplayTag {
        &self.tag
    }

    fn source_id_field(&self) -> &str {
        &self.source.config().id_field
    }

    fn projection_of(&self, object: &StoredObject) -> Value {
        self.link
            .project(self.source_id_field(), object.id(), object.content())
    }

    /// Position of the projection of `source_id` in the target's list.
    fn position(&self, target: &StoredObject, source_id: &str) -> Option<usize> {
        target
            .get(&self.link.target_collection_field)
            .and_then(Value::as_array)?
            .iter()
            .position(|item| {
                item.get(self.source_id_field()).and_then(Value::as_str) == Some(source_id)
            })
    }

    /// Adds the projection to `target_id`, or replaces it if present.
    async fn put_projection(
        &self,
        target_id: &str,
        source_id: &str,
        projection: Value,
    ) -> StorageResult<()> {
        let collection = &self.link.target_collection_field;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let Some(target) = self.target.get(target_id).await? else {
                warn!(
                    mapper = %self.name,
                    source = source_id,
                    target = target_id,
                    "Target object not found, projection skipped"
                );
                return Ok(());
            };
            let result = match self.position(&target, source_id) {
                Some(index) => {
                    let condition = WriteCondition::new(self.source_id_field(), source_id);
                    self.target
                        .upsert_item_to_collection(
                            target_id,
                            collection,
                            projection.clone(),
                            Some(index),
                            Some(&condition),
                        )
                        .await
                }
                None => {
                    self.target
                        .upsert_item_to_collection(
                            target_id,
                            collection,
                            projection.clone(),
                            None,
                            None,
                        )
                        .await
                }
            };
            match result {
                Err(e) if is_stale(&e) && attempt < self.link.max_replay_attempts => {
                    warn!(
                        mapper = %self.name,
                        target = target_id,
                        attempt = attempt,
                        "Projection list changed during replay, retrying"
                    );
                }
                other => return other,
            }
        }
    }

    /// Removes the projection of `source_id` from `target_id`, if present.
    async fn remove_projection(&self, target_id: &str, source_id: &str) -> StorageResult<()> {
        let collection = &self.link.target_collection_field;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let Some(target) = self.target.get(target_id).await? else {
                debug!(mapper = %self.name, target = target_id, "Target already gone");
                return Ok(());
            };
            let Some(index) = self.position(&target, source_id) else {
                return Ok(());
            };
            let condition = WriteCondition::new(self.source_id_field(), source_id);
            let result = self
                .target
                .delete_item_from_collection(target_id, collection, index, Some(&condition))
                .await;
            match result {
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) if is_stale(&e) && attempt < self.link.max_replay_attempts => {
                    warn!(
                        mapper = %self.name,
                        target = target_id,
                        attempt = attempt,
                        "Projection list changed during replay, retrying"
                    );
                }
                other => return other,
            }
        }
    }

    async fn replay_saved(&self, object: &StoredObject) -> StorageResult<()> {
        let Some(target_id) = self.link.target_of(object.content()) else {
            return Ok(());
        };
        self.put_projection(target_id, object.id(), self.projection_of(object))
            .await
    }

    async fn replay_changed(
        &self,
        object: &StoredObject,
        previous: Option<&StoredObject>,
    ) -> StorageResult<()> {
        let new_target = self.link.target_of(object.content());
        let Some(previous) = previous else {
            // Without the previous state the old target is unknown; make
            // sure the current one is right.
            return match new_target {
                Some(target_id) => {
                    self.put_projection(target_id, object.id(), self.projection_of(object))
                        .await
                }
                None => Ok(()),
            };
        };

        let old_target = self.link.target_of(previous.content());
        if old_target != new_target {
            warn!(
                mapper = %self.name,
                source = object.id(),
                from = old_target.unwrap_or("-"),
                to = new_target.unwrap_or("-"),
                "Relocating projection"
            );
            if let Some(old_id) = old_target {
                self.remove_projection(old_id, object.id()).await?;
            }
            if let Some(new_id) = new_target {
                self.put_projection(new_id, object.id(), self.projection_of(object))
                    .await?;
            }
            return Ok(());
        }

        let projection = self.projection_of(object);
        match new_target {
            Some(target_id) if projection != self.projection_of(previous) => {
                self.put_projection(target_id, object.id(), projection).await
            }
            _ => Ok(()),
        }
    }

    async fn replay_deleted(&self, object: &StoredObject) -> StorageResult<()> {
        match self.link.target_of(object.content()) {
            Some(target_id) => self.remove_projection(target_id, object.id()).await,
            None => Ok(()),
        }
    }

    /// Deletes the source objects listed by a deleted target.
    async fn cascade(&self, target: &StoredObject) {
        let Some(items) = target
            .get(&self.link.target_collection_field)
            .and_then(Value::as_array)
        else {
            return;
        };
        let condition = WriteCondition::new(self.link.source_key_field.clone(), target.id());
        for item in items {
            let Some(source_id) = item.get(self.source_id_field()).and_then(Value::as_str) else {
                continue;
            };
            match self.source.delete(source_id, Some(&condition)).await {
                Ok(()) => debug!(
                    mapper = %self.name,
                    target = target.id(),
                    source = source_id,
                    "Cascade deleted source object"
                ),
                Err(e) if e.is_not_found() => debug!(
                    mapper = %self.name,
                    source = source_id,
                    "Cascade target already deleted"
                ),
                Err(e) => error!(
                    mapper = %self.name,
                    target = target.id(),
                    source = source_id,
                    error = %e,
                    "Cascade delete failed"
                ),
            }
        }
    }

    async fn handle(&self, event: &StoreEvent) -> StorageResult<()> {
        if event.store == self.link.source_store {
            match &event.event {
                LifecycleEvent::Saved { object } => self.replay_saved(object).await,
                LifecycleEvent::Updated { object, previous }
                | LifecycleEvent::PatchUpdated {
                    object, previous, ..
                }
                | LifecycleEvent::PartialUpdated {
                    object, previous, ..
                } => self.replay_changed(object, previous.as_ref()).await,
                LifecycleEvent::Deleted { object, .. } => self.replay_deleted(object).await,
            }
        } else if event.store == self.link.target_store && self.link.cascade_delete {
            if let LifecycleEvent::Deleted { object, .. } = &event.event {
                self.cascade(object).await;
            }
            Ok(())
        } else {
            Ok(())
        }
    }
}

/// True when the projection list moved under a replay.
fn is_stale(err: &StorageError) -> bool {
    err.is_retryable()
        || matches!(
            err,
            StorageError::Validation(ValidationError::IndexOutOfRange { .. })
        )
}

#[async_trait]
impl StoreListener for Mapper {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_event(&self, event: &StoreEvent) -> StorageResult<()> {
        if event.originates_from(&self.tag) {
            debug!(
                mapper = %self.name,
                event = %event.event.kind(),
                id = event.event.object_id(),
                "Skipping own replay"
            );
            return Ok(());
        }
        replaying(self.tag.clone(), self.handle(event)).await
    }
}
