//! Core object storage trait.
//!
//! This module defines the [`Store`] trait, the uniform CRUD, collection
//! mutation and query interface every backend implements.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{StorageError, StorageResult};
use crate::query::{BackendCapabilities, FindResult, Query};

use super::backend::BackendKind;
use super::condition::WriteCondition;
use super::config::StoreConfig;
use super::events::StoreEvents;
use super::object::StoredObject;

/// Object store contract.
///
/// A store owns JSON objects keyed by the identifier attribute named in its
/// [`StoreConfig`] and maintains their last-update attribute on every
/// mutation.
///
/// # Write Conditions
///
/// Mutations accept an optional [`WriteCondition`]. The backend checks it
/// and applies the write in one atomic step; when it does not hold the call
/// fails with `UpdateConditionFailed` and the object is unchanged. Of two
/// racing writers with the same condition exactly one succeeds; the loser
/// is expected to re-read and retry.
///
/// # Events
///
/// Each successful mutation emits one lifecycle event through
/// [`Store::events`] before returning.
///
/// # Tombstones
///
/// With [`DeleteMode::Tombstone`](super::DeleteMode::Tombstone), `delete`
/// keeps the object as a tombstone. Tombstoned objects behave as absent
/// for every operation except [`Store::purge`] and `save`, which reports a
/// conflict on their id.
///
/// # Example
///
/// ```
/// use polystore::backends::memory::MemoryStore;
/// use polystore::core::{Store, StoreConfig, WriteCondition};
/// use polystore::query::Query;
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let store = MemoryStore::new(StoreConfig::new("users")).unwrap();
///
/// let saved = store.save(json!({"uuid": "u1", "version": 1})).await?;
/// assert_eq!(saved.id(), "u1");
///
/// // Conditional update: only applies while version is still 1.
/// store
///     .patch(json!({"version": 2}), "u1", Some(&WriteCondition::new("version", 1)))
///     .await?;
///
/// let page = store.find(&Query::parse("version = 2")?).await?;
/// assert_eq!(page.results.len(), 1);
/// # Ok::<_, polystore::error::StorageError>(())
/// # }).unwrap();
/// ```
#[async_trait]
pub trait Store: Send + Sync {
    /// Returns the backend type.
    fn backend_kind(&self) -> BackendKind;

    /// Returns the store configuration.
    fn config(&self) -> &StoreConfig;

    /// Returns the store name.
    fn name(&self) -> &str {
        &self.config().name
    }

    /// Returns the capability table used to compile queries.
    fn capabilities(&self) -> &BackendCapabilities;

    /// Returns the lifecycle event hub.
    fn events(&self) -> &StoreEvents;

    /// Reads an object.
    ///
    /// # Returns
    ///
    /// The object, or `None` if it is absent or tombstoned.
    async fn get(&self, id: &str) -> StorageResult<Option<StoredObject>>;

    /// Reads an object, failing with `NotFound` when it is absent.
    async fn get_or_fail(&self, id: &str) -> StorageResult<StoredObject> {
        self.get(id)
            .await?
            .ok_or_else(|| StorageError::not_found(self.name(), id))
    }

    /// Returns true if a visible object with this id exists.
    async fn exists(&self, id: &str) -> StorageResult<bool> {
        Ok(self.get(id).await?.is_some())
    }

    /// Creates an object.
    ///
    /// An identifier is generated when the object has none.
    ///
    /// # Errors
    ///
    /// * `StorageError::Resource(Conflict)` - if the id is already taken
    /// * `StorageError::Validation` - if the object is not a JSON object
    async fn save(&self, object: Value) -> StorageResult<StoredObject>;

    /// Replaces an object.
    ///
    /// # Errors
    ///
    /// * `StorageError::Resource(NotFound)` - if the object is absent
    /// * `StorageError::Concurrency(UpdateConditionFailed)` - if `condition` does not hold
    async fn update(
        &self,
        object: Value,
        id: &str,
        condition: Option<&WriteCondition>,
    ) -> StorageResult<StoredObject>;

    /// Merges a partial object into an object (RFC 7396 merge patch).
    ///
    /// Same errors as [`Store::update`].
    async fn patch(
        &self,
        partial: Value,
        id: &str,
        condition: Option<&WriteCondition>,
    ) -> StorageResult<StoredObject>;

    /// Deletes an object (or tombstones it, per configuration).
    async fn delete(&self, id: &str, condition: Option<&WriteCondition>) -> StorageResult<()>;

    /// Physically removes an object, tombstoned or not. No event is emitted
    /// for objects that were already tombstoned.
    async fn purge(&self, id: &str) -> StorageResult<()>;

    /// Atomically adds `delta` to a numeric attribute. A missing attribute
    /// counts as zero.
    async fn increment_attribute(&self, id: &str, attribute: &str, delta: i64)
    -> StorageResult<()>;

    /// Replaces the collection item at `index`, or appends when `index` is
    /// `None`.
    ///
    /// With an index, `condition` is checked against the item currently at
    /// that position rather than the object itself.
    async fn upsert_item_to_collection(
        &self,
        id: &str,
        collection: &str,
        item: Value,
        index: Option<usize>,
        condition: Option<&WriteCondition>,
    ) -> StorageResult<()>;

    /// Removes the collection item at `index`; `condition` is checked
    /// against that item.
    async fn delete_item_from_collection(
        &self,
        id: &str,
        collection: &str,
        index: usize,
        condition: Option<&WriteCondition>,
    ) -> StorageResult<()>;

    /// Removes an attribute.
    async fn remove_attribute(
        &self,
        id: &str,
        attribute: &str,
        condition: Option<&WriteCondition>,
    ) -> StorageResult<()>;

    /// Runs a query.
    ///
    /// The filter is compiled for this backend; whatever the backend cannot
    /// evaluate natively is applied in memory, which `residual_applied`
    /// reports.
    async fn find(&self, query: &Query) -> StorageResult<FindResult>;

    /// Reads several objects, or every object when `ids` is `None`.
    ///
    /// Absent ids are skipped; the result follows the order of `ids`.
    async fn get_all(&self, ids: Option<&[String]>) -> StorageResult<Vec<StoredObject>>;
}
