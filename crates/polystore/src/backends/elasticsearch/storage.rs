//! [`Store`] implementation for the Elasticsearch projection.
//!
//! Every mutation is forwarded to the authoritative store, whose events
//! reach the index through the subscribed projection before the call
//! returns. Queries search the index for ids and load the objects from
//! the authoritative store, so results never show index-only state.

use async_trait::async_trait;
use elasticsearch::SearchParts;
use serde_json::{json, Value};
use tracing::debug;

use crate::core::{
    execute_find, BackendKind, NativeScan, Store, StoreConfig, StoreEvents, StoredObject,
    WriteCondition,
};
use crate::error::{BackendError, ConfigurationError, QueryError, StorageError, StorageResult};
use crate::expr::Expression;
use crate::query::{compile, BackendCapabilities, CompiledQuery, FindResult, OrderBy, Query, QueryDialect};

use super::backend::ElasticsearchStore;

fn internal_error(message: String) -> StorageError {
    StorageError::Backend(BackendError::Internal {
        backend_name: "elasticsearch".to_string(),
        message,
        source: None,
    })
}

/// Extracts the ids of the hits of a search response, in hit order.
fn hit_ids(body: &Value) -> Vec<String> {
    body.get("hits")
        .and_then(|h| h.get("hits"))
        .and_then(Value::as_array)
        .map(|hits| {
            hits.iter()
                .filter_map(|hit| hit.get("_id").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl ElasticsearchStore {
    /// Runs one search request and returns the matching ids.
    async fn search_ids(
        &self,
        filter: &Value,
        order: &[OrderBy],
        offset: u64,
        limit: u64,
    ) -> StorageResult<Vec<String>> {
        let window = u64::from(self.config.max_result_window);
        if offset >= window {
            return Err(beyond_window(offset, window));
        }
        let size = limit.min(window - offset);

        let body = json!({
            "query": { "bool": { "filter": [filter] } },
            "sort": self.dialect.sort(order)?,
            "from": offset,
            "size": size,
            "_source": false,
            "track_total_hits": false
        });

        let response = self
            .client
            .search(SearchParts::Index(&[&self.index]))
            .body(body)
            .send()
            .await?;

        let status = response.status_code();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if body.contains("index_not_found_exception") {
                return Err(StorageError::Configuration(ConfigurationError::UnknownIndex {
                    index: self.index.clone(),
                }));
            }
            return Err(internal_error(format!(
                "Search failed (status {}): {}",
                status, body
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| internal_error(format!("Failed to parse search response: {}", e)))?;
        let ids = hit_ids(&body);
        // A full window cut short by the cap may hide further matches.
        if size < limit && ids.len() as u64 == size {
            return Err(beyond_window(offset + size, window));
        }
        Ok(ids)
    }
}

fn beyond_window(offset: u64, window: u64) -> StorageError {
    QueryError::CompilationUnsupported {
        backend: BackendKind::Elasticsearch.to_string(),
        message: format!("offset {} is beyond the result window of {}", offset, window),
    }
    .into()
}

#[async_trait]
impl NativeScan for ElasticsearchStore {
    type Filter = Value;

    fn compile_filter(&self, filter: &Expression) -> StorageResult<CompiledQuery<Value>> {
        Ok(compile(&self.dialect, filter)?)
    }

    async fn scan(
        &self,
        filter: &Value,
        order: &[OrderBy],
        offset: u64,
        limit: u64,
    ) -> StorageResult<Vec<StoredObject>> {
        let ids = self.search_ids(filter, order, offset, limit).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let objects = self.primary.get_all(Some(&ids)).await?;
        if objects.len() != ids.len() {
            debug!(
                index = %self.index,
                hits = ids.len(),
                loaded = objects.len(),
                "Skipped hits missing from the authoritative store"
            );
        }
        Ok(objects)
    }
}

#[async_trait]
impl Store for ElasticsearchStore {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::Elasticsearch
    }

    fn config(&self) -> &StoreConfig {
        self.primary.config()
    }

    fn capabilities(&self) -> &BackendCapabilities {
        self.dialect.capabilities()
    }

    fn events(&self) -> &StoreEvents {
        self.primary.events()
    }

    async fn get(&self, id: &str) -> StorageResult<Option<StoredObject>> {
        self.primary.get(id).await
    }

    async fn save(&self, object: Value) -> StorageResult<StoredObject> {
        self.primary.save(object).await
    }

    async fn update(
        &self,
        object: Value,
        id: &str,
        condition: Option<&WriteCondition>,
    ) -> StorageResult<StoredObject> {
        self.primary.update(object, id, condition).await
    }

    async fn patch(
        &self,
        partial: Value,
        id: &str,
        condition: Option<&WriteCondition>,
    ) -> StorageResult<StoredObject> {
        self.primary.patch(partial, id, condition).await
    }

    async fn delete(&self, id: &str, condition: Option<&WriteCondition>) -> StorageResult<()> {
        self.primary.delete(id, condition).await
    }

    async fn purge(&self, id: &str) -> StorageResult<()> {
        self.primary.purge(id).await
    }

    async fn increment_attribute(
        &self,
        id: &str,
        attribute: &str,
        delta: i64,
    ) -> StorageResult<()> {
        self.primary.increment_attribute(id, attribute, delta).await
    }

    async fn upsert_item_to_collection(
        &self,
        id: &str,
        collection: &str,
        item: Value,
        index: Option<usize>,
        condition: Option<&WriteCondition>,
    ) -> StorageResult<()> {
        self.primary
            .upsert_item_to_collection(id, collection, item, index, condition)
            .await
    }

    async fn delete_item_from_collection(
        &self,
        id: &str,
        collection: &str,
        index: usize,
        condition: Option<&WriteCondition>,
    ) -> StorageResult<()> {
        self.primary
            .delete_item_from_collection(id, collection, index, condition)
            .await
    }

    async fn remove_attribute(
        &self,
        id: &str,
        attribute: &str,
        condition: Option<&WriteCondition>,
    ) -> StorageResult<()> {
        self.primary.remove_attribute(id, attribute, condition).await
    }

    async fn find(&self, query: &Query) -> StorageResult<FindResult> {
        execute_find(self, self.primary.config(), query).await
    }

    async fn get_all(&self, ids: Option<&[String]>) -> StorageResult<Vec<StoredObject>> {
        self.primary.get_all(ids).await
    }
}
