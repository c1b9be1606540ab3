//! Replays store events into the search index.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use elasticsearch::params::Refresh;
use elasticsearch::{DeleteParts, Elasticsearch, UpdateParts};
use serde_json::{json, Value};
use tracing::debug;

use crate::core::object::format_timestamp;
use crate::core::{LifecycleEvent, StoreEvent, StoreListener, StoredObject};
use crate::error::{BackendError, StorageError, StorageResult};

use super::backend::ElasticsearchConfig;
use super::query_builder::project;
use super::schema;

/// Replaces the stored document unless it already reflects a later write,
/// in which case the update is a `noop`.
const REPLACE_IF_NEWER: &str = "\
if (ctx._source.last_updated != null && ctx._source.last_updated.compareTo(params.doc.last_updated) > 0) {\
  ctx.op = 'noop';\
} else {\
  ctx._source.clear();\
  ctx._source.putAll(params.doc);\
}";

fn internal_error(message: String) -> StorageError {
    StorageError::Backend(BackendError::Internal {
        backend_name: "elasticsearch".to_string(),
        message,
        source: None,
    })
}

/// Keeps one index in step with the events of one store.
pub struct IndexProjection {
    name: String,
    client: Elasticsearch,
    index: String,
    config: ElasticsearchConfig,
    index_ready: AtomicBool,
}

impl IndexProjection {
    pub(super) fn new(client: Elasticsearch, index: String, config: ElasticsearchConfig) -> Self {
        Self {
            name: format!("elasticsearch:{}", index),
            client,
            index,
            config,
            index_ready: AtomicBool::new(false),
        }
    }

    pub(super) fn mark_index_ready(&self) {
        self.index_ready.store(true, Ordering::Release);
    }

    async fn ensure_index(&self) -> StorageResult<()> {
        if !self.index_ready.load(Ordering::Acquire) {
            schema::ensure_index(&self.client, &self.index, &self.config).await?;
            self.mark_index_ready();
        }
        Ok(())
    }

    fn refresh(&self) -> Refresh {
        if self.config.refresh_on_write {
            Refresh::WaitFor
        } else {
            Refresh::False
        }
    }

    /// Writes the search document of `object`.
    pub(super) async fn index_object(&self, object: &StoredObject) -> StorageResult<()> {
        self.ensure_index().await?;
        let doc = project(
            object.id(),
            object.content(),
            &format_timestamp(object.last_updated()),
        );
        let response = self
            .client
            .update(UpdateParts::IndexId(&self.index, object.id()))
            .refresh(self.refresh())
            .retry_on_conflict(3)
            .body(json!({
                "scripted_upsert": true,
                "script": {
                    "lang": "painless",
                    "source": REPLACE_IF_NEWER,
                    "params": { "doc": doc }
                },
                "upsert": {}
            }))
            .send()
            .await
            .map_err(|e| internal_error(format!("Failed to index document: {}", e)))?;

        let status = response.status_code();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(internal_error(format!(
                "Failed to index document (status {}): {}",
                status, body
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| internal_error(format!("Failed to parse index response: {}", e)))?;
        debug!(
            index = %self.index,
            id = object.id(),
            result = body.get("result").and_then(Value::as_str).unwrap_or("unknown"),
            "Projected object"
        );
        Ok(())
    }

    async fn remove(&self, id: &str) -> StorageResult<()> {
        let response = self
            .client
            .delete(DeleteParts::IndexId(&self.index, id))
            .refresh(self.refresh())
            .send()
            .await
            .map_err(|e| internal_error(format!("Failed to delete document: {}", e)))?;

        let status = response.status_code();
        // Already gone, or the index was never created.
        if !status.is_success() && status.as_u16() != 404 {
            let body = response.text().await.unwrap_or_default();
            return Err(internal_error(format!(
                "Failed to delete document (status {}): {}",
                status, body
            )));
        }
        debug!(index = %self.index, id = id, "Removed projected object");
        Ok(())
    }
}

#[async_trait]
impl StoreListener for IndexProjection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_event(&self, event: &StoreEvent) -> StorageResult<()> {
        match &event.event {
            LifecycleEvent::Deleted { object, .. } => self.remove(object.id()).await,
            other => self.index_object(other.object()).await,
        }
    }
}
