//! Index settings and mapping of the search projection.

use elasticsearch::indices::{IndicesCreateParts, IndicesExistsParts};
use elasticsearch::Elasticsearch;
use serde_json::{json, Value};
use tracing::info;

use crate::error::{BackendError, StorageError, StorageResult};

use super::backend::ElasticsearchConfig;
use super::query_builder::{ValueKind, ID_FIELD, LAST_UPDATED_FIELD};

/// Longest string, in characters, that is indexed. Lucene caps terms at
/// 32766 bytes.
pub(crate) const MAX_INDEXED_STRING: u32 = 8191;

fn internal_error(message: String) -> StorageError {
    StorageError::Backend(BackendError::Internal {
        backend_name: "elasticsearch".to_string(),
        message,
        source: None,
    })
}

/// Creates the index settings and mapping.
///
/// The typed groups use dynamic templates, so any projected path gets the
/// mapping of its group the first time it is seen.
pub fn create_index_mapping(config: &ElasticsearchConfig) -> Value {
    let template = |kind: ValueKind, mapping: Value| {
        json!({
            format!("{}_fields", kind.group()): {
                "path_match": format!("{}.*", kind.group()),
                "mapping": mapping
            }
        })
    };
    json!({
        "settings": {
            "number_of_shards": config.number_of_shards,
            "number_of_replicas": config.number_of_replicas,
            "index.max_result_window": config.max_result_window,
            "index.mapping.total_fields.limit": config.total_fields_limit,
            "refresh_interval": config.refresh_interval
        },
        "mappings": {
            "dynamic": true,
            "dynamic_templates": [
                template(ValueKind::String, json!({
                    "type": "keyword",
                    "ignore_above": MAX_INDEXED_STRING
                })),
                template(ValueKind::Number, json!({ "type": "double" })),
                template(ValueKind::Bool, json!({ "type": "boolean" })),
                template(ValueKind::Null, json!({ "type": "boolean" })),
                template(ValueKind::Array, json!({ "type": "boolean" }))
            ],
            "properties": {
                ID_FIELD: { "type": "keyword" },
                LAST_UPDATED_FIELD: { "type": "keyword" },
                "str": { "type": "object" },
                "num": { "type": "object" },
                "bool": { "type": "object" },
                "nul": { "type": "object" },
                "arr": { "type": "object" }
            }
        }
    })
}

/// Returns true if the index exists.
pub async fn index_exists(client: &Elasticsearch, index: &str) -> StorageResult<bool> {
    let response = client
        .indices()
        .exists(IndicesExistsParts::Index(&[index]))
        .send()
        .await
        .map_err(|e| internal_error(format!("Failed to check index existence: {}", e)))?;
    Ok(response.status_code().is_success())
}

/// Ensures the index exists, creating it if necessary.
pub async fn ensure_index(
    client: &Elasticsearch,
    index: &str,
    config: &ElasticsearchConfig,
) -> StorageResult<()> {
    if index_exists(client, index).await? {
        return Ok(());
    }

    let response = client
        .indices()
        .create(IndicesCreateParts::Index(index))
        .body(create_index_mapping(config))
        .send()
        .await
        .map_err(|e| internal_error(format!("Failed to create index {}: {}", index, e)))?;

    let status = response.status_code();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        // Another writer created it first.
        if body.contains("resource_already_exists_exception") {
            return Ok(());
        }
        return Err(internal_error(format!(
            "Failed to create index {} (status {}): {}",
            index, status, body
        )));
    }

    info!(index = %index, "Created Elasticsearch index");
    Ok(())
}
