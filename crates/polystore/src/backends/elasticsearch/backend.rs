//! Elasticsearch backend configuration and client.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use elasticsearch::auth::Credentials;
use elasticsearch::cert::CertificateValidation;
use elasticsearch::http::transport::{SingleNodeConnectionPool, TransportBuilder};
use elasticsearch::indices::IndicesRefreshParts;
use elasticsearch::Elasticsearch;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::config::{require_non_empty, ConfigError};
use crate::core::{Store, StoreListener};
use crate::error::{BackendError, StorageError, StorageResult};

use super::projection::IndexProjection;
use super::query_builder::EsDialect;
use super::schema;

/// Authentication configuration for Elasticsearch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ElasticsearchAuth {
    /// Basic username/password authentication.
    Basic {
        /// The username for basic auth.
        username: String,
        /// The password for basic auth.
        password: String,
    },
    /// Bearer token authentication.
    Bearer {
        /// The bearer token.
        token: String,
    },
}

/// Configuration for the Elasticsearch backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElasticsearchConfig {
    /// Elasticsearch node URLs (e.g., `["http://localhost:9200"]`).
    /// Currently uses the first node (single-node connection pool).
    #[serde(default = "default_nodes")]
    pub nodes: Vec<String>,

    /// Index name prefix (default: `"polystore"`).
    /// The index is named `{prefix}_{store_name_lowercase}` unless `index`
    /// is set.
    #[serde(default = "default_index_prefix")]
    pub index_prefix: String,

    /// Explicit index name.
    #[serde(default)]
    pub index: Option<String>,

    /// Create the index when the store is attached. When false, queries
    /// fail with `UnknownIndex` until the first projected write creates it.
    #[serde(default = "default_create_index")]
    pub create_index: bool,

    /// Number of primary shards per index (default: 1).
    #[serde(default = "default_shards")]
    pub number_of_shards: u32,

    /// Number of replica shards per index (default: 1).
    #[serde(default = "default_replicas")]
    pub number_of_replicas: u32,

    /// Refresh interval (default: "1s").
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: String,

    /// Maximum result window size (default: 10000). Pages reaching past it
    /// are rejected.
    #[serde(default = "default_max_result_window")]
    pub max_result_window: u32,

    /// Maximum number of distinct projected fields (default: 5000).
    #[serde(default = "default_total_fields_limit")]
    pub total_fields_limit: u32,

    /// Wait for each projected write to become searchable before the
    /// mutating call returns. Mostly useful in tests.
    #[serde(default)]
    pub refresh_on_write: bool,

    /// Request timeout in milliseconds (default: 30000).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Optional authentication.
    #[serde(default)]
    pub auth: Option<ElasticsearchAuth>,

    /// Whether to disable certificate validation (default: false).
    /// Only use for development/testing.
    #[serde(default)]
    pub disable_certificate_validation: bool,
}

fn default_nodes() -> Vec<String> {
    vec!["http://localhost:9200".to_string()]
}

fn default_index_prefix() -> String {
    "polystore".to_string()
}

fn default_create_index() -> bool {
    true
}

fn default_shards() -> u32 {
    1
}

fn default_replicas() -> u32 {
    1
}

fn default_refresh_interval() -> String {
    "1s".to_string()
}

fn default_max_result_window() -> u32 {
    10000
}

fn default_total_fields_limit() -> u32 {
    5000
}

fn default_request_timeout_ms() -> u64 {
    30000
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
            index_prefix: default_index_prefix(),
            index: None,
            create_index: default_create_index(),
            number_of_shards: default_shards(),
            number_of_replicas: default_replicas(),
            refresh_interval: default_refresh_interval(),
            max_result_window: default_max_result_window(),
            total_fields_limit: default_total_fields_limit(),
            refresh_on_write: false,
            request_timeout_ms: default_request_timeout_ms(),
            auth: None,
            disable_certificate_validation: false,
        }
    }
}

impl ElasticsearchConfig {
    /// Sets the node URL.
    pub fn with_node(mut self, url: impl Into<String>) -> Self {
        self.nodes = vec![url.into()];
        self
    }

    /// Returns the index name used for the named store.
    pub fn index_name(&self, store_name: &str) -> String {
        match &self.index {
            Some(index) => index.clone(),
            None => format!("{}_{}", self.index_prefix, store_name.to_lowercase()),
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let Some(node) = self.nodes.first() else {
            return Err(ConfigError::empty("nodes"));
        };
        if !(node.starts_with("http://") || node.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                option: "nodes".to_string(),
                message: format!("'{}' is not an http(s) URL", node),
            });
        }
        require_non_empty("index_prefix", &self.index_prefix)?;
        if let Some(index) = &self.index {
            validate_index_name(index)?;
        } else {
            validate_index_name(&self.index_prefix)?;
        }
        require_non_empty("refresh_interval", &self.refresh_interval)?;
        for (option, value) in [
            ("number_of_shards", self.number_of_shards),
            ("max_result_window", self.max_result_window),
            ("total_fields_limit", self.total_fields_limit),
        ] {
            if value == 0 {
                return Err(ConfigError::OutOfRange {
                    option: option.to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::OutOfRange {
                option: "request_timeout_ms".to_string(),
                message: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Index names are lowercase and must not start with `_`, `-` or `+`.
fn validate_index_name(name: &str) -> Result<(), ConfigError> {
    let valid = !name.is_empty()
        && !name.starts_with(['_', '-', '+'])
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            option: "index".to_string(),
            message: format!("'{}' is not a valid index name", name),
        })
    }
}

/// Searchable projection of an authoritative store.
///
/// Reads and writes go to the authoritative (primary) store; an
/// [`IndexProjection`] subscribed to its events keeps the index current,
/// and `find` runs against the index and rehydrates the hits from the
/// primary.
pub struct ElasticsearchStore {
    pub(super) primary: Arc<dyn Store>,
    pub(super) client: Elasticsearch,
    pub(super) config: ElasticsearchConfig,
    pub(super) index: String,
    pub(super) dialect: EsDialect,
    pub(super) projection: Arc<IndexProjection>,
}

impl Debug for ElasticsearchStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElasticsearchStore")
            .field("primary", &self.primary.name())
            .field("index", &self.index)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ElasticsearchStore {
    /// Attaches a search index to `primary`.
    ///
    /// Creates the index when configured to, and subscribes the projection
    /// to the primary's events. Objects already in the primary are not
    /// indexed; see [`ElasticsearchStore::reindex`].
    pub async fn attach(primary: Arc<dyn Store>, config: ElasticsearchConfig) -> StorageResult<Self> {
        config.validate()?;
        let client = build_client(&config)?;
        let index = config.index_name(primary.name());

        let projection = Arc::new(IndexProjection::new(
            client.clone(),
            index.clone(),
            config.clone(),
        ));
        if config.create_index {
            schema::ensure_index(&client, &index, &config).await?;
            projection.mark_index_ready();
        }
        primary
            .events()
            .subscribe(projection.clone() as Arc<dyn StoreListener>);
        debug!(store = %primary.name(), index = %index, "Attached Elasticsearch projection");

        Ok(Self {
            primary,
            client,
            index,
            dialect: EsDialect::new(),
            projection,
            config,
        })
    }

    /// Stops projecting the primary's events.
    pub fn detach(&self) -> bool {
        self.primary.events().unsubscribe(self.projection.name())
    }

    /// Indexes every visible object of the primary.
    pub async fn reindex(&self) -> StorageResult<usize> {
        let objects = self.primary.get_all(None).await?;
        for object in &objects {
            self.projection.index_object(object).await?;
        }
        Ok(objects.len())
    }

    /// Returns the authoritative store.
    pub fn primary(&self) -> &Arc<dyn Store> {
        &self.primary
    }

    /// Returns the backend configuration.
    pub fn es_config(&self) -> &ElasticsearchConfig {
        &self.config
    }

    /// Returns the index name.
    pub fn index_name(&self) -> &str {
        &self.index
    }

    /// Refreshes the index to make recently indexed documents searchable.
    ///
    /// Only needed for testing; in production ES refreshes automatically.
    pub async fn refresh_index(&self) -> StorageResult<()> {
        self.client
            .indices()
            .refresh(IndicesRefreshParts::Index(&[&self.index]))
            .send()
            .await
            .map_err(|e| {
                StorageError::Backend(BackendError::Internal {
                    backend_name: "elasticsearch".to_string(),
                    message: format!("Failed to refresh index {}: {}", self.index, e),
                    source: None,
                })
            })?;
        Ok(())
    }
}

/// Builds the Elasticsearch client from configuration.
fn build_client(config: &ElasticsearchConfig) -> StorageResult<Elasticsearch> {
    let url = config
        .nodes
        .first()
        .cloned()
        .unwrap_or_else(|| "http://localhost:9200".to_string());

    let parsed_url: elasticsearch::http::Url = url.parse().map_err(|e| {
        StorageError::Backend(BackendError::ConnectionFailed {
            backend_name: "elasticsearch".to_string(),
            message: format!("Invalid URL: {}", e),
        })
    })?;

    let conn_pool = SingleNodeConnectionPool::new(parsed_url);

    let mut builder =
        TransportBuilder::new(conn_pool).timeout(Duration::from_millis(config.request_timeout_ms));

    if config.disable_certificate_validation {
        builder = builder.cert_validation(CertificateValidation::None);
    }

    if let Some(ref auth) = config.auth {
        builder = match auth {
            ElasticsearchAuth::Basic { username, password } => {
                builder.auth(Credentials::Basic(username.clone(), password.clone()))
            }
            ElasticsearchAuth::Bearer { token } => builder.auth(Credentials::Bearer(token.clone())),
        };
    }

    let transport = builder.build().map_err(|e| {
        StorageError::Backend(BackendError::ConnectionFailed {
            backend_name: "elasticsearch".to_string(),
            message: format!("Failed to build transport: {}", e),
        })
    })?;

    Ok(Elasticsearch::new(transport))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ElasticsearchConfig::default();
        assert_eq!(config.index_prefix, "polystore");
        assert_eq!(config.number_of_shards, 1);
        assert_eq!(config.number_of_replicas, 1);
        assert_eq!(config.nodes, vec!["http://localhost:9200"]);
        assert!(config.create_index);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_index_name() {
        let config = ElasticsearchConfig::default();
        assert_eq!(config.index_name("Users"), "polystore_users");

        let explicit = ElasticsearchConfig {
            index: Some("people-v2".to_string()),
            ..Default::default()
        };
        assert_eq!(explicit.index_name("users"), "people-v2");
        assert!(explicit.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let no_nodes = ElasticsearchConfig {
            nodes: Vec::new(),
            ..Default::default()
        };
        assert!(matches!(no_nodes.validate(), Err(ConfigError::Empty { .. })));

        let bad_index = ElasticsearchConfig {
            index: Some("_People".to_string()),
            ..Default::default()
        };
        assert!(bad_index.validate().is_err());

        let zero_window = ElasticsearchConfig {
            max_result_window: 0,
            ..Default::default()
        };
        assert!(matches!(
            zero_window.validate(),
            Err(ConfigError::OutOfRange { .. })
        ));

        let bad_node = ElasticsearchConfig::default().with_node("localhost:9200");
        assert!(bad_node.validate().is_err());
    }

    #[test]
    fn test_config_from_json() {
        let config: ElasticsearchConfig = serde_json::from_str(
            r#"{
                "nodes": ["https://search:9200"],
                "refresh_on_write": true,
                "auth": {"Basic": {"username": "elastic", "password": "secret"}}
            }"#,
        )
        .unwrap();
        assert!(config.refresh_on_write);
        assert_eq!(config.max_result_window, 10000);
        assert!(matches!(config.auth, Some(ElasticsearchAuth::Basic { .. })));
    }

    #[test]
    fn test_build_client() {
        assert!(build_client(&ElasticsearchConfig::default()).is_ok());
    }
}
