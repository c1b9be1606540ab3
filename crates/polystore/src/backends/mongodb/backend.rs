//! MongoDB backend configuration and client.

use std::fmt::Debug;
use std::time::Duration;

use mongodb::bson::{doc, Document};
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection, IndexModel};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::config::{humantime_serde, require_identifier, require_non_empty, ConfigError};
use crate::core::{StoreConfig, StoreEvents};
use crate::error::{BackendError, ConfigurationError, StorageError, StorageResult};
use crate::query::IndexDefinition;

use super::query_builder::{MongoDialect, DATA};

/// Configuration for the MongoDB backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MongoConfig {
    /// Common store options.
    #[serde(flatten)]
    pub store: StoreConfig,

    /// Connection string (`mongodb://` or `mongodb+srv://`).
    #[serde(default = "default_uri")]
    pub uri: String,

    /// Database name.
    #[serde(default = "default_database")]
    pub database: String,

    /// Collection holding the objects; defaults to the store name.
    #[serde(default)]
    pub collection: Option<String>,

    /// Create the collection when it does not exist. When false, opening a
    /// store on a missing collection fails with `UnknownCollection`.
    #[serde(default = "default_auto_create")]
    pub auto_create: bool,

    /// Compound indexes to create. When non-empty, queries are compiled
    /// for the restricted index profile: only conjunctions these indexes
    /// cover run natively.
    #[serde(default)]
    pub indexes: Vec<IndexDefinition>,

    /// Maximum number of pooled connections.
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: u32,

    /// Connection timeout.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// How many times a collection splice is retried after a transient
    /// transaction error.
    #[serde(default = "default_transaction_retries")]
    pub transaction_retries: u32,
}

fn default_uri() -> String {
    "mongodb://localhost:27017".to_string()
}

fn default_database() -> String {
    "polystore".to_string()
}

fn default_auto_create() -> bool {
    true
}

fn default_max_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_transaction_retries() -> u32 {
    3
}

impl MongoConfig {
    /// Creates a configuration with default connection settings.
    pub fn new(store: StoreConfig) -> Self {
        Self {
            store,
            uri: default_uri(),
            database: default_database(),
            collection: None,
            auto_create: default_auto_create(),
            indexes: Vec::new(),
            max_pool_size: default_max_pool_size(),
            connect_timeout: default_connect_timeout(),
            transaction_retries: default_transaction_retries(),
        }
    }

    /// Sets the connection string.
    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    /// Returns the collection name.
    pub fn collection_name(&self) -> &str {
        self.collection.as_deref().unwrap_or(&self.store.name)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.validate()?;
        require_non_empty("uri", &self.uri)?;
        if !(self.uri.starts_with("mongodb://") || self.uri.starts_with("mongodb+srv://")) {
            return Err(ConfigError::Invalid {
                option: "uri".to_string(),
                message: "must start with mongodb:// or mongodb+srv://".to_string(),
            });
        }
        require_identifier("database", &self.database)?;
        require_identifier("collection", self.collection_name())?;
        for (option, field) in [
            ("id_field", &self.store.id_field),
            ("last_update_field", &self.store.last_update_field),
        ] {
            if field.contains('.') || field.starts_with('$') {
                return Err(ConfigError::Invalid {
                    option: option.to_string(),
                    message: format!("'{}' is not a MongoDB field name", field),
                });
            }
        }
        for index in &self.indexes {
            if index.equality_fields.is_empty() && index.range_field.is_none() {
                return Err(ConfigError::empty("indexes"));
            }
            if let Some(range) = &index.range_field
                && index.equality_fields.contains(range)
            {
                return Err(ConfigError::Conflict(format!(
                    "'{}' is both an equality and the range field of an index",
                    range
                )));
            }
        }
        if self.max_pool_size == 0 {
            return Err(ConfigError::OutOfRange {
                option: "max_pool_size".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

/// Store backed by one MongoDB collection.
///
/// Documents have the shape
/// `{ _id, data: <object>, last_updated: <RFC 3339>, tombstoned: <bool> }`.
pub struct MongoStore {
    pub(super) client: Client,
    pub(super) collection: Collection<Document>,
    pub(super) config: MongoConfig,
    pub(super) dialect: MongoDialect,
    pub(super) events: StoreEvents,
}

impl Debug for MongoStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoStore")
            .field("config", &self.config)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl MongoStore {
    /// Connects and opens (or creates) the collection.
    pub async fn new(config: MongoConfig) -> StorageResult<Self> {
        config.validate()?;

        let mut options = ClientOptions::parse(config.uri.as_str()).await.map_err(|e| {
            StorageError::Backend(BackendError::ConnectionFailed {
                backend_name: "mongodb".to_string(),
                message: format!("Invalid connection string: {}", e),
            })
        })?;
        options.app_name = Some(crate::NAME.to_string());
        options.connect_timeout = Some(config.connect_timeout);
        options.max_pool_size = Some(config.max_pool_size);
        let client = Client::with_options(options)?;

        let database = client.database(&config.database);
        let name = config.collection_name().to_string();
        let existing = database.list_collection_names().await?;
        if !existing.contains(&name) {
            if !config.auto_create {
                return Err(StorageError::Configuration(
                    ConfigurationError::UnknownCollection { collection: name },
                ));
            }
            database.create_collection(&name).await?;
            info!(database = %config.database, collection = %name, "Created MongoDB collection");
        }

        let collection = database.collection::<Document>(&name);
        for index in &config.indexes {
            collection.create_index(index_model(index)).await?;
        }

        let dialect = if config.indexes.is_empty() {
            MongoDialect::new()
        } else {
            MongoDialect::indexed(config.indexes.clone())
        };
        debug!(store = %config.store.name, collection = %name, "Connected to MongoDB");
        Ok(Self {
            client,
            collection,
            events: StoreEvents::new(config.store.name.clone()),
            dialect,
            config,
        })
    }

    /// Returns the backend configuration.
    pub fn mongo_config(&self) -> &MongoConfig {
        &self.config
    }
}

/// Index on the visible flag followed by the indexed data fields.
fn index_model(index: &IndexDefinition) -> IndexModel {
    let mut keys = doc! { "tombstoned": 1 };
    for field in index.equality_fields.iter().chain(index.range_field.as_ref()) {
        keys.insert(format!("{}.{}", DATA, field), 1);
    }
    IndexModel::builder().keys(keys).build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_and_validation() {
        let config = MongoConfig::new(StoreConfig::new("users"));
        assert!(config.validate().is_ok());
        assert_eq!(config.collection_name(), "users");

        let bad_uri = config.clone().with_uri("http://localhost");
        assert!(bad_uri.validate().is_err());

        let mut dotted = config.clone();
        dotted.store.last_update_field = "meta.updated".to_string();
        assert!(dotted.validate().is_err());

        let mut overlapping = config;
        overlapping.indexes = vec![IndexDefinition::new(["age"], Some("age"))];
        assert!(matches!(
            overlapping.validate(),
            Err(ConfigError::Conflict(_))
        ));
    }

    #[test]
    fn test_config_from_json() {
        let config: MongoConfig = serde_json::from_str(
            r#"{
                "name": "users",
                "auto_create": false,
                "indexes": [{"equality_fields": ["team"], "range_field": "age"}]
            }"#,
        )
        .unwrap();
        assert!(!config.auto_create);
        assert_eq!(config.indexes.len(), 1);
        assert_eq!(config.uri, "mongodb://localhost:27017");
    }

    #[test]
    fn test_index_model_keys() {
        let model = index_model(&IndexDefinition::new(["team"], Some("age")));
        assert_eq!(
            model.keys,
            doc! { "tombstoned": 1, "data.team": 1, "data.age": 1 }
        );
    }
}
