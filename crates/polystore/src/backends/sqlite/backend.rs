//! SQLite backend configuration and connection pool.

use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};

use crate::core::config::{humantime_serde, require_identifier, ConfigError};
use crate::core::{StoreConfig, StoreEvents};
use crate::error::{BackendError, StorageError, StorageResult};

use super::query_builder::SqliteDialect;
use super::schema;

/// Configuration for the SQLite backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqliteConfig {
    /// Common store options.
    #[serde(flatten)]
    pub store: StoreConfig,

    /// Table holding the objects; defaults to the store name.
    #[serde(default)]
    pub table: Option<String>,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of idle connections.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// How long to wait for a pooled connection.
    #[serde(default = "default_connection_timeout", with = "humantime_serde")]
    pub connection_timeout: Duration,

    /// How long a writer waits on a locked database.
    #[serde(default = "default_busy_timeout", with = "humantime_serde")]
    pub busy_timeout: Duration,

    /// Enable WAL mode for file databases.
    #[serde(default = "default_true")]
    pub enable_wal: bool,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_busy_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_true() -> bool {
    true
}

impl SqliteConfig {
    /// Creates a configuration with default pool settings.
    pub fn new(store: StoreConfig) -> Self {
        Self {
            store,
            table: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connection_timeout: default_connection_timeout(),
            busy_timeout: default_busy_timeout(),
            enable_wal: true,
        }
    }

    /// Returns the table name.
    pub fn table_name(&self) -> &str {
        self.table.as_deref().unwrap_or(&self.store.name)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.validate()?;
        require_identifier("table", self.table_name())?;
        if self.store.last_update_field.contains('"') {
            return Err(ConfigError::Invalid {
                option: "last_update_field".to_string(),
                message: "must not contain '\"'".to_string(),
            });
        }
        if self.max_connections == 0 {
            return Err(ConfigError::OutOfRange {
                option: "max_connections".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.min_connections > self.max_connections {
            return Err(ConfigError::Conflict(format!(
                "min_connections {} exceeds max_connections {}",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

/// Store backed by one SQLite table with a JSON column.
pub struct SqliteStore {
    pub(super) pool: Pool<SqliteConnectionManager>,
    pub(super) config: SqliteConfig,
    pub(super) table: String,
    pub(super) dialect: SqliteDialect,
    pub(super) events: StoreEvents,
    is_memory: bool,
}

impl Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("config", &self.config)
            .field("is_memory", &self.is_memory)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Creates a store in a private in-memory database.
    pub fn in_memory(store: StoreConfig) -> StorageResult<Self> {
        Self::with_config(":memory:", SqliteConfig::new(store))
    }

    /// Opens or creates a file-based database.
    pub fn open<P: AsRef<Path>>(path: P, store: StoreConfig) -> StorageResult<Self> {
        Self::with_config(path, SqliteConfig::new(store))
    }

    /// Creates a store with custom configuration and initializes its table.
    pub fn with_config<P: AsRef<Path>>(path: P, config: SqliteConfig) -> StorageResult<Self> {
        config.validate()?;
        let is_memory = path.as_ref().to_string_lossy() == ":memory:";

        let busy_timeout = config.busy_timeout;
        let enable_wal = config.enable_wal && !is_memory;
        let manager = if is_memory {
            SqliteConnectionManager::memory()
        } else {
            SqliteConnectionManager::file(path.as_ref())
        }
        .with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            if enable_wal {
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                    row.get::<_, String>(0)
                })?;
            }
            Ok(())
        });

        // Each connection to ":memory:" is its own database, so the pool must
        // hold exactly one connection and never recycle it.
        let builder = if is_memory {
            Pool::<SqliteConnectionManager>::builder()
                .max_size(1)
                .min_idle(Some(1))
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            Pool::<SqliteConnectionManager>::builder()
                .max_size(config.max_connections)
                .min_idle(Some(config.min_connections))
        };
        let pool = builder
            .connection_timeout(config.connection_timeout)
            .build(manager)
            .map_err(|e| {
                StorageError::Backend(BackendError::ConnectionFailed {
                    backend_name: "sqlite".to_string(),
                    message: e.to_string(),
                })
            })?;

        let store = Self {
            pool,
            table: quote_identifier(config.table_name()),
            events: StoreEvents::new(config.store.name.clone()),
            dialect: SqliteDialect::new(),
            config,
            is_memory,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Creates the object table if needed. Idempotent.
    pub fn init_schema(&self) -> StorageResult<()> {
        let conn = self.get_connection()?;
        schema::initialize_schema(&conn, self.config.table_name())
    }

    /// Get a connection from the pool.
    pub(crate) fn get_connection(
        &self,
    ) -> StorageResult<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| {
            StorageError::Backend(BackendError::ConnectionFailed {
                backend_name: "sqlite".to_string(),
                message: e.to_string(),
            })
        })
    }

    /// Returns whether this is an in-memory database.
    pub fn is_memory(&self) -> bool {
        self.is_memory
    }

    /// Returns the backend configuration.
    pub fn sqlite_config(&self) -> &SqliteConfig {
        &self.config
    }
}

pub(super) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
