//! Backend implementations of the [`Store`](crate::core::Store) contract.
//!
//! Each backend except `memory` is gated behind a feature flag.
//!
//! # Available Backends
//!
//! | Backend | Feature | Description |
//! |---------|---------|-------------|
//! | Memory | (always) | In-process map with a configurable capability table |
//! | SQLite | `sqlite` | JSON column in one table per store |
//! | PostgreSQL | `postgres` | JSONB column in one table per store |
//! | MongoDB | `mongodb` | One collection per store |
//! | Elasticsearch | `elasticsearch` | Search projection of another store |
//! | Filesystem | `filesystem` | One JSON file per object |
//!
//! # Example
//!
//! ```no_run
//! # #[cfg(feature = "sqlite")]
//! use polystore::backends::sqlite::{SqliteConfig, SqliteStore};
//! use polystore::core::StoreConfig;
//!
//! # #[cfg(feature = "sqlite")]
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // An in-memory database
//! let store = SqliteStore::in_memory(StoreConfig::new("users"))?;
//!
//! // Or a file-based one
//! let store = SqliteStore::open("./data/users.db", StoreConfig::new("users"))?;
//! # Ok(())
//! # }
//! ```

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mongodb")]
pub mod mongodb;

#[cfg(feature = "elasticsearch")]
pub mod elasticsearch;

#[cfg(feature = "filesystem")]
pub mod filesystem;
