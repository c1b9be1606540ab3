//! SQLite backend.
//!
//! Each store is one table holding objects as JSON text. Filters compile to
//! `json_extract`/`json_type` predicates, so everything the expression
//! model can say is evaluated natively except paths whose segments contain
//! a double quote.
//!
//! # Example
//!
//! ```
//! use polystore::backends::sqlite::SqliteStore;
//! use polystore::core::{Store, StoreConfig};
//! use polystore::query::Query;
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let store = SqliteStore::in_memory(StoreConfig::new("users"))?;
//! store.save(json!({"uuid": "u1", "team": {"id": 3}})).await?;
//!
//! let page = store.find(&Query::parse("team.id < 5")?).await?;
//! assert_eq!(page.results.len(), 1);
//! assert!(!page.residual_applied);
//! # Ok::<_, polystore::error::StorageError>(())
//! # }).unwrap();
//! ```
//!
//! # Schema
//!
//! ```text
//! <table> (
//!     id           TEXT PRIMARY KEY,
//!     data         TEXT NOT NULL,      -- the object, as JSON
//!     last_updated TEXT NOT NULL,      -- RFC 3339
//!     tombstoned   INTEGER NOT NULL
//! )
//! ```

mod backend;
mod query_builder;
mod schema;
mod storage;

pub use backend::{SqliteConfig, SqliteStore};
pub use query_builder::{SqlFragment, SqliteDialect};
