//! Polystore: one object store contract over several storage engines.
//!
//! JSON objects are stored, patched, queried and deleted through the same
//! [`Store`](core::Store) trait whether they live in memory, in a SQL table
//! with a JSON column, in a document database, in a search index or on the
//! local filesystem. Queries are written once as an [`Expression`] and
//! compiled per backend: what the backend can evaluate natively is pushed
//! down, the rest is applied in memory.
//!
//! # Features
//!
//! - **One query language**: `status = 'active' AND age >= 18`, with a
//!   canonical text form and an in-memory evaluator that defines semantics
//! - **Capability-driven compilation**: each backend declares what it can do
//!   natively; the generic planner splits every filter accordingly
//! - **Conditional writes**: every mutation can be guarded by a
//!   [`WriteCondition`](core::WriteCondition) checked atomically
//! - **Lifecycle events**: listeners observe every committed mutation
//! - **Denormalization**: the [`mapper`] keeps projections of source objects
//!   in target collections up to date, with optional cascade delete
//!
//! # Backend Features
//!
//! - `sqlite` (default) - SQLite with a JSON column, file or in-memory
//! - `filesystem` (default) - One JSON file per object via `object_store`
//! - `postgres` - PostgreSQL with a JSONB column
//! - `mongodb` - MongoDB documents
//! - `elasticsearch` - Elasticsearch secondary index over a primary store
//!
//! The in-memory backend is always available.
//!
//! # Quick Start
//!
//! ```
//! use polystore::backends::memory::MemoryStore;
//! use polystore::core::{Store, StoreConfig};
//! use polystore::query::{OrderBy, Query};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let users = MemoryStore::new(StoreConfig::new("users"))?;
//! users.save(json!({"uuid": "u1", "name": "ada", "age": 36})).await?;
//! users.save(json!({"uuid": "u2", "name": "alan", "age": 41})).await?;
//!
//! let query = Query::parse("age > 40 OR name LIKE 'a%a'")?
//!     .order_by(OrderBy::parse("-age")?)
//!     .with_limit(10);
//! let page = users.find(&query).await?;
//! assert_eq!(page.results.len(), 2);
//! assert_eq!(page.results[0].id(), "u2");
//! # Ok::<_, polystore::StorageError>(())
//! # }).unwrap();
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod backends;
pub mod core;
pub mod error;
pub mod expr;
pub mod mapper;
pub mod query;

// Re-export commonly used types at crate root
pub use error::{ErrorKind, StorageError, StorageResult};
pub use expr::{AttributePath, Expression, Operator};
pub use query::{FindResult, OrderBy, Query};

pub use core::{BackendKind, Store, StoreConfig, StoredObject, WriteCondition};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
