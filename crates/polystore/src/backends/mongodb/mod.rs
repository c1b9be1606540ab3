//! MongoDB backend.
//!
//! Each store is one collection of documents shaped
//! `{ _id, data, last_updated, tombstoned }`, with the object under `data`.
//! Filters compile to a single `$expr` aggregation expression with explicit
//! type guards, so comparisons keep the strict typing of the in-memory
//! evaluator. Paths containing `.` or `$`, or numeric segments, fall back to
//! in-memory evaluation.
//!
//! Setting [`MongoConfig::indexes`] switches the compiler to the restricted
//! index profile: equality conjuncts merge freely and at most one range
//! field runs natively, and only when an index covers it.
//!
//! Merge patches and index-addressed collection updates run in session
//! transactions, which require a replica set.
//!
//! # Example
//!
//! ```no_run
//! use polystore::backends::mongodb::{MongoConfig, MongoStore};
//! use polystore::core::{Store, StoreConfig};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MongoConfig::new(StoreConfig::new("users"))
//!     .with_uri("mongodb://localhost:27017/?replicaSet=rs0");
//! let store = MongoStore::new(config).await?;
//! store.save(json!({"uuid": "u1", "tags": []})).await?;
//! store.upsert_item_to_collection("u1", "tags", json!("admin"), None, None).await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod query_builder;
mod storage;

pub use backend::{MongoConfig, MongoStore};
pub use query_builder::MongoDialect;
