//! Elasticsearch search projection.
//!
//! Elasticsearch is not authoritative here: an [`ElasticsearchStore`] wraps
//! another store, forwards every mutation to it, and keeps an index of its
//! objects by replaying the store's lifecycle events. Queries run against
//! the index and the hits are loaded back from the authoritative store.
//!
//! # Replay
//!
//! Saves and updates upsert the search document with a painless script
//! that turns into a `noop` when the indexed document already carries a
//! later last-update time, so a delayed replay never overwrites newer
//! state. Deletes (and tombstones) remove the document.
//!
//! # Index Structure
//!
//! One index per store, `{prefix}_{store_name}`, holding flat typed
//! projections of the objects (see the `query_builder` module). Searching
//! a store whose index has not been created yet fails with `UnknownIndex`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use polystore::backends::elasticsearch::{ElasticsearchConfig, ElasticsearchStore};
//! use polystore::backends::memory::MemoryStore;
//! use polystore::core::{Store, StoreConfig};
//!
//! # async fn example() -> polystore::error::StorageResult<()> {
//! let primary: Arc<dyn Store> = Arc::new(MemoryStore::new(StoreConfig::new("users"))?);
//! let config = ElasticsearchConfig::default().with_node("http://localhost:9200");
//! let search = ElasticsearchStore::attach(primary, config).await?;
//! search.save(serde_json::json!({"name": "ada"})).await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod projection;
mod query_builder;
mod schema;
mod storage;

pub use backend::{ElasticsearchAuth, ElasticsearchConfig, ElasticsearchStore};
pub use projection::IndexProjection;
pub use query_builder::EsDialect;
pub use schema::create_index_mapping;
