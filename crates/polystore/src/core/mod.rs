//! Core storage traits and abstractions.
//!
//! - [`Store`] - The object store contract every backend implements
//! - [`StoredObject`] - An object with its id, last-update time and state
//! - [`WriteCondition`] - Optimistic concurrency guard on mutations
//! - [`PartialUpdate`] - Targeted single-attribute mutations
//! - [`StoreEvents`] / [`StoreListener`] - Lifecycle event dispatch
//! - [`NativeScan`] / [`execute_find`] - Shared query pagination
//!
//! # Example: Implementing a Store
//!
//! A backend provides native reads through [`NativeScan`] and delegates
//! `find` to [`execute_find`], which applies the residual filter and builds
//! continuation tokens:
//!
//! ```ignore
//! #[async_trait]
//! impl Store for MyStore {
//!     async fn find(&self, query: &Query) -> StorageResult<FindResult> {
//!         execute_find(self, &self.config, query).await
//!     }
//!
//!     // ... implement other required methods
//! }
//! ```

pub mod backend;
pub mod condition;
pub mod config;
pub mod events;
pub mod executor;
pub mod object;
pub mod partial;
pub mod storage;

pub use backend::BackendKind;
pub use condition::WriteCondition;
pub use config::{ConfigError, DeleteMode, StoreConfig};
pub use events::{
    current_origin, replaying, EventKind, LifecycleEvent, ReplayTag, StoreEvent, StoreEvents,
    StoreListener,
};
pub use executor::{compare_objects, execute_find, NativeScan};
pub use object::{ObjectState, StoredObject};
pub use partial::PartialUpdate;
pub use storage::Store;
