//! Test infrastructure shared by the backend integration tests.
//!
//! [`contract`] holds the behaviour every [`Store`] must show, written
//! against `&dyn Store` so each backend test file runs the same checks;
//! [`fixtures`] builds the datasets they use.

#![allow(dead_code)]

pub mod contract;
pub mod fixtures;

pub use fixtures::*;

use polystore::Store;
use tempfile::TempDir;

/// A store under test, with whatever must outlive it.
pub struct Harness {
    store: Box<dyn Store>,
    _dir: Option<TempDir>,
}

impl Harness {
    /// Wraps a store that owns all its resources.
    pub fn new(store: impl Store + 'static) -> Self {
        Self {
            store: Box::new(store),
            _dir: None,
        }
    }

    /// Wraps a store living in a temporary directory.
    pub fn in_dir(store: impl Store + 'static, dir: TempDir) -> Self {
        Self {
            store: Box::new(store),
            _dir: Some(dir),
        }
    }

    /// Returns the store.
    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }
}

/// Declares one `#[tokio::test]` per contract check, each on a fresh
/// [`Harness`] built by `$factory` (an async expression).
macro_rules! store_contract_tests {
    ($factory:expr) => {
        store_contract_tests!(@tests $factory;
            crud_round_trip,
            save_generates_identifier,
            save_rejects_existing_identifier,
            update_replaces_content,
            update_checks_condition,
            update_rejects_identifier_mismatch,
            patch_merges,
            delete_removes_object,
            increment_attribute,
            collection_append_and_replace,
            collection_replace_checks_item_condition,
            collection_delete_item,
            remove_attribute,
            get_all_keeps_request_order,
            find_filters_and_orders,
            find_pages_are_stable,
            find_rejects_bad_token,
            events_carry_previous_state,
            concurrent_conditional_updates,
        );
    };
    (@tests $factory:expr; $($check:ident),+ $(,)?) => {
        $(
            #[tokio::test]
            async fn $check() {
                let harness = $factory.await;
                common::contract::$check(harness.store()).await;
            }
        )+
    };
}
