//! End-to-end scenarios over a 1000-object dataset and the write paths
//! that must be atomic.

mod common;

use std::sync::Arc;

use polystore::backends::memory::{MemoryConfig, MemoryStore};
use polystore::core::BackendKind;
use polystore::expr::parse;
use polystore::mapper::{Mapper, MapperLink};
use polystore::query::{BackendCapabilities, IndexDefinition};
use polystore::{ErrorKind, Query, Store, StoreConfig, WriteCondition};
use serde_json::json;

/// A document database with a compound index on `(state, role)`.
fn indexed_people() -> MemoryStore {
    let capabilities = BackendCapabilities::indexed(
        BackendKind::Memory,
        vec![IndexDefinition::new(["state", "role"], None)],
    );
    MemoryStore::with_config(
        MemoryConfig::new(StoreConfig::new("people")).with_capabilities(capabilities),
    )
    .unwrap()
}

async fn count_matching(store: &dyn Store, filter: &str) -> (usize, bool) {
    let query = Query::parse(filter).unwrap().with_limit(1000);
    let result = store.find(&query).await.unwrap();
    assert!(result.continuation_token.is_none());
    (result.results.len(), result.residual_applied)
}

#[tokio::test]
async fn test_indexed_equality_conjunction_is_native() {
    let store = indexed_people();
    common::seed_people(&store, 1000).await;

    let (count, residual) = count_matching(&store, "state = 'CA' AND role = 4").await;
    assert_eq!(count, 50);
    assert!(!residual);
}

#[tokio::test]
async fn test_unindexed_range_falls_back_to_residual() {
    let store = indexed_people();
    common::seed_people(&store, 1000).await;

    let (count, residual) = count_matching(&store, "state = 'CA' AND role <= 4").await;
    assert_eq!(count, 150);
    assert!(residual);

    let (native_count, _) = count_matching(&store, "state = 'CA'").await;
    assert_eq!(native_count, 200);
}

#[tokio::test]
async fn test_range_alone_stays_native() {
    let store = indexed_people();
    common::seed_people(&store, 1000).await;

    let (count, residual) = count_matching(&store, "role <= 2").await;
    assert_eq!(count, 250);
    assert!(!residual);
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_same_counts_on_sqlite() {
    use polystore::backends::sqlite::SqliteStore;

    let store = SqliteStore::in_memory(StoreConfig::new("people")).unwrap();
    common::seed_people(&store, 1000).await;

    assert_eq!(
        count_matching(&store, "state = 'CA' AND role = 4").await,
        (50, false)
    );
    assert_eq!(
        count_matching(&store, "state = 'CA' AND role <= 4").await,
        (150, false)
    );
    assert_eq!(
        count_matching(&store, "state IN ['CA', 'NY'] OR team.id = 3").await.0,
        (0..1000)
            .filter(|i| i % 5 < 2 || i % 7 == 3)
            .count()
    );
}

#[tokio::test]
async fn test_racing_conditional_updates() {
    let store = Arc::new(MemoryStore::new(StoreConfig::new("docs")).unwrap());
    store
        .save(json!({"uuid": "d1", "version": 3, "body": "v3"}))
        .await
        .unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                let condition = WriteCondition::new("version", 3);
                store
                    .update(
                        json!({"version": 4, "body": format!("writer-{}", i)}),
                        "d1",
                        Some(&condition),
                    )
                    .await
            })
        })
        .collect();

    let mut winners = Vec::new();
    for task in tasks {
        match task.await.unwrap() {
            Ok(object) => winners.push(object),
            Err(e) => assert_eq!(e.kind(), ErrorKind::UpdateConditionFailed),
        }
    }
    assert_eq!(winners.len(), 1);
    let stored = store.get_or_fail("d1").await.unwrap();
    assert_eq!(stored.content()["body"], winners[0].content()["body"]);
    assert_eq!(stored.content()["version"], json!(4));
}

#[tokio::test]
async fn test_conditional_item_replace_leaves_list_unchanged() {
    let store = MemoryStore::new(StoreConfig::new("flows")).unwrap();
    store
        .save(json!({"uuid": "f1", "actions": [{"type": "plip"}, {"type": "plop"}]}))
        .await
        .unwrap();

    let condition = WriteCondition::new("type", "plop");
    let err = store
        .upsert_item_to_collection("f1", "actions", json!({"type": "new"}), Some(0), Some(&condition))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UpdateConditionFailed);
    assert_eq!(
        store.get_or_fail("f1").await.unwrap().content()["actions"],
        json!([{"type": "plip"}, {"type": "plop"}])
    );

    store
        .upsert_item_to_collection("f1", "actions", json!({"type": "new"}), Some(1), Some(&condition))
        .await
        .unwrap();
    assert_eq!(
        store.get_or_fail("f1").await.unwrap().content()["actions"],
        json!([{"type": "plip"}, {"type": "new"}])
    );
}

#[tokio::test]
async fn test_cascade_removes_linked_idents() {
    let users: Arc<dyn Store> = Arc::new(MemoryStore::new(StoreConfig::new("users")).unwrap());
    let idents: Arc<dyn Store> = Arc::new(MemoryStore::new(StoreConfig::new("idents")).unwrap());
    let link = MapperLink::new("idents", "user", "users", "idents").with_cascade_delete(true);
    Mapper::new(link, idents.clone(), users.clone())
        .unwrap()
        .attach();

    users.save(json!({"uuid": "u1"})).await.unwrap();
    idents.save(json!({"uuid": "i1", "user": "u1"})).await.unwrap();
    idents.save(json!({"uuid": "i2", "user": "u1"})).await.unwrap();
    assert_eq!(
        users.get_or_fail("u1").await.unwrap().content()["idents"],
        json!([{"uuid": "i1"}, {"uuid": "i2"}])
    );

    users.delete("u1", None).await.unwrap();
    assert!(idents.get_all(None).await.unwrap().is_empty());
    let remaining = idents
        .find(&Query::new(parse("user = 'u1'").unwrap()))
        .await
        .unwrap();
    assert!(remaining.results.is_empty());
}
