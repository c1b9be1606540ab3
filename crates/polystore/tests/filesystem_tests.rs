//! Flat-file backend integration tests.

#![cfg(feature = "filesystem")]

#[macro_use]
mod common;

use common::Harness;
use polystore::backends::filesystem::{FileSystemConfig, FileSystemStore};
use polystore::core::DeleteMode;
use polystore::{ErrorKind, Query, Store, StoreConfig};
use serde_json::json;
use tempfile::TempDir;

fn people() -> StoreConfig {
    StoreConfig::new("people")
}

store_contract_tests!(async {
    let dir = TempDir::new().unwrap();
    let store = FileSystemStore::open(dir.path(), people()).unwrap();
    Harness::in_dir(store, dir)
});

#[tokio::test]
async fn test_tombstones() {
    let dir = TempDir::new().unwrap();
    let store =
        FileSystemStore::open(dir.path(), people().with_delete_mode(DeleteMode::Tombstone)).unwrap();
    common::contract::tombstones_stay_reserved(&store).await;
}

#[tokio::test]
async fn test_reopen_keeps_objects() {
    let dir = TempDir::new().unwrap();
    {
        let store = FileSystemStore::open(dir.path(), people()).unwrap();
        common::seed_people(&store, 10).await;
    }

    let store = FileSystemStore::open(dir.path(), people()).unwrap();
    assert_eq!(store.get_all(None).await.unwrap().len(), 10);
    let ca = store.find(&Query::parse("state = 'CA'").unwrap()).await.unwrap();
    assert_eq!(common::ids(&ca.results), vec!["p0000", "p0005"]);
    assert!(ca.residual_applied);
}

#[tokio::test]
async fn test_foreign_files_are_ignored() {
    let dir = TempDir::new().unwrap();
    let store = FileSystemStore::open(dir.path(), people()).unwrap();
    store.save(json!({"uuid": "a"})).await.unwrap();
    std::fs::write(dir.path().join("people").join("notes.txt"), b"not an object").unwrap();

    assert_eq!(common::ids(&store.get_all(None).await.unwrap()), vec!["a"]);
}

#[tokio::test]
async fn test_identifiers_cannot_escape_the_directory() {
    let dir = TempDir::new().unwrap();
    let store = FileSystemStore::open(dir.path(), people()).unwrap();

    for id in ["../evil", "a/b", ".."] {
        let err = store.save(json!({"uuid": id})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput, "id {:?}", id);
        assert!(store.get(id).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_custom_directory() {
    let dir = TempDir::new().unwrap();
    let mut config = FileSystemConfig::new(people(), dir.path());
    config.directory = Some("humans".to_string());
    let store = FileSystemStore::with_config(config).unwrap();
    store.save(json!({"uuid": "a"})).await.unwrap();

    assert!(dir.path().join("humans").join("a.json").exists());
}

#[test]
fn test_missing_root_without_create() {
    let dir = TempDir::new().unwrap();
    let mut config = FileSystemConfig::new(people(), dir.path().join("absent"));
    config.create_root = false;
    assert!(FileSystemStore::with_config(config).is_err());
}
