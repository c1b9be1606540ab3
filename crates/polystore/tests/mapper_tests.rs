//! Mapper integration tests: replay of source changes into target
//! collections, relocation and cascade delete.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use polystore::backends::memory::MemoryStore;
use polystore::core::{DeleteMode, EventKind, ReplayTag, StoreEvent, StoreListener};
use polystore::error::StorageResult;
use polystore::mapper::{Mapper, MapperLink};
use polystore::{ErrorKind, Store, StoreConfig};
use serde_json::{json, Value};

fn memory(name: &str) -> Arc<dyn Store> {
    Arc::new(MemoryStore::new(StoreConfig::new(name)).unwrap())
}

fn ident_link() -> MapperLink {
    MapperLink::new("idents", "user", "users", "idents").with_copied_fields(["kind", "value"])
}

struct Stores {
    users: Arc<dyn Store>,
    idents: Arc<dyn Store>,
    mapper: Arc<Mapper>,
}

fn attached(link: MapperLink, users: Arc<dyn Store>, idents: Arc<dyn Store>) -> Stores {
    let mapper = Mapper::new(link, idents.clone(), users.clone()).unwrap();
    mapper.attach();
    Stores {
        users,
        idents,
        mapper,
    }
}

fn in_memory(link: MapperLink) -> Stores {
    attached(link, memory("users"), memory("idents"))
}

async fn projections(users: &dyn Store, id: &str) -> Value {
    users
        .get_or_fail(id)
        .await
        .unwrap()
        .content()
        .get("idents")
        .cloned()
        .unwrap_or(Value::Null)
}

/// Records the origin of every event it sees.
#[derive(Default)]
struct OriginRecorder {
    seen: Mutex<Vec<(EventKind, Option<ReplayTag>)>>,
}

#[async_trait]
impl StoreListener for OriginRecorder {
    fn name(&self) -> &str {
        "origins"
    }

    async fn on_event(&self, event: &StoreEvent) -> StorageResult<()> {
        self.seen
            .lock()
            .push((event.event.kind(), event.origin.clone()));
        Ok(())
    }
}

#[tokio::test]
async fn test_save_and_delete_keep_one_projection() {
    let s = in_memory(ident_link());
    s.users.save(json!({"uuid": "u1", "name": "ada"})).await.unwrap();

    s.idents
        .save(json!({"uuid": "i1", "user": "u1", "kind": "email", "value": "a@x", "secret": 1}))
        .await
        .unwrap();
    assert_eq!(
        projections(s.users.as_ref(), "u1").await,
        json!([{"uuid": "i1", "kind": "email", "value": "a@x"}])
    );

    s.idents.delete("i1", None).await.unwrap();
    assert_eq!(projections(s.users.as_ref(), "u1").await, json!([]));
    assert_eq!(
        s.users.get_or_fail("u1").await.unwrap().content()["name"],
        json!("ada")
    );
}

#[tokio::test]
async fn test_copied_field_change_replaces_in_place() {
    let s = in_memory(ident_link());
    s.users.save(json!({"uuid": "u1"})).await.unwrap();
    for (id, value) in [("i1", "a@x"), ("i2", "b@x"), ("i3", "c@x")] {
        s.idents
            .save(json!({"uuid": id, "user": "u1", "kind": "email", "value": value}))
            .await
            .unwrap();
    }

    s.idents
        .patch(json!({"value": "B@x"}), "i2", None)
        .await
        .unwrap();
    s.idents.increment_attribute("i3", "uses", 1).await.unwrap();

    assert_eq!(
        projections(s.users.as_ref(), "u1").await,
        json!([
            {"uuid": "i1", "kind": "email", "value": "a@x"},
            {"uuid": "i2", "kind": "email", "value": "B@x"},
            {"uuid": "i3", "kind": "email", "value": "c@x"},
        ])
    );
}

#[tokio::test]
async fn test_key_change_relocates_projection() {
    let s = in_memory(ident_link());
    s.users.save(json!({"uuid": "u1"})).await.unwrap();
    s.users.save(json!({"uuid": "u2"})).await.unwrap();
    s.idents
        .save(json!({"uuid": "i1", "user": "u1", "kind": "phone"}))
        .await
        .unwrap();

    s.idents
        .update(json!({"user": "u2", "kind": "phone"}), "i1", None)
        .await
        .unwrap();
    assert_eq!(projections(s.users.as_ref(), "u1").await, json!([]));
    assert_eq!(
        projections(s.users.as_ref(), "u2").await,
        json!([{"uuid": "i1", "kind": "phone"}])
    );

    s.idents.remove_attribute("i1", "user", None).await.unwrap();
    assert_eq!(projections(s.users.as_ref(), "u2").await, json!([]));
}

#[tokio::test]
async fn test_missing_target_is_skipped() {
    let s = in_memory(ident_link());
    s.idents
        .save(json!({"uuid": "i1", "user": "nobody", "kind": "email"}))
        .await
        .unwrap();
    s.idents
        .save(json!({"uuid": "i2", "kind": "orphan"}))
        .await
        .unwrap();
    s.idents.delete("i1", None).await.unwrap();
    assert!(s.users.get_all(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cascade_deletes_linked_sources() {
    let s = in_memory(ident_link().with_cascade_delete(true));
    s.users.save(json!({"uuid": "u1"})).await.unwrap();
    s.users.save(json!({"uuid": "u2"})).await.unwrap();
    for (id, user) in [("i1", "u1"), ("i2", "u1"), ("i3", "u2")] {
        s.idents
            .save(json!({"uuid": id, "user": user, "kind": "email"}))
            .await
            .unwrap();
    }
    assert_eq!(
        projections(s.users.as_ref(), "u1")
            .await
            .as_array()
            .map(Vec::len),
        Some(2)
    );

    s.users.delete("u1", None).await.unwrap();

    assert!(s.idents.get("i1").await.unwrap().is_none());
    assert!(s.idents.get("i2").await.unwrap().is_none());
    assert!(s.idents.get("i3").await.unwrap().is_some());
    assert_eq!(
        projections(s.users.as_ref(), "u2").await,
        json!([{"uuid": "i3", "kind": "email"}])
    );
}

#[tokio::test]
async fn test_cascade_skips_relocated_sources() {
    let s = in_memory(ident_link().with_cascade_delete(true));
    s.users.save(json!({"uuid": "u1"})).await.unwrap();
    s.users.save(json!({"uuid": "u2"})).await.unwrap();
    s.idents
        .save(json!({"uuid": "i1", "user": "u1"}))
        .await
        .unwrap();

    // A stale projection left on u1 while i1 points at u2.
    s.mapper.detach();
    s.idents
        .patch(json!({"user": "u2"}), "i1", None)
        .await
        .unwrap();
    s.mapper.attach();

    s.users.delete("u1", None).await.unwrap();
    assert!(s.idents.get("i1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_cascade_with_tombstoned_targets() {
    let users: Arc<dyn Store> = Arc::new(
        MemoryStore::new(StoreConfig::new("users").with_delete_mode(DeleteMode::Tombstone))
            .unwrap(),
    );
    let s = attached(ident_link().with_cascade_delete(true), users, memory("idents"));
    s.users.save(json!({"uuid": "u1"})).await.unwrap();
    s.idents
        .save(json!({"uuid": "i1", "user": "u1"}))
        .await
        .unwrap();

    s.users.delete("u1", None).await.unwrap();
    assert!(s.idents.get("i1").await.unwrap().is_none());
    assert!(s.users.get("u1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_own_writes_carry_the_replay_tag() {
    let s = in_memory(ident_link());
    let recorder = Arc::new(OriginRecorder::default());
    s.users.events().subscribe(recorder.clone());

    s.users.save(json!({"uuid": "u1"})).await.unwrap();
    s.idents
        .save(json!({"uuid": "i1", "user": "u1"}))
        .await
        .unwrap();

    let seen = recorder.seen.lock().clone();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], (EventKind::Saved, None));
    assert_eq!(
        seen[1],
        (EventKind::PartialUpdated, Some(s.mapper.tag().clone()))
    );
}

#[tokio::test]
async fn test_chained_links() {
    // idents -> users.idents, users -> teams.members
    let users = memory("users");
    let idents = memory("idents");
    let teams = memory("teams");
    let s = attached(ident_link(), users.clone(), idents);
    let members = Mapper::new(
        MapperLink::new("users", "team", "teams", "members").with_copied_fields(["idents"]),
        users,
        teams.clone(),
    )
    .unwrap();
    members.attach();

    teams.save(json!({"uuid": "t1"})).await.unwrap();
    s.users
        .save(json!({"uuid": "u1", "team": "t1"}))
        .await
        .unwrap();
    s.idents
        .save(json!({"uuid": "i1", "user": "u1", "kind": "email"}))
        .await
        .unwrap();

    let team = teams.get_or_fail("t1").await.unwrap();
    assert_eq!(
        team.content()["members"],
        json!([{"uuid": "u1", "idents": [{"uuid": "i1", "kind": "email"}]}])
    );
}

#[tokio::test]
async fn test_concurrent_saves_all_projected() {
    let s = in_memory(ident_link());
    s.users.save(json!({"uuid": "u1"})).await.unwrap();

    let saves = (0..20).map(|i| {
        let idents = s.idents.clone();
        async move {
            idents
                .save(json!({"uuid": format!("i{:02}", i), "user": "u1", "kind": "email"}))
                .await
        }
    });
    for result in futures::future::join_all(saves).await {
        result.unwrap();
    }

    let listed = projections(s.users.as_ref(), "u1").await;
    let mut ids: Vec<&str> = listed
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["uuid"].as_str().unwrap())
        .collect();
    ids.sort_unstable();
    let expected: Vec<String> = (0..20).map(|i| format!("i{:02}", i)).collect();
    assert_eq!(ids, expected);
}

#[cfg(all(feature = "sqlite", feature = "filesystem"))]
#[tokio::test]
async fn test_mixed_backends() {
    use polystore::backends::filesystem::FileSystemStore;
    use polystore::backends::sqlite::SqliteStore;

    let dir = tempfile::TempDir::new().unwrap();
    let users: Arc<dyn Store> = Arc::new(
        SqliteStore::open(dir.path().join("users.db"), StoreConfig::new("users")).unwrap(),
    );
    let idents: Arc<dyn Store> =
        Arc::new(FileSystemStore::open(dir.path(), StoreConfig::new("idents")).unwrap());
    let s = attached(ident_link().with_cascade_delete(true), users, idents);

    s.users.save(json!({"uuid": "u1"})).await.unwrap();
    s.idents
        .save(json!({"uuid": "i1", "user": "u1", "kind": "email", "value": "a@x"}))
        .await
        .unwrap();
    s.idents
        .patch(json!({"value": "b@x"}), "i1", None)
        .await
        .unwrap();
    assert_eq!(
        projections(s.users.as_ref(), "u1").await,
        json!([{"uuid": "i1", "kind": "email", "value": "b@x"}])
    );

    s.users.delete("u1", None).await.unwrap();
    assert!(s.idents.get("i1").await.unwrap().is_none());
}

#[test]
fn test_rejects_mismatched_stores() {
    let err = Mapper::new(ident_link(), memory("users"), memory("idents")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let err = Mapper::new(
        MapperLink::new("idents", "user", "users", "uuid"),
        memory("idents"),
        memory("users"),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}
