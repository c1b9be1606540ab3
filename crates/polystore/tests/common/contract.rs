//! Behaviour every store implementation must show.
//!
//! Each check expects an empty store named anything, with the default id
//! (`uuid`) and last-update (`_lastUpdate`) fields.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use polystore::core::{EventKind, StoreEvent, StoreListener};
use polystore::error::{ErrorKind, StorageResult};
use polystore::expr::parse;
use polystore::{OrderBy, Query, Store, WriteCondition};
use serde_json::{json, Value};

use super::fixtures::{ids, person, seed_people};

fn kind_of<T: std::fmt::Debug>(result: StorageResult<T>) -> ErrorKind {
    match result {
        Ok(value) => panic!("expected an error, got {:?}", value),
        Err(e) => e.kind(),
    }
}

async fn content(store: &dyn Store, id: &str) -> Value {
    store.get_or_fail(id).await.expect("object").content().clone()
}

pub async fn crud_round_trip(store: &dyn Store) {
    let saved = store
        .save(json!({"uuid": "a", "name": "ada", "nested": {"x": 1}}))
        .await
        .unwrap();
    assert_eq!(saved.id(), "a");
    assert_eq!(saved.content()["name"], json!("ada"));
    assert!(saved.content()["_lastUpdate"].is_string());

    let loaded = store.get("a").await.unwrap().expect("saved object");
    assert_eq!(loaded.content(), saved.content());
    assert_eq!(loaded.last_updated(), saved.last_updated());
    assert!(store.exists("a").await.unwrap());

    assert!(store.get("missing").await.unwrap().is_none());
    assert!(!store.exists("missing").await.unwrap());
    assert_eq!(kind_of(store.get_or_fail("missing").await), ErrorKind::NotFound);
}

pub async fn save_generates_identifier(store: &dyn Store) {
    let saved = store.save(json!({"name": "anonymous"})).await.unwrap();
    assert_eq!(saved.id().len(), 36);
    assert_eq!(saved.id().matches('-').count(), 4);
    assert_eq!(saved.content()["uuid"], json!(saved.id()));
    assert!(store.exists(saved.id()).await.unwrap());

    assert_eq!(
        kind_of(store.save(json!({"uuid": 42})).await),
        ErrorKind::InvalidInput
    );
    assert_eq!(kind_of(store.save(json!([1, 2])).await), ErrorKind::InvalidInput);
}

pub async fn save_rejects_existing_identifier(store: &dyn Store) {
    store.save(json!({"uuid": "a", "n": 1})).await.unwrap();
    assert_eq!(
        kind_of(store.save(json!({"uuid": "a", "n": 2})).await),
        ErrorKind::Conflict
    );
    assert_eq!(content(store, "a").await["n"], json!(1));
}

pub async fn update_replaces_content(store: &dyn Store) {
    let saved = store
        .save(json!({"uuid": "a", "name": "ada", "age": 36}))
        .await
        .unwrap();
    let updated = store
        .update(json!({"name": "grace"}), "a", None)
        .await
        .unwrap();
    assert!(updated.last_updated() >= saved.last_updated());

    let current = content(store, "a").await;
    assert_eq!(current["name"], json!("grace"));
    assert_eq!(current["uuid"], json!("a"));
    assert!(current.get("age").is_none());

    assert_eq!(
        kind_of(store.update(json!({"name": "x"}), "missing", None).await),
        ErrorKind::NotFound
    );
}

pub async fn update_checks_condition(store: &dyn Store) {
    store.save(json!({"uuid": "a", "version": 3})).await.unwrap();

    let stale = WriteCondition::new("version", 4);
    let result = store
        .update(json!({"version": 5}), "a", Some(&stale))
        .await;
    assert_eq!(kind_of(result), ErrorKind::UpdateConditionFailed);
    assert_eq!(content(store, "a").await["version"], json!(3));

    let absent = WriteCondition::new("revision", 3);
    let result = store
        .update(json!({"version": 5}), "a", Some(&absent))
        .await;
    assert_eq!(kind_of(result), ErrorKind::UpdateConditionFailed);

    let current = WriteCondition::new("version", 3);
    store
        .update(json!({"version": 4}), "a", Some(&current))
        .await
        .unwrap();
    assert_eq!(content(store, "a").await["version"], json!(4));
}

pub async fn update_rejects_identifier_mismatch(store: &dyn Store) {
    store.save(json!({"uuid": "a"})).await.unwrap();
    assert_eq!(
        kind_of(store.update(json!({"uuid": "b"}), "a", None).await),
        ErrorKind::InvalidInput
    );
    assert!(store.get("b").await.unwrap().is_none());
}

pub async fn patch_merges(store: &dyn Store) {
    store
        .save(json!({
            "uuid": "a",
            "name": "ada",
            "address": {"city": "Paris", "zip": "75001"},
            "tmp": 1
        }))
        .await
        .unwrap();
    let patched = store
        .patch(
            json!({
                "uuid": "ignored",
                "address": {"zip": null, "street": "Rue"},
                "tmp": null,
                "extra": true
            }),
            "a",
            None,
        )
        .await
        .unwrap();
    assert_eq!(patched.id(), "a");

    let current = content(store, "a").await;
    assert_eq!(current["uuid"], json!("a"));
    assert_eq!(current["address"], json!({"city": "Paris", "street": "Rue"}));
    assert!(current.get("tmp").is_none());
    assert_eq!(current["extra"], json!(true));

    let failing = WriteCondition::new("name", "grace");
    assert_eq!(
        kind_of(store.patch(json!({"n": 1}), "a", Some(&failing)).await),
        ErrorKind::UpdateConditionFailed
    );
}

pub async fn delete_removes_object(store: &dyn Store) {
    store.save(json!({"uuid": "a", "state": "open"})).await.unwrap();

    let failing = WriteCondition::new("state", "closed");
    assert_eq!(
        kind_of(store.delete("a", Some(&failing)).await),
        ErrorKind::UpdateConditionFailed
    );
    assert!(store.exists("a").await.unwrap());

    let holding = WriteCondition::new("state", "open");
    store.delete("a", Some(&holding)).await.unwrap();
    assert!(store.get("a").await.unwrap().is_none());
    assert_eq!(kind_of(store.delete("a", None).await), ErrorKind::NotFound);
    assert_eq!(
        kind_of(store.update(json!({}), "a", None).await),
        ErrorKind::NotFound
    );
}

pub async fn increment_attribute(store: &dyn Store) {
    store
        .save(json!({"uuid": "a", "count": 1, "name": "ada"}))
        .await
        .unwrap();
    store.increment_attribute("a", "count", 2).await.unwrap();
    store.increment_attribute("a", "visits", 5).await.unwrap();
    store.increment_attribute("a", "count", -1).await.unwrap();

    let current = content(store, "a").await;
    assert_eq!(current["count"].as_i64(), Some(2));
    assert_eq!(current["visits"].as_i64(), Some(5));

    assert_eq!(
        kind_of(store.increment_attribute("a", "name", 1).await),
        ErrorKind::InvalidInput
    );
    assert_eq!(
        kind_of(store.increment_attribute("missing", "count", 1).await),
        ErrorKind::NotFound
    );
}

pub async fn collection_append_and_replace(store: &dyn Store) {
    store.save(json!({"uuid": "a"})).await.unwrap();
    store
        .upsert_item_to_collection("a", "actions", json!({"type": "plop", "n": 1}), None, None)
        .await
        .unwrap();
    store
        .upsert_item_to_collection("a", "actions", json!({"type": "x"}), None, None)
        .await
        .unwrap();
    store
        .upsert_item_to_collection("a", "actions", json!({"type": "y"}), Some(1), None)
        .await
        .unwrap();
    assert_eq!(
        content(store, "a").await["actions"],
        json!([{"type": "plop", "n": 1}, {"type": "y"}])
    );

    let result = store
        .upsert_item_to_collection("a", "actions", json!({"type": "z"}), Some(5), None)
        .await;
    assert_eq!(kind_of(result), ErrorKind::InvalidInput);
    assert_eq!(content(store, "a").await["actions"].as_array().map(Vec::len), Some(2));

    store.save(json!({"uuid": "b", "actions": "not a list"})).await.unwrap();
    let result = store
        .upsert_item_to_collection("b", "actions", json!(1), None, None)
        .await;
    assert_eq!(kind_of(result), ErrorKind::InvalidInput);
}

pub async fn collection_replace_checks_item_condition(store: &dyn Store) {
    store
        .save(json!({"uuid": "a", "actions": [{"type": "other", "n": 1}]}))
        .await
        .unwrap();

    let plop = WriteCondition::new("type", "plop");
    let result = store
        .upsert_item_to_collection("a", "actions", json!({"type": "new"}), Some(0), Some(&plop))
        .await;
    assert_eq!(kind_of(result), ErrorKind::UpdateConditionFailed);
    assert_eq!(
        content(store, "a").await["actions"],
        json!([{"type": "other", "n": 1}])
    );

    let other = WriteCondition::new("type", "other");
    store
        .upsert_item_to_collection("a", "actions", json!({"type": "new"}), Some(0), Some(&other))
        .await
        .unwrap();
    assert_eq!(content(store, "a").await["actions"], json!([{"type": "new"}]));
}

pub async fn collection_delete_item(store: &dyn Store) {
    store
        .save(json!({"uuid": "a", "items": [{"n": 1}, {"n": 2}, {"n": 3}]}))
        .await
        .unwrap();
    store
        .delete_item_from_collection("a", "items", 1, None)
        .await
        .unwrap();
    assert_eq!(content(store, "a").await["items"], json!([{"n": 1}, {"n": 3}]));

    let wrong = WriteCondition::new("n", 5);
    assert_eq!(
        kind_of(store.delete_item_from_collection("a", "items", 0, Some(&wrong)).await),
        ErrorKind::UpdateConditionFailed
    );
    assert_eq!(
        kind_of(store.delete_item_from_collection("a", "items", 9, None).await),
        ErrorKind::InvalidInput
    );

    let right = WriteCondition::new("n", 3);
    store
        .delete_item_from_collection("a", "items", 1, Some(&right))
        .await
        .unwrap();
    assert_eq!(content(store, "a").await["items"], json!([{"n": 1}]));
}

pub async fn remove_attribute(store: &dyn Store) {
    store
        .save(json!({"uuid": "a", "tmp": 1, "keep": 2}))
        .await
        .unwrap();

    let wrong = WriteCondition::new("keep", 3);
    assert_eq!(
        kind_of(store.remove_attribute("a", "tmp", Some(&wrong)).await),
        ErrorKind::UpdateConditionFailed
    );

    store.remove_attribute("a", "tmp", None).await.unwrap();
    let current = content(store, "a").await;
    assert!(current.get("tmp").is_none());
    assert_eq!(current["keep"], json!(2));

    store.remove_attribute("a", "tmp", None).await.unwrap();
    assert_eq!(
        kind_of(store.remove_attribute("a", "uuid", None).await),
        ErrorKind::InvalidInput
    );
}

pub async fn get_all_keeps_request_order(store: &dyn Store) {
    for id in ["a", "b", "c"] {
        store.save(json!({"uuid": id})).await.unwrap();
    }
    let requested = vec!["c".to_string(), "missing".to_string(), "a".to_string()];
    let found = store.get_all(Some(&requested)).await.unwrap();
    assert_eq!(ids(&found), vec!["c", "a"]);

    let mut all = ids(&store.get_all(None).await.unwrap());
    all.sort();
    assert_eq!(all, vec!["a", "b", "c"]);
}

pub async fn find_filters_and_orders(store: &dyn Store) {
    seed_people(store, 40).await;
    let people: Vec<Value> = (0..40).map(person).collect();

    for filter in [
        "state = 'CA' AND age >= 20",
        "name LIKE 'person-001%'",
        "team.id IN [1, 2] OR role = 5",
        "missing != 1 AND role < 3",
        "state IN ['NY'] AND absent = null",
    ] {
        let expression = parse(filter).unwrap();
        let mut expected: Vec<&Value> = people.iter().filter(|p| expression.evaluate(p)).collect();
        expected.sort_by(|a, b| {
            b["age"]
                .as_u64()
                .cmp(&a["age"].as_u64())
                .then_with(|| a["uuid"].as_str().cmp(&b["uuid"].as_str()))
        });
        let expected: Vec<String> = expected
            .iter()
            .filter_map(|p| p["uuid"].as_str().map(str::to_string))
            .collect();

        let query = Query::new(expression)
            .order_by(OrderBy::parse("-age").unwrap())
            .with_limit(100);
        let page = store.find(&query).await.unwrap();
        assert_eq!(ids(&page.results), expected, "{}", filter);
        assert!(page.continuation_token.is_none(), "{}", filter);
    }
}

pub async fn find_pages_are_stable(store: &dyn Store) {
    seed_people(store, 23).await;
    let base = Query::parse("role >= 3")
        .unwrap()
        .order_by(OrderBy::parse("state").unwrap());

    let all = store.find(&base.clone().with_limit(1000)).await.unwrap();
    assert!(all.continuation_token.is_none());

    let mut paged = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let mut query = base.clone().with_limit(5);
        if let Some(t) = token.take() {
            query = query.with_continuation(t);
        }
        let page = store.find(&query).await.unwrap();
        assert!(page.results.len() <= 5);
        paged.extend(ids(&page.results));
        match page.continuation_token {
            Some(t) => token = Some(t),
            None => break,
        }
    }
    assert_eq!(paged, ids(&all.results));
}

pub async fn find_rejects_bad_token(store: &dyn Store) {
    seed_people(store, 3).await;
    let query = Query::all().with_continuation("not-a-token");
    assert_eq!(kind_of(store.find(&query).await), ErrorKind::InvalidInput);
}

/// Records every event it sees.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(EventKind, String, Option<Value>)>>,
}

#[async_trait]
impl StoreListener for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn on_event(&self, event: &StoreEvent) -> StorageResult<()> {
        self.seen.lock().push((
            event.event.kind(),
            event.event.object_id().to_string(),
            event.event.previous().map(|p| p.content().clone()),
        ));
        Ok(())
    }
}

pub async fn events_carry_previous_state(store: &dyn Store) {
    let recorder = Arc::new(Recorder::default());
    store.events().subscribe(recorder.clone());

    store.save(json!({"uuid": "a", "name": "ada"})).await.unwrap();
    store.update(json!({"name": "grace"}), "a", None).await.unwrap();
    store.patch(json!({"age": 1}), "a", None).await.unwrap();
    store.increment_attribute("a", "age", 1).await.unwrap();
    store.delete("a", None).await.unwrap();
    assert!(store.events().unsubscribe("recorder"));

    let seen = recorder.seen.lock();
    let kinds: Vec<EventKind> = seen.iter().map(|(k, _, _)| *k).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Saved,
            EventKind::Updated,
            EventKind::PatchUpdated,
            EventKind::PartialUpdated,
            EventKind::Deleted,
        ]
    );
    assert!(seen.iter().all(|(_, id, _)| id == "a"));
    let updated_from = seen[1].2.as_ref().expect("previous state of update");
    assert_eq!(updated_from["name"], json!("ada"));
    let incremented_from = seen[3].2.as_ref().expect("previous state of increment");
    assert_eq!(incremented_from["age"].as_i64(), Some(1));
}

pub async fn concurrent_conditional_updates(store: &dyn Store) {
    store.save(json!({"uuid": "a", "version": 3})).await.unwrap();
    let condition = WriteCondition::new("version", 3);

    let (first, second) = tokio::join!(
        store.update(json!({"version": 4, "by": "first"}), "a", Some(&condition)),
        store.update(json!({"version": 4, "by": "second"}), "a", Some(&condition)),
    );
    let (winner, loser) = match (first, second) {
        (Ok(_), Err(e)) => ("first", e),
        (Err(e), Ok(_)) => ("second", e),
        (a, b) => panic!("expected exactly one winner, got {:?} and {:?}", a.is_ok(), b.is_ok()),
    };
    assert_eq!(loser.kind(), ErrorKind::UpdateConditionFailed);
    assert_eq!(content(store, "a").await["by"], json!(winner));
}

/// Needs a store configured with `DeleteMode::Tombstone`.
pub async fn tombstones_stay_reserved(store: &dyn Store) {
    store.save(json!({"uuid": "a", "state": "open"})).await.unwrap();
    store.save(json!({"uuid": "b", "state": "open"})).await.unwrap();
    store.delete("a", None).await.unwrap();

    assert!(store.get("a").await.unwrap().is_none());
    assert!(!store.exists("a").await.unwrap());
    assert_eq!(ids(&store.get_all(None).await.unwrap()), vec!["b"]);
    let found = store.find(&Query::parse("state = 'open'").unwrap()).await.unwrap();
    assert_eq!(ids(&found.results), vec!["b"]);

    assert_eq!(kind_of(store.delete("a", None).await), ErrorKind::NotFound);
    assert_eq!(
        kind_of(store.patch(json!({"state": "closed"}), "a", None).await),
        ErrorKind::NotFound
    );
    assert_eq!(
        kind_of(store.save(json!({"uuid": "a"})).await),
        ErrorKind::Conflict
    );

    store.purge("a").await.unwrap();
    store.save(json!({"uuid": "a", "state": "new"})).await.unwrap();
    assert_eq!(content(store, "a").await["state"], json!("new"));
}
