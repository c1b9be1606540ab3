//! Deterministic datasets.

use polystore::Store;
use serde_json::{json, Value};

const STATES: [&str; 5] = ["CA", "NY", "TX", "WA", "OR"];

/// The `i`-th synthetic person.
///
/// Every fifth person lives in `CA`, and `role` cycles through `2..=5`
/// within each state, so among 1000 people 50 match
/// `state = 'CA' AND role = 4` and 150 match `state = 'CA' AND role <= 4`.
pub fn person(i: usize) -> Value {
    json!({
        "uuid": format!("p{:04}", i),
        "name": format!("person-{:04}", i),
        "state": STATES[i % STATES.len()],
        "role": (i / STATES.len()) % 4 + 2,
        "age": 18 + (i % 50),
        "team": { "id": i % 7 },
        "tags": ["synthetic"],
    })
}

/// Saves people `0..count`.
pub async fn seed_people(store: &dyn Store, count: usize) {
    for i in 0..count {
        store.save(person(i)).await.expect("seed person");
    }
}

/// Ids of the stored objects, in result order.
pub fn ids(objects: &[polystore::StoredObject]) -> Vec<String> {
    objects.iter().map(|o| o.id().to_string()).collect()
}
