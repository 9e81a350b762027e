//! Update strategies of the state store

mod common;

use common::map;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use superstep_core::error::GraphError;
use superstep_core::state::{AppendReducer, StateMap, StateStore, UpdateStrategy};

#[test]
fn test_merge_ignore_raise_sequence() {
    let store = StateStore::new();
    store
        .update(map(json!({"stats": {"a": 1}})), UpdateStrategy::Merge, "first")
        .unwrap();
    store
        .update(map(json!({"stats": {"b": 2}})), UpdateStrategy::Merge, "second")
        .unwrap();
    assert_eq!(store.get("stats"), Some(json!({"a": 1, "b": 2})));

    let ignore = StateStore::new();
    ignore
        .update(map(json!({"stats": {"a": 1}})), UpdateStrategy::Ignore, "first")
        .unwrap();
    ignore
        .update(map(json!({"stats": {"b": 2}})), UpdateStrategy::Ignore, "second")
        .unwrap();
    assert_eq!(ignore.get("stats"), Some(json!({"a": 1})));

    let raise = StateStore::new();
    raise
        .update(map(json!({"stats": {"a": 1}})), UpdateStrategy::Raise, "first")
        .unwrap();
    let err = raise
        .update(map(json!({"stats": {"b": 2}})), UpdateStrategy::Raise, "second")
        .unwrap_err();
    assert!(matches!(err, GraphError::DuplicateKey { ref key } if key == "stats"));
    assert_eq!(raise.get("stats"), Some(json!({"a": 1})));
}

#[test]
fn test_append_reducer_accumulates() {
    let store = StateStore::new();
    store.register_reducer("log", Box::new(AppendReducer));
    for entry in ["fetch", "parse", "store"] {
        store
            .update(map(json!({"log": entry})), UpdateStrategy::Merge, entry)
            .unwrap();
    }
    assert_eq!(store.get("log"), Some(json!(["fetch", "parse", "store"])));
}

fn small_object() -> impl Strategy<Value = BTreeMap<String, i64>> {
    prop::collection::btree_map("[a-e]", any::<i64>(), 0..5)
}

fn to_value(entries: &BTreeMap<String, i64>) -> Value {
    Value::Object(entries.iter().map(|(k, v)| (k.clone(), json!(v))).collect())
}

proptest! {
    #[test]
    fn prop_object_merge_is_shallow_union(old in small_object(), new in small_object()) {
        let store = StateStore::new();
        store.set("obj", to_value(&old), "seed");

        let mut update = StateMap::new();
        update.insert("obj".into(), to_value(&new));
        store.update(update, UpdateStrategy::Merge, "merge").unwrap();

        let mut expected = old.clone();
        expected.extend(new.clone());
        prop_assert_eq!(store.get("obj"), Some(to_value(&expected)));
    }

    #[test]
    fn prop_array_merge_concatenates(old in prop::collection::vec(any::<i32>(), 0..6),
                                     new in prop::collection::vec(any::<i32>(), 0..6)) {
        let store = StateStore::new();
        store.set("items", json!(old), "seed");

        let mut update = StateMap::new();
        update.insert("items".into(), json!(new));
        store.update(update, UpdateStrategy::Merge, "merge").unwrap();

        let expected: Vec<i32> = old.iter().chain(new.iter()).copied().collect();
        prop_assert_eq!(store.get("items"), Some(json!(expected)));
    }

    #[test]
    fn prop_raise_is_all_or_nothing(existing in prop::collection::btree_set("[a-h]", 0..5),
                                    incoming in prop::collection::btree_set("[a-h]", 1..5)) {
        let initial: StateMap = existing.iter().map(|k| (k.clone(), json!("old"))).collect();
        let store = StateStore::with_initial(initial.clone());

        let update: StateMap = incoming.iter().map(|k| (k.clone(), json!("new"))).collect();
        let result = store.update(update, UpdateStrategy::Raise, "raise");

        if existing.is_disjoint(&incoming) {
            prop_assert!(result.is_ok());
            prop_assert_eq!(store.len(), existing.len() + incoming.len());
        } else {
            prop_assert!(result.is_err());
            prop_assert_eq!(store.snapshot(), initial);
        }
    }

    #[test]
    fn prop_ignore_never_changes_existing(existing in prop::collection::btree_set("[a-h]", 0..5),
                                          incoming in prop::collection::btree_set("[a-h]", 0..5)) {
        let initial: StateMap = existing.iter().map(|k| (k.clone(), json!("old"))).collect();
        let store = StateStore::with_initial(initial);

        let update: StateMap = incoming.iter().map(|k| (k.clone(), json!("new"))).collect();
        store.update(update, UpdateStrategy::Ignore, "ignore").unwrap();

        for key in &existing {
            prop_assert_eq!(store.get(key), Some(json!("old")));
        }
        for key in incoming.difference(&existing) {
            prop_assert_eq!(store.get(key), Some(json!("new")));
        }
    }
}
