//! Things storage and sync-ledger behavior on a real database file.

use serde_json::json;

use local_twins::model::{Feature, NamespacedId, Thing};
use local_twins::store::{StoreError, ThingStorage, ThingStore};

const DEVICE: &str = "org.eclipse.kanto:gw";
const THING: &str = "org.eclipse.kanto:test";

fn open_store(dir: &tempfile::TempDir) -> ThingStore {
    ThingStore::open(dir.path().join("things.db"), DEVICE).unwrap()
}

fn object(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    value.as_object().unwrap().clone()
}

fn test_thing() -> Thing {
    Thing::new()
        .with_id(NamespacedId::parse(THING).unwrap())
        .with_attributes(Some(object(json!({"location": {"lat": 47.6}}))))
        .with_feature(
            "meter",
            Feature::new().with_properties(Some(object(json!({"x": 12.34})))),
        )
}

#[test]
fn add_thing_get_thing_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);

    let thing = test_thing();
    store.add_thing(&thing).unwrap();

    let mut loaded = store.thing(THING).unwrap();
    assert_eq!(loaded.revision, 0);
    assert!(!loaded.timestamp.is_empty());

    // Equal modulo the ledger-owned fields.
    loaded.revision = thing.revision;
    loaded.timestamp = thing.timestamp.clone();
    assert_eq!(loaded, thing);
}

#[test]
fn incoming_revision_seeds_the_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);

    let mut thing = test_thing();
    thing.revision = 7;
    assert_eq!(store.add_thing(&thing).unwrap(), 7);
    assert_eq!(store.system_data(THING).unwrap().revision, 7);

    // Subsequent writes bump the ledger regardless of the payload.
    thing.revision = 100;
    assert_eq!(store.add_thing(&thing).unwrap(), 8);
}

#[test]
fn add_thing_requires_a_real_id() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);

    assert!(matches!(
        store.add_thing(&Thing::new()),
        Err(StoreError::InvalidThingId { .. })
    ));
    let wildcard = Thing::new().with_id(NamespacedId::parse("_:_").unwrap());
    assert!(matches!(
        store.add_thing(&wildcard),
        Err(StoreError::InvalidThingId { .. })
    ));
}

#[test]
fn add_feature_increments_unsync_counter() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store.add_thing(&test_thing()).unwrap();

    let feature = Feature::new().with_properties(Some(object(json!({"y": 1}))));
    assert_eq!(store.add_feature(THING, "gauge", &feature).unwrap(), 1);
    assert_eq!(store.add_feature(THING, "gauge", &feature).unwrap(), 2);

    let system = store.system_data(THING).unwrap();
    assert_eq!(system.unsynchronized_features.get("gauge"), Some(&2));
    assert!(!system.deleted_features.contains("gauge"));
    // Each write bumped the ledger revision.
    assert_eq!(system.revision, 2);
}

#[test]
fn add_feature_requires_the_thing() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    assert!(matches!(
        store.add_feature(THING, "meter", &Feature::new()),
        Err(StoreError::ThingNotFound { .. })
    ));
}

#[test]
fn remove_feature_moves_it_to_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store.add_thing(&test_thing()).unwrap();

    store.remove_feature(THING, "meter").unwrap();

    let system = store.system_data(THING).unwrap();
    assert!(system.deleted_features.contains("meter"));
    assert!(!system.unsynchronized_features.contains_key("meter"));
    assert!(matches!(
        store.feature(THING, "meter"),
        Err(StoreError::FeatureNotFound { .. })
    ));

    // Re-adding clears the deleted mark again.
    store.add_feature(THING, "meter", &Feature::new()).unwrap();
    let system = store.system_data(THING).unwrap();
    assert!(!system.deleted_features.contains("meter"));
    assert_eq!(system.unsynchronized_features.get("meter"), Some(&1));
}

#[test]
fn remove_missing_feature_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store.add_thing(&test_thing()).unwrap();

    assert!(matches!(
        store.remove_feature(THING, "nope"),
        Err(StoreError::FeatureNotFound { .. })
    ));
    assert!(matches!(
        store.remove_feature("org.eclipse.kanto:other", "meter"),
        Err(StoreError::ThingNotFound { .. })
    ));
}

#[test]
fn add_thing_recomputes_the_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store.add_thing(&test_thing()).unwrap();

    // Replace the features with a different set: the previous feature is
    // marked deleted, the new ones start with a fresh unsync counter.
    let replacement = Thing::new()
        .with_id(NamespacedId::parse(THING).unwrap())
        .with_feature("gauge", Feature::new());
    store.add_thing(&replacement).unwrap();

    let system = store.system_data(THING).unwrap();
    assert!(system.deleted_features.contains("meter"));
    assert_eq!(system.unsynchronized_features.get("gauge"), Some(&1));
    assert!(!system.unsynchronized_features.contains_key("meter"));
    assert!(matches!(
        store.feature(THING, "meter"),
        Err(StoreError::FeatureNotFound { .. })
    ));

    // Re-adding a deleted feature removes the deleted mark.
    let again = test_thing();
    store.add_thing(&again).unwrap();
    let system = store.system_data(THING).unwrap();
    assert!(!system.deleted_features.contains("meter"));
    assert!(system.deleted_features.contains("gauge"));
    assert_eq!(system.unsynchronized_features.get("meter"), Some(&1));
}

#[test]
fn thing_synchronized_clears_everything_on_matching_revision() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store.add_thing(&test_thing()).unwrap();
    store.remove_feature(THING, "meter").unwrap();
    store.add_feature(THING, "gauge", &Feature::new()).unwrap();

    let system = store.system_data(THING).unwrap();
    assert!(!system.deleted_features.is_empty());
    assert!(!system.unsynchronized_features.is_empty());

    assert!(!store.thing_synchronized(THING, system.revision + 1).unwrap());
    assert!(store.thing_synchronized(THING, system.revision).unwrap());

    let system = store.system_data(THING).unwrap();
    assert!(system.deleted_features.is_empty());
    assert!(system.unsynchronized_features.is_empty());
}

#[test]
fn feature_synchronized_semantics() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store.add_thing(&test_thing()).unwrap();

    // Nothing pending: trivially synchronized.
    assert!(store.feature_synchronized(THING, "unknown", 5).unwrap());

    // Counter mismatch keeps the ledger dirty.
    store.add_feature(THING, "meter", &Feature::new()).unwrap();
    let counter = store.system_data(THING).unwrap().unsynchronized_features["meter"];
    assert!(!store.feature_synchronized(THING, "meter", counter + 1).unwrap());
    assert!(store
        .system_data(THING)
        .unwrap()
        .unsynchronized_features
        .contains_key("meter"));

    // Matching counter clears the entry.
    assert!(store.feature_synchronized(THING, "meter", counter).unwrap());
    assert!(!store
        .system_data(THING)
        .unwrap()
        .unsynchronized_features
        .contains_key("meter"));

    // A deleted feature is settled regardless of the revision argument.
    store.remove_feature(THING, "meter").unwrap();
    assert!(store.feature_synchronized(THING, "meter", 0).unwrap());
    assert!(!store
        .system_data(THING)
        .unwrap()
        .deleted_features
        .contains("meter"));
}

#[test]
fn thing_ids_and_remove_thing() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    assert!(store.thing_ids().unwrap().is_empty());

    store.add_thing(&test_thing()).unwrap();
    let other = Thing::new().with_id(NamespacedId::parse("org.eclipse.kanto:other").unwrap());
    store.add_thing(&other).unwrap();

    let mut ids = store.thing_ids().unwrap();
    ids.sort();
    assert_eq!(ids, vec!["org.eclipse.kanto:other", THING]);

    store.remove_thing(THING).unwrap();
    assert_eq!(store.thing_ids().unwrap(), vec!["org.eclipse.kanto:other"]);
    assert!(matches!(
        store.thing(THING),
        Err(StoreError::ThingNotFound { .. })
    ));
    assert!(matches!(
        store.remove_thing(THING),
        Err(StoreError::ThingNotFound { .. })
    ));
}

#[test]
fn thing_data_skips_features() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store.add_thing(&test_thing()).unwrap();

    let data = store.thing_data(THING).unwrap();
    assert!(data.features.is_none());
    assert!(data.attributes.is_some());
}

#[test]
fn storage_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open_store(&dir);
        store.add_thing(&test_thing()).unwrap();
        store.close().unwrap();
    }
    let store = open_store(&dir);
    let thing = store.thing(THING).unwrap();
    assert_eq!(
        thing.features.unwrap()["meter"].properties,
        Some(object(json!({"x": 12.34})))
    );
}

#[test]
fn rebinding_to_another_device_backs_up_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("things.db");
    {
        let store = ThingStore::open(&path, "org.eclipse.kanto:first").unwrap();
        store.add_thing(&test_thing()).unwrap();
        store.close().unwrap();
    }

    let store = ThingStore::open(&path, "org.eclipse.kanto:second").unwrap();
    assert_eq!(store.device_id(), "org.eclipse.kanto:second");
    // The new store is empty; the old contents live in the backup file.
    assert!(store.thing_ids().unwrap().is_empty());
    assert!(dir.path().join("things.db.org.eclipse.kanto_first").exists());
}

#[test]
fn reopening_with_same_device_keeps_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("things.db");
    {
        let store = ThingStore::open(&path, DEVICE).unwrap();
        store.add_thing(&test_thing()).unwrap();
        store.close().unwrap();
    }
    let store = ThingStore::open(&path, DEVICE).unwrap();
    assert_eq!(store.thing_ids().unwrap(), vec![THING.to_string()]);
    assert!(!dir.path().join("things.db.org.eclipse.kanto_gw").exists());
}
