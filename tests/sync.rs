//! Offline→online synchronization flows.

mod fixtures;

use serde_json::{json, Value};

use fixtures::{published_on, rig, Rig, TEST_THING_ID};
use local_twins::model::{Feature, NamespacedId, Thing};
use local_twins::router::Message;
use local_twins::store::ThingStorage;
use local_twins::Disposition;

fn object(value: Value) -> serde_json::Map<String, Value> {
    value.as_object().unwrap().clone()
}

fn meter_feature() -> Feature {
    Feature::new()
        .with_properties(Some(object(json!({"x": 12.34}))))
        .with_desired_properties(Some(object(json!({"x": 5}))))
}

fn add_thing_with_meter(rig: &Rig) {
    let thing = Thing::new()
        .with_id(NamespacedId::parse(TEST_THING_ID).unwrap())
        .with_feature("meter", meter_feature());
    rig.storage.add_thing(&thing).unwrap();
}

/// The retrieve command published by `start`, as (correlation-id, value).
fn started_retrieve(rig: &Rig) -> (String, Value) {
    rig.synchronizer.start().unwrap();
    let mut upstream = rig.upstream.take();
    assert_eq!(upstream.len(), 1);
    let (topic, retrieve) = upstream.remove(0);
    assert_eq!(topic, "e");
    assert_eq!(
        retrieve["topic"],
        "org.eclipse.kanto/test/things/twin/commands/retrieve"
    );
    assert_eq!(retrieve["path"], "/");
    assert_eq!(retrieve["fields"], "features(meter/desiredProperties)");
    assert_eq!(retrieve["headers"]["reply-to"], "command/t1");
    let correlation_id = retrieve["headers"]["correlation-id"]
        .as_str()
        .unwrap()
        .to_string();
    (correlation_id, retrieve)
}

fn response_message(correlation_id: &str, features: Value) -> Message {
    let envelope = json!({
        "topic": "org.eclipse.kanto/test/things/twin/commands/retrieve",
        "headers": {"correlation-id": correlation_id},
        "path": "/",
        "status": 200,
        "value": {"features": features}
    });
    Message::new(serde_json::to_vec(&envelope).unwrap())
}

#[test]
fn start_skips_things_without_features() {
    let rig = rig(false);
    let bare = Thing::new().with_id(NamespacedId::parse(TEST_THING_ID).unwrap());
    rig.storage.add_thing(&bare).unwrap();

    rig.synchronizer.start().unwrap();
    assert!(rig.upstream.is_empty());
}

#[test]
fn offline_changes_drain_after_connect() {
    let rig = rig(false);
    add_thing_with_meter(&rig);
    // A second offline mutation accumulates a counter of 2.
    rig.storage
        .add_feature(TEST_THING_ID, "meter", &meter_feature())
        .unwrap();
    assert_eq!(
        rig.storage.system_data(TEST_THING_ID).unwrap().unsynchronized_features["meter"],
        2
    );

    let (correlation_id, _) = started_retrieve(&rig);

    // Cloud answers with the same desired properties: no local change.
    let disposition = rig
        .synchronizer
        .handle_hub_message(&response_message(
            &correlation_id,
            json!({"meter": {"desiredProperties": {"x": 5}}}),
        ));
    assert_eq!(disposition, Disposition::Consumed);

    // No local event was needed.
    assert!(rig.local.is_empty());

    // The drain pushed one feature-sync command; meter has desired
    // properties, so only its reported properties go upstream.
    let upstream = rig.upstream.take();
    assert_eq!(upstream.len(), 1);
    let (topic, sync_cmd) = upstream.into_iter().next().unwrap();
    assert_eq!(topic, "e");
    assert_eq!(
        sync_cmd["topic"],
        "org.eclipse.kanto/test/things/twin/commands/modify"
    );
    assert_eq!(sync_cmd["path"], "/features/meter/properties");
    assert_eq!(sync_cmd["value"], json!({"x": 12.34}));
    assert_eq!(sync_cmd["headers"]["response-required"], false);

    // FeatureSynchronized(…, 2) cleared the entry; the thing-level clear
    // wiped the rest of the ledger.
    let system = rig.storage.system_data(TEST_THING_ID).unwrap();
    assert!(system.unsynchronized_features.is_empty());
    assert!(system.deleted_features.is_empty());
}

#[test]
fn feature_without_desired_properties_is_sent_whole() {
    let rig = rig(false);
    let thing = Thing::new()
        .with_id(NamespacedId::parse(TEST_THING_ID).unwrap())
        .with_feature(
            "meter",
            Feature::new().with_properties(Some(object(json!({"x": 1})))),
        );
    rig.storage.add_thing(&thing).unwrap();

    let (correlation_id, _) = started_retrieve(&rig);
    rig.synchronizer
        .handle_hub_message(&response_message(&correlation_id, json!({})));

    let upstream = rig.upstream.take();
    let (_, sync_cmd) = upstream.into_iter().next().unwrap();
    assert_eq!(sync_cmd["path"], "/features/meter");
    assert_eq!(sync_cmd["value"], json!({"properties": {"x": 1}}));
}

#[test]
fn cloud_desired_properties_are_merged_locally() {
    let rig = rig(false);
    add_thing_with_meter(&rig);
    // Settle the creation so the merge is the only pending change after.
    assert!(rig
        .storage
        .feature_synchronized(TEST_THING_ID, "meter", 1)
        .unwrap());

    let (correlation_id, _) = started_retrieve(&rig);

    rig.synchronizer.handle_hub_message(&response_message(
        &correlation_id,
        json!({"meter": {"desiredProperties": {"x": 9, "new": true}}}),
    ));

    // Local state now mirrors the cloud's desired properties.
    let feature = rig.storage.feature(TEST_THING_ID, "meter").unwrap();
    assert_eq!(
        Value::Object(feature.desired_properties.unwrap()),
        json!({"x": 9, "new": true})
    );

    // A local modified event announced the merge.
    let local = rig.local.take();
    let event = published_on(&local, "command///req//modified").unwrap();
    assert_eq!(event["path"], "/features/meter/desiredProperties");
    assert_eq!(event["value"], json!({"x": 9, "new": true}));
    assert_eq!(
        event["headers"]["content-type"],
        "application/vnd.eclipse.ditto+json"
    );
    assert_eq!(event["headers"]["response-required"], false);

    // The merge was the only pending change, so the ledger is clean and
    // the drain found nothing else to push.
    let system = rig.storage.system_data(TEST_THING_ID).unwrap();
    assert!(system.unsynchronized_features.is_empty());
}

#[test]
fn absent_cloud_feature_clears_local_desired_properties() {
    let rig = rig(false);
    add_thing_with_meter(&rig);
    assert!(rig
        .storage
        .feature_synchronized(TEST_THING_ID, "meter", 1)
        .unwrap());

    let (correlation_id, _) = started_retrieve(&rig);
    rig.synchronizer
        .handle_hub_message(&response_message(&correlation_id, json!({})));

    let feature = rig.storage.feature(TEST_THING_ID, "meter").unwrap();
    assert!(feature.desired_properties.is_none());
}

#[test]
fn error_response_is_consumed_without_update() {
    let rig = rig(false);
    add_thing_with_meter(&rig);

    let (correlation_id, _) = started_retrieve(&rig);

    let error = json!({
        "topic": "org.eclipse.kanto/test/things/twin/errors",
        "headers": {"correlation-id": correlation_id},
        "path": "/",
        "status": 404,
        "value": {
            "status": 404,
            "error": "things:thing.notfound",
            "message": "The Thing with ID 'org.eclipse.kanto:test' could not be found."
        }
    });
    let disposition = rig
        .synchronizer
        .handle_hub_message(&Message::new(serde_json::to_vec(&error).unwrap()));
    assert_eq!(disposition, Disposition::Consumed);

    // Desired properties stayed put; nothing was drained.
    let feature = rig.storage.feature(TEST_THING_ID, "meter").unwrap();
    assert_eq!(Value::Object(feature.desired_properties.unwrap()), json!({"x": 5}));
    assert!(rig.upstream.is_empty());
}

#[test]
fn unrelated_hub_messages_pass_through() {
    let rig = rig(false);
    add_thing_with_meter(&rig);
    rig.synchronizer.start().unwrap();
    rig.upstream.take();

    let unrelated = json!({
        "topic": "org.eclipse.kanto/test/things/twin/commands/modify",
        "headers": {"correlation-id": "someone-elses"},
        "path": "/features/meter",
        "value": {}
    });
    let message = Message::new(serde_json::to_vec(&unrelated).unwrap());
    assert!(matches!(
        rig.synchronizer.handle_hub_message(&message),
        Disposition::PassThrough(_)
    ));

    // Non-envelope payloads pass through as well.
    let garbage = Message::new(&b"not json"[..]);
    assert!(matches!(
        rig.synchronizer.handle_hub_message(&garbage),
        Disposition::PassThrough(_)
    ));
}

#[test]
fn deleted_features_are_merged_away_upstream() {
    let rig = rig(false);
    add_thing_with_meter(&rig);
    rig.storage.remove_feature(TEST_THING_ID, "meter").unwrap();

    rig.synchronizer.connected(true);
    rig.synchronizer
        .sync_things(&[TEST_THING_ID.to_string()])
        .unwrap();

    let upstream = rig.upstream.take();
    assert_eq!(upstream.len(), 1);
    let (_, merge) = upstream.into_iter().next().unwrap();
    assert_eq!(
        merge["topic"],
        "org.eclipse.kanto/test/things/twin/commands/merge"
    );
    assert_eq!(merge["path"], "/features");
    assert_eq!(merge["value"], json!({"meter": null}));
    assert_eq!(
        merge["headers"]["content-type"],
        "application/merge-patch+json"
    );

    let system = rig.storage.system_data(TEST_THING_ID).unwrap();
    assert!(system.deleted_features.is_empty());
    assert!(system.unsynchronized_features.is_empty());
}

#[test]
fn disconnect_keeps_the_ledger_dirty() {
    let rig = rig(false);
    add_thing_with_meter(&rig);

    rig.synchronizer.stop();
    let err = rig
        .synchronizer
        .sync_things(&[TEST_THING_ID.to_string()])
        .unwrap_err();
    assert!(matches!(err, local_twins::sync::SyncError::NotConnected));

    let system = rig.storage.system_data(TEST_THING_ID).unwrap();
    assert_eq!(system.unsynchronized_features.get("meter"), Some(&1));
}

#[test]
fn stop_forgets_pending_correlations() {
    let rig = rig(false);
    add_thing_with_meter(&rig);

    let (correlation_id, _) = started_retrieve(&rig);
    rig.synchronizer.stop();
    rig.synchronizer.connected(true);

    // The pending map was cleared: the response is no longer ours.
    let message = response_message(&correlation_id, json!({}));
    assert!(matches!(
        rig.synchronizer.handle_hub_message(&message),
        Disposition::PassThrough(_)
    ));
}
