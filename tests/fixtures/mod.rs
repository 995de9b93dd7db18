#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tempfile::TempDir;

use local_twins::commands::DeviceInfo;
use local_twins::router::{Message, PublishError, Publisher};
use local_twins::store::{ThingStorage, ThingStore};
use local_twins::sync::Synchronizer;
use local_twins::Handler;

pub const TEST_THING_ID: &str = "org.eclipse.kanto:test";
pub const TEST_FEATURE_ID: &str = "meter";

/// Captures published messages, decoded to JSON, per topic.
pub struct RecordingPublisher {
    connected: AtomicBool,
    records: Mutex<Vec<(String, Value)>>,
}

impl RecordingPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(true),
            records: Mutex::new(Vec::new()),
        })
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Drain everything captured so far.
    pub fn take(&self) -> Vec<(String, Value)> {
        std::mem::take(&mut *self.records.lock().unwrap())
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, topic: &str, message: &Message) -> Result<(), PublishError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(PublishError::NotConnected);
        }
        let value = serde_json::from_slice(&message.payload).unwrap_or(Value::Null);
        self.records
            .lock()
            .unwrap()
            .push((topic.to_string(), value));
        Ok(())
    }
}

/// A handler plus its publishers and storage on a temp database.
pub struct Rig {
    pub handler: Handler,
    pub synchronizer: Arc<Synchronizer>,
    pub local: Arc<RecordingPublisher>,
    pub upstream: Arc<RecordingPublisher>,
    pub storage: Arc<ThingStore>,
    _dir: TempDir,
}

pub fn rig(auto_provisioning: bool) -> Rig {
    rig_for_device(TEST_THING_ID, auto_provisioning)
}

pub fn rig_for_device(device_id: &str, auto_provisioning: bool) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(ThingStore::open(dir.path().join("things.db"), device_id).unwrap());
    let local = RecordingPublisher::new();
    let upstream = RecordingPublisher::new();

    let device = DeviceInfo {
        device_id: device_id.to_string(),
        tenant_id: "t1".to_string(),
        auto_provisioning,
    };
    let handler = Handler::new(
        device.clone(),
        local.clone(),
        upstream.clone(),
        storage.clone(),
    );
    let synchronizer = Arc::new(Synchronizer::new(
        device,
        storage.clone(),
        local.clone(),
        upstream.clone(),
    ));

    Rig {
        handler,
        synchronizer,
        local,
        upstream,
        storage,
        _dir: dir,
    }
}

impl Rig {
    pub fn handle(&self, payload: &str) -> local_twins::Disposition {
        self.handler
            .handle(&Message::new(payload.as_bytes().to_vec()))
            .unwrap()
    }

    pub fn handle_err(&self, payload: &str) -> local_twins::commands::CommandError {
        self.handler
            .handle(&Message::new(payload.as_bytes().to_vec()))
            .unwrap_err()
    }

    pub fn storage_dyn(&self) -> &dyn ThingStorage {
        self.storage.as_ref()
    }
}

/// The captured entry's envelope value under `field`, by publish topic.
pub fn published_on<'a>(records: &'a [(String, Value)], topic: &str) -> Option<&'a Value> {
    records
        .iter()
        .find(|(published_topic, _)| published_topic == topic)
        .map(|(_, value)| value)
}
