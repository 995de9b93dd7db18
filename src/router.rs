//! Integration seams to the surrounding message router.
//!
//! The core only relies on three small interfaces: a publisher, a
//! subscriber and a connection listener. Handlers return a
//! [`Disposition`] telling the router whether the message was consumed
//! or should continue down the chain.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::Receiver;
use thiserror::Error;
use uuid::Uuid;

use crate::sync::Synchronizer;

/// One routed message: opaque payload plus a router-assigned id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub payload: Bytes,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload: payload.into(),
        }
    }
}

/// What a handler decided about an inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Fully handled, do not pass on.
    Consumed,
    /// Hand the message to the next handler unchanged.
    PassThrough(Message),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("not connected")]
    NotConnected,
    #[error("publish failed: {reason}")]
    Failed { reason: String },
}

/// Topic-addressed outbound publishing.
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, message: &Message) -> Result<(), PublishError>;
}

/// Topic-pattern subscription; messages arrive on the returned channel.
pub trait Subscriber: Send + Sync {
    fn subscribe(&self, pattern: &str) -> Receiver<Message>;
}

/// Transport connection state notifications. The error, when present,
/// describes why the connection was lost.
pub trait ConnectionListener: Send + Sync {
    fn connected(&self, connected: bool, error: Option<&(dyn std::error::Error + 'static)>);
}

/// Drives the synchronizer lifecycle from transport connection events.
///
/// On connect the synchronizer start is delayed so the transport can
/// settle; on disconnect it stops immediately. Both run off the caller's
/// thread.
pub struct ConnectionHandler {
    synchronizer: Arc<Synchronizer>,
    settle: Duration,
}

impl ConnectionHandler {
    pub fn new(synchronizer: Arc<Synchronizer>) -> Self {
        Self {
            synchronizer,
            settle: Duration::from_secs(2),
        }
    }

    pub fn with_settle_delay(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }
}

impl ConnectionListener for ConnectionHandler {
    fn connected(&self, connected: bool, error: Option<&(dyn std::error::Error + 'static)>) {
        if let Some(error) = error {
            tracing::debug!(error = %error, "connection state change");
        }
        let synchronizer = Arc::clone(&self.synchronizer);
        if connected {
            let settle = self.settle;
            thread::spawn(move || {
                thread::sleep(settle);
                if let Err(err) = synchronizer.start() {
                    tracing::error!(error = %err, "synchronize error");
                }
            });
        } else {
            thread::spawn(move || synchronizer.stop());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use crossbeam::channel::{unbounded, Sender};

    use crate::commands::DeviceInfo;
    use crate::store::ThingStore;

    #[test]
    fn message_ids_are_unique() {
        let a = Message::new(&b"x"[..]);
        let b = Message::new(&b"x"[..]);
        assert_ne!(a.id, b.id);
        assert_eq!(a.payload, b.payload);
    }

    /// Channel-backed bus with MQTT-style `#` wildcard patterns.
    struct LocalBus {
        subscriptions: Mutex<Vec<(String, Sender<Message>)>>,
    }

    impl LocalBus {
        fn new() -> Self {
            Self {
                subscriptions: Mutex::new(Vec::new()),
            }
        }

        fn matches(pattern: &str, topic: &str) -> bool {
            pattern
                .split(',')
                .any(|p| match p.strip_suffix("/#") {
                    Some(prefix) => topic == prefix || topic.starts_with(&format!("{prefix}/")),
                    None => p == topic,
                })
        }
    }

    impl Subscriber for LocalBus {
        fn subscribe(&self, pattern: &str) -> Receiver<Message> {
            let (tx, rx) = unbounded();
            self.subscriptions
                .lock()
                .unwrap()
                .push((pattern.to_string(), tx));
            rx
        }
    }

    impl Publisher for LocalBus {
        fn publish(&self, topic: &str, message: &Message) -> Result<(), PublishError> {
            for (pattern, tx) in self.subscriptions.lock().unwrap().iter() {
                if Self::matches(pattern, topic) {
                    let _ = tx.send(message.clone());
                }
            }
            Ok(())
        }
    }

    #[test]
    fn bus_routes_by_pattern() {
        let bus = LocalBus::new();
        let events = bus.subscribe("event/#,e/#");
        let other = bus.subscribe("command/#");

        bus.publish("e/t1/ns:dev", &Message::new(&b"cmd"[..])).unwrap();
        bus.publish("telemetry", &Message::new(&b"x"[..])).unwrap();

        assert_eq!(events.try_iter().count(), 1);
        assert_eq!(other.try_iter().count(), 0);
    }

    #[test]
    fn connection_handler_starts_and_stops_the_synchronizer() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(ThingStore::open(dir.path().join("things.db"), "ns:gw").unwrap());
        let bus = Arc::new(LocalBus::new());
        let synchronizer = Arc::new(Synchronizer::new(
            DeviceInfo {
                device_id: "ns:gw".into(),
                tenant_id: "t1".into(),
                auto_provisioning: false,
            },
            storage,
            bus.clone(),
            bus,
        ));
        let handler = ConnectionHandler::new(synchronizer.clone())
            .with_settle_delay(Duration::from_millis(0));

        assert!(synchronizer.sync_things(&[]).is_err());

        handler.connected(true, None);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while synchronizer.sync_things(&[]).is_err() {
            assert!(std::time::Instant::now() < deadline, "synchronizer never started");
            thread::sleep(Duration::from_millis(10));
        }

        handler.connected(false, None);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while synchronizer.sync_things(&[]).is_ok() {
            assert!(std::time::Instant::now() < deadline, "synchronizer never stopped");
            thread::sleep(Duration::from_millis(10));
        }
    }
}
