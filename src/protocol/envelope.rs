//! Wire envelope carrying a command, event or error.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::headers::Headers;
use super::topic::Topic;

/// A protocol envelope.
///
/// `value` stays raw JSON; the command handler parses it against the
/// schema the (scope, action) pair expects.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: Topic,

    #[serde(default, skip_serializing_if = "Headers::is_empty")]
    pub headers: Headers,

    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Envelope {
    pub fn new(topic: Topic, path: impl Into<String>) -> Self {
        Self {
            topic,
            headers: Headers::new(),
            path: path.into(),
            fields: None,
            value: None,
            status: None,
            revision: None,
            timestamp: None,
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_fields(mut self, fields: Option<String>) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_revision(mut self, revision: i64) -> Self {
        self.revision = Some(revision);
        self
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_command_envelope() {
        let raw = json!({
            "topic": "org.eclipse.kanto/test/things/twin/commands/modify",
            "headers": {"correlation-id": "c1"},
            "path": "/features/meter",
            "value": {"properties": {"x": 12.34}}
        });
        let envelope: Envelope = serde_json::from_value(raw.clone()).unwrap();
        assert!(envelope.topic.is_twin_commands());
        assert_eq!(envelope.headers.correlation_id(), Some("c1"));
        assert_eq!(envelope.path, "/features/meter");
        assert_eq!(serde_json::to_value(&envelope).unwrap(), raw);
    }

    #[test]
    fn optional_fields_are_omitted() {
        let topic = Topic::parse("ns/id/things/twin/events/modified").unwrap();
        let envelope = Envelope::new(topic, "/").with_status(200);
        let raw = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            raw,
            json!({
                "topic": "ns/id/things/twin/events/modified",
                "path": "/",
                "status": 200
            })
        );
    }
}
