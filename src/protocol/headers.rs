//! Protocol headers: a case-insensitive map with typed accessors.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use super::ProtocolError;

const HEADER_CONTENT_TYPE: &str = "content-type";
const HEADER_CORRELATION_ID: &str = "correlation-id";
const HEADER_REPLY_TO: &str = "reply-to";
const HEADER_RESPONSE_REQUIRED: &str = "response-required";
const HEADER_TIMEOUT: &str = "timeout";
const HEADER_ETAG: &str = "etag";
const HEADER_IF_MATCH: &str = "if-match";
const HEADER_IF_NONE_MATCH: &str = "if-none-match";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Envelope headers.
///
/// Keys are case-insensitive and stored lowercase; unknown keys are
/// preserved opaquely. `response-required` defaults to true when absent,
/// so setting it to true removes the key.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Headers {
    values: BTreeMap<String, Value>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn string_value(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    fn with_string(mut self, key: &str, value: &str) -> Self {
        if value.is_empty() {
            self.values.remove(key);
        } else {
            self.values
                .insert(key.to_string(), Value::String(value.to_string()));
        }
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.string_value(HEADER_CONTENT_TYPE)
    }

    pub fn with_content_type(self, content_type: &str) -> Self {
        self.with_string(HEADER_CONTENT_TYPE, content_type)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.string_value(HEADER_CORRELATION_ID)
    }

    pub fn with_correlation_id(self, correlation_id: &str) -> Self {
        self.with_string(HEADER_CORRELATION_ID, correlation_id)
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.string_value(HEADER_REPLY_TO)
    }

    pub fn with_reply_to(self, reply_to: &str) -> Self {
        self.with_string(HEADER_REPLY_TO, reply_to)
    }

    pub fn etag(&self) -> Option<&str> {
        self.string_value(HEADER_ETAG)
    }

    pub fn with_etag(self, etag: &str) -> Self {
        self.with_string(HEADER_ETAG, etag)
    }

    pub fn if_match(&self) -> Option<&str> {
        self.string_value(HEADER_IF_MATCH)
    }

    pub fn with_if_match(self, if_match: &str) -> Self {
        self.with_string(HEADER_IF_MATCH, if_match)
    }

    pub fn if_none_match(&self) -> Option<&str> {
        self.string_value(HEADER_IF_NONE_MATCH)
    }

    pub fn with_if_none_match(self, if_none_match: &str) -> Self {
        self.with_string(HEADER_IF_NONE_MATCH, if_none_match)
    }

    /// True unless the header is present and false.
    pub fn response_required(&self) -> bool {
        self.values
            .get(HEADER_RESPONSE_REQUIRED)
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    /// True is the default-when-absent, so it removes the key.
    pub fn with_response_required(mut self, required: bool) -> Self {
        if required {
            self.values.remove(HEADER_RESPONSE_REQUIRED);
        } else {
            self.values
                .insert(HEADER_RESPONSE_REQUIRED.to_string(), Value::Bool(false));
        }
        self
    }

    /// The `timeout` header, 60 s when absent or out of range.
    pub fn timeout(&self) -> Duration {
        match self.string_value(HEADER_TIMEOUT) {
            Some(raw) => parse_timeout(raw).unwrap_or(DEFAULT_TIMEOUT),
            None => DEFAULT_TIMEOUT,
        }
    }

    /// Set `timeout` as the compact `<n>[ms|s|m]` string.
    ///
    /// Negative handling is moot with `Duration`; a value of an hour or
    /// more removes the header (the 60 s default applies again).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        if timeout >= Duration::from_secs(3600) {
            self.values.remove(HEADER_TIMEOUT);
            return self;
        }
        let value = if timeout > Duration::from_secs(1) {
            let secs = timeout.as_secs();
            if timeout.subsec_nanos() == 0 {
                format!("{secs}")
            } else {
                format!("{}", secs + 1)
            }
        } else {
            let millis = timeout.as_millis() as u64;
            if timeout.subsec_nanos() % 1_000_000 == 0 {
                format!("{millis}ms")
            } else {
                format!("{}ms", millis + 1)
            }
        };
        self.values
            .insert(HEADER_TIMEOUT.to_string(), Value::String(value));
        self
    }

    /// Raw access to any header, lowercased lookup.
    pub fn generic(&self, key: &str) -> Option<&Value> {
        self.values.get(&key.to_lowercase())
    }

    /// Set any header; an empty string value removes the key.
    pub fn with_generic(mut self, key: &str, value: Value) -> Self {
        let key = key.to_lowercase();
        match value {
            Value::String(s) if s.is_empty() => {
                self.values.remove(&key);
            }
            other => {
                self.values.insert(key, other);
            }
        }
        self
    }
}

/// Parse a timeout string: trailing `m`, `ms` or `s` unit, bare integer
/// body means seconds. Values outside 0..1h are out of range.
pub(crate) fn parse_timeout(raw: &str) -> Result<Duration, ProtocolError> {
    let invalid = || ProtocolError::InvalidTimeout {
        raw: raw.to_string(),
    };
    if raw.is_empty() {
        return Err(invalid());
    }

    let (body, unit_millis) = if let Some(body) = raw.strip_suffix("ms") {
        (body, 1u64)
    } else if let Some(body) = raw.strip_suffix('m') {
        (body, 60_000)
    } else if let Some(body) = raw.strip_suffix('s') {
        (body, 1_000)
    } else {
        (raw, 1_000)
    };

    let value: i64 = body.parse().map_err(|_| invalid())?;
    if value < 0 {
        return Err(invalid());
    }
    let duration = Duration::from_millis(value as u64 * unit_millis);
    if duration >= Duration::from_secs(3600) {
        return Err(invalid());
    }
    Ok(duration)
}

impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.values.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Headers {
    /// Lowercases keys and rejects a syntactically invalid `timeout`
    /// string; an out-of-range timeout is accepted (the accessor falls
    /// back to the default).
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, Value>::deserialize(deserializer)?;
        let mut values = BTreeMap::new();
        for (key, value) in raw {
            values.insert(key.to_lowercase(), value);
        }

        if let Some(timeout) = values.get(HEADER_TIMEOUT) {
            let Some(timeout) = timeout.as_str() else {
                return Err(D::Error::custom(ProtocolError::InvalidHeader {
                    name: HEADER_TIMEOUT.to_string(),
                }));
            };
            if let Err(err) = parse_timeout(timeout) {
                // Only a malformed body fails parsing of the envelope.
                if !is_out_of_range(timeout) {
                    return Err(D::Error::custom(err));
                }
            }
        }

        Ok(Self { values })
    }
}

fn is_out_of_range(raw: &str) -> bool {
    let body = raw
        .strip_suffix("ms")
        .or_else(|| raw.strip_suffix('m'))
        .or_else(|| raw.strip_suffix('s'))
        .unwrap_or(raw);
    body.parse::<i64>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn timeout_units() {
        assert_eq!(parse_timeout("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_timeout("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_timeout("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_timeout("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_timeout("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn timeout_rejects_invalid() {
        assert!(parse_timeout("").is_err());
        assert!(parse_timeout("abc").is_err());
        assert!(parse_timeout("1.5s").is_err());
        assert!(parse_timeout("-5").is_err());
        assert!(parse_timeout("3600").is_err());
        assert!(parse_timeout("60m").is_err());
        assert!(parse_timeout("1h").is_err());
    }

    #[test]
    fn timeout_defaults_to_sixty_seconds() {
        assert_eq!(Headers::new().timeout(), Duration::from_secs(60));
        let headers: Headers = serde_json::from_value(json!({"timeout": "3600"})).unwrap();
        assert_eq!(headers.timeout(), Duration::from_secs(60));
    }

    #[test]
    fn with_timeout_renders_compact_strings() {
        let headers = Headers::new().with_timeout(Duration::from_secs(45));
        assert_eq!(headers.generic("timeout"), Some(&json!("45")));
        let headers = Headers::new().with_timeout(Duration::from_millis(250));
        assert_eq!(headers.generic("timeout"), Some(&json!("250ms")));
        let headers = Headers::new().with_timeout(Duration::from_secs(7200));
        assert_eq!(headers.generic("timeout"), None);
    }

    #[test]
    fn response_required_defaults_true_and_true_removes_key() {
        let headers = Headers::new();
        assert!(headers.response_required());

        let headers = headers.with_response_required(false);
        assert!(!headers.response_required());
        assert_eq!(headers.generic("response-required"), Some(&json!(false)));

        let headers = headers.with_response_required(true);
        assert!(headers.response_required());
        assert_eq!(headers.generic("response-required"), None);
    }

    #[test]
    fn keys_are_case_insensitive_and_unknown_preserved() {
        let headers: Headers = serde_json::from_value(json!({
            "Content-Type": "application/json",
            "X-Custom": 42
        }))
        .unwrap();
        assert_eq!(headers.content_type(), Some("application/json"));
        assert_eq!(headers.generic("x-custom"), Some(&json!(42)));
        let out = serde_json::to_value(&headers).unwrap();
        assert_eq!(out, json!({"content-type": "application/json", "x-custom": 42}));
    }

    #[test]
    fn invalid_timeout_string_fails_unmarshal() {
        let result = serde_json::from_value::<Headers>(json!({"timeout": "later"}));
        assert!(result.is_err());
    }

    #[test]
    fn valid_timeout_round_trips() {
        let raw = json!({"timeout": "45s", "correlation-id": "c1"});
        let headers: Headers = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(serde_json::to_value(&headers).unwrap(), raw);
    }

    #[test]
    fn clone_is_independent_of_parent() {
        let parent = Headers::new().with_correlation_id("c1");
        let clone = parent.clone().with_correlation_id("c2").with_etag("abc");
        assert_eq!(parent.correlation_id(), Some("c1"));
        assert_eq!(parent.etag(), None);
        assert_eq!(clone.correlation_id(), Some("c2"));
    }
}
