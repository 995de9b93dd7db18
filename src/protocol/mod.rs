//! Ditto protocol surface: topics, headers, envelopes, resource paths.

mod envelope;
mod headers;
pub mod path;
mod topic;

pub use envelope::Envelope;
pub use headers::Headers;
pub use path::{ResourcePath, Scope};
pub use topic::{Action, Channel, Criterion, Group, Topic, TOPIC_PLACEHOLDER};

use thiserror::Error;

/// Ditto JSON content type.
pub const CONTENT_TYPE_DITTO: &str = "application/vnd.eclipse.ditto+json";
/// Plain JSON content type.
pub const CONTENT_TYPE_JSON: &str = "application/json";
/// JSON merge patch content type (RFC 7396).
pub const CONTENT_TYPE_JSON_MERGE: &str = "application/merge-patch+json";

/// Wire-level protocol parse failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("topic `{raw}` is invalid: {reason}")]
    InvalidTopic { raw: String, reason: String },
    #[error("timeout `{raw}` is invalid")]
    InvalidTimeout { raw: String },
    #[error("header `{name}` has an unexpected value")]
    InvalidHeader { name: String },
}
