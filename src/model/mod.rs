//! Entity model: namespaced identifiers, things, features.

mod feature;
mod id;
pub mod pointer;
mod thing;

pub use feature::Feature;
pub use id::{DefinitionId, IdError, NamespacedId};
pub use thing::Thing;

/// Attribute / property maps are plain JSON objects.
pub type JsonObject = serde_json::Map<String, serde_json::Value>;
