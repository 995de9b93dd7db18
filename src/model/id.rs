//! Identity atoms.
//!
//! NamespacedId: `namespace:name` thing/policy identifier
//! DefinitionId: `namespace:name:version` definition identifier

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The storage layer reserves `§` as a key separator, so it may never occur
/// inside an identifier.
pub const RESERVED_SEPARATOR: char = '§';

/// Invalid identifier string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum IdError {
    #[error("namespaced id `{raw}` is invalid: {reason}")]
    Namespaced { raw: String, reason: String },
    #[error("definition id `{raw}` is invalid: {reason}")]
    Definition { raw: String, reason: String },
}

/// Namespaced entity identifier with the canonical form `namespace:name`.
///
/// The namespace is a dot-separated sequence of non-empty segments built
/// from ASCII letters, digits, `_` and `-`. The name is any non-empty
/// string free of `/` and the reserved `§` separator. Equality and
/// ordering are by the canonical string.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NamespacedId {
    namespace: String,
    name: String,
}

impl NamespacedId {
    pub fn new(namespace: &str, name: &str) -> Result<Self, IdError> {
        validate_namespace(namespace).map_err(|reason| IdError::Namespaced {
            raw: format!("{namespace}:{name}"),
            reason,
        })?;
        validate_name(name).map_err(|reason| IdError::Namespaced {
            raw: format!("{namespace}:{name}"),
            reason,
        })?;
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    /// Parse the canonical `namespace:name` form.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let Some((namespace, name)) = s.split_once(':') else {
            return Err(IdError::Namespaced {
                raw: s.to_string(),
                reason: "missing ':' separator".into(),
            });
        };
        Self::new(namespace, name)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for NamespacedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

impl fmt::Debug for NamespacedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NamespacedId({}:{})", self.namespace, self.name)
    }
}

impl TryFrom<String> for NamespacedId {
    type Error = IdError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        NamespacedId::parse(&s)
    }
}

impl From<NamespacedId> for String {
    fn from(id: NamespacedId) -> String {
        id.to_string()
    }
}

impl std::str::FromStr for NamespacedId {
    type Err = IdError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NamespacedId::parse(s)
    }
}

fn validate_namespace(namespace: &str) -> Result<(), String> {
    if namespace.is_empty() {
        return Err("empty namespace".into());
    }
    for segment in namespace.split('.') {
        if segment.is_empty() {
            return Err("namespace contains an empty segment".into());
        }
        for c in segment.chars() {
            if !(c.is_ascii_alphanumeric() || c == '_' || c == '-') {
                return Err(format!("namespace contains invalid character `{c}`"));
            }
        }
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("empty name".into());
    }
    if name.contains(RESERVED_SEPARATOR) {
        return Err("name contains the reserved `§` separator".into());
    }
    if name.contains('/') {
        return Err("name contains `/`".into());
    }
    Ok(())
}

/// Definition identifier with the canonical form `namespace:name:version`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DefinitionId {
    namespace: String,
    name: String,
    version: String,
}

impl DefinitionId {
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(IdError::Definition {
                raw: s.to_string(),
                reason: "expected `namespace:name:version`".into(),
            });
        }
        validate_namespace(parts[0]).map_err(|reason| IdError::Definition {
            raw: s.to_string(),
            reason,
        })?;
        if parts[1].is_empty() || parts[2].is_empty() {
            return Err(IdError::Definition {
                raw: s.to_string(),
                reason: "empty name or version".into(),
            });
        }
        Ok(Self {
            namespace: parts[0].to_string(),
            name: parts[1].to_string(),
            version: parts[2].to_string(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

impl fmt::Display for DefinitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.name, self.version)
    }
}

impl fmt::Debug for DefinitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DefinitionId({self})")
    }
}

impl TryFrom<String> for DefinitionId {
    type Error = IdError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        DefinitionId::parse(&s)
    }
}

impl From<DefinitionId> for String {
    fn from(id: DefinitionId) -> String {
        id.to_string()
    }
}

impl std::str::FromStr for DefinitionId {
    type Err = IdError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DefinitionId::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaced_id_parse_valid() {
        let id = NamespacedId::parse("org.eclipse.kanto:test").unwrap();
        assert_eq!(id.namespace(), "org.eclipse.kanto");
        assert_eq!(id.name(), "test");
        assert_eq!(id.to_string(), "org.eclipse.kanto:test");
    }

    #[test]
    fn namespaced_id_name_may_contain_colon() {
        let id = NamespacedId::parse("ns:dev:ice").unwrap();
        assert_eq!(id.name(), "dev:ice");
    }

    #[test]
    fn namespaced_id_rejects_bad_forms() {
        assert!(NamespacedId::parse("no-separator").is_err());
        assert!(NamespacedId::parse(":name").is_err());
        assert!(NamespacedId::parse("ns:").is_err());
        assert!(NamespacedId::parse("ns..x:name").is_err());
        assert!(NamespacedId::parse("n s:name").is_err());
        assert!(NamespacedId::parse("ns:na§me").is_err());
        assert!(NamespacedId::parse("ns:na/me").is_err());
    }

    #[test]
    fn namespaced_id_underscore_is_a_plain_segment() {
        // The `_` wildcard is a topic-level sentinel; as an id it parses
        // like any other single-character namespace or name.
        let id = NamespacedId::parse("_:_").unwrap();
        assert_eq!(id.namespace(), "_");
    }

    #[test]
    fn namespaced_id_serde_round_trip() {
        let id = NamespacedId::parse("org.eclipse.kanto:test").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"org.eclipse.kanto:test\"");
        let back: NamespacedId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn definition_id_parse() {
        let def = DefinitionId::parse("org.eclipse:Sensor:1.0.0").unwrap();
        assert_eq!(def.version(), "1.0.0");
        assert_eq!(def.to_string(), "org.eclipse:Sensor:1.0.0");

        assert!(DefinitionId::parse("org.eclipse:Sensor").is_err());
        assert!(DefinitionId::parse("org.eclipse:Sensor:1:0").is_err());
        assert!(DefinitionId::parse("org.eclipse::1.0.0").is_err());
    }
}
