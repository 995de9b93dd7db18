//! Thing: the addressable digital-twin entity.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::feature::Feature;
use super::id::{DefinitionId, NamespacedId};
use super::JsonObject;

/// A thing with its attributes and features.
///
/// `revision` and `timestamp` are owned by the local synchronization
/// ledger; inbound values only seed the baseline of a freshly created
/// thing and are otherwise overridden on every write.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Thing {
    #[serde(rename = "thingId", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<NamespacedId>,

    #[serde(rename = "policyId", default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<NamespacedId>,

    #[serde(rename = "definition", default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<DefinitionId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<JsonObject>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<BTreeMap<String, Feature>>,

    #[serde(rename = "_revision", default, skip_serializing_if = "revision_unset")]
    pub revision: i64,

    #[serde(rename = "_modified", default, skip_serializing_if = "String::is_empty")]
    pub timestamp: String,
}

fn revision_unset(revision: &i64) -> bool {
    *revision == 0
}

impl Thing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: NamespacedId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_attributes(mut self, attributes: Option<JsonObject>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_features(mut self, features: Option<BTreeMap<String, Feature>>) -> Self {
        self.features = features;
        self
    }

    pub fn with_feature(mut self, feature_id: impl Into<String>, feature: Feature) -> Self {
        self.features
            .get_or_insert_with(BTreeMap::new)
            .insert(feature_id.into(), feature);
        self
    }

    /// Feature ids of this thing, empty when the features map is absent.
    pub fn feature_ids(&self) -> Vec<&str> {
        self.features
            .as_ref()
            .map(|features| features.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn marshal_unmarshal_round_trip() {
        let raw = json!({
            "thingId": "org.eclipse.kanto:test",
            "policyId": "org.eclipse.kanto:the-policy",
            "definition": "org.eclipse:Gateway:2.0.0",
            "attributes": {"location": {"lat": 47.6, "lon": 9.1}},
            "features": {
                "meter": {"properties": {"x": 12.34}}
            },
            "_revision": 7,
            "_modified": "2024-05-30T10:15:00Z"
        });
        let thing: Thing = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(serde_json::to_value(&thing).unwrap(), raw);
    }

    #[test]
    fn null_features_mean_absent() {
        let thing: Thing =
            serde_json::from_value(json!({"thingId": "ns:a", "features": null})).unwrap();
        assert!(thing.features.is_none());
        let json = serde_json::to_value(&thing).unwrap();
        assert_eq!(json, json!({"thingId": "ns:a"}));
    }

    #[test]
    fn ledger_fields_are_omitted_when_unset() {
        let thing = Thing::new().with_id(NamespacedId::parse("ns:a").unwrap());
        assert_eq!(
            serde_json::to_value(&thing).unwrap(),
            json!({"thingId": "ns:a"})
        );
    }
}
