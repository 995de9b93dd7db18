//! Feature: a named sub-structure of a thing.

use serde::{Deserialize, Serialize};

use super::id::DefinitionId;
use super::JsonObject;

/// A feature groups reported `properties` and cloud-authored
/// `desiredProperties` under a feature id.
///
/// Absent (`None`) and empty (`{}`) property sections are semantically
/// different: an absent section does not exist (retrieving it is a 404),
/// an empty one exists and carries no keys.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<Vec<DefinitionId>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<JsonObject>,

    #[serde(
        rename = "desiredProperties",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub desired_properties: Option<JsonObject>,
}

impl Feature {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_definition(mut self, definition: Vec<DefinitionId>) -> Self {
        self.definition = Some(definition);
        self
    }

    pub fn with_properties(mut self, properties: Option<JsonObject>) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_desired_properties(mut self, desired: Option<JsonObject>) -> Self {
        self.desired_properties = desired;
        self
    }

    /// True when there are no desired properties, absent and empty alike.
    pub fn desired_properties_empty(&self) -> bool {
        self.desired_properties
            .as_ref()
            .map_or(true, |map| map.is_empty())
    }
}
