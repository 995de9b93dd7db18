//! Protocol topic: `<namespace>/<entityId>/<group>/<channel>/<criterion>[/<action>]`.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::model::NamespacedId;

use super::ProtocolError;

/// `_` stands for "any" namespace/entity id in retrieve-multiple topics.
pub const TOPIC_PLACEHOLDER: &str = "_";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Group {
    Things,
    Policies,
}

impl Group {
    pub fn as_str(self) -> &'static str {
        match self {
            Group::Things => "things",
            Group::Policies => "policies",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Twin,
    Live,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Twin => "twin",
            Channel::Live => "live",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Criterion {
    Commands,
    Events,
    Search,
    Messages,
    Errors,
}

impl Criterion {
    pub fn as_str(self) -> &'static str {
        match self {
            Criterion::Commands => "commands",
            Criterion::Events => "events",
            Criterion::Search => "search",
            Criterion::Messages => "messages",
            Criterion::Errors => "errors",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Create,
    Created,
    Modify,
    Modified,
    Merge,
    Merged,
    Delete,
    Deleted,
    Retrieve,
    Subscribe,
    Request,
    Cancel,
    Next,
    Complete,
    Failed,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Created => "created",
            Action::Modify => "modify",
            Action::Modified => "modified",
            Action::Merge => "merge",
            Action::Merged => "merged",
            Action::Delete => "delete",
            Action::Deleted => "deleted",
            Action::Retrieve => "retrieve",
            Action::Subscribe => "subscribe",
            Action::Request => "request",
            Action::Cancel => "cancel",
            Action::Next => "next",
            Action::Complete => "complete",
            Action::Failed => "failed",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Group {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "things" => Ok(Group::Things),
            "policies" => Ok(Group::Policies),
            _ => Err(()),
        }
    }
}

impl FromStr for Channel {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "twin" => Ok(Channel::Twin),
            "live" => Ok(Channel::Live),
            _ => Err(()),
        }
    }
}

impl FromStr for Criterion {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "commands" => Ok(Criterion::Commands),
            "events" => Ok(Criterion::Events),
            "search" => Ok(Criterion::Search),
            "messages" => Ok(Criterion::Messages),
            "errors" => Ok(Criterion::Errors),
            _ => Err(()),
        }
    }
}

impl FromStr for Action {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Action::Create),
            "created" => Ok(Action::Created),
            "modify" => Ok(Action::Modify),
            "modified" => Ok(Action::Modified),
            "merge" => Ok(Action::Merge),
            "merged" => Ok(Action::Merged),
            "delete" => Ok(Action::Delete),
            "deleted" => Ok(Action::Deleted),
            "retrieve" => Ok(Action::Retrieve),
            "subscribe" => Ok(Action::Subscribe),
            "request" => Ok(Action::Request),
            "cancel" => Ok(Action::Cancel),
            "next" => Ok(Action::Next),
            "complete" => Ok(Action::Complete),
            "failed" => Ok(Action::Failed),
            _ => Err(()),
        }
    }
}

/// Slash-delimited envelope address.
///
/// Things topics carry a channel segment, policies topics do not. The
/// namespace and entity id are validated as a namespaced id unless both
/// are the `_` placeholder (or the namespace alone is `_`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topic {
    pub namespace: String,
    pub entity_id: String,
    pub group: Group,
    pub channel: Option<Channel>,
    pub criterion: Criterion,
    pub action: Option<Action>,
}

impl Topic {
    /// Twin-channel things topic for `ns:name`.
    pub fn twin(id: &NamespacedId, criterion: Criterion, action: Option<Action>) -> Self {
        Self {
            namespace: id.namespace().to_string(),
            entity_id: id.name().to_string(),
            group: Group::Things,
            channel: Some(Channel::Twin),
            criterion,
            action,
        }
    }

    /// The `ns:id` string addressed by this topic.
    pub fn namespaced_id(&self) -> String {
        format!("{}:{}", self.namespace, self.entity_id)
    }

    pub fn is_wildcard(&self) -> bool {
        self.namespace == TOPIC_PLACEHOLDER || self.entity_id == TOPIC_PLACEHOLDER
    }

    pub fn is_twin_commands(&self) -> bool {
        self.group == Group::Things
            && self.channel == Some(Channel::Twin)
            && self.criterion == Criterion::Commands
    }

    pub fn with_criterion(mut self, criterion: Criterion) -> Self {
        self.criterion = criterion;
        self
    }

    pub fn with_action(mut self, action: Option<Action>) -> Self {
        self.action = action;
        self
    }

    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let invalid = |reason: &str| ProtocolError::InvalidTopic {
            raw: raw.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = raw.split('/').collect();
        if parts.len() < 4 {
            return Err(invalid("too few segments"));
        }

        let namespace = parts[0];
        let entity_id = parts[1];
        validate_topic_id(namespace, entity_id).map_err(|reason| invalid(&reason))?;

        let group = Group::from_str(parts[2]).map_err(|()| invalid("unknown group"))?;

        let (channel, criterion_index) = match group {
            Group::Things => {
                if parts.len() < 5 {
                    return Err(invalid("too few segments"));
                }
                let channel =
                    Channel::from_str(parts[3]).map_err(|()| invalid("unknown channel"))?;
                (Some(channel), 4)
            }
            Group::Policies => (None, 3),
        };

        let criterion = Criterion::from_str(parts[criterion_index])
            .map_err(|()| invalid("unknown criterion"))?;

        let action = match parts.get(criterion_index + 1) {
            None => None,
            Some(raw_action) => {
                Some(Action::from_str(raw_action).map_err(|()| invalid("unknown action"))?)
            }
        };

        if parts.len() > criterion_index + 2 {
            return Err(invalid("too many segments"));
        }

        Ok(Self {
            namespace: namespace.to_string(),
            entity_id: entity_id.to_string(),
            group,
            channel,
            criterion,
            action,
        })
    }
}

fn validate_topic_id(namespace: &str, entity_id: &str) -> Result<(), String> {
    if namespace == TOPIC_PLACEHOLDER {
        if entity_id == TOPIC_PLACEHOLDER {
            return Ok(());
        }
        // Wildcard namespace with a concrete name: validate the name alone.
        return NamespacedId::new("ns", entity_id)
            .map(|_| ())
            .map_err(|e| e.to_string());
    }
    NamespacedId::new(namespace, entity_id)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.entity_id, self.group.as_str())?;
        if let (Group::Things, Some(channel)) = (self.group, self.channel) {
            write!(f, "/{}", channel.as_str())?;
        }
        write!(f, "/{}", self.criterion.as_str())?;
        if let Some(action) = self.action {
            write!(f, "/{}", action.as_str())?;
        }
        Ok(())
    }
}

impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Topic::parse(&raw).map_err(D::Error::custom)
    }
}
