//! Command handler: the state machine behind `twin/commands` envelopes.
//!
//! One inbound message is parsed, dispatched on (scope, action), executed
//! against the things storage and answered with up to four outputs: a
//! local response envelope, a local event envelope, an upstream forward
//! and a ledger hint used to mark the resource synchronized once the
//! forward succeeded.

pub mod errors;
mod feature;
mod features;
mod properties;
mod property;
mod thing;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, error, trace};

use crate::model::{NamespacedId, Thing};
use crate::protocol::path::{self, Scope};
use crate::protocol::{
    Action, Criterion, Envelope, Headers, Topic, CONTENT_TYPE_DITTO,
};
use crate::router::{Disposition, Message, PublishError, Publisher};
use crate::store::{StoreError, ThingStorage};

pub(crate) const OK: u16 = 200;
pub(crate) const CREATED: u16 = 201;
pub(crate) const MODIFIED: u16 = 204;
pub(crate) const DELETED: u16 = 204;

/// Gateway device details the handler acts on behalf of.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub device_id: String,
    pub tenant_id: String,
    pub auto_provisioning: bool,
}

/// Errors surfaced to the router; anything else becomes an error envelope.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CommandError {
    #[error("invalid command payload: {0}")]
    InvalidPayload(#[source] serde_json::Error),

    #[error("invalid command path {path}")]
    UnexpectedPath { path: String },

    #[error("invalid command value: {reason}")]
    InvalidValue { reason: String },
}

/// The parsed command a command function works on.
pub(crate) struct Command {
    pub envelope: Envelope,
    pub thing_id: String,
    pub target: Option<String>,
    pub pointer: Option<String>,
}

impl Command {
    pub(crate) fn feature_id(&self) -> &str {
        self.target.as_deref().unwrap_or_default()
    }

    pub(crate) fn property_pointer(&self) -> &str {
        self.pointer.as_deref().unwrap_or_default()
    }
}

/// What a command function produced.
#[derive(Default)]
pub(crate) struct CommandOutput {
    pub response: Option<Envelope>,
    pub event: Option<Envelope>,
    pub invalid_value: Option<String>,

    pub thing_id: Option<String>,
    pub feature_id: Option<String>,
    pub revision: i64,
}

type CommandFn = fn(&Handler, &Command, &mut CommandOutput);

/// Handles twin protocol commands against the local things storage.
pub struct Handler {
    pub(crate) device: DeviceInfo,
    pub(crate) local: Arc<dyn Publisher>,
    pub(crate) upstream: Arc<dyn Publisher>,
    pub(crate) storage: Arc<dyn ThingStorage>,
}

impl Handler {
    pub fn new(
        device: DeviceInfo,
        local: Arc<dyn Publisher>,
        upstream: Arc<dyn Publisher>,
        storage: Arc<dyn ThingStorage>,
    ) -> Self {
        Self {
            device,
            local,
            upstream,
            storage,
        }
    }

    /// Handle one local message.
    ///
    /// Non-command envelopes and unmapped (scope, action) pairs pass
    /// through; malformed payloads and unknown paths are errors for the
    /// router. Everything else is consumed here.
    pub fn handle(&self, message: &Message) -> Result<Disposition, CommandError> {
        let envelope: Envelope =
            serde_json::from_slice(&message.payload).map_err(CommandError::InvalidPayload)?;

        if !envelope.topic.is_twin_commands() {
            return Ok(Disposition::PassThrough(message.clone()));
        }

        let parsed = path::parse(&envelope.path);
        if parsed.scope == Scope::Unknown {
            return Err(CommandError::UnexpectedPath {
                path: envelope.path,
            });
        }

        let Some(command_fn) = envelope.topic.action.and_then(|a| dispatch(parsed.scope, a))
        else {
            trace!(
                path = %envelope.path,
                action = ?envelope.topic.action,
                thing = %envelope.topic.namespaced_id(),
                "thing command unsupported"
            );
            return Ok(Disposition::PassThrough(message.clone()));
        };

        let command = Command {
            thing_id: envelope.topic.namespaced_id(),
            target: parsed.target,
            pointer: parsed.pointer,
            envelope,
        };

        let mut output = CommandOutput::default();
        command_fn(self, &command, &mut output);

        if let Some(response) = &output.response {
            self.publish_response(response);
        }
        if let Some(event) = &output.event {
            self.publish_event(event);
        }

        debug!(
            correlation_id = command.envelope.headers.correlation_id().unwrap_or_default(),
            path = %command.envelope.path,
            action = ?command.envelope.topic.action,
            thing = %command.thing_id,
            "thing command handled"
        );

        if let Some(reason) = output.invalid_value {
            return Err(CommandError::InvalidValue { reason });
        }

        self.forward_upstream(message, &command.envelope, &output);
        Ok(Disposition::Consumed)
    }

    fn publish_response(&self, response: &Envelope) {
        let topic = response_publish_topic(&self.device.device_id, &response.topic);
        self.publish_local(&topic, response, "response");
    }

    fn publish_event(&self, event: &Envelope) {
        let topic = event_publish_topic(&self.device.device_id, &event.topic);
        self.publish_local(&topic, event, "event");
    }

    fn publish_local(&self, topic: &str, envelope: &Envelope, what: &str) {
        match serde_json::to_vec(envelope) {
            Ok(payload) => {
                if let Err(err) = self.local.publish(topic, &Message::new(payload)) {
                    error!(topic, error = %err, "unable to publish {what}");
                }
            }
            Err(err) => error!(error = %err, "unable to encode {what}"),
        }
    }

    fn forward_upstream(&self, message: &Message, envelope: &Envelope, output: &CommandOutput) {
        let forward = if output.response.is_some() {
            // Already answered locally, the hub must not respond again.
            command_without_response_required(message, envelope)
        } else {
            message.clone()
        };

        let topic = hub_publish_topic(&self.device, &envelope.topic.namespaced_id());
        match self.upstream.publish(&topic, &forward) {
            Ok(()) => {
                trace!("thing command forwarded to hub");
                self.resource_synchronized(output);
            }
            Err(PublishError::NotConnected) => {
                trace!("thing command not forwarded to hub: no hub connection");
            }
            Err(err) => {
                error!(error = %err, "thing command not forwarded to hub, unexpected error");
            }
        }
    }

    fn resource_synchronized(&self, output: &CommandOutput) {
        let Some(thing_id) = output.thing_id.as_deref() else {
            return;
        };

        if let Some(feature_id) = output.feature_id.as_deref() {
            if let Ok(true) =
                self.storage
                    .feature_synchronized(thing_id, feature_id, output.revision)
            {
                trace!(thing = thing_id, feature = feature_id, "feature marked as synchronized");
            }
        } else if let Ok(true) = self.storage.thing_synchronized(thing_id, output.revision) {
            trace!(thing = thing_id, "thing marked as synchronized");
        }
    }

    /// Load a persisted thing; with auto-provisioning on, an unknown
    /// thing is created empty and its created event published first.
    pub(crate) fn load_thing(
        &self,
        thing_id: &str,
        envelope: &Envelope,
    ) -> Result<Thing, StoreError> {
        match self.storage.thing(thing_id) {
            Ok(thing) => Ok(thing),
            Err(err) if self.device.auto_provisioning && err.is_thing_not_found() => {
                self.autoprovision_thing(envelope, thing_id)
            }
            Err(err) => Err(err),
        }
    }

    /// Load a feature; an unknown thing may be auto-provisioned, after
    /// which the feature is still reported missing.
    pub(crate) fn load_feature(
        &self,
        thing_id: &str,
        feature_id: &str,
        envelope: &Envelope,
    ) -> Result<crate::model::Feature, StoreError> {
        match self.storage.feature(thing_id, feature_id) {
            Ok(feature) => Ok(feature),
            Err(err) if self.device.auto_provisioning && err.is_thing_not_found() => {
                self.autoprovision_thing(envelope, thing_id)?;
                Err(StoreError::FeatureNotFound {
                    thing_id: thing_id.to_string(),
                    feature_id: feature_id.to_string(),
                })
            }
            Err(err) => Err(err),
        }
    }

    pub(crate) fn autoprovision_thing(
        &self,
        envelope: &Envelope,
        thing_id: &str,
    ) -> Result<Thing, StoreError> {
        let id = NamespacedId::parse(thing_id).map_err(|e| StoreError::InvalidThingId {
            id: thing_id.to_string(),
            reason: e.to_string(),
        })?;
        let thing = Thing::new().with_id(id);
        let revision = self.storage.add_thing(&thing)?;

        let system = self.storage.system_data(thing_id)?;
        let event = thing_event_envelope(envelope, Action::Created, &thing, revision, &system.timestamp);
        self.publish_event(&event);
        Ok(thing)
    }

    /// Post-write event envelope mirroring the command's path and value.
    pub(crate) fn event_envelope(
        &self,
        thing_id: &str,
        envelope: &Envelope,
        action: Action,
    ) -> Option<Envelope> {
        match self.storage.thing_data(thing_id) {
            Ok(thing) => Some(event_envelope(
                envelope,
                thing.revision,
                &thing.timestamp,
                action,
            )),
            Err(err) => {
                error!(thing = thing_id, error = %err, "failed to create event on command execution, unknown thing");
                None
            }
        }
    }

    pub(crate) fn resource_not_found(
        &self,
        message: &str,
        err: &StoreError,
        envelope: &Envelope,
        thing_id: &str,
        feature_id: &str,
    ) -> Option<Envelope> {
        log_command_error(message, err, envelope);

        if !envelope.headers.response_required() {
            return None;
        }
        if err.is_thing_not_found() {
            Some(errors::thing_not_found(envelope, thing_id))
        } else {
            Some(errors::feature_not_found(envelope, thing_id, feature_id))
        }
    }

    pub(crate) fn thing_not_found(
        &self,
        message: &str,
        err: &StoreError,
        envelope: &Envelope,
        thing_id: &str,
    ) -> Option<Envelope> {
        log_command_error(message, err, envelope);
        envelope
            .headers
            .response_required()
            .then(|| errors::thing_not_found(envelope, thing_id))
    }

    pub(crate) fn unknown_error(
        &self,
        message: &str,
        err: &StoreError,
        envelope: &Envelope,
    ) -> Option<Envelope> {
        log_command_error(message, err, envelope);
        envelope
            .headers
            .response_required()
            .then(|| errors::unknown(envelope, message, &err.to_string()))
    }

    pub(crate) fn invalid_field_selector(
        &self,
        message: &str,
        err: &crate::selector::SelectorError,
        envelope: &Envelope,
    ) -> Option<Envelope> {
        error!(
            path = %envelope.path,
            thing = %envelope.topic.namespaced_id(),
            error = %err,
            "{message}"
        );
        envelope
            .headers
            .response_required()
            .then(|| errors::invalid_field_selector(envelope, &err.to_string()))
    }
}

fn dispatch(scope: Scope, action: Action) -> Option<CommandFn> {
    match scope {
        Scope::Thing => match action {
            Action::Create => Some(thing::create),
            Action::Modify => Some(thing::modify),
            Action::Delete => Some(thing::delete),
            Action::Retrieve => Some(thing::retrieve),
            _ => None,
        },
        Scope::Features => match action {
            Action::Modify => Some(features::modify),
            Action::Delete => Some(features::delete),
            Action::Retrieve => Some(features::retrieve),
            _ => None,
        },
        Scope::Feature => match action {
            Action::Modify => Some(feature::modify),
            Action::Delete => Some(feature::delete),
            Action::Retrieve => Some(feature::retrieve),
            _ => None,
        },
        Scope::FeatureProperties => match action {
            Action::Modify => Some(properties::modify),
            Action::Delete => Some(properties::delete),
            Action::Retrieve => Some(properties::retrieve),
            _ => None,
        },
        Scope::FeatureDesiredProperties => match action {
            Action::Modify => Some(properties::modify_desired),
            Action::Delete => Some(properties::delete_desired),
            Action::Retrieve => Some(properties::retrieve_desired),
            _ => None,
        },
        Scope::FeatureProperty => match action {
            Action::Modify => Some(property::modify),
            Action::Delete => Some(property::delete),
            Action::Retrieve => Some(property::retrieve),
            _ => None,
        },
        Scope::FeatureDesiredProperty => match action {
            Action::Modify => Some(property::modify_desired),
            Action::Delete => Some(property::delete_desired),
            Action::Retrieve => Some(property::retrieve_desired),
            _ => None,
        },
        // Attributes, definition, policy and feature-definition commands
        // are not served locally.
        _ => None,
    }
}

/// Parse the command value against the expected schema, filling the
/// invalid-value output (and error response when one is required) on
/// failure.
pub(crate) fn command_value<T: DeserializeOwned>(
    envelope: &Envelope,
    output: &mut CommandOutput,
) -> Option<T> {
    let parsed = match &envelope.value {
        None => Err("unexpected end of JSON input".to_string()),
        Some(value) => serde_json::from_value(value.clone()).map_err(|err| err.to_string()),
    };
    match parsed {
        Ok(parsed) => Some(parsed),
        Err(reason) => {
            output.invalid_value = Some(format!("invalid command payload: {reason}"));
            if envelope.headers.response_required() {
                output.response = Some(errors::invalid_json_value(envelope, &reason));
            }
            None
        }
    }
}

pub(crate) fn log_command_error(message: &str, err: &dyn std::fmt::Display, envelope: &Envelope) {
    error!(
        correlation_id = envelope.headers.correlation_id().unwrap_or_default(),
        path = %envelope.path,
        action = ?envelope.topic.action,
        thing = %envelope.topic.namespaced_id(),
        error = %err,
        "{message}"
    );
}

pub(crate) fn response_headers(headers: &Headers) -> Headers {
    headers.clone().with_response_required(false)
}

pub(crate) fn response_headers_with_content(headers: &Headers) -> Headers {
    response_headers(headers).with_content_type(CONTENT_TYPE_DITTO)
}

/// Status-only response, suppressed when no response is required.
pub(crate) fn response_envelope(envelope: &Envelope, status: u16) -> Option<Envelope> {
    envelope.headers.response_required().then(|| {
        Envelope::new(envelope.topic.clone(), envelope.path.clone())
            .with_headers(response_headers(&envelope.headers))
            .with_status(status)
    })
}

/// Response with a value, suppressed when no response is required.
pub(crate) fn response_with_value(
    envelope: &Envelope,
    status: u16,
    value: serde_json::Value,
) -> Option<Envelope> {
    envelope.headers.response_required().then(|| {
        Envelope::new(envelope.topic.clone(), envelope.path.clone())
            .with_headers(response_headers_with_content(&envelope.headers))
            .with_fields(envelope.fields.clone())
            .with_status(status)
            .with_value(value)
    })
}

/// Event mirroring the command's path, carrying the post-write revision
/// and timestamp. Deleted events carry no value.
pub(crate) fn event_envelope(
    envelope: &Envelope,
    revision: i64,
    timestamp: &str,
    action: Action,
) -> Envelope {
    let topic = envelope
        .topic
        .clone()
        .with_criterion(Criterion::Events)
        .with_action(Some(action));
    let mut event = Envelope::new(topic, envelope.path.clone());
    if revision != 0 {
        event = event.with_revision(revision);
    }
    if !timestamp.is_empty() {
        event = event.with_timestamp(timestamp);
    }
    if action == Action::Deleted {
        event.with_headers(response_headers(&envelope.headers))
    } else {
        let mut event = event.with_headers(response_headers_with_content(&envelope.headers));
        if let Some(value) = &envelope.value {
            event = event.with_value(value.clone());
        }
        event
    }
}

/// Thing-level event at path `/` carrying the whole thing as value.
pub(crate) fn thing_event_envelope(
    envelope: &Envelope,
    action: Action,
    thing: &Thing,
    revision: i64,
    timestamp: &str,
) -> Envelope {
    let topic = envelope
        .topic
        .clone()
        .with_criterion(Criterion::Events)
        .with_action(Some(action));
    let mut event = Envelope::new(topic, "/")
        .with_headers(response_headers_with_content(&envelope.headers))
        .with_value(serde_json::to_value(thing).expect("thing serializes"));
    if revision != 0 {
        event = event.with_revision(revision);
    }
    if !timestamp.is_empty() {
        event = event.with_timestamp(timestamp);
    }
    event
}

/// Local event topic: `command//<ns>:<id>/req//<action>`, collapsed for
/// the root device.
pub fn event_publish_topic(device_id: &str, topic: &Topic) -> String {
    let action = topic
        .action
        .map(Action::as_str)
        .unwrap_or_else(|| topic.criterion.as_str());
    if device_id == topic.namespaced_id() {
        format!("command///req//{action}")
    } else {
        format!(
            "command//{}:{}/req//{action}",
            topic.namespace, topic.entity_id
        )
    }
}

/// Local response topic: like the event topic with a `-response` suffix;
/// error envelopes (no action) use the criterion.
pub fn response_publish_topic(device_id: &str, topic: &Topic) -> String {
    let action = topic
        .action
        .map(Action::as_str)
        .unwrap_or_else(|| topic.criterion.as_str());
    if device_id == topic.namespaced_id() {
        format!("command///req//{action}-response")
    } else {
        format!(
            "command//{}:{}/req//{action}-response",
            topic.namespace, topic.entity_id
        )
    }
}

/// Device-to-cloud topic: bare `e` for the root device, otherwise
/// `e/<tenant>/<ns>:<id>`.
pub fn hub_publish_topic(device: &DeviceInfo, thing_id: &str) -> String {
    if device.device_id == thing_id {
        "e".to_string()
    } else {
        format!("e/{}/{}", device.tenant_id, thing_id)
    }
}

fn command_without_response_required(message: &Message, envelope: &Envelope) -> Message {
    let mut stripped = envelope.clone();
    stripped.headers = stripped.headers.with_response_required(false);
    match serde_json::to_vec(&stripped) {
        Ok(payload) => Message {
            id: message.id.clone(),
            payload: payload.into(),
        },
        Err(_) => message.clone(),
    }
}
