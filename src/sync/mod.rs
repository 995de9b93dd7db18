//! Offline→online reconciliation.
//!
//! On connect the synchronizer asks the hub for every locally known
//! feature's desired properties, merges the answers into the local twin
//! (emitting local modified events as if the change had arrived locally)
//! and then drains the per-thing ledger upstream: pending feature
//! changes as modify commands, pending deletions as one merge patch.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, trace};
use uuid::Uuid;

use crate::commands::{
    errors::ThingError, event_publish_topic, hub_publish_topic, DeviceInfo,
};
use crate::model::{Feature, NamespacedId};
use crate::protocol::{
    Action, Channel, Criterion, Envelope, Group, Headers, Topic, CONTENT_TYPE_DITTO,
    CONTENT_TYPE_JSON_MERGE,
};
use crate::router::{Disposition, Message, PublishError, Publisher};
use crate::store::{StoreError, ThingStorage};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    #[error("no hub connection")]
    NotConnected,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),

    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Default)]
struct SyncState {
    connected: bool,
    /// correlation id → thing id of in-flight desired-property retrieves.
    pending: HashMap<String, String>,
}

/// Reconciles local twin state with the hub.
pub struct Synchronizer {
    device: DeviceInfo,
    storage: Arc<dyn ThingStorage>,
    local: Arc<dyn Publisher>,
    upstream: Arc<dyn Publisher>,
    state: Mutex<SyncState>,
}

impl Synchronizer {
    pub fn new(
        device: DeviceInfo,
        storage: Arc<dyn ThingStorage>,
        local: Arc<dyn Publisher>,
        upstream: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            device,
            storage,
            local,
            upstream,
            state: Mutex::new(SyncState::default()),
        }
    }

    /// Begin a synchronization round for every persisted thing.
    pub fn start(&self) -> Result<(), SyncError> {
        {
            let mut state = self.lock_state();
            state.pending.clear();
            state.connected = true;
        }

        let thing_ids = self.storage.thing_ids()?;
        if let Err(err) = self.retrieve_desired_properties(&thing_ids) {
            debug!(error = %err, "error on retrieve desired properties request");
        }
        Ok(())
    }

    /// Interrupt a started synchronization, e.g. on lost hub connection.
    pub fn stop(&self) {
        let mut state = self.lock_state();
        state.connected = false;
        state.pending.clear();
    }

    /// Update the connection flag without starting or stopping a round.
    pub fn connected(&self, connected: bool) {
        self.lock_state().connected = connected;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SyncState> {
        self.state.lock().expect("synchronizer state lock poisoned")
    }

    fn ensure_connected(&self) -> Result<(), SyncError> {
        if self.lock_state().connected {
            Ok(())
        } else {
            Err(SyncError::NotConnected)
        }
    }

    fn retrieve_desired_properties(&self, thing_ids: &[String]) -> Result<(), SyncError> {
        for thing_id in thing_ids {
            trace!(thing = %thing_id, "starting retrieve desired properties");
            let thing = self.storage.thing(thing_id)?;

            let Some(envelope) = self.retrieve_desired_properties_command(&thing) else {
                continue;
            };

            self.ensure_connected()?;
            self.publish_upstream(&envelope, thing_id)?;
            trace!(thing = %thing_id, "retrieve desired properties published");
        }
        Ok(())
    }

    /// The retrieve command pulling all desired properties of `thing`
    /// from the cloud, or nothing for a thing without features.
    pub fn retrieve_desired_properties_command(
        &self,
        thing: &crate::model::Thing,
    ) -> Option<Envelope> {
        let id = thing.id.as_ref()?;
        let feature_ids = thing.feature_ids();
        if feature_ids.is_empty() {
            return None;
        }

        let fields = format!(
            "features({})",
            feature_ids
                .iter()
                .map(|feature_id| format!("{feature_id}/desiredProperties"))
                .collect::<Vec<_>>()
                .join(",")
        );

        let correlation_id = self.new_correlation_id(&id.to_string());
        let topic = Topic::twin(id, Criterion::Commands, Some(Action::Retrieve));
        Some(
            Envelope::new(topic, "/")
                .with_headers(
                    Headers::new()
                        .with_correlation_id(&correlation_id)
                        .with_reply_to(&format!("command/{}", self.device.tenant_id)),
                )
                .with_fields(Some(fields)),
        )
    }

    fn new_correlation_id(&self, thing_id: &str) -> String {
        let correlation_id = Uuid::new_v4().to_string();
        self.lock_state()
            .pending
            .insert(correlation_id.clone(), thing_id.to_string());
        correlation_id
    }

    /// Inbound-hub middleware: consume responses to our own
    /// retrieve-desired-properties commands, pass everything else on.
    pub fn handle_hub_message(&self, message: &Message) -> Disposition {
        let envelope: Envelope = match serde_json::from_slice(&message.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(error = %err, "unexpected cloud to device command payload");
                return Disposition::PassThrough(message.clone());
            }
        };

        let thing_id = envelope.topic.namespaced_id();
        let Some(correlation_id) = envelope.headers.correlation_id().map(str::to_string) else {
            return Disposition::PassThrough(message.clone());
        };

        let expected = self.lock_state().pending.get(&correlation_id).cloned();
        let Some(expected_thing_id) = expected else {
            return Disposition::PassThrough(message.clone());
        };

        if expected_thing_id != thing_id {
            error!(
                correlation_id = %correlation_id,
                thing = %thing_id,
                "correlation-id and thing pair mismatch on desired properties response"
            );
            return Disposition::PassThrough(message.clone());
        }

        match self.retrieved_properties(&envelope) {
            Ok(Some(cloud_features)) => {
                match self.update_local_desired_properties(&thing_id, cloud_features) {
                    Ok(()) => {
                        self.lock_state().pending.remove(&correlation_id);
                        if let Err(err) = self.sync_things(&[thing_id.clone()]) {
                            debug!(thing = %thing_id, error = %err, "error on synchronizing thing");
                        }
                    }
                    Err(err) => {
                        error!(thing = %thing_id, error = %err, "error on updating desired properties");
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                error!(error = %err, "unexpected desired properties response value");
            }
        }
        Disposition::Consumed
    }

    /// Extract the featureId → feature mapping from a retrieve response.
    /// `None` means "no update" (an error response or unexpected shape).
    fn retrieved_properties(
        &self,
        envelope: &Envelope,
    ) -> Result<Option<BTreeMap<String, Feature>>, serde_json::Error> {
        if !response_valid(envelope) {
            return Ok(None);
        }

        #[derive(Deserialize)]
        struct ResponseValue {
            #[serde(default)]
            features: Option<BTreeMap<String, Feature>>,
        }

        let value = envelope.value.clone().unwrap_or(Value::Null);
        let parsed: ResponseValue = serde_json::from_value(value)?;
        Ok(Some(parsed.features.unwrap_or_default()))
    }

    /// Overwrite locally persisted desired properties with the cloud
    /// values, emitting local modified events for every change.
    pub fn update_local_desired_properties(
        &self,
        thing_id: &str,
        cloud_features: BTreeMap<String, Feature>,
    ) -> Result<(), SyncError> {
        let thing = self.storage.thing(thing_id)?;
        let system = match self.storage.system_data(thing_id) {
            Ok(system) => Some(system),
            Err(err) => {
                debug!(thing = %thing_id, error = %err, "error on getting thing system data");
                None
            }
        };

        let Some(features) = thing.features else {
            return Ok(());
        };

        for (feature_id, _) in features {
            let mut local = match self.storage.feature(thing_id, &feature_id) {
                Ok(feature) => feature,
                Err(err) if err.is_thing_not_found() => return Err(err.into()),
                Err(err) => {
                    debug!(thing = %thing_id, feature = %feature_id, error = %err, "error on getting feature");
                    continue;
                }
            };

            if !desired_properties_changed(&feature_id, &cloud_features, &mut local) {
                continue;
            }

            let was_unsynchronized_before = system
                .as_ref()
                .map_or(true, |system| {
                    system.unsynchronized_features.contains_key(&feature_id)
                });

            if let Err(err) = self.storage.add_feature(thing_id, &feature_id, &local) {
                debug!(thing = %thing_id, feature = %feature_id, error = %err, "error on updating feature desired properties");
                continue;
            }

            if let Err(err) = self.publish_desired_properties_modified(thing_id, &feature_id, &local)
            {
                debug!(
                    thing = %thing_id,
                    feature = %feature_id,
                    error = %err,
                    "unable to publish local event on updating desired properties with the cloud values"
                );
            }

            // The merge we just wrote is the only pending change: settle
            // it immediately. A preexisting pending change stays for the
            // upstream drain to resolve.
            if !was_unsynchronized_before {
                if let Err(err) = self.storage.feature_synchronized(thing_id, &feature_id, 1) {
                    debug!(thing = %thing_id, feature = %feature_id, error = %err, "error on synchronizing feature");
                }
            }
        }
        Ok(())
    }

    fn publish_desired_properties_modified(
        &self,
        thing_id: &str,
        feature_id: &str,
        feature: &Feature,
    ) -> Result<(), SyncError> {
        let thing = self.storage.thing_data(thing_id)?;
        let id = NamespacedId::parse(thing_id).map_err(|e| StoreError::Corrupted {
            reason: e.to_string(),
        })?;

        let topic = Topic {
            namespace: id.namespace().to_string(),
            entity_id: id.name().to_string(),
            group: Group::Things,
            channel: Some(Channel::Twin),
            criterion: Criterion::Events,
            action: Some(Action::Modified),
        };
        let value = feature
            .desired_properties
            .clone()
            .map(Value::Object)
            .unwrap_or(Value::Null);
        let mut envelope = Envelope::new(topic, format!("/features/{feature_id}/desiredProperties"))
            .with_headers(
                Headers::new()
                    .with_response_required(false)
                    .with_content_type(CONTENT_TYPE_DITTO),
            )
            .with_value(value);
        if thing.revision != 0 {
            envelope = envelope.with_revision(thing.revision);
        }
        if !thing.timestamp.is_empty() {
            envelope = envelope.with_timestamp(thing.timestamp.as_str());
        }

        let payload = serde_json::to_vec(&envelope)?;
        let topic = event_publish_topic(&self.device.device_id, &envelope.topic);
        self.local.publish(&topic, &Message::new(payload))?;
        Ok(())
    }

    /// Drain the ledger of every given thing upstream.
    pub fn sync_things(&self, thing_ids: &[String]) -> Result<(), SyncError> {
        self.ensure_connected()?;
        for thing_id in thing_ids {
            self.sync_thing(thing_id)?;
        }
        Ok(())
    }

    fn sync_thing(&self, thing_id: &str) -> Result<(), SyncError> {
        self.ensure_connected()?;

        info!(thing = %thing_id, "starting thing synchronization");
        let system = match self.storage.system_data(thing_id) {
            Ok(system) => system,
            Err(err) => {
                error!(thing = %thing_id, error = %err, "error on getting thing system data");
                return Err(err.into());
            }
        };

        let mut sync_needed = false;

        if !system.unsynchronized_features.is_empty() {
            sync_needed = true;
            for (feature_id, counter) in &system.unsynchronized_features {
                self.sync_feature_revision(thing_id, feature_id, *counter)?;
            }
        }

        if !system.deleted_features.is_empty() {
            sync_needed = true;
            self.sync_deleted_features(thing_id, &system.deleted_features)?;
        }

        if sync_needed {
            let synchronized = self
                .storage
                .thing_synchronized(thing_id, system.revision)
                .map_err(|err| {
                    error!(thing = %thing_id, error = %err, "error on persisting thing synchronized state");
                    err
                })?;
            info!(thing = %thing_id, synchronized, "thing synchronization is finished");
        } else {
            debug!(thing = %thing_id, "thing features were already synchronized");
        }
        Ok(())
    }

    /// Synchronize one feature if it has a pending local change.
    pub fn sync_feature(&self, thing_id: &str, feature_id: &str) -> Result<(), SyncError> {
        self.ensure_connected()?;

        debug!(thing = %thing_id, feature = %feature_id, "start feature synchronization");
        let feature = self.storage.feature(thing_id, feature_id).map_err(|err| {
            error!(thing = %thing_id, feature = %feature_id, error = %err, "error on getting feature");
            err
        })?;
        let system = self.storage.system_data(thing_id)?;

        let Some(counter) = system.unsynchronized_features.get(feature_id).copied() else {
            debug!(thing = %thing_id, feature = %feature_id, "the feature is already synchronized");
            return Ok(());
        };

        self.push_feature(thing_id, feature_id, &feature, counter)
    }

    fn sync_feature_revision(
        &self,
        thing_id: &str,
        feature_id: &str,
        revision: i64,
    ) -> Result<(), SyncError> {
        let feature = self.storage.feature(thing_id, feature_id).map_err(|err| {
            error!(thing = %thing_id, feature = %feature_id, error = %err, "error on getting feature");
            err
        })?;
        self.push_feature(thing_id, feature_id, &feature, revision)
    }

    fn push_feature(
        &self,
        thing_id: &str,
        feature_id: &str,
        feature: &Feature,
        revision: i64,
    ) -> Result<(), SyncError> {
        let headers = Headers::new()
            .with_response_required(false)
            .with_correlation_id(&Uuid::new_v4().to_string());
        let envelope = feature_sync_command(thing_id, feature_id, feature)?.with_headers(headers);

        self.ensure_connected()?;
        self.publish_upstream(&envelope, thing_id)?;

        match self
            .storage
            .feature_synchronized(thing_id, feature_id, revision)
        {
            Err(err) => {
                debug!(thing = %thing_id, feature = %feature_id, error = %err, "error on persisting feature synchronization state")
            }
            Ok(synchronized) => {
                debug!(thing = %thing_id, feature = %feature_id, synchronized, "feature synchronization is finished")
            }
        }
        Ok(())
    }

    fn sync_deleted_features(
        &self,
        thing_id: &str,
        deleted: &BTreeSet<String>,
    ) -> Result<(), SyncError> {
        let headers = Headers::new()
            .with_response_required(false)
            .with_content_type(CONTENT_TYPE_JSON_MERGE)
            .with_correlation_id(&Uuid::new_v4().to_string());

        let mut patch = serde_json::Map::new();
        for feature_id in deleted {
            patch.insert(feature_id.clone(), Value::Null);
        }

        let id = parse_thing_id(thing_id)?;
        let envelope = Envelope::new(
            Topic::twin(&id, Criterion::Commands, Some(Action::Merge)),
            "/features",
        )
        .with_headers(headers)
        .with_value(Value::Object(patch));

        self.ensure_connected()?;
        self.publish_upstream(&envelope, thing_id)?;

        for feature_id in deleted {
            match self.storage.feature_synchronized(thing_id, feature_id, 0) {
                Err(err) => {
                    debug!(thing = %thing_id, feature = %feature_id, error = %err, "error on persisting deleted feature synchronization state")
                }
                Ok(synchronized) => {
                    debug!(thing = %thing_id, feature = %feature_id, synchronized, "deleted feature synchronization is finished")
                }
            }
        }
        Ok(())
    }

    fn publish_upstream(&self, envelope: &Envelope, thing_id: &str) -> Result<(), SyncError> {
        let payload = serde_json::to_vec(envelope).map_err(|err| {
            error!(error = %err, "unexpected synchronize command content");
            err
        })?;
        let topic = hub_publish_topic(&self.device, thing_id);
        self.upstream.publish(&topic, &Message::new(payload))?;
        Ok(())
    }
}

/// Feature-sync command shape: a feature without desired properties is
/// re-told whole; one with desired properties only pushes its reported
/// properties (desired state is authored by the cloud).
fn feature_sync_command(
    thing_id: &str,
    feature_id: &str,
    feature: &Feature,
) -> Result<Envelope, SyncError> {
    let id = parse_thing_id(thing_id)?;
    let envelope = if feature.desired_properties_empty() {
        Envelope::new(
            Topic::twin(&id, Criterion::Commands, Some(Action::Modify)),
            format!("/features/{feature_id}"),
        )
        .with_value(serde_json::to_value(feature)?)
    } else {
        Envelope::new(
            Topic::twin(&id, Criterion::Commands, Some(Action::Modify)),
            format!("/features/{feature_id}/properties"),
        )
        .with_value(
            feature
                .properties
                .clone()
                .map(Value::Object)
                .unwrap_or(Value::Null),
        )
    };
    Ok(envelope)
}

fn parse_thing_id(thing_id: &str) -> Result<NamespacedId, SyncError> {
    NamespacedId::parse(thing_id)
        .map_err(|e| {
            SyncError::Store(StoreError::Corrupted {
                reason: e.to_string(),
            })
        })
}

fn desired_properties_changed(
    feature_id: &str,
    cloud_features: &BTreeMap<String, Feature>,
    local: &mut Feature,
) -> bool {
    match cloud_features.get(feature_id) {
        Some(cloud) => {
            if local.desired_properties == cloud.desired_properties {
                return false;
            }
            local.desired_properties = cloud.desired_properties.clone();
            true
        }
        None => {
            if local.desired_properties_empty() {
                return false;
            }
            local.desired_properties = None;
            true
        }
    }
}

fn response_valid(envelope: &Envelope) -> bool {
    let topic = &envelope.topic;
    if topic.criterion == Criterion::Errors {
        let value = envelope.value.clone().unwrap_or(Value::Null);
        match serde_json::from_value::<ThingError>(value) {
            Ok(thing_error) => {
                error!(
                    status = thing_error.status,
                    error = %thing_error.error,
                    message = %thing_error.message,
                    "retrieve desired properties response error received"
                );
            }
            Err(_) => {
                error!("retrieve desired properties response error received");
            }
        }
        return false;
    }

    if topic.criterion != Criterion::Commands
        || topic.action != Some(Action::Retrieve)
        || topic.channel != Some(Channel::Twin)
        || topic.group != Group::Things
    {
        error!(
            topic = %topic,
            correlation_id = envelope.headers.correlation_id().unwrap_or_default(),
            "unexpected topic on retrieve desired properties response"
        );
        return false;
    }

    if envelope.path != "/" {
        error!(
            path = %envelope.path,
            correlation_id = envelope.headers.correlation_id().unwrap_or_default(),
            "unexpected path on retrieve desired properties response"
        );
        return false;
    }

    if envelope.status.unwrap_or(0) >= 400 {
        error!(
            status = ?envelope.status,
            correlation_id = envelope.headers.correlation_id().unwrap_or_default(),
            "unexpected status on retrieve desired properties response"
        );
        return false;
    }

    true
}
