//! Commands on a single `/features/<featureId>`.

use crate::model::Feature;
use crate::protocol::Action;
use crate::store::StoreError;

use super::{
    command_value, response_envelope, response_with_value, Command, CommandOutput, Handler,
    CREATED, DELETED, MODIFIED, OK,
};

pub(crate) fn modify(handler: &Handler, command: &Command, output: &mut CommandOutput) {
    let Some(feature) = command_value::<Feature>(&command.envelope, output) else {
        return;
    };
    let thing_id = &command.thing_id;
    let feature_id = command.feature_id();

    let (status, action) = match handler.storage.feature(thing_id, feature_id) {
        Ok(_) => (MODIFIED, Action::Modified),
        Err(_) => {
            // The feature is new; make sure its thing exists (possibly by
            // provisioning it) before persisting.
            if let Err(err) = handler.load_thing(thing_id, &command.envelope) {
                output.response = handler.thing_not_found(
                    "modify feature failed",
                    &err,
                    &command.envelope,
                    thing_id,
                );
                return;
            }
            (CREATED, Action::Created)
        }
    };

    match handler.storage.add_feature(thing_id, feature_id, &feature) {
        Err(err) => {
            output.response = handler.resource_not_found(
                "modify feature failed",
                &err,
                &command.envelope,
                thing_id,
                feature_id,
            );
        }
        Ok(revision) => {
            output.response = response_envelope(&command.envelope, status);
            output.event = handler.event_envelope(thing_id, &command.envelope, action);
            output.thing_id = Some(thing_id.clone());
            output.feature_id = Some(feature_id.to_string());
            output.revision = revision;
        }
    }
}

pub(crate) fn retrieve(handler: &Handler, command: &Command, output: &mut CommandOutput) {
    let thing_id = &command.thing_id;
    let feature_id = command.feature_id();

    match handler.load_feature(thing_id, feature_id, &command.envelope) {
        Err(err) => {
            output.response = handler.resource_not_found(
                "unable to retrieve feature, feature not found",
                &err,
                &command.envelope,
                thing_id,
                feature_id,
            );
        }
        Ok(feature) => {
            output.response = response_with_value(
                &command.envelope,
                OK,
                serde_json::to_value(&feature).expect("feature serializes"),
            );
        }
    }
}

pub(crate) fn delete(handler: &Handler, command: &Command, output: &mut CommandOutput) {
    let thing_id = &command.thing_id;
    let feature_id = command.feature_id();

    match handler.storage.remove_feature(thing_id, feature_id) {
        Err(err) => {
            let err = if handler.device.auto_provisioning && err.is_thing_not_found() {
                match handler.autoprovision_thing(&command.envelope, thing_id) {
                    Ok(_) => StoreError::FeatureNotFound {
                        thing_id: thing_id.clone(),
                        feature_id: feature_id.to_string(),
                    },
                    Err(err) => err,
                }
            } else {
                err
            };
            output.response = handler.resource_not_found(
                "delete feature failed",
                &err,
                &command.envelope,
                thing_id,
                feature_id,
            );
        }
        Ok(()) => {
            output.response = response_envelope(&command.envelope, DELETED);
            output.event =
                handler.event_envelope(thing_id, &command.envelope, Action::Deleted);
            output.thing_id = Some(thing_id.clone());
            output.feature_id = Some(feature_id.to_string());
        }
    }
}
