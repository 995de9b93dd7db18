//! Commands on whole property sections:
//! `/features/<f>/properties` and `/features/<f>/desiredProperties`.

use crate::model::JsonObject;
use crate::protocol::{Action, Envelope};

use super::{
    command_value, errors, log_command_error, response_envelope, response_with_value, Command,
    CommandOutput, Handler, CREATED, DELETED, MODIFIED, OK,
};

pub(crate) fn modify(handler: &Handler, command: &Command, output: &mut CommandOutput) {
    do_modify(handler, command, false, output);
}

pub(crate) fn modify_desired(handler: &Handler, command: &Command, output: &mut CommandOutput) {
    do_modify(handler, command, true, output);
}

pub(crate) fn retrieve(handler: &Handler, command: &Command, output: &mut CommandOutput) {
    do_retrieve(handler, command, false, output);
}

pub(crate) fn retrieve_desired(handler: &Handler, command: &Command, output: &mut CommandOutput) {
    do_retrieve(handler, command, true, output);
}

pub(crate) fn delete(handler: &Handler, command: &Command, output: &mut CommandOutput) {
    do_delete(handler, command, false, output);
}

pub(crate) fn delete_desired(handler: &Handler, command: &Command, output: &mut CommandOutput) {
    do_delete(handler, command, true, output);
}

fn do_modify(handler: &Handler, command: &Command, desired: bool, output: &mut CommandOutput) {
    let thing_id = &command.thing_id;
    let feature_id = command.feature_id();

    let mut feature = match handler.load_feature(thing_id, feature_id, &command.envelope) {
        Ok(feature) => feature,
        Err(err) => {
            output.response = handler.resource_not_found(
                "modify feature properties failed, unknown feature",
                &err,
                &command.envelope,
                thing_id,
                feature_id,
            );
            return;
        }
    };

    let Some(new_value) = command_value::<Option<JsonObject>>(&command.envelope, output) else {
        return;
    };

    let section = if desired {
        &mut feature.desired_properties
    } else {
        &mut feature.properties
    };
    let (status, action) = if section.is_none() {
        (CREATED, Action::Created)
    } else {
        (MODIFIED, Action::Modified)
    };
    *section = new_value;

    match handler.storage.add_feature(thing_id, feature_id, &feature) {
        Err(err) => {
            output.response =
                handler.unknown_error("update feature properties failed", &err, &command.envelope);
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

fn do_retrieve(handler: &Handler, command: &Command, desired: bool, output: &mut CommandOutput) {
    let thing_id = &command.thing_id;
    let feature_id = command.feature_id();

    match handler.load_feature(thing_id, feature_id, &command.envelope) {
        Err(err) => {
            output.response = handler.resource_not_found(
                "unable to retrieve properties, feature not found",
                &err,
                &command.envelope,
                thing_id,
                feature_id,
            );
        }
        Ok(feature) => {
            let section = if desired {
                feature.desired_properties
            } else {
                feature.properties
            };
            match section {
                None => {
                    output.response = properties_not_found(command, thing_id, feature_id, desired);
                }
                Some(properties) => {
                    output.response = response_with_value(
                        &command.envelope,
                        OK,
                        serde_json::Value::Object(properties),
                    );
                }
            }
        }
    }
}

fn do_delete(handler: &Handler, command: &Command, desired: bool, output: &mut CommandOutput) {
    let thing_id = &command.thing_id;
    let feature_id = command.feature_id();

    let mut feature = match handler.load_feature(thing_id, feature_id, &command.envelope) {
        Ok(feature) => feature,
        Err(err) => {
            output.response = handler.resource_not_found(
                "delete feature properties failed, feature not found",
                &err,
                &command.envelope,
                thing_id,
                feature_id,
            );
            return;
        }
    };

    let section = if desired {
        &mut feature.desired_properties
    } else {
        &mut feature.properties
    };
    if section.is_none() {
        output.response = properties_not_found(command, thing_id, feature_id, desired);
        return;
    }
    *section = None;

    match handler.storage.add_feature(thing_id, feature_id, &feature) {
        Err(err) => {
            output.response =
                handler.unknown_error("delete feature properties failed", &err, &command.envelope);
        }
        Ok(revision) => {
            output.response = response_envelope(&command.envelope, DELETED);
            output.event =
                handler.event_envelope(thing_id, &command.envelope, Action::Deleted);
            // Deleted desired properties are cloud-authored state: only a
            // lone pending change may be marked synchronized on forward.
            if !desired || revision == 1 {
                output.thing_id = Some(thing_id.clone());
                output.feature_id = Some(feature_id.to_string());
                output.revision = revision;
            }
        }
    }
}

fn properties_not_found(
    command: &Command,
    thing_id: &str,
    feature_id: &str,
    desired: bool,
) -> Option<Envelope> {
    let what = if desired {
        "desired properties of feature could not be found"
    } else {
        "properties of feature could not be found"
    };
    log_command_error(what, &what, &command.envelope);
    command
        .envelope
        .headers
        .response_required()
        .then(|| errors::properties_not_found(&command.envelope, thing_id, feature_id, desired))
}
