//! Commands on a single property JSON pointer:
//! `/features/<f>/properties/<p…>` and `/features/<f>/desiredProperties/<p…>`.

use serde_json::Value;

use crate::model::{pointer, Feature, JsonObject};
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
                "modify feature property failed, feature not found",
                &err,
                &command.envelope,
                thing_id,
                feature_id,
            );
            return;
        }
    };

    let section = section_mut(&mut feature, desired);
    let (status, action) = if section.is_none() {
        (CREATED, Action::Created)
    } else {
        (MODIFIED, Action::Modified)
    };
    let properties = section.take().unwrap_or_default();

    let Some(new_value) = command_value::<Value>(&command.envelope, output) else {
        return;
    };

    let mut tree = Value::Object(properties);
    if !pointer::set(&mut tree, command.property_pointer(), new_value) {
        output.response = property_not_found(
            command,
            "update feature property failed, unable to set pointer value",
            thing_id,
            feature_id,
            desired,
        );
        return;
    }
    *section_mut(&mut feature, desired) = match tree {
        Value::Object(map) => Some(map),
        _ => None,
    };

    match handler.storage.add_feature(thing_id, feature_id, &feature) {
        Err(err) => {
            output.response =
                handler.unknown_error("update feature property failed", &err, &command.envelope);
        }
        Ok(revision) => {
            output.response = response_envelope(&command.envelope, status);
            output.event = handler.event_envelope(thing_id, &command.envelope, action);
            add_change_info(output, thing_id, feature_id, revision);
        }
    }
}

fn do_retrieve(handler: &Handler, command: &Command, desired: bool, output: &mut CommandOutput) {
    let thing_id = &command.thing_id;
    let feature_id = command.feature_id();

    let feature = match handler.load_feature(thing_id, feature_id, &command.envelope) {
        Ok(feature) => feature,
        Err(err) => {
            output.response = handler.resource_not_found(
                "unable to retrieve feature property, feature not found",
                &err,
                &command.envelope,
                thing_id,
                feature_id,
            );
            return;
        }
    };

    let Some(properties) = section(&feature, desired) else {
        output.response = property_not_found(
            command,
            "unable to retrieve any properties of feature",
            thing_id,
            feature_id,
            desired,
        );
        return;
    };

    let tree = Value::Object(properties.clone());
    match pointer::get(&tree, command.property_pointer()) {
        None => {
            output.response = property_not_found(
                command,
                "unable to retrieve property path",
                thing_id,
                feature_id,
                desired,
            );
        }
        Some(value) => {
            output.response = response_with_value(&command.envelope, OK, value.clone());
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
                "delete feature property failed, feature not found",
                &err,
                &command.envelope,
                thing_id,
                feature_id,
            );
            return;
        }
    };

    let Some(properties) = section(&feature, desired) else {
        output.response = property_not_found(
            command,
            "delete feature property failed",
            thing_id,
            feature_id,
            desired,
        );
        return;
    };

    let mut tree = Value::Object(properties.clone());
    if !pointer::remove(&mut tree, command.property_pointer()) {
        output.response = property_not_found(
            command,
            "delete feature property path failed",
            thing_id,
            feature_id,
            desired,
        );
        return;
    }

    let remaining = match tree {
        Value::Object(map) if map.is_empty() => None,
        Value::Object(map) => Some(map),
        _ => None,
    };
    *section_mut(&mut feature, desired) = remaining;

    match handler.storage.add_feature(thing_id, feature_id, &feature) {
        Err(err) => {
            output.response =
                handler.unknown_error("delete feature property failed", &err, &command.envelope);
        }
        Ok(revision) => {
            output.response = response_envelope(&command.envelope, DELETED);
            output.event =
                handler.event_envelope(thing_id, &command.envelope, Action::Deleted);
            add_change_info(output, thing_id, feature_id, revision);
        }
    }
}

fn section(feature: &Feature, desired: bool) -> Option<&JsonObject> {
    if desired {
        feature.desired_properties.as_ref()
    } else {
        feature.properties.as_ref()
    }
}

fn section_mut(feature: &mut Feature, desired: bool) -> &mut Option<JsonObject> {
    if desired {
        &mut feature.desired_properties
    } else {
        &mut feature.properties
    }
}

/// Only a lone pending change may be auto-synchronized on forward; with
/// more accumulated changes the drain resolves the ledger instead.
fn add_change_info(output: &mut CommandOutput, thing_id: &str, feature_id: &str, revision: i64) {
    if revision == 1 {
        output.thing_id = Some(thing_id.to_string());
        output.feature_id = Some(feature_id.to_string());
        output.revision = 1;
    }
}

fn property_not_found(
    command: &Command,
    message: &str,
    thing_id: &str,
    feature_id: &str,
    desired: bool,
) -> Option<Envelope> {
    log_command_error(message, &"property of feature could not be found", &command.envelope);
    command.envelope.headers.response_required().then(|| {
        errors::property_not_found(
            &command.envelope,
            thing_id,
            feature_id,
            command.property_pointer(),
            desired,
        )
    })
}
