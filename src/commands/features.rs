//! Commands on the whole `/features` map.

use std::collections::BTreeMap;

use crate::model::Feature;
use crate::protocol::{Action, Envelope};

use super::{
    command_value, errors, log_command_error, response_envelope, response_with_value, Command,
    CommandOutput, Handler, CREATED, DELETED, MODIFIED, OK,
};

pub(crate) fn modify(handler: &Handler, command: &Command, output: &mut CommandOutput) {
    let Some(features) = command_value::<BTreeMap<String, Feature>>(&command.envelope, output)
    else {
        return;
    };

    let mut thing = match handler.load_thing(&command.thing_id, &command.envelope) {
        Ok(thing) => thing,
        Err(err) => {
            output.response = handler.resource_not_found(
                "modify thing features failed, unknown thing",
                &err,
                &command.envelope,
                &command.thing_id,
                "",
            );
            return;
        }
    };

    let (status, action) = if thing.features.is_none() {
        (CREATED, Action::Created)
    } else {
        (MODIFIED, Action::Modified)
    };

    thing.features = Some(features);
    match handler.storage.add_thing(&thing) {
        Err(err) => {
            output.response =
                handler.unknown_error("modify thing features failed", &err, &command.envelope);
        }
        Ok(revision) => {
            output.response = response_envelope(&command.envelope, status);
            output.event = handler.event_envelope(&command.thing_id, &command.envelope, action);
            output.thing_id = Some(command.thing_id.clone());
            output.revision = revision;
        }
    }
}

pub(crate) fn retrieve(handler: &Handler, command: &Command, output: &mut CommandOutput) {
    match handler.load_thing(&command.thing_id, &command.envelope) {
        Err(err) => {
            output.response = handler.resource_not_found(
                "retrieve thing features failed, unknown thing",
                &err,
                &command.envelope,
                &command.thing_id,
                "",
            );
        }
        Ok(thing) => match thing.features {
            None => {
                output.response = features_not_found(handler, command);
            }
            Some(features) => {
                output.response = response_with_value(
                    &command.envelope,
                    OK,
                    serde_json::to_value(features).expect("features serialize"),
                );
            }
        },
    }
}

pub(crate) fn delete(handler: &Handler, command: &Command, output: &mut CommandOutput) {
    let mut thing = match handler.load_thing(&command.thing_id, &command.envelope) {
        Ok(thing) => thing,
        Err(err) => {
            output.response = handler.resource_not_found(
                "delete thing features failed, unknown thing",
                &err,
                &command.envelope,
                &command.thing_id,
                "",
            );
            return;
        }
    };

    if thing.features.is_none() {
        output.response = features_not_found(handler, command);
        return;
    }

    thing.features = None;
    match handler.storage.add_thing(&thing) {
        Err(err) => {
            output.response =
                handler.unknown_error("delete thing features failed", &err, &command.envelope);
        }
        Ok(revision) => {
            output.response = response_envelope(&command.envelope, DELETED);
            output.event =
                handler.event_envelope(&command.thing_id, &command.envelope, Action::Deleted);
            output.thing_id = Some(command.thing_id.clone());
            output.revision = revision;
        }
    }
}

fn features_not_found(_handler: &Handler, command: &Command) -> Option<Envelope> {
    log_command_error(
        "features could not be found",
        &"features could not be found",
        &command.envelope,
    );
    command
        .envelope
        .headers
        .response_required()
        .then(|| errors::features_not_found(&command.envelope, &command.thing_id))
}
