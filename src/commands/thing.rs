//! Thing-level commands: create, modify, retrieve (single and batch),
//! delete.

use serde_json::Value;

use crate::model::Thing;
use crate::protocol::{Action, Envelope, TOPIC_PLACEHOLDER};
use crate::selector;

use super::{
    command_value, errors, event_envelope, log_command_error, response_envelope,
    response_with_value, thing_event_envelope, Command, CommandOutput, Handler, CREATED, DELETED,
    MODIFIED, OK,
};

pub(crate) fn create(handler: &Handler, command: &Command, output: &mut CommandOutput) {
    let Some(thing) = command_thing(command, output) else {
        return;
    };
    match handler.storage.thing_data(&command.thing_id) {
        Err(_) => perform_modify(handler, command, thing, CREATED, Action::Created, output),
        Ok(_) => {
            log_command_error(
                "create thing failed, thing exists",
                &"thing already exists",
                &command.envelope,
            );
            if command.envelope.headers.response_required() {
                output.response = Some(errors::thing_conflict(&command.envelope, &command.thing_id));
            }
        }
    }
}

pub(crate) fn modify(handler: &Handler, command: &Command, output: &mut CommandOutput) {
    let Some(thing) = command_thing(command, output) else {
        return;
    };
    // Modifying an unknown thing implicitly creates it.
    let status = match handler.storage.thing_data(&command.thing_id) {
        Ok(_) => MODIFIED,
        Err(_) => CREATED,
    };
    perform_modify(handler, command, thing, status, Action::Modified, output);
}

pub(crate) fn retrieve(handler: &Handler, command: &Command, output: &mut CommandOutput) {
    if command.envelope.topic.namespace == TOPIC_PLACEHOLDER
        || command.envelope.topic.entity_id == TOPIC_PLACEHOLDER
    {
        retrieve_things(handler, command, output);
        return;
    }

    let thing = match handler.storage.thing(&command.thing_id) {
        Ok(thing) => thing,
        Err(err) => {
            output.response = handler.thing_not_found(
                "retrieve thing failed",
                &err,
                &command.envelope,
                &command.thing_id,
            );
            return;
        }
    };

    let value = serde_json::to_value(&thing).expect("thing serializes");
    output.response = match command.envelope.fields.as_deref() {
        None => response_with_value(&command.envelope, OK, value),
        Some(fields) => match selector::project(&value, fields) {
            Ok(projected) => response_with_value(&command.envelope, OK, projected),
            Err(err) => {
                handler.invalid_field_selector("invalid field selector", &err, &command.envelope)
            }
        },
    };
}

/// Batch retrieve by explicit thing ids; unknown ids are skipped.
fn retrieve_things(handler: &Handler, command: &Command, output: &mut CommandOutput) {
    let thing_ids = match batch_thing_ids(&command.envelope) {
        Ok(ids) => ids,
        Err(reason) => {
            if command.envelope.headers.response_required() {
                output.response = Some(errors::invalid_json_value(&command.envelope, &reason));
            }
            return;
        }
    };

    let mut things = Vec::new();
    for thing_id in &thing_ids {
        if !thing_id.contains(':') {
            if command.envelope.headers.response_required() {
                output.response = Some(errors::id_invalid(&command.envelope, thing_id));
            }
            return;
        }
        if let Ok(thing) = handler.storage.thing(thing_id) {
            things.push(serde_json::to_value(&thing).expect("thing serializes"));
        }
    }

    let value = Value::Array(things);
    output.response = match command.envelope.fields.as_deref() {
        None => response_with_value(&command.envelope, OK, value),
        Some(fields) => match selector::project(&value, fields) {
            Ok(projected) => response_with_value(&command.envelope, OK, projected),
            Err(err) => {
                handler.invalid_field_selector("invalid field selector", &err, &command.envelope)
            }
        },
    };
}

fn batch_thing_ids(envelope: &Envelope) -> Result<Vec<String>, String> {
    let value = envelope.value.as_ref().ok_or("missing command value")?;
    let ids = value
        .get("thingIds")
        .and_then(Value::as_array)
        .ok_or("missing 'thingIds' value")?;
    if ids.is_empty() {
        return Err("Empty 'thingIds' value".into());
    }
    ids.iter()
        .map(|id| {
            id.as_str()
                .map(str::to_string)
                .ok_or_else(|| "non-string entry in 'thingIds' value".to_string())
        })
        .collect()
}

pub(crate) fn delete(handler: &Handler, command: &Command, output: &mut CommandOutput) {
    match handler.load_thing(&command.thing_id, &command.envelope) {
        Err(err) => {
            output.response = handler.resource_not_found(
                "delete thing failed, unknown thing",
                &err,
                &command.envelope,
                &command.thing_id,
                "",
            );
        }
        Ok(thing) => {
            // The local copy stays; the removal propagates through the
            // forwarded command and comes back as a hub-side state change.
            output.response = response_envelope(&command.envelope, DELETED);
            output.event = Some(event_envelope(
                &command.envelope,
                thing.revision,
                &thing.timestamp,
                Action::Deleted,
            ));
        }
    }
}

/// Parse the thing out of the command value; the id must be absent or
/// equal to the topic's id.
fn command_thing(command: &Command, output: &mut CommandOutput) -> Option<Thing> {
    let mut thing: Thing = command_value(&command.envelope, output)?;

    match &thing.id {
        None => {
            let id = command.thing_id.parse().ok()?;
            thing.id = Some(id);
        }
        Some(id) => {
            if id.to_string() != command.thing_id {
                if command.envelope.headers.response_required() {
                    output.response = Some(errors::id_not_settable(&command.envelope));
                }
                return None;
            }
        }
    }
    Some(thing)
}

fn perform_modify(
    handler: &Handler,
    command: &Command,
    thing: Thing,
    status: u16,
    action: Action,
    output: &mut CommandOutput,
) {
    let revision = match handler.storage.add_thing(&thing) {
        Ok(revision) => revision,
        Err(err) => {
            output.response = handler.unknown_error("modify thing failed", &err, &command.envelope);
            return;
        }
    };

    output.response = if status == CREATED {
        response_with_value(
            &command.envelope,
            status,
            serde_json::to_value(&thing).expect("thing serializes"),
        )
    } else {
        response_envelope(&command.envelope, status)
    };

    let timestamp = handler
        .storage
        .system_data(&command.thing_id)
        .map(|system| system.timestamp)
        .unwrap_or_default();
    output.event = Some(thing_event_envelope(
        &command.envelope,
        action,
        &thing,
        revision,
        &timestamp,
    ));

    output.thing_id = Some(command.thing_id.clone());
    output.revision = revision;
}
