//! Protocol error envelopes for the `things` namespace.
//!
//! These are responses, not crate errors: each constructor builds a
//! `twin/errors` envelope with an HTTP-like status, rooted at path `/`.

use serde::{Deserialize, Serialize};

use crate::protocol::{
    Channel, Criterion, Envelope, Group, Topic, CONTENT_TYPE_DITTO,
};

/// Error payload carried by a `twin/errors` envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThingError {
    pub status: u16,
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

pub fn thing_not_found(cmd: &Envelope, thing_id: &str) -> Envelope {
    error_envelope(
        cmd,
        ThingError {
            status: 404,
            error: "things:thing.notfound".into(),
            message: format!("The Thing with ID '{thing_id}' could not be found."),
            description: "Check if the ID of your requested Thing was correct.".into(),
        },
    )
}

pub fn thing_conflict(cmd: &Envelope, thing_id: &str) -> Envelope {
    error_envelope(
        cmd,
        ThingError {
            status: 409,
            error: "things:thing.conflict".into(),
            message: format!("The Thing with ID '{thing_id}' already exists."),
            description: "Choose another Thing ID.".into(),
        },
    )
}

pub fn feature_not_found(cmd: &Envelope, thing_id: &str, feature_id: &str) -> Envelope {
    error_envelope(
        cmd,
        ThingError {
            status: 404,
            error: "things:feature.notfound".into(),
            message: format!(
                "The Feature with ID '{feature_id}' on the Thing with ID '{thing_id}' could not be found."
            ),
            description:
                "Check if the ID of the Thing and the ID of your requested Feature was correct."
                    .into(),
        },
    )
}

pub fn features_not_found(cmd: &Envelope, thing_id: &str) -> Envelope {
    error_envelope(
        cmd,
        ThingError {
            status: 404,
            error: "things:features.notfound".into(),
            message: format!("The Features on the Thing with ID '{thing_id}' do not exist."),
            description: "Check if the ID of the Thing was correct.".into(),
        },
    )
}

pub fn properties_not_found(
    cmd: &Envelope,
    thing_id: &str,
    feature_id: &str,
    desired: bool,
) -> Envelope {
    let (error, message) = if desired {
        (
            "things:feature.desiredProperties.notfound",
            format!(
                "The desired properties of the Feature with ID '{feature_id}' on the Thing with ID '{thing_id}' do not exist."
            ),
        )
    } else {
        (
            "things:feature.properties.notfound",
            format!(
                "The Properties of the Feature with ID '{feature_id}' on the Thing with ID '{thing_id}' do not exist."
            ),
        )
    };
    error_envelope(
        cmd,
        ThingError {
            status: 404,
            error: error.into(),
            message,
            description: "Check if the ID of the Thing and the Feature ID was correct.".into(),
        },
    )
}

pub fn property_not_found(
    cmd: &Envelope,
    thing_id: &str,
    feature_id: &str,
    pointer: &str,
    desired: bool,
) -> Envelope {
    let (error, noun) = if desired {
        ("things:feature.desiredProperty.notfound", "The desired property")
    } else {
        ("things:feature.property.notfound", "The property")
    };
    error_envelope(
        cmd,
        ThingError {
            status: 404,
            error: error.into(),
            message: format!(
                "{noun} with JSON Pointer '{pointer}' of the Feature with ID '{feature_id}' on the Thing with ID '{thing_id}' does not exist."
            ),
            description:
                "Check if the ID of the Thing, the Feature ID and the key of your requested property was correct."
                    .into(),
        },
    )
}

pub fn id_not_settable(cmd: &Envelope) -> Envelope {
    error_envelope(
        cmd,
        ThingError {
            status: 400,
            error: "things:id.notsettable".into(),
            message: "The Thing ID in the command value is not equal to the Thing ID in the command topic."
                .into(),
            description:
                "Either delete the Thing ID from the command value or use the same Thing ID as in the command topic."
                    .into(),
        },
    )
}

pub fn id_invalid(cmd: &Envelope, thing_id: &str) -> Envelope {
    error_envelope(
        cmd,
        ThingError {
            status: 400,
            error: "things:id.invalid".into(),
            message: format!("Thing ID '{thing_id}' is not valid!"),
            description: "It must conform to the namespaced entity ID notation (see Ditto documentation)"
                .into(),
        },
    )
}

pub fn invalid_json_value(cmd: &Envelope, reason: &str) -> Envelope {
    error_envelope(
        cmd,
        ThingError {
            status: 400,
            error: "json.invalid".into(),
            message: format!("Failed to parse command value: {reason}."),
            description: "Check if the JSON was valid and if it was in required format.".into(),
        },
    )
}

pub fn invalid_field_selector(cmd: &Envelope, reason: &str) -> Envelope {
    error_envelope(
        cmd,
        ThingError {
            status: 400,
            error: "json.fieldselector.invalid".into(),
            message: format!("Invalid field selector: {reason}."),
            description: "Check fields syntax.".into(),
        },
    )
}

pub fn unknown(cmd: &Envelope, message: &str, reason: &str) -> Envelope {
    error_envelope(
        cmd,
        ThingError {
            status: 400,
            error: "unknown".into(),
            message: format!("{message}: {reason}."),
            description: "Unexpected error on command execution. Try it later.".into(),
        },
    )
}

fn error_envelope(cmd: &Envelope, error: ThingError) -> Envelope {
    let topic = Topic {
        namespace: cmd.topic.namespace.clone(),
        entity_id: cmd.topic.entity_id.clone(),
        group: Group::Things,
        channel: Some(Channel::Twin),
        criterion: Criterion::Errors,
        action: None,
    };
    let status = error.status;
    Envelope::new(topic, "/")
        .with_headers(
            cmd.headers
                .clone()
                .with_response_required(false)
                .with_content_type(CONTENT_TYPE_DITTO),
        )
        .with_status(status)
        .with_value(serde_json::to_value(error).expect("thing error serializes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> Envelope {
        let topic = Topic::parse("org.eclipse.kanto/test/things/twin/commands/delete").unwrap();
        Envelope::new(topic, "/features/meter/desiredProperties")
    }

    #[test]
    fn error_envelope_shape() {
        let envelope = properties_not_found(&command(), "org.eclipse.kanto:test", "meter", true);
        assert_eq!(
            envelope.topic.to_string(),
            "org.eclipse.kanto/test/things/twin/errors"
        );
        assert_eq!(envelope.path, "/");
        assert_eq!(envelope.status, Some(404));
        let value = envelope.value.unwrap();
        assert_eq!(value["error"], "things:feature.desiredProperties.notfound");
        assert_eq!(
            value["message"],
            "The desired properties of the Feature with ID 'meter' on the Thing with ID 'org.eclipse.kanto:test' do not exist."
        );
    }

    #[test]
    fn conflict_is_409() {
        let envelope = thing_conflict(&command(), "org.eclipse.kanto:test");
        assert_eq!(envelope.status, Some(409));
        assert_eq!(
            envelope.value.unwrap()["error"],
            "things:thing.conflict"
        );
    }
}
