//! Typed binary codec for persisted records.
//!
//! Everything in the store is CBOR: a self-describing encoding, so a
//! decoder that knows only the target type can reconstruct nested
//! heterogeneous maps and arrays. Records are encoded as fixed-length
//! arrays of fields; dynamic JSON trees are encoded structurally.

use std::collections::{BTreeMap, BTreeSet};

use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use serde_json::{Number, Value};
use thiserror::Error;

use crate::model::JsonObject;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(#[from] minicbor::encode::Error<std::convert::Infallible>),
    #[error("decode failed: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error("unencodable number {0}")]
    UnencodableNumber(String),
}

/// Persisted shape of a thing without its features.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ThingData {
    pub id: String,
    pub policy_id: Option<String>,
    pub definition: Option<String>,
    pub attributes: Option<JsonObject>,
}

/// Persisted shape of a single feature.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeatureData {
    pub id: String,
    pub thing_id: String,
    pub definition: Vec<String>,
    pub properties: Option<JsonObject>,
    pub desired_properties: Option<JsonObject>,
}

/// The per-thing synchronization ledger.
///
/// `revision` and `timestamp` are bumped together by every write.
/// `deleted_features` holds locally removed, not yet acknowledged feature
/// ids; `unsynchronized_features` maps locally changed feature ids to
/// their pending-change counter. The two sets are always disjoint.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SystemThingData {
    pub id: String,
    pub revision: i64,
    pub timestamp: String,
    pub deleted_features: BTreeSet<String>,
    pub unsynchronized_features: BTreeMap<String, i64>,
}

pub fn encode_thing_data(data: &ThingData) -> Result<Vec<u8>, CodecError> {
    let mut encoder = Encoder::new(Vec::new());
    encoder.array(4)?;
    encoder.str(&data.id)?;
    encode_opt_str(&mut encoder, data.policy_id.as_deref())?;
    encode_opt_str(&mut encoder, data.definition.as_deref())?;
    encode_opt_object(&mut encoder, data.attributes.as_ref())?;
    Ok(encoder.into_writer())
}

pub fn decode_thing_data(bytes: &[u8]) -> Result<ThingData, CodecError> {
    let mut decoder = Decoder::new(bytes);
    expect_array(&mut decoder, 4, "thing data")?;
    Ok(ThingData {
        id: decoder.str()?.to_string(),
        policy_id: decode_opt_str(&mut decoder)?,
        definition: decode_opt_str(&mut decoder)?,
        attributes: decode_opt_object(&mut decoder)?,
    })
}

pub fn encode_feature_data(data: &FeatureData) -> Result<Vec<u8>, CodecError> {
    let mut encoder = Encoder::new(Vec::new());
    encoder.array(5)?;
    encoder.str(&data.id)?;
    encoder.str(&data.thing_id)?;
    encoder.array(data.definition.len() as u64)?;
    for definition in &data.definition {
        encoder.str(definition)?;
    }
    encode_opt_object(&mut encoder, data.properties.as_ref())?;
    encode_opt_object(&mut encoder, data.desired_properties.as_ref())?;
    Ok(encoder.into_writer())
}

pub fn decode_feature_data(bytes: &[u8]) -> Result<FeatureData, CodecError> {
    let mut decoder = Decoder::new(bytes);
    expect_array(&mut decoder, 5, "feature data")?;
    let id = decoder.str()?.to_string();
    let thing_id = decoder.str()?.to_string();

    let len = definite_len(decoder.array()?, "feature definition")?;
    let mut definition = Vec::with_capacity(len as usize);
    for _ in 0..len {
        definition.push(decoder.str()?.to_string());
    }

    Ok(FeatureData {
        id,
        thing_id,
        definition,
        properties: decode_opt_object(&mut decoder)?,
        desired_properties: decode_opt_object(&mut decoder)?,
    })
}

pub fn encode_system_data(data: &SystemThingData) -> Result<Vec<u8>, CodecError> {
    let mut encoder = Encoder::new(Vec::new());
    encoder.array(5)?;
    encoder.str(&data.id)?;
    encoder.i64(data.revision)?;
    encoder.str(&data.timestamp)?;
    encoder.array(data.deleted_features.len() as u64)?;
    for feature_id in &data.deleted_features {
        encoder.str(feature_id)?;
    }
    encoder.map(data.unsynchronized_features.len() as u64)?;
    for (feature_id, counter) in &data.unsynchronized_features {
        encoder.str(feature_id)?;
        encoder.i64(*counter)?;
    }
    Ok(encoder.into_writer())
}

pub fn decode_system_data(bytes: &[u8]) -> Result<SystemThingData, CodecError> {
    let mut decoder = Decoder::new(bytes);
    expect_array(&mut decoder, 5, "system thing data")?;
    let id = decoder.str()?.to_string();
    let revision = decoder.i64()?;
    let timestamp = decoder.str()?.to_string();

    let len = definite_len(decoder.array()?, "deleted features")?;
    let mut deleted_features = BTreeSet::new();
    for _ in 0..len {
        deleted_features.insert(decoder.str()?.to_string());
    }

    let len = definite_len(decoder.map()?, "unsynchronized features")?;
    let mut unsynchronized_features = BTreeMap::new();
    for _ in 0..len {
        let feature_id = decoder.str()?.to_string();
        unsynchronized_features.insert(feature_id, decoder.i64()?);
    }

    Ok(SystemThingData {
        id,
        revision,
        timestamp,
        deleted_features,
        unsynchronized_features,
    })
}

pub fn encode_id_set(ids: &BTreeSet<String>) -> Result<Vec<u8>, CodecError> {
    let mut encoder = Encoder::new(Vec::new());
    encoder.array(ids.len() as u64)?;
    for id in ids {
        encoder.str(id)?;
    }
    Ok(encoder.into_writer())
}

pub fn decode_id_set(bytes: &[u8]) -> Result<BTreeSet<String>, CodecError> {
    let mut decoder = Decoder::new(bytes);
    let len = definite_len(decoder.array()?, "id set")?;
    let mut ids = BTreeSet::new();
    for _ in 0..len {
        ids.insert(decoder.str()?.to_string());
    }
    Ok(ids)
}

fn encode_opt_str(
    encoder: &mut Encoder<Vec<u8>>,
    value: Option<&str>,
) -> Result<(), CodecError> {
    match value {
        Some(s) => encoder.str(s)?,
        None => encoder.null()?,
    };
    Ok(())
}

fn decode_opt_str(decoder: &mut Decoder<'_>) -> Result<Option<String>, CodecError> {
    if decoder.datatype()? == Type::Null {
        decoder.null()?;
        return Ok(None);
    }
    Ok(Some(decoder.str()?.to_string()))
}

fn encode_opt_object(
    encoder: &mut Encoder<Vec<u8>>,
    value: Option<&JsonObject>,
) -> Result<(), CodecError> {
    match value {
        Some(object) => encode_object(encoder, object),
        None => {
            encoder.null()?;
            Ok(())
        }
    }
}

fn decode_opt_object(decoder: &mut Decoder<'_>) -> Result<Option<JsonObject>, CodecError> {
    if decoder.datatype()? == Type::Null {
        decoder.null()?;
        return Ok(None);
    }
    Ok(Some(decode_object(decoder)?))
}

fn encode_object(encoder: &mut Encoder<Vec<u8>>, object: &JsonObject) -> Result<(), CodecError> {
    encoder.map(object.len() as u64)?;
    for (key, value) in object {
        encoder.str(key)?;
        encode_value(encoder, value)?;
    }
    Ok(())
}

fn decode_object(decoder: &mut Decoder<'_>) -> Result<JsonObject, CodecError> {
    let len = definite_len(decoder.map()?, "object")?;
    let mut object = JsonObject::new();
    for _ in 0..len {
        let key = decoder.str()?.to_string();
        object.insert(key, decode_value(decoder)?);
    }
    Ok(object)
}

/// Encode one dynamic JSON value.
pub fn encode_value(encoder: &mut Encoder<Vec<u8>>, value: &Value) -> Result<(), CodecError> {
    match value {
        Value::Null => {
            encoder.null()?;
        }
        Value::Bool(b) => {
            encoder.bool(*b)?;
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                encoder.i64(i)?;
            } else if let Some(u) = n.as_u64() {
                encoder.u64(u)?;
            } else if let Some(f) = n.as_f64() {
                encoder.f64(f)?;
            } else {
                return Err(CodecError::UnencodableNumber(n.to_string()));
            }
        }
        Value::String(s) => {
            encoder.str(s)?;
        }
        Value::Array(items) => {
            encoder.array(items.len() as u64)?;
            for item in items {
                encode_value(encoder, item)?;
            }
        }
        Value::Object(object) => {
            encode_object(encoder, object)?;
        }
    }
    Ok(())
}

/// Decode one dynamic JSON value.
pub fn decode_value(decoder: &mut Decoder<'_>) -> Result<Value, CodecError> {
    let value = match decoder.datatype()? {
        Type::Null => {
            decoder.null()?;
            Value::Null
        }
        Type::Bool => Value::Bool(decoder.bool()?),
        Type::U8 | Type::U16 | Type::U32 | Type::U64 => {
            Value::Number(Number::from(decoder.u64()?))
        }
        Type::I8 | Type::I16 | Type::I32 | Type::I64 => {
            Value::Number(Number::from(decoder.i64()?))
        }
        Type::F16 | Type::F32 | Type::F64 => {
            let f = decoder.f64()?;
            Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        Type::String => Value::String(decoder.str()?.to_string()),
        Type::Array => {
            let len = definite_len(decoder.array()?, "array")?;
            let mut items = Vec::with_capacity(len as usize);
            for _ in 0..len {
                items.push(decode_value(decoder)?);
            }
            Value::Array(items)
        }
        Type::Map => Value::Object(decode_object(decoder)?),
        other => {
            return Err(minicbor::decode::Error::message(format!(
                "unexpected cbor type {other}"
            ))
            .into());
        }
    };
    Ok(value)
}

fn expect_array(
    decoder: &mut Decoder<'_>,
    expected: u64,
    what: &str,
) -> Result<(), CodecError> {
    let len = definite_len(decoder.array()?, what)?;
    if len != expected {
        return Err(minicbor::decode::Error::message(format!(
            "{what}: expected {expected} fields, got {len}"
        ))
        .into());
    }
    Ok(())
}

fn definite_len(len: Option<u64>, what: &str) -> Result<u64, CodecError> {
    len.ok_or_else(|| {
        minicbor::decode::Error::message(format!("{what}: indefinite length not supported")).into()
    })
}
