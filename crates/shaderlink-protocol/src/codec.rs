//! Text-frame codec for [`Envelope`].
//!
//! Decoding only rejects frames whose envelope is broken (`id` or `type`
//! missing or not a string) or whose known payload lacks a correlation key.
//! Unknown `type`s decode into [`MessageKind::Unknown`]. A missing
//! `timestamp` becomes "now" and a missing `payload` is treated as `{}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::ids::MessageId;
use crate::message::{Envelope, MessageKind};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(String),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("envelope field `{0}` is missing")]
    MissingField(&'static str),
    #[error("envelope field `{0}` must be a non-empty string")]
    InvalidField(&'static str),
    #[error("invalid `{kind}` payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

#[derive(Debug, Error)]
#[error("failed to encode `{kind}` envelope: {reason}")]
pub struct EncodeError {
    pub kind: String,
    pub reason: String,
}

/// Encode an envelope as a JSON text frame.
///
/// Every catalogue payload is a plain struct with string keys, so this only
/// fails for a hand-built `Unknown` payload that JSON cannot represent.
pub fn encode(envelope: &Envelope) -> Result<String, EncodeError> {
    serde_json::to_string(envelope).map_err(|error| EncodeError {
        kind: envelope.kind.type_name().to_owned(),
        reason: error.to_string(),
    })
}

/// Wrap `kind` in a fresh envelope and encode it.
pub fn encode_kind(kind: MessageKind) -> Result<String, EncodeError> {
    encode(&Envelope::new(kind))
}

pub fn decode(frame: &str) -> Result<Envelope, DecodeError> {
    let value: Value =
        serde_json::from_str(frame).map_err(|error| DecodeError::Malformed(error.to_string()))?;
    decode_value(value)
}

pub fn decode_value(value: Value) -> Result<Envelope, DecodeError> {
    let Value::Object(mut fields) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let id = required_string(&mut fields, "id")?;
    let kind_name = required_string(&mut fields, "type")?;
    let timestamp = fields
        .remove("timestamp")
        .and_then(|raw| serde_json::from_value::<DateTime<Utc>>(raw).ok())
        .unwrap_or_else(Utc::now);
    let payload = match fields.remove("payload") {
        Some(Value::Null) | None => Value::Object(Map::new()),
        Some(payload) => payload,
    };

    let kind = MessageKind::from_parts(&kind_name, payload).map_err(|error| {
        DecodeError::InvalidPayload {
            kind: kind_name.clone(),
            reason: error.to_string(),
        }
    })?;

    Ok(Envelope {
        id: MessageId::from(id),
        kind,
        timestamp,
    })
}

fn required_string(fields: &mut Map<String, Value>, name: &'static str) -> Result<String, DecodeError> {
    match fields.remove(name) {
        Some(Value::String(text)) if !text.is_empty() => Ok(text),
        Some(_) => Err(DecodeError::InvalidField(name)),
        None => Err(DecodeError::MissingField(name)),
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        decode_value(value).map_err(serde::de::Error::custom)
    }
}
