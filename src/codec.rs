//! Packet codec: one JSON envelope carrying either a chat message or a
//! typing signal.
//!
//! The envelope layout matches what the mobile clients put on the air:
//!
//! ```json
//! {"type": "message", "playload": "<base64 of the payload JSON>"}
//! ```
//!
//! `kind`/`payload` are accepted as field names on input. There is no version
//! field; unknown fields are ignored so newer peers can add some.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::{ChatMessage, TypingKind, TypingSignal};
use crate::error::{DecodeError, EncodeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketKind {
    Message,
    Typing,
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketKind::Message => f.write_str("message"),
            PacketKind::Typing => f.write_str("typing"),
        }
    }
}

/// Discriminated wire wrapper. `payload` must decode under the schema named
/// by `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEnvelope {
    #[serde(rename = "type", alias = "kind")]
    pub kind: PacketKind,
    #[serde(rename = "playload", alias = "payload", with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl WireEnvelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(bytes).map_err(DecodeError::Envelope)
    }
}

/// A decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Message(ChatMessage),
    Typing(TypingSignal),
}

#[derive(Debug, Serialize, Deserialize)]
struct MessagePayload {
    id: String,
    text: String,
    timestamp: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct TypingPayload {
    #[serde(rename = "type")]
    kind: TypingKind,
    #[serde(rename = "peerName")]
    peer_name: String,
    timestamp: f64,
}

pub fn encode_message(message: &ChatMessage) -> Result<WireEnvelope, EncodeError> {
    let payload = MessagePayload {
        // Foundation prints UUIDs in upper case.
        id: message.id.hyphenated().to_string().to_uppercase(),
        text: message.text.clone(),
        timestamp: to_wire_seconds(message.timestamp),
    };
    Ok(WireEnvelope {
        kind: PacketKind::Message,
        payload: serde_json::to_vec(&payload)?,
    })
}

pub fn encode_typing(signal: &TypingSignal) -> Result<WireEnvelope, EncodeError> {
    let payload = TypingPayload {
        kind: signal.kind,
        peer_name: signal.peer_display_name.clone(),
        timestamp: to_wire_seconds(signal.timestamp),
    };
    Ok(WireEnvelope {
        kind: PacketKind::Typing,
        payload: serde_json::to_vec(&payload)?,
    })
}

/// Encode straight to bytes ready for the transport.
pub fn encode(packet: &Packet) -> Result<Vec<u8>, EncodeError> {
    let envelope = match packet {
        Packet::Message(message) => encode_message(message)?,
        Packet::Typing(signal) => encode_typing(signal)?,
    };
    envelope.to_bytes()
}

/// Decode bytes received from a peer. Messages come out as incoming and
/// already `Sent`.
pub fn decode(bytes: &[u8]) -> Result<Packet, DecodeError> {
    decode_envelope(&WireEnvelope::from_bytes(bytes)?)
}

pub fn decode_envelope(envelope: &WireEnvelope) -> Result<Packet, DecodeError> {
    let kind = envelope.kind;
    match kind {
        PacketKind::Message => {
            let payload: MessagePayload = serde_json::from_slice(&envelope.payload)
                .map_err(|source| DecodeError::Payload { kind, source })?;
            let timestamp = from_wire_seconds(payload.timestamp)?;
            let id = Uuid::parse_str(&payload.id).unwrap_or_else(|err| {
                log::debug!("Message id `{}` is not a UUID ({err}); assigning one", payload.id);
                Uuid::new_v4()
            });
            Ok(Packet::Message(ChatMessage::incoming(id, payload.text, timestamp)))
        }
        PacketKind::Typing => {
            let payload: TypingPayload = serde_json::from_slice(&envelope.payload)
                .map_err(|source| DecodeError::Payload { kind, source })?;
            Ok(Packet::Typing(TypingSignal {
                kind: payload.kind,
                peer_display_name: payload.peer_name,
                timestamp: from_wire_seconds(payload.timestamp)?,
            }))
        }
    }
}

fn to_wire_seconds(timestamp: DateTime<Utc>) -> f64 {
    timestamp.timestamp_micros() as f64 / 1_000_000.0
}

fn from_wire_seconds(seconds: f64) -> Result<DateTime<Utc>, DecodeError> {
    let micros = (seconds * 1_000_000.0).round();
    if !micros.is_finite() || micros < i64::MIN as f64 || micros > i64::MAX as f64 {
        return Err(DecodeError::Timestamp(seconds));
    }
    DateTime::from_timestamp_micros(micros as i64).ok_or(DecodeError::Timestamp(seconds))
}

mod base64_bytes {
    use data_encoding::BASE64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        BASE64
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
