//! Gateway wire protocol: envelope types, codec, and subject grammar.
//!
//! Devices talk to the message-bus gateway over a framed text carrier
//! (WebSocket in practice). Every frame is a JSON [`Envelope`] whose
//! `type` field is a small integer code shared with the gateway — the
//! codes are load-bearing and must never be renumbered.
//!
//! This crate is the **single source of truth** for the device ↔ gateway
//! wire format. Both the device SDK and any test gateways depend on it
//! and never build JSON objects by hand — they only serialize and
//! deserialize these types.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub mod subject;

pub use subject::{matches, validate_subject};

/// Protocol version string exchanged with the gateway.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Maximum length of a subject or pattern, in bytes.
pub const MAX_SUBJECT_LEN: usize = 256;

/// Errors produced while encoding or decoding wire frames.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed JSON: {0}")]
    MalformedJson(String),

    #[error("invalid message type: {0}")]
    InvalidMessageType(u64),

    #[error("invalid subject '{0}'")]
    InvalidSubject(String),
}

// ── Message type codes ───────────────────────────────────────────────

/// Frame type discriminator, carried on the wire as a small integer.
///
/// The numeric values are shared with the gateway and must match on both
/// peers: Publish=0 … Pong=10.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageType {
    #[default]
    Publish = 0,
    Subscribe = 1,
    Unsubscribe = 2,
    Message = 3,
    Request = 4,
    Reply = 5,
    Ack = 6,
    Error = 7,
    Auth = 8,
    Ping = 9,
    Pong = 10,
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        t as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, ProtocolError> {
        Ok(match v {
            0 => Self::Publish,
            1 => Self::Subscribe,
            2 => Self::Unsubscribe,
            3 => Self::Message,
            4 => Self::Request,
            5 => Self::Reply,
            6 => Self::Ack,
            7 => Self::Error,
            8 => Self::Auth,
            9 => Self::Ping,
            10 => Self::Pong,
            other => return Err(ProtocolError::InvalidMessageType(u64::from(other))),
        })
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Publish => "Publish",
            Self::Subscribe => "Subscribe",
            Self::Unsubscribe => "Unsubscribe",
            Self::Message => "Message",
            Self::Request => "Request",
            Self::Reply => "Reply",
            Self::Ack => "Ack",
            Self::Error => "Error",
            Self::Auth => "Auth",
            Self::Ping => "Ping",
            Self::Pong => "Pong",
        };
        f.write_str(s)
    }
}

// ── Envelope ─────────────────────────────────────────────────────────

/// The on-wire frame.
///
/// Optional fields are omitted from the encoded JSON when absent.
/// `deviceId` is stamped by the gateway on inbound frames and is never
/// required when sending. Decoding is lenient: unknown fields are
/// ignored and an unparseable timestamp is dropped rather than failing
/// the whole frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type", default)]
    pub msg_type: MessageType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "wire_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl Envelope {
    fn bare(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            subject: None,
            payload: None,
            correlation_id: None,
            timestamp: None,
            device_id: None,
        }
    }

    /// A Publish frame carrying `payload` on `subject`.
    pub fn publish(subject: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            subject: Some(subject.into()),
            payload: Some(payload),
            ..Self::bare(MessageType::Publish)
        }
    }

    /// A Subscribe frame for `pattern`.
    pub fn subscribe(pattern: impl Into<String>) -> Self {
        Self {
            subject: Some(pattern.into()),
            ..Self::bare(MessageType::Subscribe)
        }
    }

    /// An Unsubscribe frame for `pattern`.
    pub fn unsubscribe(pattern: impl Into<String>) -> Self {
        Self {
            subject: Some(pattern.into()),
            ..Self::bare(MessageType::Unsubscribe)
        }
    }

    /// A heartbeat Ping frame.
    pub fn ping() -> Self {
        Self::bare(MessageType::Ping)
    }

    /// A heartbeat Pong frame.
    pub fn pong() -> Self {
        Self::bare(MessageType::Pong)
    }

    /// An Auth frame carrying the handshake request.
    pub fn auth(request: &AuthRequest) -> Self {
        Self {
            // AuthRequest has no non-serializable members, this cannot fail
            payload: serde_json::to_value(request).ok(),
            ..Self::bare(MessageType::Auth)
        }
    }
}

/// Timestamp codec: ISO-8601 UTC with millisecond precision
/// (`YYYY-MM-DDTHH:MM:SS.mmmZ`). Lenient on decode.
mod wire_timestamp {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        ts: &Option<DateTime<Utc>>,
        ser: S,
    ) -> Result<S::Ok, S::Error> {
        match ts {
            Some(ts) => ser.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(de)?;
        Ok(raw.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }))
    }
}

// ── Codec ────────────────────────────────────────────────────────────

/// Serialize an envelope to its wire text.
///
/// A missing timestamp is stamped with "now" (UTC, millisecond
/// precision) so every frame on the wire carries one.
pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    let mut frame = envelope.clone();
    if frame.timestamp.is_none() {
        frame.timestamp = Some(Utc::now());
    }
    serde_json::to_string(&frame).map_err(|e| ProtocolError::MalformedJson(e.to_string()))
}

/// Parse wire text into an envelope.
///
/// Unknown fields are ignored; an out-of-range `type` code is an
/// [`ProtocolError::InvalidMessageType`]; anything else unparseable is
/// [`ProtocolError::MalformedJson`].
pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;

    if let Some(code) = value.get("type").and_then(serde_json::Value::as_u64) {
        let known = u8::try_from(code)
            .ok()
            .and_then(|c| MessageType::try_from(c).ok())
            .is_some();
        if !known {
            return Err(ProtocolError::InvalidMessageType(code));
        }
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::MalformedJson(e.to_string()))
}

// ── Device identity & auth payloads ──────────────────────────────────

/// Device types recognized by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Sensor,
    Actuator,
    Controller,
    Gateway,
    Custom,
}

impl DeviceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sensor => "sensor",
            Self::Actuator => "actuator",
            Self::Controller => "controller",
            Self::Gateway => "gateway",
            Self::Custom => "custom",
        }
    }

    /// Parse from a wire string; anything unrecognized is `Custom`.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "sensor" => Self::Sensor,
            "actuator" => Self::Actuator,
            "controller" => Self::Controller,
            "gateway" => Self::Gateway,
            _ => Self::Custom,
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity and permissions granted by the gateway after a successful
/// handshake.
///
/// The allow-lists are ordered pattern lists. An empty list means
/// **deny-all** (failure-closed) — the gateway is authoritative either
/// way, these lists only drive client-side advisory checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_type: String,
    pub is_connected: bool,
    pub allowed_publish_topics: Vec<String>,
    pub allowed_subscribe_topics: Vec<String>,
}

impl DeviceIdentity {
    /// Whether this identity may publish to `subject`.
    /// Empty allow-list denies everything.
    pub fn allows_publish(&self, subject: &str) -> bool {
        Self::allowed_by(&self.allowed_publish_topics, subject)
    }

    /// Whether this identity may subscribe to `subject`.
    /// Empty allow-list denies everything.
    pub fn allows_subscribe(&self, subject: &str) -> bool {
        Self::allowed_by(&self.allowed_subscribe_topics, subject)
    }

    fn allowed_by(patterns: &[String], subject: &str) -> bool {
        patterns.iter().any(|p| matches(p, subject))
    }
}

/// Handshake request payload, carried inside an Auth envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub device_id: String,
    pub token: String,
    pub device_type: String,
}

/// Handshake response payload, carried inside an Auth envelope.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthResponse {
    pub success: bool,
    pub message: Option<String>,
    pub device: Option<DeviceIdentity>,
}

impl AuthResponse {
    /// Extract the response from an Auth envelope payload.
    /// Lenient: missing fields fall back to defaults (failure).
    pub fn from_envelope(envelope: &Envelope) -> Self {
        envelope
            .payload
            .clone()
            .and_then(|p| serde_json::from_value(p).ok())
            .unwrap_or_default()
    }
}

// ═════════════════════════════════════════════════════════════════════
// Tests
// ═════════════════════════════════════════════════════════════════════
