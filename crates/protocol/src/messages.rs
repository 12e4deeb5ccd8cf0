//! RPC envelope definitions.
//!
//! Every frame on a negotiated channel carries one JSON-encoded [`Envelope`].
//! The `tag` names the payload's logical type; the receiving side looks it up
//! in its handler registry. Requests carry a correlation id that the matching
//! response or failure echoes back.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Reserved tag for the reverse port advertisement.
pub const REVERSE_PORT_TAG: &str = "$reverse-port";

/// Prefix reserved for control tags.
pub const CONTROL_TAG_PREFIX: char = '$';

/// What an envelope is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// Fire-and-forget; no reply expected.
    Command,
    /// Expects a `Response` or `Failure` with the same correlation id.
    Request,
    /// Successful reply to a request.
    Response,
    /// Failed reply to a request.
    Failure,
}

/// The framed unit of the RPC protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version for compatibility checking.
    pub version: u8,
    /// Logical type of the payload.
    pub tag: String,
    pub kind: EnvelopeKind,
    /// Present on requests and on their replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<u64>,
    /// The serialized object.
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    fn new(tag: impl Into<String>, kind: EnvelopeKind, correlation_id: Option<u64>, payload: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            tag: tag.into(),
            kind,
            correlation_id,
            payload,
        }
    }

    /// Builds a fire-and-forget command.
    pub fn command<T: Serialize>(tag: impl Into<String>, payload: &T) -> Result<Self> {
        Ok(Self::new(tag, EnvelopeKind::Command, None, to_value(payload)?))
    }

    /// Builds a request expecting a reply correlated by `id`.
    pub fn request<T: Serialize>(tag: impl Into<String>, id: u64, payload: &T) -> Result<Self> {
        Ok(Self::new(tag, EnvelopeKind::Request, Some(id), to_value(payload)?))
    }

    /// Builds the successful reply to a request.
    pub fn response<T: Serialize>(tag: impl Into<String>, id: u64, payload: &T) -> Result<Self> {
        Ok(Self::new(tag, EnvelopeKind::Response, Some(id), to_value(payload)?))
    }

    /// Builds the failed reply to a request.
    pub fn failure(tag: impl Into<String>, id: u64, reason: &FailureReason) -> Result<Self> {
        Ok(Self::new(tag, EnvelopeKind::Failure, Some(id), to_value(reason)?))
    }

    /// Builds the reverse port advertisement.
    pub fn reverse_port(port: u16) -> Result<Self> {
        Self::command(REVERSE_PORT_TAG, &ReversePort { port })
    }

    /// True for reserved control tags.
    pub fn is_control(&self) -> bool {
        self.tag.starts_with(CONTROL_TAG_PREFIX)
    }

    /// Deserializes the payload.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.payload).map_err(ProtocolError::from)
    }

    /// Serializes to JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parses JSON bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(ProtocolError::Deserialization(format!(
                "unsupported protocol version {} (expected {})",
                envelope.version, PROTOCOL_VERSION
            )));
        }
        Ok(envelope)
    }
}

fn to_value<T: Serialize>(payload: &T) -> Result<Value> {
    serde_json::to_value(payload).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Payload of the reverse port advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReversePort {
    /// Port of the advertising peer's own listener.
    pub port: u16,
}

/// Payload of a failure reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub code: FailureCode,
    /// Human-readable message.
    pub message: String,
}

impl FailureReason {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Why a request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    /// No handler registered for the tag.
    UnknownTag,
    /// The payload did not deserialize to the handler's type.
    InvalidPayload,
    /// The handler returned an error.
    HandlerFailed,
}
