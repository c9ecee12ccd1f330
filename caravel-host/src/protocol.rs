//! Wire types for the hypervisor's monitor protocol.
//!
//! The protocol is newline-delimited JSON: each direction emits one JSON
//! object per line. The peer sends exactly one greeting after the transport
//! opens, then replies to commands in submission order; asynchronous events
//! may be interleaved at any point after the greeting.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::HostError;

/// A single outbound monitor command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorRequest {
    /// Command name.
    pub execute: String,

    /// Command-defined arguments. Key sets are not validated here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Map<String, Value>>,

    /// Optional correlation id, echoed back by the peer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl MonitorRequest {
    /// Create a request with no arguments and no id.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            execute: command.into(),
            arguments: None,
            id: None,
        }
    }

    /// Attach an arguments map.
    #[must_use]
    pub fn with_arguments(mut self, arguments: Map<String, Value>) -> Self {
        self.arguments = Some(arguments);
        self
    }

    /// Attach a correlation id.
    #[must_use]
    pub fn with_id(mut self, id: Value) -> Self {
        self.id = Some(id);
        self
    }

    /// Encode as one canonical JSON object followed by a single newline.
    ///
    /// # Errors
    /// Returns the underlying `serde_json` error if serialization fails.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

/// The one-shot hello the peer emits before accepting commands.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Greeting {
    /// Greeting body, nested under the protocol marker key.
    #[serde(rename = "QMP")]
    pub qmp: GreetingBody,
}

/// Body of the greeting message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GreetingBody {
    /// Peer version information.
    pub version: VersionInfo,

    /// Capabilities advertised by the peer.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Peer version information.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VersionInfo {
    /// Numeric version of the hypervisor.
    pub qemu: VersionTriple,

    /// Distribution package string, when available.
    #[serde(default)]
    pub package: String,
}

/// Major/minor/micro version numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct VersionTriple {
    pub major: u64,
    pub minor: u64,
    pub micro: u64,
}

impl Greeting {
    /// Parse a greeting from a decoded JSON message.
    ///
    /// # Errors
    /// Returns [`HostError::InvalidResponse`] when the message carries the
    /// greeting marker but does not match the greeting shape.
    pub fn from_value(value: Value) -> Result<Self, HostError> {
        serde_json::from_value(value)
            .map_err(|e| HostError::InvalidResponse(format!("greeting: {e}")))
    }
}

/// An asynchronous event emitted by the peer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MonitorEvent {
    /// Event name (e.g. "SHUTDOWN", "DEVICE_DELETED").
    pub event: String,

    /// Event payload, when present.
    #[serde(default)]
    pub data: Option<Value>,

    /// Time the event was emitted.
    pub timestamp: EventTimestamp,
}

/// Event timestamp in seconds and microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct EventTimestamp {
    pub seconds: i64,
    pub microseconds: i64,
}

impl MonitorEvent {
    /// Parse an event from a decoded JSON message.
    ///
    /// # Errors
    /// Returns [`HostError::InvalidResponse`] when the message carries the
    /// `event` key but does not match the event shape.
    pub fn from_value(value: Value) -> Result<Self, HostError> {
        serde_json::from_value(value)
            .map_err(|e| HostError::InvalidResponse(format!("event: {e}")))
    }
}

/// A reply to a previously submitted command.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorResponse {
    /// The command succeeded; the payload may be any JSON value.
    Success {
        payload: Value,
        id: Option<Value>,
    },
    /// The peer rejected the command.
    Failure {
        class: String,
        desc: String,
        id: Option<Value>,
    },
}

impl MonitorResponse {
    /// Parse a reply from a decoded JSON message.
    ///
    /// # Errors
    /// Returns [`HostError::InvalidResponse`] when the message carries
    /// neither a `return` nor a well-formed `error` member.
    pub fn from_value(value: Value) -> Result<Self, HostError> {
        let Value::Object(mut fields) = value else {
            return Err(HostError::InvalidResponse(
                "reply is not a JSON object".to_owned(),
            ));
        };
        let id = fields.remove("id");
        if let Some(payload) = fields.remove("return") {
            return Ok(Self::Success { payload, id });
        }
        if let Some(error) = fields.remove("error") {
            let class = error
                .get("class")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    HostError::InvalidResponse("error reply missing class".to_owned())
                })?
                .to_owned();
            let desc = error
                .get("desc")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    HostError::InvalidResponse("error reply missing desc".to_owned())
                })?
                .to_owned();
            return Ok(Self::Failure { class, desc, id });
        }
        Err(HostError::InvalidResponse(
            "reply carries neither return nor error".to_owned(),
        ))
    }

    /// Convert into the command outcome: the success payload, or a
    /// [`HostError::Monitor`] carrying the peer's class and description.
    ///
    /// # Errors
    /// Returns [`HostError::Monitor`] for failure replies.
    pub fn into_result(self) -> Result<Value, HostError> {
        match self {
            Self::Success { payload, .. } => Ok(payload),
            Self::Failure { class, desc, .. } => Err(HostError::Monitor { class, desc }),
        }
    }
}

/// A `query-status` reply.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueryStatus {
    /// Guest state string (e.g. "running", "paused").
    pub status: String,

    /// Whether vCPUs are currently executing.
    pub running: bool,

    /// Whether single-step mode is active.
    pub singlestep: bool,
}

/// Structural classification of an inbound message.
///
/// Classification is by key presence, checked in a fixed order; it never
/// attempts to decode the full message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Greeting,
    Event,
    Response,
    Unknown,
}

impl MessageKind {
    /// Classify a decoded JSON message.
    #[must_use]
    pub fn classify(value: &Value) -> Self {
        if value.get("QMP").is_some() {
            Self::Greeting
        } else if value.get("event").is_some() {
            Self::Event
        } else if value.get("return").is_some() || value.get("error").is_some() {
            Self::Response
        } else {
            Self::Unknown
        }
    }
}
