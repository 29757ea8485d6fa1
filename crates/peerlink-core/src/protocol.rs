//! Channel message envelope
//!
//! Every protocol message travels as the textual payload of a channel message:
//!
//! ```text
//! {"type":"message","sender":"<self>","target":"<peer>","data":<json>,"isPrivate":false}
//! ```
//!
//! Receivers ignore envelopes whose `type` they do not recognise so that newer
//! peers can extend the protocol without breaking older ones.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Wire tag for peer-to-peer text messages
pub const MSG_TYPE_MESSAGE: &str = "message";

/// Protocol type carried in the envelope `type` field
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// Peer-to-peer text message
    Message,
    /// Any tag this build does not understand
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Message => MSG_TYPE_MESSAGE,
            MessageType::Other(tag) => tag,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, MessageType::Other(_))
    }
}

impl From<String> for MessageType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            MSG_TYPE_MESSAGE => MessageType::Message,
            _ => MessageType::Other(tag),
        }
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Message => MSG_TYPE_MESSAGE.to_string(),
            MessageType::Other(tag) => tag,
        }
    }
}

/// Structured wrapper sent over a channel
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,

    /// Peer id of the sender
    #[serde(default)]
    pub sender: String,

    /// Peer id of the destination
    #[serde(default)]
    pub target: String,

    /// Arbitrary payload
    #[serde(default)]
    pub data: Value,

    #[serde(rename = "isPrivate", default)]
    pub is_private: bool,
}

impl Envelope {
    /// Create a text message envelope
    pub fn message(
        sender: impl Into<String>,
        target: impl Into<String>,
        data: impl Into<Value>,
        is_private: bool,
    ) -> Self {
        Self {
            kind: MessageType::Message,
            sender: sender.into(),
            target: target.into(),
            data: data.into(),
            is_private,
        }
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(ProtocolError::decode)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::encode)
    }
}

/// A message handed to a session for sending
///
/// Text goes out as-is; structured values are serialized to JSON.
#[derive(Clone, Debug, PartialEq)]
pub enum OutgoingMessage {
    Text(String),
    Json(Value),
    Envelope(Envelope),
}

impl OutgoingMessage {
    /// Render the wire payload
    pub fn encode(&self) -> Result<String, ProtocolError> {
        match self {
            OutgoingMessage::Text(text) => Ok(text.clone()),
            OutgoingMessage::Json(Value::String(text)) => Ok(text.clone()),
            OutgoingMessage::Json(value) => {
                serde_json::to_string(value).map_err(ProtocolError::encode)
            }
            OutgoingMessage::Envelope(envelope) => envelope.to_json(),
        }
    }
}

impl From<&str> for OutgoingMessage {
    fn from(text: &str) -> Self {
        OutgoingMessage::Text(text.to_string())
    }
}

impl From<String> for OutgoingMessage {
    fn from(text: String) -> Self {
        OutgoingMessage::Text(text)
    }
}

impl From<Value> for OutgoingMessage {
    fn from(value: Value) -> Self {
        OutgoingMessage::Json(value)
    }
}

impl From<Envelope> for OutgoingMessage {
    fn from(envelope: Envelope) -> Self {
        OutgoingMessage::Envelope(envelope)
    }
}
