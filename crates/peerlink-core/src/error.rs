//! Error types for the envelope protocol

use thiserror::Error;

/// Protocol-level errors
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),
}

impl ProtocolError {
    pub(crate) fn encode(e: serde_json::Error) -> Self {
        ProtocolError::Serialization(e.to_string())
    }

    pub(crate) fn decode(e: serde_json::Error) -> Self {
        ProtocolError::Deserialization(e.to_string())
    }
}
