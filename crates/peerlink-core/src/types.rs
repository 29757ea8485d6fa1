//! Channel and peer types shared across the session layer

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::MESSAGING_CHANNEL_LABEL;

/// Role of a channel within a peer connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// The durable "main" channel used for text messaging
    Messaging,
    /// A transient channel opened for one data transfer
    Data,
}

impl ChannelKind {
    /// Derive the kind from a channel label
    pub fn from_label(label: &str) -> Self {
        if label == MESSAGING_CHANNEL_LABEL {
            ChannelKind::Messaging
        } else {
            ChannelKind::Data
        }
    }
}

/// Ready state reported by a channel primitive
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Lifecycle state of a channel session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
    /// Side-channel notification; the primitive's close event stays authoritative
    Error,
}

impl ChannelState {
    /// Position in the forward lifecycle, `None` for the error side channel
    pub fn rank(self) -> Option<u8> {
        match self {
            ChannelState::Connecting => Some(0),
            ChannelState::Open => Some(1),
            ChannelState::Closing => Some(2),
            ChannelState::Closed => Some(3),
            ChannelState::Error => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == ChannelState::Closed
    }
}

impl From<ReadyState> for ChannelState {
    fn from(state: ReadyState) -> Self {
        match state {
            ReadyState::Connecting => ChannelState::Connecting,
            ReadyState::Open => ChannelState::Open,
            ReadyState::Closing => ChannelState::Closing,
            ReadyState::Closed => ChannelState::Closed,
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Open => "open",
            ChannelState::Closing => "closing",
            ChannelState::Closed => "closed",
            ChannelState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Application data attached to a remote peer
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// Free-form user data published by the peer
    #[serde(default)]
    pub user_data: Value,

    /// Client agent name, if advertised
    #[serde(default)]
    pub agent: Option<String>,
}

/// An in-flight data transfer riding on a channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferInfo {
    pub transfer_id: String,
    pub name: String,
    pub size: u64,
}

/// Generate a random peer ID (16 hex chars)
pub fn generate_peer_id() -> Result<String, getrandom::Error> {
    let mut bytes = [0u8; 8];
    getrandom::fill(&mut bytes)?;
    Ok(hex::encode(bytes))
}
