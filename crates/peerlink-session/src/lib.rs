//! Peerlink Session - DataChannel session protocol
//!
//! Tracks the labelled channels a peer connection opens to each remote party
//! and runs the lightweight message protocol over them.
//!
//! # Protocol
//!
//! 1. A channel is opened locally (`ensure_messaging_session`) or by the remote
//!    peer (`attach_channel`) and wrapped in a [`ChannelSession`]
//! 2. The channel labelled `"main"` is the peer's MESSAGING channel; any other
//!    label is a DATA channel for a single transfer
//! 3. Text messages travel as JSON envelopes over the MESSAGING channel
//! 4. Lifecycle changes and inbound messages surface as [`RegistryEvent`]s
//! 5. Closed sessions are dropped from the registry

pub mod channel;
pub mod loopback;
pub mod registry;
pub mod session;

pub use channel::{ChannelError, DataChannel, LifecycleHandler, PayloadHandler};
pub use loopback::LoopbackChannel;
pub use registry::{ChannelSessionRegistry, IncomingMessage, RegistryError, RegistryEvent};
pub use session::{ChannelSession, SendOutcome, SessionError, SessionListener};

pub use peerlink_core::{
    ChannelKind, ChannelState, Envelope, MessageType, PeerInfo, ReadyState, SessionConfig,
    TransferInfo, MESSAGING_CHANNEL_LABEL,
};
