//! Channel primitive abstraction
//!
//! Trait for the labelled bidirectional channel a peer connection hands us.
//! Implementations:
//! - WebRTC data channels (provided by the embedding application)
//! - LoopbackChannel (testing/demo)

use peerlink_core::ReadyState;
use thiserror::Error;

/// Errors reported by a channel primitive
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("channel not open (state {0:?})")]
    NotOpen(ReadyState),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("close failed: {0}")]
    CloseFailed(String),
    #[error("channel could not be created: {0}")]
    CreateFailed(String),
}

/// Handler for the primitive's open and close events
pub type LifecycleHandler = Box<dyn Fn() + Send + Sync>;

/// Handler for error reports and inbound text payloads
pub type PayloadHandler = Box<dyn Fn(String) + Send + Sync>;

/// A single labelled channel to one remote peer
///
/// Each `on_*` registration replaces the previous handler for that event.
/// Handlers may be invoked from any thread.
pub trait DataChannel: Send + Sync {
    /// Channel label, also used as the session id
    fn label(&self) -> &str;

    /// Current ready state of the primitive
    fn ready_state(&self) -> ReadyState;

    /// Send a text payload
    fn send(&self, data: &str) -> Result<(), ChannelError>;

    /// Begin closing; the close event fires once the primitive is closed
    fn close(&self) -> Result<(), ChannelError>;

    fn on_open(&self, handler: LifecycleHandler);

    fn on_close(&self, handler: LifecycleHandler);

    fn on_error(&self, handler: PayloadHandler);

    fn on_message(&self, handler: PayloadHandler);
}
