//! Peerlink Core - Shared types, envelope protocol, and configuration
//!
//! This crate contains the foundational types used by the peerlink session layer.
//! It has no dependencies on any channel primitive or async runtime.

pub mod config;
pub mod error;
pub mod protocol;
pub mod types;

pub use config::{ConfigError, SessionConfig};
pub use error::*;
pub use protocol::*;
pub use types::*;

/// Label of the durable peer-to-peer messaging channel
pub const MESSAGING_CHANNEL_LABEL: &str = "main";

/// Default settling delay for channels that report open before they are usable (ms)
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 500;

/// Default capacity of the session event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 64;
