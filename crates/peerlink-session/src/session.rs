//! Channel session lifecycle
//!
//! A [`ChannelSession`] adapts one [`DataChannel`] for one remote peer into a
//! typed session with an explicit lifecycle:
//!
//! ```text
//! CONNECTING -> OPEN -> CLOSING -> CLOSED
//!      \__________\________\__________ ERROR (side channel, any time before CLOSED)
//! ```
//!
//! The state only moves forward. ERROR is reported to the listener but does not
//! end the session; the primitive's own close event does.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use peerlink_core::{
    ChannelKind, ChannelState, Envelope, MessageType, OutgoingMessage, ProtocolError, ReadyState,
    SessionConfig, TransferInfo,
};

use crate::channel::{ChannelError, DataChannel};

/// Session errors
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("transfer {0} already in progress on this channel")]
    TransferInProgress(String),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Result of a send attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the primitive
    Sent,
    /// Session was not open; nothing went on the wire
    Dropped,
}

/// Observer for session lifecycle and protocol traffic
pub trait SessionListener: Send + Sync {
    /// Lifecycle notification, `error` is set for [`ChannelState::Error`]
    fn on_state(&self, session: &ChannelSession, state: ChannelState, error: Option<&str>);

    /// Inbound peer text message envelope
    fn on_peer_message(&self, session: &ChannelSession, envelope: Envelope);
}

/// Current state plus the furthest forward lifecycle state reached
struct StateCell {
    current: ChannelState,
    lifecycle: ChannelState,
}

impl StateCell {
    fn new(state: ChannelState) -> Self {
        Self {
            current: state,
            lifecycle: state,
        }
    }

    /// Apply a transition, returning false if it would move backwards
    fn advance(&mut self, next: ChannelState) -> bool {
        if self.lifecycle.is_terminal() {
            return false;
        }
        match next.rank() {
            None => {
                self.current = next;
                true
            }
            Some(rank) if Some(rank) > self.lifecycle.rank() => {
                self.current = next;
                self.lifecycle = next;
                true
            }
            Some(_) => false,
        }
    }
}

/// A typed session over one channel to one peer
pub struct ChannelSession {
    id: String,
    peer_id: String,
    kind: ChannelKind,
    state: Mutex<StateCell>,
    pending_transfer: Mutex<Option<TransferInfo>>,
    channel: Arc<dyn DataChannel>,
    listener: Arc<dyn SessionListener>,
    settle_delay: Duration,
}

impl ChannelSession {
    /// Wrap a channel and start observing it
    ///
    /// The initial state follows the primitive's ready state. A primitive that
    /// is already open is reported OPEN after [`SessionConfig::settle_delay`];
    /// that timer runs on the current tokio runtime, or on a dedicated thread
    /// when called outside one.
    pub fn new(
        peer_id: impl Into<String>,
        channel: Arc<dyn DataChannel>,
        listener: Arc<dyn SessionListener>,
        config: &SessionConfig,
    ) -> Arc<Self> {
        let session = Self::detached(peer_id, channel, listener, config);
        session.attach();
        session
    }

    /// Build the session without wiring handlers or notifying anyone
    pub(crate) fn detached(
        peer_id: impl Into<String>,
        channel: Arc<dyn DataChannel>,
        listener: Arc<dyn SessionListener>,
        config: &SessionConfig,
    ) -> Arc<Self> {
        let id = channel.label().to_string();
        let kind = ChannelKind::from_label(&id);
        let initial = match channel.ready_state() {
            // Reported OPEN only once the settling delay has passed
            ReadyState::Open => ChannelState::Connecting,
            other => ChannelState::from(other),
        };

        Arc::new(Self {
            id,
            peer_id: peer_id.into(),
            kind,
            state: Mutex::new(StateCell::new(initial)),
            pending_transfer: Mutex::new(None),
            channel,
            listener,
            settle_delay: config.settle_delay(),
        })
    }

    /// Register primitive handlers and publish the initial state
    pub(crate) fn attach(self: &Arc<Self>) {
        info!(
            "Channel session started: {} ({:?}) for peer {}",
            self.id, self.kind, self.peer_id
        );

        let weak = Arc::downgrade(self);
        self.channel.on_error(Box::new(move |error: String| {
            if let Some(session) = weak.upgrade() {
                session.handle_error(&error);
            }
        }));

        let weak = Arc::downgrade(self);
        self.channel.on_close(Box::new(move || {
            if let Some(session) = weak.upgrade() {
                session.transition(ChannelState::Closed, None);
            }
        }));

        let weak = Arc::downgrade(self);
        self.channel.on_message(Box::new(move |payload: String| {
            if let Some(session) = weak.upgrade() {
                session.handle_payload(&payload);
            }
        }));

        let ready = self.channel.ready_state();
        if ready == ReadyState::Open {
            self.schedule_settled_open();
        } else {
            let weak = Arc::downgrade(self);
            self.channel.on_open(Box::new(move || {
                if let Some(session) = weak.upgrade() {
                    session.transition(ChannelState::Open, None);
                }
            }));
            self.listener.on_state(self, ChannelState::from(ready), None);
        }
    }

    fn schedule_settled_open(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let delay = self.settle_delay;
        debug!("Channel {} already open, settling for {:?}", self.id, delay);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    settle(weak);
                });
            }
            Err(_) => {
                debug!("No tokio runtime, settling channel {} on a thread", self.id);
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    settle(weak);
                });
            }
        }
    }

    /// Channel label
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn state(&self) -> ChannelState {
        self.state.lock().current
    }

    /// Ready state of the underlying primitive
    pub fn ready_state(&self) -> ReadyState {
        self.channel.ready_state()
    }

    /// Whether the lifecycle has reached OPEN and not yet started closing
    ///
    /// An ERROR notification does not change this; only the close event does.
    pub fn is_open(&self) -> bool {
        self.state.lock().lifecycle == ChannelState::Open
    }

    /// Send a message if the session is open
    ///
    /// Sends on a session that is not open are dropped and logged, not failed.
    pub fn send(&self, message: impl Into<OutgoingMessage>) -> Result<SendOutcome, SessionError> {
        let lifecycle = self.state.lock().lifecycle;
        if lifecycle != ChannelState::Open {
            warn!(
                "Dropping send on channel {} to {}: state is {}",
                self.id, self.peer_id, lifecycle
            );
            return Ok(SendOutcome::Dropped);
        }

        let payload = message.into().encode()?;
        self.channel.send(&payload)?;
        Ok(SendOutcome::Sent)
    }

    /// Close the channel
    ///
    /// Listeners see CLOSING immediately and CLOSED once the primitive closes.
    /// Calling this on a closing or closed session does nothing.
    pub fn disconnect(&self) {
        {
            let mut cell = self.state.lock();
            if matches!(cell.lifecycle, ChannelState::Closing | ChannelState::Closed) {
                debug!(
                    "Dropping disconnect on channel {} to {}: already {}",
                    self.id, self.peer_id, cell.lifecycle
                );
                return;
            }
            cell.advance(ChannelState::Closing);
        }

        info!("Closing channel {} to {}", self.id, self.peer_id);
        self.listener.on_state(self, ChannelState::Closing, None);

        if let Err(e) = self.channel.close() {
            warn!("Channel {} close failed: {}", self.id, e);
        }
    }

    /// Claim the transfer slot for this channel
    pub fn begin_transfer(&self, transfer: TransferInfo) -> Result<(), SessionError> {
        let mut slot = self.pending_transfer.lock();
        if let Some(current) = slot.as_ref() {
            return Err(SessionError::TransferInProgress(current.transfer_id.clone()));
        }
        debug!("Transfer {} started on {}", transfer.transfer_id, self.id);
        *slot = Some(transfer);
        Ok(())
    }

    /// Release the transfer slot
    pub fn finish_transfer(&self) -> Option<TransferInfo> {
        self.pending_transfer.lock().take()
    }

    pub fn pending_transfer(&self) -> Option<TransferInfo> {
        self.pending_transfer.lock().clone()
    }

    fn transition(&self, next: ChannelState, error: Option<&str>) {
        let accepted = self.state.lock().advance(next);
        if !accepted {
            debug!("Channel {} ignoring late {} transition", self.id, next);
            return;
        }

        debug!("Channel {} to {} is now {}", self.id, self.peer_id, next);
        self.listener.on_state(self, next, error);
    }

    fn handle_error(&self, error: &str) {
        warn!("Channel {} to {} reported error: {}", self.id, self.peer_id, error);
        self.transition(ChannelState::Error, Some(error));
    }

    fn handle_payload(&self, payload: &str) {
        let envelope = match Envelope::from_json(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Discarding malformed payload on {}: {}", self.id, e);
                return;
            }
        };

        match envelope.kind {
            MessageType::Message => self.listener.on_peer_message(self, envelope),
            MessageType::Other(ref tag) => {
                debug!("Ignoring envelope type {:?} on {}", tag, self.id);
            }
        }
    }
}

fn settle(session: Weak<ChannelSession>) {
    if let Some(session) = session.upgrade() {
        session.transition(ChannelState::Open, None);
    }
}

impl std::fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSession")
            .field("id", &self.id)
            .field("peer_id", &self.peer_id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}
