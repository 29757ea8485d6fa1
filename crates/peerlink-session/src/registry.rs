//! Channel session registry
//!
//! Owns the peer -> channel id -> session map for one signaling context,
//! keeps at most one MESSAGING session per peer, and turns session traffic
//! into [`RegistryEvent`]s for the application.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use peerlink_core::{
    ChannelKind, ChannelState, Envelope, MessageType, PeerInfo, SessionConfig,
    MESSAGING_CHANNEL_LABEL,
};

use crate::channel::{ChannelError, DataChannel};
use crate::session::{ChannelSession, SendOutcome, SessionError, SessionListener};

/// Registry errors
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("no messaging channel for peer {0}")]
    NoChannel(String),
    #[error("channel factory returned label {actual:?}, expected {expected:?}")]
    UnexpectedLabel { expected: String, actual: String },
    #[error("channel factory failed: {0}")]
    Factory(ChannelError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Text message delivered over a channel
#[derive(Clone, Debug, PartialEq)]
pub struct IncomingMessage {
    pub content: Value,
    pub is_private: bool,
    /// Arrived over a data channel rather than the signaling path
    pub is_data_channel: bool,
    pub target_peer_id: String,
    pub sender_peer_id: String,
}

/// Events from the registry
#[derive(Clone, Debug)]
pub enum RegistryEvent {
    /// A channel session changed state
    DataChannelState {
        state: ChannelState,
        peer_id: String,
        error: Option<String>,
        channel_id: String,
        channel_kind: ChannelKind,
    },
    /// A peer text message arrived
    IncomingMessage {
        message: IncomingMessage,
        peer_id: String,
        peer_info: Option<PeerInfo>,
        is_self: bool,
    },
}

struct RegistryInner {
    self_id: String,
    config: SessionConfig,
    /// Sessions by peer ID, then channel ID
    sessions: DashMap<String, HashMap<String, Arc<ChannelSession>>>,
    peer_info: DashMap<String, PeerInfo>,
    event_tx: broadcast::Sender<RegistryEvent>,
}

/// Per-context owner of all channel sessions
#[derive(Clone)]
pub struct ChannelSessionRegistry {
    inner: Arc<RegistryInner>,
}

impl ChannelSessionRegistry {
    /// Create a registry for the local peer `self_id`
    pub fn new(self_id: impl Into<String>, config: SessionConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            inner: Arc::new(RegistryInner {
                self_id: self_id.into(),
                config,
                sessions: DashMap::new(),
                peer_info: DashMap::new(),
                event_tx,
            }),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.inner.self_id
    }

    /// Subscribe to registry events
    ///
    /// Events are buffered per subscriber up to `event_capacity`. A subscriber
    /// that falls further behind loses the oldest events, including
    /// [`RegistryEvent::IncomingMessage`], and its next `recv` returns
    /// [`broadcast::error::RecvError::Lagged`] with the number skipped.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Get the peer's MESSAGING session, creating it with `factory` if needed
    ///
    /// `factory` receives the label to use and runs at most once per peer while
    /// a live MESSAGING session exists; concurrent callers get the same session.
    /// It runs under the peer's map lock and must not call back into the registry.
    pub fn ensure_messaging_session<F, C>(
        &self,
        peer_id: &str,
        factory: F,
    ) -> Result<Arc<ChannelSession>, RegistryError>
    where
        F: FnOnce(&str) -> Result<Arc<C>, ChannelError>,
        C: DataChannel + 'static,
    {
        self.get_or_insert(peer_id, MESSAGING_CHANNEL_LABEL, || {
            let channel: Arc<dyn DataChannel> =
                factory(MESSAGING_CHANNEL_LABEL).map_err(RegistryError::Factory)?;
            if channel.label() != MESSAGING_CHANNEL_LABEL {
                return Err(RegistryError::UnexpectedLabel {
                    expected: MESSAGING_CHANNEL_LABEL.to_string(),
                    actual: channel.label().to_string(),
                });
            }
            Ok(channel)
        })
    }

    /// Track a channel opened by the remote peer
    ///
    /// Stored under its own label, so DATA channels never displace the
    /// MESSAGING session. A live session with the same label is kept.
    pub fn attach_channel(
        &self,
        peer_id: &str,
        channel: Arc<dyn DataChannel>,
    ) -> Arc<ChannelSession> {
        let label = channel.label().to_string();
        match self.get_or_insert(peer_id, &label, || Ok::<_, Infallible>(channel)) {
            Ok(session) => session,
            Err(never) => match never {},
        }
    }

    fn get_or_insert<F, E>(
        &self,
        peer_id: &str,
        channel_id: &str,
        make: F,
    ) -> Result<Arc<ChannelSession>, E>
    where
        F: FnOnce() -> Result<Arc<dyn DataChannel>, E>,
    {
        let created = {
            let mut peer = self.inner.sessions.entry(peer_id.to_string()).or_default();

            match peer.get(channel_id) {
                Some(existing) if !existing.state().is_terminal() => {
                    return Ok(existing.clone());
                }
                Some(_) => debug!("Replacing closed channel {} for {}", channel_id, peer_id),
                None => {}
            }

            let channel = match make() {
                Ok(channel) => channel,
                Err(e) => {
                    drop(peer);
                    self.inner
                        .sessions
                        .remove_if(peer_id, |_, channels| channels.is_empty());
                    return Err(e);
                }
            };

            let session =
                ChannelSession::detached(peer_id, channel, self.listener(), &self.inner.config);
            peer.insert(session.id().to_string(), session.clone());
            session
        };

        // Handlers fire outside the map lock so CLOSED can re-enter the registry
        created.attach();
        Ok(created)
    }

    fn listener(&self) -> Arc<dyn SessionListener> {
        Arc::new(RegistryListener(Arc::downgrade(&self.inner)))
    }

    /// Send a text message to a peer over its MESSAGING session
    pub fn send_peer_message(
        &self,
        peer_id: &str,
        content: impl Into<Value>,
        is_private: bool,
    ) -> Result<SendOutcome, RegistryError> {
        let session = self
            .messaging_session(peer_id)
            .ok_or_else(|| RegistryError::NoChannel(peer_id.to_string()))?;

        let envelope = Envelope::message(&self.inner.self_id, peer_id, content, is_private);
        Ok(session.send(envelope)?)
    }

    /// Route an inbound envelope from `peer_id`
    pub fn handle_inbound_message(&self, peer_id: &str, envelope: Envelope) {
        self.inner.handle_inbound_message(peer_id, envelope);
    }

    /// Forget a session
    pub fn drop_session(&self, peer_id: &str, channel_id: &str) -> Option<Arc<ChannelSession>> {
        self.inner.drop_session_if(peer_id, channel_id, |_| true)
    }

    pub fn session(&self, peer_id: &str, channel_id: &str) -> Option<Arc<ChannelSession>> {
        self.inner
            .sessions
            .get(peer_id)
            .and_then(|channels| channels.get(channel_id).cloned())
    }

    pub fn messaging_session(&self, peer_id: &str) -> Option<Arc<ChannelSession>> {
        self.session(peer_id, MESSAGING_CHANNEL_LABEL)
    }

    /// All sessions for a peer
    pub fn sessions_for(&self, peer_id: &str) -> Vec<Arc<ChannelSession>> {
        self.inner
            .sessions
            .get(peer_id)
            .map(|channels| channels.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.inner.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Total sessions across all peers
    pub fn session_count(&self) -> usize {
        self.inner.sessions.iter().map(|e| e.value().len()).sum()
    }

    pub fn set_peer_info(&self, peer_id: &str, info: PeerInfo) {
        self.inner.peer_info.insert(peer_id.to_string(), info);
    }

    pub fn remove_peer_info(&self, peer_id: &str) -> Option<PeerInfo> {
        self.inner.peer_info.remove(peer_id).map(|(_, info)| info)
    }

    /// Disconnect every session of a peer and forget the peer
    pub fn close_peer(&self, peer_id: &str) {
        let Some((_, channels)) = self.inner.sessions.remove(peer_id) else {
            return;
        };
        self.inner.peer_info.remove(peer_id);

        info!("Closing {} channel(s) for peer {}", channels.len(), peer_id);
        for session in channels.into_values() {
            session.disconnect();
        }
    }

    /// Disconnect everything
    pub fn close_all(&self) {
        for peer_id in self.peer_ids() {
            self.close_peer(&peer_id);
        }
    }
}

impl RegistryInner {
    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    fn handle_inbound_message(&self, peer_id: &str, envelope: Envelope) {
        match envelope.kind {
            MessageType::Message => {
                debug!("Message from {} (private: {})", peer_id, envelope.is_private);
                let message = IncomingMessage {
                    content: envelope.data,
                    is_private: envelope.is_private,
                    is_data_channel: true,
                    target_peer_id: envelope.target,
                    sender_peer_id: peer_id.to_string(),
                };
                self.emit(RegistryEvent::IncomingMessage {
                    message,
                    peer_id: peer_id.to_string(),
                    peer_info: self.peer_info.get(peer_id).map(|info| info.value().clone()),
                    is_self: peer_id == self.self_id,
                });
            }
            MessageType::Other(tag) => {
                debug!("Ignoring envelope type {:?} from {}", tag, peer_id);
            }
        }
    }

    fn drop_session_if<P>(
        &self,
        peer_id: &str,
        channel_id: &str,
        predicate: P,
    ) -> Option<Arc<ChannelSession>>
    where
        P: FnOnce(&Arc<ChannelSession>) -> bool,
    {
        let removed = {
            let mut channels = self.sessions.get_mut(peer_id)?;
            let matches = channels.get(channel_id).map_or(false, predicate);
            if matches {
                channels.remove(channel_id)
            } else {
                None
            }
        };

        self.sessions
            .remove_if(peer_id, |_, channels| channels.is_empty());

        if removed.is_some() {
            debug!("Dropped channel {} for peer {}", channel_id, peer_id);
        }
        removed
    }
}

/// Session listener that forwards into the registry without keeping it alive
struct RegistryListener(Weak<RegistryInner>);

impl SessionListener for RegistryListener {
    fn on_state(&self, session: &ChannelSession, state: ChannelState, error: Option<&str>) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };

        inner.emit(RegistryEvent::DataChannelState {
            state,
            peer_id: session.peer_id().to_string(),
            error: error.map(str::to_string),
            channel_id: session.id().to_string(),
            channel_kind: session.kind(),
        });

        if state == ChannelState::Closed && inner.config.drop_closed_sessions {
            // Only drop the entry if it still refers to this session
            inner.drop_session_if(session.peer_id(), session.id(), |stored| {
                std::ptr::eq(Arc::as_ptr(stored), session)
            });
        }
    }

    fn on_peer_message(&self, session: &ChannelSession, envelope: Envelope) {
        match self.0.upgrade() {
            Some(inner) => inner.handle_inbound_message(session.peer_id(), envelope),
            None => warn!(
                "Message on channel {} after registry shutdown",
                session.id()
            ),
        }
    }
}
