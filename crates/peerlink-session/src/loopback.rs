//! In-memory channel primitive
//!
//! Two connected ends sharing one ready state. Delivery is synchronous:
//! `send` on one end invokes the other end's message handler before returning.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use peerlink_core::ReadyState;

use crate::channel::{ChannelError, DataChannel, LifecycleHandler, PayloadHandler};

type SharedLifecycle = Arc<dyn Fn() + Send + Sync>;
type SharedPayload = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    open: Option<SharedLifecycle>,
    close: Option<SharedLifecycle>,
    error: Option<SharedPayload>,
    message: Option<SharedPayload>,
}

/// One end of an in-memory channel pair
pub struct LoopbackChannel {
    label: String,
    state: Arc<Mutex<ReadyState>>,
    handlers: Mutex<Handlers>,
    remote: Mutex<Weak<LoopbackChannel>>,
    sent: Mutex<Vec<String>>,
    close_calls: AtomicUsize,
}

impl LoopbackChannel {
    /// Create a pair of connected channels, both in the connecting state
    pub fn pair(label: impl Into<String>) -> (Arc<Self>, Arc<Self>) {
        let label = label.into();
        let state = Arc::new(Mutex::new(ReadyState::Connecting));

        let a = Arc::new(Self::end(label.clone(), state.clone()));
        let b = Arc::new(Self::end(label, state));

        *a.remote.lock() = Arc::downgrade(&b);
        *b.remote.lock() = Arc::downgrade(&a);

        (a, b)
    }

    fn end(label: String, state: Arc<Mutex<ReadyState>>) -> Self {
        Self {
            label,
            state,
            handlers: Mutex::new(Handlers::default()),
            remote: Mutex::new(Weak::new()),
            sent: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
        }
    }

    fn remote(&self) -> Option<Arc<LoopbackChannel>> {
        self.remote.lock().upgrade()
    }

    /// Mark the pair open and fire both open handlers
    pub fn establish(&self) {
        *self.state.lock() = ReadyState::Open;
        self.fire_open();
        if let Some(remote) = self.remote() {
            remote.fire_open();
        }
    }

    /// Move the pair to the closing state without firing any handler
    pub fn begin_close(&self) {
        *self.state.lock() = ReadyState::Closing;
    }

    /// Report a transport error on this end without changing the ready state
    pub fn fail(&self, error: impl Into<String>) {
        let handler = self.handlers.lock().error.clone();
        if let Some(handler) = handler {
            handler(error.into());
        }
    }

    /// Payloads successfully sent from this end
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Number of times `close` was called on this end
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    fn fire_open(&self) {
        let handler = self.handlers.lock().open.clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    fn fire_close(&self) {
        let handler = self.handlers.lock().close.clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    fn deliver(&self, data: String) {
        let handler = self.handlers.lock().message.clone();
        if let Some(handler) = handler {
            handler(data);
        }
    }
}

impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ReadyState {
        *self.state.lock()
    }

    fn send(&self, data: &str) -> Result<(), ChannelError> {
        let state = self.ready_state();
        if state != ReadyState::Open {
            return Err(ChannelError::NotOpen(state));
        }

        self.sent.lock().push(data.to_string());
        if let Some(remote) = self.remote() {
            remote.deliver(data.to_string());
        }
        Ok(())
    }

    fn close(&self) -> Result<(), ChannelError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);

        {
            let mut state = self.state.lock();
            if *state == ReadyState::Closed {
                return Ok(());
            }
            *state = ReadyState::Closed;
        }

        self.fire_close();
        if let Some(remote) = self.remote() {
            remote.fire_close();
        }
        Ok(())
    }

    fn on_open(&self, handler: LifecycleHandler) {
        self.handlers.lock().open = Some(Arc::from(handler));
    }

    fn on_close(&self, handler: LifecycleHandler) {
        self.handlers.lock().close = Some(Arc::from(handler));
    }

    fn on_error(&self, handler: PayloadHandler) {
        self.handlers.lock().error = Some(Arc::from(handler));
    }

    fn on_message(&self, handler: PayloadHandler) {
        self.handlers.lock().message = Some(Arc::from(handler));
    }
}
