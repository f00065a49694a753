//! Contract for the physical real-time connection.
//!
//! The manager drives a [`Transport`] through `connect`/`disconnect`/`emit` and receives
//! everything coming the other way through the [`InboundSink`] handed over in
//! [`Transport::bind`].

pub mod error;
#[cfg(feature = "ws")]
pub mod ws;

use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::Value;

pub use error::TransportError;

use crate::credential::Credential;

/// Why the transport stopped.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The manager asked for the disconnect
    ClientRequested,
    /// The server closed the connection or the link failed
    Remote(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientRequested => write!(f, "client requested disconnect"),
            Self::Remote(reason) => write!(f, "{reason}"),
        }
    }
}

/// Everything a transport reports back: the reserved lifecycle events (`connect`,
/// `disconnect`, `reconnect_attempt`, `error`) and raw inbound events.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Connected,
    Disconnected(DisconnectReason),
    ReconnectAttempt(u32),
    Error(TransportError),
    Event { name: String, payload: Value },
}

impl Signal {
    pub fn event<S: Into<String>>(name: S, payload: Value) -> Self {
        Self::Event {
            name: name.into(),
            payload,
        }
    }
}

pub(crate) trait SignalHandler: Send + Sync {
    fn handle(&self, signal: Signal);
}

/// Where a [`Transport`] delivers inbound traffic.
///
/// Holds only a weak reference to its manager: once the manager is gone, deliveries are
/// dropped. Signals must be delivered one at a time, in the order they were received.
#[derive(Clone)]
pub struct InboundSink {
    handler: Weak<dyn SignalHandler>,
}

impl InboundSink {
    pub(crate) fn new<H: SignalHandler + 'static>(handler: &Arc<H>) -> Self {
        let handler: Weak<H> = Arc::downgrade(handler);
        Self { handler }
    }

    /// A sink that drops everything, for transports that were never bound.
    #[must_use]
    pub fn detached() -> Self {
        struct Detached;

        impl SignalHandler for Detached {
            fn handle(&self, _signal: Signal) {}
        }

        let handler: Weak<Detached> = Weak::new();
        Self { handler }
    }

    pub fn deliver(&self, signal: Signal) {
        match self.handler.upgrade() {
            Some(handler) => handler.handle(signal),
            None => {
                #[cfg(feature = "tracing")]
                tracing::trace!(?signal, "Dropping signal for a manager that is gone");
            }
        }
    }

    /// Whether the receiving manager still exists.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.handler.strong_count() > 0
    }
}

impl fmt::Debug for InboundSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundSink")
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl Default for InboundSink {
    fn default() -> Self {
        Self::detached()
    }
}

/// A single bidirectional real-time connection.
///
/// The manager never holds its own lock while calling into the transport, so implementations
/// may deliver signals synchronously from within `disconnect` or `emit`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Called once by the manager at construction.
    fn bind(&self, sink: InboundSink);

    /// Resolves once the handshake completed.
    async fn connect(&self, credential: &Credential) -> Result<(), TransportError>;

    /// Closes the connection. Idempotent.
    fn disconnect(&self);

    /// Sends an outbound event. No delivery confirmation.
    fn emit(&self, event: &str, payload: &Value);
}
