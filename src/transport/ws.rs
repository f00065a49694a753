//! [`Transport`] over a WebSocket, speaking a JSON `{"event", "data"}` envelope.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use futures::{SinkExt as _, StreamExt as _};
use secrecy::ExposeSecret as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{DisconnectReason, InboundSink, Signal, Transport, TransportError};
use crate::Result;
use crate::credential::Credential;
use crate::error::Error;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_HEARTBEAT_TIMEOUT_DURATION: Duration = Duration::from_secs(15);

/// Configuration for [`WsTransport`].
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct WsConfig {
    /// Interval between WebSocket pings
    #[builder(default = DEFAULT_HEARTBEAT_INTERVAL_DURATION)]
    pub heartbeat_interval: Duration,
    /// Maximum silence from the server before the session is considered dead
    #[builder(default = DEFAULT_HEARTBEAT_TIMEOUT_DURATION)]
    pub heartbeat_timeout: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Serialize)]
struct OutboundEnvelope<'a> {
    event: &'a str,
    data: &'a Value,
}

struct Session {
    id: u64,
    outbound: mpsc::UnboundedSender<Message>,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct Shared {
    sink: OnceLock<InboundSink>,
    session: Mutex<Option<Session>>,
    next_session: AtomicU64,
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, signal: Signal) {
        match self.sink.get() {
            Some(sink) => sink.deliver(signal),
            None => {
                #[cfg(feature = "tracing")]
                tracing::trace!(?signal, "Transport not bound, dropping signal");
            }
        }
    }

    /// Forgets session `id` if it is still the current one. Returns whether it was.
    fn retire(&self, id: u64) -> bool {
        let mut session = self.session();
        if session.as_ref().is_some_and(|current| current.id == id) {
            *session = None;
            true
        } else {
            false
        }
    }
}

/// WebSocket [`Transport`] built on `tokio-tungstenite`.
///
/// The credential is presented as an `Authorization: Bearer` header on the upgrade request.
/// Every `connect` opens a fresh session and closes the previous one.
pub struct WsTransport {
    endpoint: Url,
    config: WsConfig,
    shared: Arc<Shared>,
}

impl WsTransport {
    /// Fails if `endpoint` is not a `ws://` or `wss://` URL.
    pub fn new(endpoint: &str, config: WsConfig) -> Result<Self> {
        let endpoint = Url::parse(endpoint)?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(Error::validation(format!(
                "unsupported scheme `{}`, expected ws or wss",
                endpoint.scheme()
            )));
        }

        Ok(Self {
            endpoint,
            config,
            shared: Arc::default(),
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Whether a session is currently open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.session().is_some()
    }
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("endpoint", &self.endpoint.as_str())
            .field("config", &self.config)
            .field("open", &self.is_open())
            .finish()
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn bind(&self, sink: InboundSink) {
        if self.shared.sink.set(sink).is_err() {
            #[cfg(feature = "tracing")]
            tracing::warn!("Transport is already bound, ignoring");
        }
    }

    async fn connect(&self, credential: &Credential) -> std::result::Result<(), TransportError> {
        let mut request = self.endpoint.as_str().into_client_request()?;
        let authorization =
            HeaderValue::from_str(&format!("Bearer {}", credential.token().expose_secret()))
                .map_err(|e| TransportError::auth(format!("unusable credential: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, authorization);

        #[cfg(feature = "tracing")]
        tracing::debug!(endpoint = %self.endpoint, "Opening WebSocket");
        let (stream, _response) = connect_async(request).await?;

        let id = self.shared.next_session.fetch_add(1, Ordering::Relaxed);
        let shutdown = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let previous = self.shared.session().replace(Session {
            id,
            outbound: outbound_tx,
            shutdown: shutdown.clone(),
        });
        if let Some(previous) = previous {
            previous.shutdown.cancel();
        }

        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        tokio::spawn(async move {
            run_session(id, stream, outbound_rx, shutdown, &config, &shared).await;
        });

        Ok(())
    }

    fn disconnect(&self) {
        if let Some(session) = self.shared.session().take() {
            #[cfg(feature = "tracing")]
            tracing::debug!(session = session.id, "Closing WebSocket");
            session.shutdown.cancel();
        }
    }

    fn emit(&self, event: &str, payload: &Value) {
        let text = match serde_json::to_string(&OutboundEnvelope {
            event,
            data: payload,
        }) {
            Ok(text) => text,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(event, error = %e, "Unable to encode outbound event");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                return;
            }
        };

        let sent = self
            .shared
            .session()
            .as_ref()
            .is_some_and(|session| session.outbound.send(Message::Text(text.into())).is_ok());
        if !sent {
            #[cfg(feature = "tracing")]
            tracing::warn!(event, "No open WebSocket session, dropping outbound event");
        }
    }
}

fn decode(text: &str) -> Signal {
    match serde_json::from_str::<Envelope>(text) {
        Ok(Envelope { event, data }) => Signal::event(event, data),
        Err(e) => Signal::Error(TransportError::protocol(format!(
            "invalid event envelope: {e}"
        ))),
    }
}

/// Pumps one WebSocket session until it is closed locally or by the server.
async fn run_session(
    id: u64,
    stream: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    shutdown: CancellationToken,
    config: &WsConfig,
    shared: &Shared,
) {
    let (mut write, mut read) = stream.split();
    let mut heartbeat = interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    let reason = loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                _ = write.send(Message::Close(None)).await;
                return;
            }

            frame = read.next() => match frame {
                Some(Ok(message)) => {
                    last_seen = Instant::now();
                    match message {
                        Message::Text(text) => {
                            #[cfg(feature = "tracing")]
                            tracing::trace!(text = text.as_str(), "Received WebSocket text message");
                            shared.deliver(decode(text.as_str()));
                        }
                        Message::Close(frame) => {
                            break frame.map_or_else(
                                || "server closed the connection".to_owned(),
                                |frame| format!("server closed the connection: {}", frame.reason.as_str()),
                            );
                        }
                        _ => {
                            // Pings are answered by tungstenite; pongs and binary frames only
                            // count as liveness.
                        }
                    }
                }
                Some(Err(e)) => break e.to_string(),
                None => break "connection closed".to_owned(),
            },

            Some(message) = outbound.recv() => {
                if let Err(e) = write.send(message).await {
                    break e.to_string();
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > config.heartbeat_timeout {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        "Heartbeat timeout: nothing received within {:?}",
                        config.heartbeat_timeout
                    );
                    break format!("no frame received within {:?}", config.heartbeat_timeout);
                }
                if let Err(e) = write.send(Message::Ping(Vec::new().into())).await {
                    break e.to_string();
                }
            }
        }
    };

    // A session replaced by a newer connect or closed by `disconnect` reports nothing.
    if shared.retire(id) && !shutdown.is_cancelled() {
        #[cfg(feature = "tracing")]
        tracing::debug!(session = id, %reason, "WebSocket closed remotely");
        shared.deliver(Signal::Disconnected(DisconnectReason::Remote(reason)));
    }
}
