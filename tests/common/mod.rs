#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]
#![allow(
    unused,
    reason = "Not every test binary uses every helper"
)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mentara_realtime::credential::ExposeSecret as _;
use mentara_realtime::{
    Config, ConnectionManager, ConnectionState, Credential, DisconnectReason, EventCallback,
    InboundSink, ManualScheduler, ReconnectConfig, Signal, Transport, TransportError, Unsubscribe,
};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};

pub const TOKEN: &str = "session-token";

/// What the next `connect` call does.
#[derive(Debug, Clone)]
pub enum Outcome {
    Succeed,
    Fail(TransportError),
    /// Never resolves, so the manager's connect timeout fires
    Hang,
    /// Succeeds once the gate is notified
    Gated(Arc<Notify>),
}

#[derive(Default)]
struct Recorded {
    sink: Mutex<InboundSink>,
    script: Mutex<VecDeque<Outcome>>,
    tokens: Mutex<Vec<String>>,
    disconnects: AtomicUsize,
    emitted: Mutex<Vec<(String, Value)>>,
}

/// In-memory [`Transport`] that records every call and lets tests inject signals.
#[derive(Clone, Default)]
pub struct MockTransport {
    recorded: Arc<Recorded>,
}

impl MockTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues outcomes for upcoming `connect` calls. Once drained, connects succeed.
    pub fn script<I: IntoIterator<Item = Outcome>>(&self, outcomes: I) {
        self.recorded.script.lock().unwrap().extend(outcomes);
    }

    pub fn fail_next(&self, count: usize, error: &TransportError) {
        self.script((0..count).map(|_| Outcome::Fail(error.clone())));
    }

    #[must_use]
    pub fn connects(&self) -> usize {
        self.recorded.tokens.lock().unwrap().len()
    }

    /// Tokens presented on every `connect`, in order.
    #[must_use]
    pub fn tokens(&self) -> Vec<String> {
        self.recorded.tokens.lock().unwrap().clone()
    }

    #[must_use]
    pub fn disconnects(&self) -> usize {
        self.recorded.disconnects.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn emitted(&self) -> Vec<(String, Value)> {
        self.recorded.emitted.lock().unwrap().clone()
    }

    pub fn deliver(&self, signal: Signal) {
        let sink = self.recorded.sink.lock().unwrap().clone();
        sink.deliver(signal);
    }

    pub fn inbound(&self, event: &str, payload: Value) {
        self.deliver(Signal::event(event, payload));
    }

    pub fn drop_connection(&self, reason: &str) {
        self.deliver(Signal::Disconnected(DisconnectReason::Remote(
            reason.to_owned(),
        )));
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn bind(&self, sink: InboundSink) {
        *self.recorded.sink.lock().unwrap() = sink;
    }

    async fn connect(&self, credential: &Credential) -> Result<(), TransportError> {
        self.recorded
            .tokens
            .lock()
            .unwrap()
            .push(credential.token().expose_secret().to_owned());

        let outcome = self
            .recorded
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Succeed);
        match outcome {
            Outcome::Succeed => Ok(()),
            Outcome::Fail(error) => Err(error),
            Outcome::Hang => futures::future::pending().await,
            Outcome::Gated(gate) => {
                gate.notified().await;
                Ok(())
            }
        }
    }

    fn disconnect(&self) {
        self.recorded.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn emit(&self, event: &str, payload: &Value) {
        self.recorded
            .emitted
            .lock()
            .unwrap()
            .push((event.to_owned(), payload.clone()));
    }
}

#[must_use]
pub fn credential() -> Credential {
    Credential::new(TOKEN)
}

/// Backoff ceilings of 100, 200, 400 and then 800 ms.
#[must_use]
pub fn fast_config(max_attempts: Option<u32>) -> Config {
    Config::builder()
        .reconnect(
            ReconnectConfig::builder()
                .maybe_max_attempts(max_attempts)
                .initial_backoff(Duration::from_millis(100))
                .max_backoff(Duration::from_millis(800))
                .build(),
        )
        .build()
}

/// A manager on a virtual clock, with the transport it drives.
#[must_use]
pub fn manager(config: Config) -> (ConnectionManager, MockTransport, ManualScheduler) {
    let transport = MockTransport::new();
    let scheduler = ManualScheduler::new();
    let manager =
        ConnectionManager::with_scheduler(transport.clone(), config, Arc::new(scheduler.clone()));
    (manager, transport, scheduler)
}

/// Subscribes `id` and runs the connect attempt.
pub async fn connected(
    manager: &ConnectionManager,
    scheduler: &ManualScheduler,
    id: &str,
) {
    manager.subscribe(id, credential()).unwrap();
    scheduler.run_due().await;
    assert!(manager.is_connected(), "expected {id} to connect");
}

#[must_use]
pub fn callback<F>(f: F) -> EventCallback
where
    F: Fn(&Value) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A callback recording every payload it receives.
#[must_use]
pub fn recorder() -> (EventCallback, Arc<Mutex<Vec<Value>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback = callback(move |payload: &Value| sink.lock().unwrap().push(payload.clone()));
    (callback, seen)
}

/// Records every connection state the manager broadcasts.
pub fn record_states(manager: &ConnectionManager) -> (Unsubscribe, Arc<Mutex<Vec<ConnectionState>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handle = manager.subscribe_to_connection_state(Arc::new(move |state: &ConnectionState| {
        sink.lock().unwrap().push(state.clone());
    }));
    (handle, seen)
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    timeout(Duration::from_secs(2), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

pub fn init_tracing() {
    drop(
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init(),
    );
}
