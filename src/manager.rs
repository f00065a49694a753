#![expect(
    clippy::module_name_repetitions,
    reason = "Manager types expose their domain in the name for clarity"
)]

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_stream::stream;
use chrono::Utc;
use futures::{FutureExt as _, Stream};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use crate::Result;
use crate::bus::fan_out;
use crate::config::Config;
use crate::credential::Credential;
use crate::error::Error;
use crate::reconnect::{Phase, ReconnectPlan, Reconnector, Retry};
use crate::registry::{EventCallback, SubscriberRegistry, Transition};
use crate::scheduler::{Scheduler, Task, TokioScheduler};
use crate::scope::SubscriberGuard;
use crate::state::{ConnectionState, ConnectionStateStore, StateObserver};
use crate::transport::{
    DisconnectReason, InboundSink, Signal, SignalHandler, Transport, TransportError,
};

/// Server event reporting that the credential was rejected mid-session.
pub const AUTH_ERROR_EVENT: &str = "auth_error";
/// Server event reporting that this user holds too many connections.
pub const CONNECTION_LIMIT_EXCEEDED_EVENT: &str = "connection_limit_exceeded";
/// Server event reporting that a server-side room subscription failed.
pub const SUBSCRIPTION_ERROR_EVENT: &str = "subscription_error";

const MAX_RETRIES_MESSAGE: &str =
    "Max retry attempts reached. Please check your connection and retry.";

/// Handle returned by every registration. Calling [`Unsubscribe::unsubscribe`] removes exactly
/// that registration; dropping the handle leaves it in place.
#[must_use = "dropping the handle keeps the registration alive, call `unsubscribe` to remove it"]
pub struct Unsubscribe {
    action: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Unsubscribe {
    fn new<F>(action: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            action: Some(Box::new(action)),
        }
    }

    /// A handle for a registration that was refused.
    fn inert() -> Self {
        Self { action: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }

    /// Whether the registration this handle was returned for was refused.
    #[must_use]
    pub fn is_inert(&self) -> bool {
        self.action.is_none()
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("inert", &self.is_inert())
            .finish()
    }
}

/// Unregisters on drop; ties an event registration to the lifetime of a stream.
struct UnsubscribeOnDrop(Option<Unsubscribe>);

impl Drop for UnsubscribeOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.unsubscribe();
        }
    }
}

struct State {
    registry: SubscriberRegistry,
    reconnector: Reconnector,
    /// Most recently supplied credential, used by every attempt
    credential: Option<Credential>,
}

struct Inner {
    me: Weak<Inner>,
    state: Mutex<State>,
    config: Config,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    store: ConnectionStateStore,
}

/// Shares one [`Transport`] between any number of independent features.
///
/// The manager keeps the transport connected exactly while at least one subscriber is
/// registered, reconnects with jittered exponential backoff after unexpected disconnects, fans
/// inbound events out to the callbacks features registered, and publishes a single
/// [`ConnectionState`].
///
/// It is a cheap handle: clone it and pass it to every feature that needs the connection.
///
/// # Example
///
/// ```ignore
/// let manager = ConnectionManager::new(WsTransport::new(endpoint, WsConfig::default())?, Config::default());
///
/// manager.subscribe("chat", Credential::new(token))?;
/// let handle = manager.subscribe_to_event("chat", "message", Arc::new(|payload| {
///     println!("new message: {payload}");
/// }));
///
/// // later
/// handle.unsubscribe();
/// manager.unsubscribe("chat");
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager whose deferred work runs on the tokio runtime.
    pub fn new<T: Transport>(transport: T, config: Config) -> Self {
        Self::with_scheduler(transport, config, Arc::new(TokioScheduler))
    }

    /// Create a manager with an explicit [`Scheduler`], e.g. a
    /// [`ManualScheduler`](crate::scheduler::ManualScheduler) in tests.
    pub fn with_scheduler<T: Transport>(
        transport: T,
        config: Config,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let inner = Arc::new_cyclic(|me| Inner {
            me: me.clone(),
            state: Mutex::new(State {
                registry: SubscriberRegistry::default(),
                reconnector: Reconnector::new(&config.reconnect),
                credential: None,
            }),
            config,
            transport: Arc::clone(&transport),
            scheduler,
            store: ConnectionStateStore::default(),
        });
        transport.bind(InboundSink::new(&inner));

        Self { inner }
    }

    /// Registers interest in the connection on behalf of `subscriber_id`.
    ///
    /// The first subscriber causes a connect attempt to be issued with `credential`. Later
    /// calls only record the credential for future attempts, unless the manager is idle with
    /// subscribers present (after an auth failure or exhausted retries), in which case a new
    /// attempt is issued. Calling this twice with the same id registers it once.
    ///
    /// Returns as soon as the attempt is issued; watch [`Self::subscribe_to_connection_state`]
    /// for the outcome.
    pub fn subscribe(&self, subscriber_id: &str, credential: Credential) -> Result<()> {
        if subscriber_id.is_empty() {
            return Err(Error::validation("subscriber id must not be empty"));
        }
        credential.validate()?;

        {
            let mut state = self.inner.lock();
            let transition = state.registry.add(subscriber_id);
            state.credential = Some(credential);

            #[cfg(feature = "tracing")]
            tracing::debug!(
                subscriber_id,
                first = transition == Transition::Opened,
                live = state.registry.live_count(),
                "Subscriber registered"
            );
            #[cfg(not(feature = "tracing"))]
            let _ = transition;

            if state.reconnector.phase() == Phase::Idle {
                self.inner.issue_attempt(&mut state);
            }
        }

        self.inner.store.flush();
        Ok(())
    }

    /// Removes `subscriber_id` and every event callback it registered. When it was the last
    /// subscriber, the transport is disconnected and any pending reconnect is cancelled. If a
    /// connect is in flight at that moment, the transport is closed once it resolves instead.
    pub fn unsubscribe(&self, subscriber_id: &str) {
        let disconnect = {
            let mut state = self.inner.lock();
            let closed = state.registry.remove(subscriber_id) == Transition::Closed;
            // A connect still in flight closes whatever it opened once it resolves.
            let in_flight = state.reconnector.is_connecting();
            if closed {
                state.reconnector.stop();
                self.inner.stage(&state, |s| s.error = None);
            }
            closed && !in_flight
        };

        if disconnect {
            #[cfg(feature = "tracing")]
            tracing::debug!("Last subscriber left, closing transport");
            self.inner.transport.disconnect();
        }
        self.inner.store.flush();
    }

    /// Invokes `callback` for every `event` received from now on, until the returned handle is
    /// used or the subscriber unsubscribes.
    ///
    /// If `subscriber_id` is not subscribed the registration is refused and logged, and the
    /// returned handle is inert.
    pub fn subscribe_to_event(
        &self,
        subscriber_id: &str,
        event: &str,
        callback: EventCallback,
    ) -> Unsubscribe {
        let registered = self
            .inner
            .lock()
            .registry
            .register(subscriber_id, event, callback);

        let Some(id) = registered else {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                subscriber_id,
                event,
                "Event registration for a subscriber that is not subscribed, ignoring"
            );
            return Unsubscribe::inert();
        };

        let me = Arc::downgrade(&self.inner);
        let event = event.to_owned();
        Unsubscribe::new(move || {
            if let Some(inner) = me.upgrade() {
                inner.lock().registry.unregister(&event, id);
            }
        })
    }

    /// Payloads of `event` as a stream. The registration lasts until the stream is dropped or
    /// the subscriber unsubscribes, at which point the stream ends.
    pub fn event_stream(
        &self,
        subscriber_id: &str,
        event: &str,
    ) -> impl Stream<Item = Value> + Send + 'static {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback: EventCallback = Arc::new(move |payload: &Value| {
            _ = tx.send(payload.clone());
        });
        let registration =
            UnsubscribeOnDrop(Some(self.subscribe_to_event(subscriber_id, event, callback)));

        stream! {
            let _registration = registration;
            while let Some(payload) = rx.recv().await {
                yield payload;
            }
        }
    }

    /// Sends `event` if connected. Otherwise the event is dropped with a warning; this is not a
    /// connection error and does not touch [`ConnectionState::error`].
    pub fn emit(&self, event: &str, payload: &Value) {
        if !self.is_connected() {
            #[cfg(feature = "tracing")]
            tracing::warn!(event, "Cannot emit event while disconnected, dropping");
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(event, "Emitting event");
        self.inner.transport.emit(event, payload);
    }

    /// Skips any backoff wait and attempts to connect right away.
    ///
    /// Does nothing while connected, while an attempt is in flight, or without subscribers.
    /// Clears an auth halt. A failed manual attempt still counts toward backoff growth.
    pub fn reconnect(&self) -> Result<()> {
        {
            let mut state = self.inner.lock();
            if state.registry.live_count() == 0 {
                #[cfg(feature = "tracing")]
                tracing::debug!("Reconnect requested without subscribers, ignoring");
                return Ok(());
            }
            match state.reconnector.phase() {
                Phase::Connected | Phase::Attempting => return Ok(()),
                Phase::Idle | Phase::Scheduled => {}
            }

            let credential = state
                .credential
                .as_ref()
                .ok_or_else(|| Error::validation("no credential available to reconnect with"))?;
            credential.validate()?;

            #[cfg(feature = "tracing")]
            tracing::debug!(
                retry_count = state.reconnector.retry_count(),
                "Manual reconnect"
            );
            self.inner.issue_attempt(&mut state);
        }

        self.inner.store.flush();
        Ok(())
    }

    /// Replaces the credential used by the next attempt without forcing one.
    pub fn set_credential(&self, credential: Credential) -> Result<()> {
        credential.validate()?;
        self.inner.lock().credential = Some(credential);
        Ok(())
    }

    /// Calls `observer` with a full copy of the state on every change.
    pub fn subscribe_to_connection_state(&self, observer: StateObserver) -> Unsubscribe {
        let id = self.inner.store.observe(observer);
        let me = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = me.upgrade() {
                inner.store.unobserve(id);
            }
        })
    }

    /// Latest-value view of the state for async consumers. Intermediate states may be skipped;
    /// use [`Self::subscribe_to_connection_state`] to see every change.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.store.receiver()
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.store.snapshot()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.phase() == Phase::Connected
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.inner.lock().reconnector.phase()
    }

    #[must_use]
    pub fn reconnect_plan(&self) -> Option<ReconnectPlan> {
        self.inner.lock().reconnector.plan().cloned()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().registry.live_count()
    }

    #[must_use]
    pub fn is_subscribed(&self, subscriber_id: &str) -> bool {
        self.inner.lock().registry.contains(subscriber_id)
    }

    /// Subscribes and returns a guard that unsubscribes when dropped.
    pub fn acquire(&self, subscriber_id: &str, credential: Credential) -> Result<SubscriberGuard> {
        self.subscribe(subscriber_id, credential)?;
        Ok(SubscriberGuard::new(self.clone(), subscriber_id.to_owned()))
    }

    /// Removes every subscriber, cancels any reconnect and closes the transport.
    pub fn shutdown(&self) {
        let disconnect = {
            let mut state = self.inner.lock();
            let removed = state.registry.clear();
            let in_flight = state.reconnector.is_connecting();
            state.reconnector.stop();
            self.inner.stage(&state, |s| s.error = None);
            !removed.is_empty() && !in_flight
        };

        if disconnect {
            self.inner.transport.disconnect();
        }
        self.inner.store.flush();
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("ConnectionManager")
            .field("phase", &state.reconnector.phase())
            .field("subscribers", &state.registry.live_count())
            .finish_non_exhaustive()
    }
}

fn server_message<'payload>(payload: &'payload Value, fallback: &'payload str) -> &'payload str {
    payload
        .get("message")
        .or_else(|| payload.get("error"))
        .and_then(Value::as_str)
        .unwrap_or(fallback)
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        // No user code runs under this lock, so a poisoned guard still holds consistent state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stages a state change with the derived fields brought in line with the reconnector.
    fn stage<F>(&self, state: &State, update: F)
    where
        F: FnOnce(&mut ConnectionState),
    {
        let connected = state.reconnector.phase() == Phase::Connected;
        let reconnecting = state.reconnector.is_reconnecting();
        let retry_count = state.reconnector.retry_count();

        self.store.stage(|s| {
            s.is_connected = connected;
            s.is_reconnecting = reconnecting;
            s.retry_count = retry_count;
            update(s);
        });
    }

    fn issue_attempt(&self, state: &mut State) {
        let generation = state.reconnector.attempt_now();
        let token = self
            .scheduler
            .after(Duration::ZERO, Self::attempt(self.me.clone(), generation));
        state.reconnector.set_pending(token);
        self.stage(state, |s| s.error = None);
    }

    fn schedule_retry(&self, state: &mut State, failed: bool, error: String) {
        match state.reconnector.retry(failed) {
            Retry::After { delay, generation } => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    ?delay,
                    retry_count = state.reconnector.retry_count(),
                    "Scheduling reconnect"
                );
                let token = self
                    .scheduler
                    .after(delay, Self::attempt(self.me.clone(), generation));
                state.reconnector.set_pending(token);
                self.stage(state, |s| s.error = Some(error));
            }
            Retry::Exhausted => {
                #[cfg(feature = "tracing")]
                tracing::warn!(last_error = %error, "Giving up reconnecting");
                self.stage(state, |s| s.error = Some(MAX_RETRIES_MESSAGE.to_owned()));
            }
        }
    }

    fn attempt(me: Weak<Self>, generation: u64) -> Task {
        async move {
            let Some(inner) = me.upgrade() else {
                return;
            };

            let credential = {
                let mut state = inner.lock();
                if !state.reconnector.enter(generation) {
                    return;
                }
                let Some(credential) = state.credential.clone() else {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Connect attempt without a credential, stopping");
                    state.reconnector.stop();
                    inner.stage(&state, |_| {});
                    drop(state);
                    inner.store.flush();
                    return;
                };
                inner.stage(&state, |_| {});
                credential
            };
            inner.store.flush();

            #[cfg(feature = "tracing")]
            tracing::debug!(generation, "Connecting transport");

            let connect_timeout = inner.config.connect_timeout;
            let result = match timeout(connect_timeout, inner.transport.connect(&credential)).await
            {
                Ok(result) => result,
                Err(_elapsed) => Err(TransportError::network(format!(
                    "connect timed out after {connect_timeout:?}"
                ))),
            };

            inner.finish_attempt(generation, result);
        }
        .boxed()
    }

    fn finish_attempt(&self, generation: u64, result: std::result::Result<(), TransportError>) {
        let mut disconnect = false;

        {
            let mut state = self.lock();
            if state.reconnector.is_current(generation) {
                match result {
                    Ok(()) => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!("Transport connected");
                        self.mark_connected(&mut state);
                    }
                    Err(e) if e.is_auth() => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(error = %e, "Credential rejected, not retrying");
                        state.reconnector.halt_auth();
                        self.stage(&state, |s| s.error = Some(e.to_string()));
                        disconnect = true;
                    }
                    Err(e) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(error = %e, "Connect attempt failed");
                        self.schedule_retry(&mut state, true, e.to_string());
                    }
                }
            } else {
                // Superseded while connecting: close whatever it opened if nobody wants it.
                disconnect = result.is_ok()
                    && (state.registry.live_count() == 0 || state.reconnector.is_auth_halted());
            }
        }

        if disconnect {
            self.transport.disconnect();
        }
        self.store.flush();
    }

    fn mark_connected(&self, state: &mut State) {
        state.reconnector.connected();
        self.stage(state, |s| {
            s.error = None;
            s.last_connected = Some(Utc::now());
            s.connection_count += 1;
        });
    }

    fn report(&self, error: String) {
        {
            let state = self.lock();
            self.stage(&state, |s| s.error = Some(error));
        }
        self.store.flush();
    }

    fn on_connected(&self) {
        let disconnect = {
            let mut state = self.lock();
            match state.reconnector.phase() {
                // An attempt in flight reports its own outcome.
                Phase::Connected | Phase::Attempting => false,
                Phase::Idle | Phase::Scheduled => {
                    if state.registry.live_count() == 0 || state.reconnector.is_auth_halted() {
                        true
                    } else {
                        self.mark_connected(&mut state);
                        false
                    }
                }
            }
        };

        if disconnect {
            self.transport.disconnect();
        }
        self.store.flush();
    }

    fn on_disconnected(&self, reason: DisconnectReason) {
        if reason == DisconnectReason::ClientRequested {
            return;
        }

        {
            let mut state = self.lock();
            if state.reconnector.phase() != Phase::Connected || state.registry.live_count() == 0 {
                #[cfg(feature = "tracing")]
                tracing::debug!(%reason, "Ignoring disconnect while not connected");
                return;
            }

            #[cfg(feature = "tracing")]
            tracing::warn!(%reason, "Transport disconnected unexpectedly");
            self.schedule_retry(&mut state, false, format!("Disconnected: {reason}"));
        }
        self.store.flush();
    }

    fn on_error(&self, error: TransportError) {
        match error {
            TransportError::Auth(_) => {
                let disconnect = {
                    let mut state = self.lock();
                    let live = state.registry.live_count() > 0;
                    if live {
                        state.reconnector.halt_auth();
                        self.stage(&state, |s| s.error = Some(error.to_string()));
                    }
                    live
                };

                if disconnect {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(%error, "Credential rejected by server, closing transport");
                    self.transport.disconnect();
                }
                self.store.flush();
            }
            TransportError::Network(_) => self.report(error.to_string()),
            TransportError::Protocol(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%error, "Dropping malformed inbound event");
            }
        }
    }

    fn dispatch(&self, event: &str, payload: &Value) {
        match event {
            AUTH_ERROR_EVENT => self.on_error(TransportError::auth(server_message(
                payload,
                "Authentication failed",
            ))),
            CONNECTION_LIMIT_EXCEEDED_EVENT => self.report(format!(
                "Connection limit exceeded: {}",
                server_message(payload, "too many connections")
            )),
            SUBSCRIPTION_ERROR_EVENT => self.report(format!(
                "Subscription error: {}",
                server_message(payload, "unknown")
            )),
            _ => {}
        }

        let targets = self.lock().registry.snapshot(event);
        if targets.is_empty() {
            #[cfg(feature = "tracing")]
            tracing::trace!(event, "No callbacks registered for event");
            return;
        }

        let delivery = fan_out(event, payload, &targets, |id| {
            self.lock().registry.is_registered(event, id)
        });

        #[cfg(feature = "tracing")]
        tracing::trace!(
            event,
            delivered = delivery.delivered,
            failed = delivery.failed,
            skipped = delivery.skipped,
            "Event dispatched"
        );
        #[cfg(not(feature = "tracing"))]
        let _ = delivery;
    }
}

impl SignalHandler for Inner {
    fn handle(&self, signal: Signal) {
        match signal {
            Signal::Event { name, payload } => self.dispatch(&name, &payload),
            Signal::Connected => self.on_connected(),
            Signal::Disconnected(reason) => self.on_disconnected(reason),
            Signal::ReconnectAttempt(attempt) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(attempt, "Transport reported a reconnect attempt");
                #[cfg(not(feature = "tracing"))]
                let _ = attempt;
            }
            Signal::Error(error) => self.on_error(error),
        }
    }
}
