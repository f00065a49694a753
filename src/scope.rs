//! Lifecycle helpers that tie a feature's subscription to a Rust scope.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::credential::Credential;
use crate::manager::{ConnectionManager, Unsubscribe};
use crate::registry::EventCallback;

/// Keeps a subscriber registered for as long as it lives.
///
/// Returned by [`ConnectionManager::acquire`]. Dropping the guard unsubscribes, which also
/// removes every callback registered through it.
#[must_use = "dropping the guard unsubscribes immediately"]
pub struct SubscriberGuard {
    manager: ConnectionManager,
    id: String,
}

impl SubscriberGuard {
    pub(crate) fn new(manager: ConnectionManager, id: String) -> Self {
        Self { manager, id }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Registers `callback` for `event` on behalf of this subscriber.
    pub fn on(&self, event: &str, callback: EventCallback) -> Unsubscribe {
        self.manager.subscribe_to_event(&self.id, event, callback)
    }

    pub fn emit(&self, event: &str, payload: &Value) {
        self.manager.emit(event, payload);
    }
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.manager.unsubscribe(&self.id);
    }
}

impl fmt::Debug for SubscriberGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberGuard")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Shared {
    closed: bool,
    /// `Some` while subscribed
    registrations: Option<Vec<Unsubscribe>>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A feature whose subscription follows the availability of a credential.
///
/// Whenever the watched credential becomes `Some`, the feature subscribes (or refreshes its
/// credential) and registers its event callbacks if they are not registered yet. When it goes
/// back to `None`, the feature unsubscribes. Dropping the scope unsubscribes as well.
///
/// ```ignore
/// let (credentials, rx) = watch::channel(None);
/// let typing = FeatureScope::spawn(&manager, "typing", rx, [("user_typing", on_typing)]);
///
/// credentials.send_replace(Some(Credential::new(token))); // subscribes
/// credentials.send_replace(None);                         // unsubscribes
/// ```
pub struct FeatureScope {
    manager: ConnectionManager,
    id: String,
    shared: Arc<Mutex<Shared>>,
    cancel: CancellationToken,
}

impl FeatureScope {
    /// Applies the current credential right away, then follows changes on a tokio task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<S, I, E>(
        manager: &ConnectionManager,
        subscriber_id: S,
        mut credentials: watch::Receiver<Option<Credential>>,
        handlers: I,
    ) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = (E, EventCallback)>,
        E: Into<String>,
    {
        let id = subscriber_id.into();
        let handlers: Arc<[(String, EventCallback)]> = handlers
            .into_iter()
            .map(|(event, callback)| (event.into(), callback))
            .collect();
        let shared = Arc::new(Mutex::new(Shared::default()));
        let cancel = CancellationToken::new();

        let initial = credentials.borrow_and_update().clone();
        apply(&shared, manager, &id, &handlers, initial);

        let task_shared = Arc::clone(&shared);
        let task_manager = manager.clone();
        let task_id = id.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => break,
                    changed = credentials.changed() => {
                        if changed.is_err() {
                            // Sender gone: keep the last state until the scope is dropped.
                            break;
                        }
                    }
                }

                let credential = credentials.borrow_and_update().clone();
                apply(&task_shared, &task_manager, &task_id, &handlers, credential);
            }
        });

        Self {
            manager: manager.clone(),
            id,
            shared,
            cancel,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the feature is currently subscribed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        lock(&self.shared).registrations.is_some()
    }
}

fn apply(
    shared: &Mutex<Shared>,
    manager: &ConnectionManager,
    id: &str,
    handlers: &[(String, EventCallback)],
    credential: Option<Credential>,
) {
    let mut shared = lock(shared);
    if shared.closed {
        return;
    }

    match credential {
        Some(credential) => {
            // The subscriber may have been removed behind our back, e.g. by a shutdown.
            let was_live = manager.is_subscribed(id);
            if let Err(e) = manager.subscribe(id, credential) {
                #[cfg(feature = "tracing")]
                tracing::warn!(subscriber_id = id, error = %e, "Feature could not subscribe");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                return;
            }

            if !was_live || shared.registrations.is_none() {
                shared.registrations = Some(
                    handlers
                        .iter()
                        .map(|(event, callback)| {
                            manager.subscribe_to_event(id, event, Arc::clone(callback))
                        })
                        .collect(),
                );
            }
        }
        None => {
            if shared.registrations.take().is_some() {
                manager.unsubscribe(id);
            }
        }
    }
}

impl Drop for FeatureScope {
    fn drop(&mut self) {
        self.cancel.cancel();

        let mut shared = lock(&self.shared);
        shared.closed = true;
        if shared.registrations.take().is_some() {
            self.manager.unsubscribe(&self.id);
        }
    }
}

impl fmt::Debug for FeatureScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureScope")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}
