#![expect(
    clippy::module_name_repetitions,
    reason = "State types expose their domain in the name for clarity"
)]

use std::collections::{BTreeMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::bus::panic_message;

/// Canonical status of the shared connection.
///
/// `is_connected` and `is_reconnecting` are never both true.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    /// The transport completed its handshake and has not dropped since
    pub is_connected: bool,
    /// A reconnect plan is in progress (waiting out a backoff delay or attempting)
    pub is_reconnecting: bool,
    /// Human-readable description of the last problem, cleared on successful connect
    pub error: Option<String>,
    /// When the transport last completed a handshake
    pub last_connected: Option<DateTime<Utc>>,
    /// Successful connections established over the lifetime of the manager
    pub connection_count: u64,
    /// Failed attempts in the current reconnect plan
    pub retry_count: u32,
}

/// Observer notified with a full copy of the state on every change.
pub type StateObserver = Arc<dyn Fn(&ConnectionState) + Send + Sync>;

#[derive(Default)]
struct Queue {
    current: ConnectionState,
    pending: VecDeque<ConnectionState>,
    draining: bool,
}

#[derive(Default)]
struct Observers {
    next_id: u64,
    entries: BTreeMap<u64, StateObserver>,
}

/// Holds the current [`ConnectionState`] and broadcasts changes.
///
/// Updates are staged while the manager holds its own lock and delivered by [`Self::flush`]
/// after it released it. A single caller drains the queue at a time, which keeps delivery in
/// occurrence order and lets observers call back into the manager.
pub(crate) struct ConnectionStateStore {
    queue: Mutex<Queue>,
    observers: Mutex<Observers>,
    watch_tx: watch::Sender<ConnectionState>,
}

impl Default for ConnectionStateStore {
    fn default() -> Self {
        let (watch_tx, _) = watch::channel(ConnectionState::default());
        Self {
            queue: Mutex::default(),
            observers: Mutex::default(),
            watch_tx,
        }
    }
}

// Neither mutex guards an invariant that a panic halfway through could break, so poisoning
// is ignored throughout.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionStateStore {
    pub(crate) fn snapshot(&self) -> ConnectionState {
        lock(&self.queue).current.clone()
    }

    pub(crate) fn receiver(&self) -> watch::Receiver<ConnectionState> {
        self.watch_tx.subscribe()
    }

    /// Applies `update` to the current state and queues the result if anything changed.
    pub(crate) fn stage<F>(&self, update: F)
    where
        F: FnOnce(&mut ConnectionState),
    {
        let mut queue = lock(&self.queue);
        let mut next = queue.current.clone();
        update(&mut next);
        debug_assert!(
            !(next.is_connected && next.is_reconnecting),
            "connected and reconnecting at the same time"
        );

        if next == queue.current {
            return;
        }

        queue.current = next.clone();
        self.watch_tx.send_replace(next.clone());
        queue.pending.push_back(next);
    }

    /// Delivers staged states to observers, unless another caller is already doing so.
    pub(crate) fn flush(&self) {
        {
            let mut queue = lock(&self.queue);
            if queue.draining || queue.pending.is_empty() {
                return;
            }
            queue.draining = true;
        }

        loop {
            let next = {
                let mut queue = lock(&self.queue);
                match queue.pending.pop_front() {
                    Some(state) => state,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };

            let observers: Vec<StateObserver> =
                lock(&self.observers).entries.values().cloned().collect();
            for observer in observers {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| observer(&next))) {
                    #[cfg(feature = "tracing")]
                    tracing::error!(
                        message = %panic_message(panic.as_ref()),
                        "Connection state observer panicked"
                    );
                    #[cfg(not(feature = "tracing"))]
                    let _ = panic_message(panic.as_ref());
                }
            }
        }
    }

    pub(crate) fn observe(&self, observer: StateObserver) -> u64 {
        let mut observers = lock(&self.observers);
        observers.next_id += 1;
        let id = observers.next_id;
        observers.entries.insert(id, observer);
        id
    }

    pub(crate) fn unobserve(&self, id: u64) -> bool {
        lock(&self.observers).entries.remove(&id).is_some()
    }
}
