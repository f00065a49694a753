use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

/// Callback invoked with the payload of every matching inbound event.
///
/// Identity is the `Arc` allocation: registering the same `Arc` twice for the same subscriber
/// and event is a no-op.
pub type EventCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Identifies a single event registration. Ordered by registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Live-count boundary crossed by an [`SubscriberRegistry::add`] or
/// [`SubscriberRegistry::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    /// 0 → 1: the connection is now wanted
    Opened,
    /// 1 → 0: nobody wants the connection any more
    Closed,
    Unchanged,
}

struct EventSubscription {
    subscriber_id: String,
    callback: EventCallback,
}

struct Subscriber {
    subscriptions: HashSet<(String, SubscriptionId)>,
    #[cfg_attr(
        not(feature = "tracing"),
        expect(dead_code, reason = "Only reported in logs")
    )]
    since: Instant,
}

/// Tracks which features want the connection alive and which callbacks they registered.
#[derive(Default)]
pub(crate) struct SubscriberRegistry {
    subscribers: HashMap<String, Subscriber>,
    by_event: HashMap<String, BTreeMap<SubscriptionId, EventSubscription>>,
    next_id: u64,
}

impl SubscriberRegistry {
    pub(crate) fn live_count(&self) -> usize {
        self.subscribers.len()
    }

    pub(crate) fn contains(&self, subscriber_id: &str) -> bool {
        self.subscribers.contains_key(subscriber_id)
    }

    /// Registers a subscriber. Adding an id that is already live changes nothing.
    pub(crate) fn add(&mut self, subscriber_id: &str) -> Transition {
        if self.subscribers.contains_key(subscriber_id) {
            return Transition::Unchanged;
        }

        self.subscribers.insert(
            subscriber_id.to_owned(),
            Subscriber {
                subscriptions: HashSet::new(),
                since: Instant::now(),
            },
        );

        if self.subscribers.len() == 1 {
            Transition::Opened
        } else {
            Transition::Unchanged
        }
    }

    /// Removes a subscriber together with all of its event registrations.
    pub(crate) fn remove(&mut self, subscriber_id: &str) -> Transition {
        let Some(subscriber) = self.subscribers.remove(subscriber_id) else {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                subscriber_id,
                "Unsubscribe without a matching subscribe, ignoring"
            );
            return Transition::Unchanged;
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(
            subscriber_id,
            registrations = subscriber.subscriptions.len(),
            lifetime = ?subscriber.since.elapsed(),
            "Removing subscriber"
        );

        for (event, id) in subscriber.subscriptions {
            self.detach(&event, id);
        }

        if self.subscribers.is_empty() {
            Transition::Closed
        } else {
            Transition::Unchanged
        }
    }

    /// Removes every subscriber, returning their ids.
    pub(crate) fn clear(&mut self) -> Vec<String> {
        self.by_event.clear();
        self.subscribers.drain().map(|(id, _)| id).collect()
    }

    /// Registers `callback` for `event` on behalf of `subscriber_id`.
    ///
    /// Returns `None` when the subscriber is not live. Registering the same callback again
    /// returns the existing id.
    pub(crate) fn register(
        &mut self,
        subscriber_id: &str,
        event: &str,
        callback: EventCallback,
    ) -> Option<SubscriptionId> {
        let subscriber = self.subscribers.get_mut(subscriber_id)?;
        let registrations = self.by_event.entry(event.to_owned()).or_default();

        if let Some(existing) = registrations.iter().find_map(|(id, sub)| {
            (sub.subscriber_id == subscriber_id && Arc::ptr_eq(&sub.callback, &callback))
                .then_some(*id)
        }) {
            return Some(existing);
        }

        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        registrations.insert(
            id,
            EventSubscription {
                subscriber_id: subscriber_id.to_owned(),
                callback,
            },
        );
        subscriber.subscriptions.insert((event.to_owned(), id));

        Some(id)
    }

    /// Removes a single registration. Returns whether it was still present.
    pub(crate) fn unregister(&mut self, event: &str, id: SubscriptionId) -> bool {
        let Some(subscription) = self.detach(event, id) else {
            return false;
        };
        if let Some(subscriber) = self.subscribers.get_mut(&subscription.subscriber_id) {
            subscriber.subscriptions.remove(&(event.to_owned(), id));
        }
        true
    }

    pub(crate) fn is_registered(&self, event: &str, id: SubscriptionId) -> bool {
        self.by_event
            .get(event)
            .is_some_and(|registrations| registrations.contains_key(&id))
    }

    /// Callbacks registered for `event`, in registration order.
    pub(crate) fn snapshot(&self, event: &str) -> Vec<(SubscriptionId, EventCallback)> {
        self.by_event
            .get(event)
            .map(|registrations| {
                registrations
                    .iter()
                    .map(|(id, sub)| (*id, Arc::clone(&sub.callback)))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn detach(&mut self, event: &str, id: SubscriptionId) -> Option<EventSubscription> {
        let registrations = self.by_event.get_mut(event)?;
        let removed = registrations.remove(&id);
        if registrations.is_empty() {
            self.by_event.remove(event);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> EventCallback {
        Arc::new(|_: &Value| {})
    }

    #[test]
    fn add_reports_only_the_first_subscriber() {
        let mut registry = SubscriberRegistry::default();

        assert_eq!(registry.add("chat"), Transition::Opened);
        assert_eq!(registry.add("chat"), Transition::Unchanged);
        assert_eq!(registry.add("notifications"), Transition::Unchanged);
        assert_eq!(registry.live_count(), 2);
    }

    #[test]
    fn remove_reports_only_the_last_subscriber() {
        let mut registry = SubscriberRegistry::default();
        let _opened = registry.add("chat");
        let _unchanged = registry.add("notifications");

        assert_eq!(registry.remove("chat"), Transition::Unchanged);
        assert_eq!(registry.remove("notifications"), Transition::Closed);
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn remove_unknown_never_goes_negative() {
        let mut registry = SubscriberRegistry::default();

        assert_eq!(registry.remove("ghost"), Transition::Unchanged);
        assert_eq!(registry.live_count(), 0);
        assert_eq!(registry.add("chat"), Transition::Opened);
    }

    #[test]
    fn register_requires_live_subscriber() {
        let mut registry = SubscriberRegistry::default();

        assert!(registry.register("chat", "message", noop()).is_none());
    }

    #[test]
    fn register_is_idempotent_per_callback() {
        let mut registry = SubscriberRegistry::default();
        let _opened = registry.add("chat");
        let callback = noop();

        let first = registry.register("chat", "message", Arc::clone(&callback));
        let second = registry.register("chat", "message", Arc::clone(&callback));
        let other = registry.register("chat", "message", noop());

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(registry.snapshot("message").len(), 2);
    }

    #[test]
    fn snapshot_follows_registration_order_across_subscribers() {
        let mut registry = SubscriberRegistry::default();
        let _opened = registry.add("chat");
        let _unchanged = registry.add("notifications");

        let a = registry.register("notifications", "message", noop()).unwrap();
        let b = registry.register("chat", "message", noop()).unwrap();
        let c = registry.register("notifications", "message", noop()).unwrap();

        let order: Vec<SubscriptionId> = registry
            .snapshot("message")
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(order, vec![a, b, c]);
    }

    #[test]
    fn removing_subscriber_drops_its_registrations() {
        let mut registry = SubscriberRegistry::default();
        let _opened = registry.add("chat");
        let _unchanged = registry.add("presence");
        let chat = registry.register("chat", "message", noop()).unwrap();
        let presence = registry.register("presence", "message", noop()).unwrap();

        let _transition = registry.remove("chat");

        assert!(!registry.is_registered("message", chat));
        assert!(registry.is_registered("message", presence));
        assert_eq!(registry.snapshot("message").len(), 1);
    }

    #[test]
    fn unregister_removes_exactly_one() {
        let mut registry = SubscriberRegistry::default();
        let _opened = registry.add("chat");
        let first = registry.register("chat", "typing", noop()).unwrap();
        let second = registry.register("chat", "typing", noop()).unwrap();

        assert!(registry.unregister("typing", first));
        assert!(!registry.unregister("typing", first));
        assert!(registry.is_registered("typing", second));
    }
}
