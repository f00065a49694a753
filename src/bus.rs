//! Fan-out of inbound events to registered callbacks.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use serde_json::Value;

use crate::registry::{EventCallback, SubscriptionId};

/// A callback panicked while handling an event.
///
/// Never propagated: the failure is logged and delivery continues with the next callback.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackError {
    pub event: String,
    pub message: String,
}

impl fmt::Display for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "callback for event `{}` panicked: {}",
            self.event, self.message
        )
    }
}

impl StdError for CallbackError {}

/// Counts from a single [`fan_out`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Delivery {
    pub(crate) delivered: usize,
    pub(crate) failed: usize,
    pub(crate) skipped: usize,
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Invokes one callback, turning a panic into a [`CallbackError`].
pub(crate) fn invoke(
    event: &str,
    callback: &EventCallback,
    payload: &Value,
) -> Result<(), CallbackError> {
    catch_unwind(AssertUnwindSafe(|| callback(payload))).map_err(|panic| CallbackError {
        event: event.to_owned(),
        message: panic_message(panic.as_ref()),
    })
}

/// Delivers `payload` to every target in order.
///
/// `still_registered` is consulted right before each invocation, so a registration removed by
/// an earlier callback in the same loop is skipped.
pub(crate) fn fan_out<F>(
    event: &str,
    payload: &Value,
    targets: &[(SubscriptionId, EventCallback)],
    mut still_registered: F,
) -> Delivery
where
    F: FnMut(SubscriptionId) -> bool,
{
    let mut delivery = Delivery::default();

    for (id, callback) in targets {
        if !still_registered(*id) {
            delivery.skipped += 1;
            continue;
        }

        match invoke(event, callback, payload) {
            Ok(()) => delivery.delivered += 1,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::error!(subscription = %id, error = %e, "Event callback failed");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                delivery.failed += 1;
            }
        }
    }

    delivery
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::registry::SubscriberRegistry;

    fn boom(_: &Value) {
        panic!("boom");
    }

    fn exploding(_: &Value) {
        panic!("handler exploded");
    }

    fn callback<F>(f: F) -> EventCallback
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    fn targets(callbacks: Vec<EventCallback>) -> Vec<(SubscriptionId, EventCallback)> {
        let mut registry = SubscriberRegistry::default();
        let _opened = registry.add("test");
        for callback in callbacks {
            let _id = registry.register("test", "message", callback).unwrap();
        }
        registry.snapshot("message")
    }

    #[test]
    fn panicking_callback_does_not_block_others() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        let targets = targets(vec![
            callback(boom),
            callback(move |_: &Value| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        ]);

        let delivery = fan_out("message", &json!({"id": 1}), &targets, |_| true);

        assert_eq!(delivery.delivered, 1);
        assert_eq!(delivery.failed, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregistered_targets_are_skipped() {
        let targets = targets(vec![callback(|_: &Value| {}), callback(|_: &Value| {})]);
        let first = targets[0].0;

        let delivery = fan_out("message", &Value::Null, &targets, |id| id != first);

        assert_eq!(delivery.skipped, 1);
        assert_eq!(delivery.delivered, 1);
    }

    #[test]
    fn invoke_reports_panic_message() {
        let exploding = callback(exploding);

        let err = invoke("typing", &exploding, &Value::Null).unwrap_err();

        assert_eq!(err.event, "typing");
        assert_eq!(err.message, "handler exploded");
        assert_eq!(
            err.to_string(),
            "callback for event `typing` panicked: handler exploded"
        );
    }
}
