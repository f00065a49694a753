#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

mod common;

use std::sync::{Arc, Mutex};

use mentara_realtime::{Config, ConnectionHub, ManualScheduler};

use crate::common::{MockTransport, credential};

type Created = Arc<Mutex<Vec<(String, MockTransport)>>>;

fn hub() -> (ConnectionHub<MockTransport>, Created, ManualScheduler) {
    let created: Created = Arc::default();
    let log = Arc::clone(&created);
    let scheduler = ManualScheduler::new();

    let hub = ConnectionHub::with_scheduler(
        move |namespace: &str| {
            let transport = MockTransport::new();
            log.lock()
                .unwrap()
                .push((namespace.to_owned(), transport.clone()));
            transport
        },
        Config::default(),
        Arc::new(scheduler.clone()),
    );

    (hub, created, scheduler)
}

#[tokio::test]
async fn managers_are_created_once_per_namespace() {
    let (hub, created, scheduler) = hub();

    let messaging = hub.manager("/messaging");
    messaging.subscribe("chat", credential()).unwrap();
    scheduler.run_due().await;

    assert_eq!(hub.manager("/messaging").subscriber_count(), 1);
    assert!(hub.manager("/messaging").is_connected());
    assert!(!hub.manager("/meetings").is_connected());

    let namespaces: Vec<String> = created
        .lock()
        .unwrap()
        .iter()
        .map(|(namespace, _)| namespace.clone())
        .collect();
    assert_eq!(namespaces, vec!["/messaging", "/meetings"]);
    assert!(hub.contains("/meetings"));
    assert!(!hub.contains("/notifications"));
}

#[tokio::test]
async fn shutdown_closes_and_forgets_a_namespace() {
    let (hub, created, scheduler) = hub();
    hub.manager("/messaging")
        .subscribe("chat", credential())
        .unwrap();
    scheduler.run_due().await;

    assert!(hub.shutdown("/messaging"));
    assert!(!hub.shutdown("/messaging"));
    assert!(!hub.contains("/messaging"));

    let transport = created.lock().unwrap()[0].1.clone();
    assert_eq!(transport.disconnects(), 1);

    // A fresh manager with a fresh transport on next use
    let _manager = hub.manager("/messaging");
    assert_eq!(created.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn shutdown_all_closes_every_namespace() {
    let (hub, created, scheduler) = hub();
    for namespace in ["/messaging", "/meetings"] {
        hub.manager(namespace)
            .subscribe("feature", credential())
            .unwrap();
    }
    scheduler.run_due().await;

    hub.shutdown_all();

    assert!(hub.namespaces().is_empty());
    for (namespace, transport) in created.lock().unwrap().iter() {
        assert_eq!(transport.connects(), 1, "{namespace}");
        assert_eq!(transport.disconnects(), 1, "{namespace}");
    }
}
