#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub(crate) mod bus;
pub mod config;
pub mod credential;
pub mod error;
pub mod hub;
pub mod manager;
pub mod reconnect;
pub mod registry;
pub mod scheduler;
pub mod scope;
pub mod state;
pub mod transport;

pub use bus::CallbackError;
pub use config::{Config, ReconnectConfig};
pub use credential::Credential;
pub use hub::ConnectionHub;
pub use manager::{ConnectionManager, Unsubscribe};
pub use reconnect::{Phase, ReconnectPlan};
pub use registry::{EventCallback, SubscriptionId};
pub use scheduler::{CancelToken, ManualScheduler, Scheduler, Task, TokioScheduler};
pub use scope::{FeatureScope, SubscriberGuard};
pub use state::{ConnectionState, StateObserver};
pub use transport::{DisconnectReason, InboundSink, Signal, Transport, TransportError};
#[cfg(feature = "ws")]
pub use transport::ws::{WsConfig, WsTransport};

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;
