use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::Config;
use crate::manager::ConnectionManager;
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::transport::Transport;

type Factory<T> = Box<dyn Fn(&str) -> T + Send + Sync>;

/// One [`ConnectionManager`] per namespace (e.g. `/messaging`, `/meetings`).
///
/// Managers are created from the transport factory on first use and share the hub's
/// [`Config`] and [`Scheduler`].
pub struct ConnectionHub<T: Transport> {
    factory: Factory<T>,
    config: Config,
    scheduler: Arc<dyn Scheduler>,
    managers: DashMap<String, ConnectionManager>,
}

impl<T: Transport> ConnectionHub<T> {
    pub fn new<F>(factory: F, config: Config) -> Self
    where
        F: Fn(&str) -> T + Send + Sync + 'static,
    {
        Self::with_scheduler(factory, config, Arc::new(TokioScheduler))
    }

    pub fn with_scheduler<F>(factory: F, config: Config, scheduler: Arc<dyn Scheduler>) -> Self
    where
        F: Fn(&str) -> T + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            config,
            scheduler,
            managers: DashMap::new(),
        }
    }

    /// The manager for `namespace`, created on first use.
    pub fn manager(&self, namespace: &str) -> ConnectionManager {
        self.managers
            .entry(namespace.to_owned())
            .or_insert_with(|| {
                #[cfg(feature = "tracing")]
                tracing::debug!(namespace, "Creating connection manager");

                ConnectionManager::with_scheduler(
                    (self.factory)(namespace),
                    self.config.clone(),
                    Arc::clone(&self.scheduler),
                )
            })
            .clone()
    }

    #[must_use]
    pub fn contains(&self, namespace: &str) -> bool {
        self.managers.contains_key(namespace)
    }

    /// Namespaces with a live manager, in no particular order.
    #[must_use]
    pub fn namespaces(&self) -> Vec<String> {
        self.managers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Shuts the namespace's manager down and forgets it. Returns whether it existed.
    ///
    /// Clones of the manager held elsewhere stay usable but are no longer handed out.
    pub fn shutdown(&self, namespace: &str) -> bool {
        match self.managers.remove(namespace) {
            Some((_, manager)) => {
                manager.shutdown();
                true
            }
            None => false,
        }
    }

    pub fn shutdown_all(&self) {
        let namespaces = self.namespaces();
        for namespace in namespaces {
            let _existed = self.shutdown(&namespace);
        }
    }
}

impl<T: Transport> fmt::Debug for ConnectionHub<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHub")
            .field("namespaces", &self.namespaces())
            .finish_non_exhaustive()
    }
}
