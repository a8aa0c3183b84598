//! Root build lifecycle notifications
//!
//! The host build session announces when a root build starts and when it
//! is about to complete. Components register listeners explicitly; there
//! is no global event bus.

use crate::error::CacheResult;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Receives root build notifications
#[async_trait]
pub trait RootBuildListener: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// A root build has started
    async fn after_start(&self) -> CacheResult<()> {
        Ok(())
    }

    /// The root build is about to complete
    async fn before_complete(&self) -> CacheResult<()>;

    /// Whether the owner is gone; detached listeners are dropped
    fn is_detached(&self) -> bool {
        false
    }
}

/// Build session event source
///
/// Listeners are notified in registration order. A failing listener is
/// logged and does not stop the others or change the build result.
#[derive(Default)]
pub struct BuildSession {
    listeners: Mutex<Vec<Arc<dyn RootBuildListener>>>,
}

impl BuildSession {
    /// Create a session with no listeners
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener
    pub fn add_listener(&self, listener: Arc<dyn RootBuildListener>) {
        debug!("Registered root build listener {}", listener.name());
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Number of registered listeners still attached
    pub fn listener_count(&self) -> usize {
        self.snapshot().len()
    }

    /// Notify listeners that a root build started
    ///
    /// Returns the number of listeners that failed.
    pub async fn root_build_started(&self) -> usize {
        let mut failures = 0;
        for listener in self.snapshot() {
            if let Err(e) = listener.after_start().await {
                warn!("Root build listener {} failed on start: {}", listener.name(), e);
                failures += 1;
            }
        }
        failures
    }

    /// Notify listeners that the root build is completing
    ///
    /// `result` is handed back unchanged whatever the listeners do.
    pub async fn root_build_completed<T>(&self, result: T) -> T {
        for listener in self.snapshot() {
            if let Err(e) = listener.before_complete().await {
                warn!(
                    "Root build listener {} failed on completion: {}",
                    listener.name(),
                    e
                );
            }
        }
        result
    }

    fn snapshot(&self) -> Vec<Arc<dyn RootBuildListener>> {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|listener| {
            let detached = listener.is_detached();
            if detached {
                debug!("Dropping detached root build listener {}", listener.name());
            }
            !detached
        });
        listeners.clone()
    }
}
