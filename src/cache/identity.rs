//! In-memory identity cache
//!
//! Maps identities to the outcome of their single computation. Entries
//! never expire; the owner clears the whole cache at build boundaries.
//! Failures are cached like successes and replayed until the next clear.

use crate::error::CacheResult;
use crate::identity::Identity;
use crate::work::ExecutionOutcome;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OnceCell;
use tracing::{debug, trace};

type Slot = Arc<OnceCell<ExecutionOutcome>>;

/// Identity to outcome cache with at-most-once computation per identity
#[derive(Debug, Default)]
pub struct IdentityCache {
    entries: Mutex<HashMap<Identity, Slot>>,
}

impl IdentityCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached outcome or compute it
    ///
    /// Concurrent callers for the same identity wait for the first one's
    /// computation. If that computation is cancelled before it finishes,
    /// nothing is stored and the next waiter computes instead.
    pub async fn get_or_compute<F, Fut>(&self, identity: &Identity, compute: F) -> ExecutionOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ExecutionOutcome>,
    {
        let slot = self.slot(identity);
        if let Some(outcome) = slot.get() {
            trace!("Identity cache hit for {}", identity.short());
            return outcome.clone();
        }

        slot.get_or_init(|| async move {
            debug!("Identity cache miss for {}, computing", identity.short());
            compute().await
        })
        .await
        .clone()
    }

    /// Like [`get_or_compute`](Self::get_or_compute) for computations that
    /// can fail outside the unit of work
    ///
    /// An `Err` is returned to this caller only and is not cached.
    pub async fn get_or_try_compute<F, Fut>(
        &self,
        identity: &Identity,
        compute: F,
    ) -> CacheResult<ExecutionOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<ExecutionOutcome>>,
    {
        let slot = self.slot(identity);
        if let Some(outcome) = slot.get() {
            trace!("Identity cache hit for {}", identity.short());
            return Ok(outcome.clone());
        }

        slot.get_or_try_init(|| async move {
            debug!("Identity cache miss for {}, computing", identity.short());
            compute().await
        })
        .await
        .cloned()
    }

    /// Completed outcome for an identity, if any
    pub fn get(&self, identity: &Identity) -> Option<ExecutionOutcome> {
        self.lock()
            .get(identity)
            .and_then(|slot| slot.get().cloned())
    }

    /// Remove all entries
    ///
    /// Computations already in flight still hand their outcome to their
    /// waiters, but it is not visible to lookups made after the clear.
    pub fn clear(&self) {
        let mut entries = self.lock();
        let count = entries.len();
        entries.clear();
        debug!("Cleared {} identity cache entries", count);
    }

    /// Number of completed entries
    pub fn len(&self) -> usize {
        self.lock()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    /// Whether no entry has completed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, identity: &Identity) -> Slot {
        Arc::clone(self.lock().entry(identity.clone()).or_default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Identity, Slot>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
