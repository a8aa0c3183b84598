//! Workspace services
//!
//! The entry point a build engine uses to obtain results. Binds one
//! [`IdentityCache`] to the workspace and history stores of a cache root
//! and clears the in-memory cache when the root build completes.

use crate::cache::{ArtifactCacheProvider, IdentityCache, WorkspaceStore};
use crate::error::CacheResult;
use crate::history::ExecutionHistoryStore;
use crate::session::{BuildSession, RootBuildListener};
use crate::work::{ExecutionOutcome, UnitOfWork};
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Cached execution of units of work for one cache root
pub struct WorkspaceServices {
    provider: Arc<ArtifactCacheProvider>,
    identity_cache: Arc<IdentityCache>,
}

impl WorkspaceServices {
    /// Bind a fresh identity cache to `provider` and hook it into `session`
    pub fn new(provider: Arc<ArtifactCacheProvider>, session: &BuildSession) -> Self {
        let identity_cache = Arc::new(IdentityCache::new());
        session.add_listener(Arc::new(ClearOnBuildComplete {
            cache: Arc::downgrade(&identity_cache),
        }));
        Self {
            provider,
            identity_cache,
        }
    }

    /// Outcome of `work`, computing it at most once per identity per build
    ///
    /// Lookup order is the identity cache, then a reusable workspace on
    /// disk, then a fresh execution. Lock and filesystem errors are
    /// returned to this caller and are not cached.
    pub async fn execute(&self, work: &dyn UnitOfWork) -> CacheResult<ExecutionOutcome> {
        let identity = work.identity();
        self.identity_cache
            .get_or_try_compute(&identity, || async {
                self.provider
                    .workspace_store()
                    .execute_immutable(work, self.provider.history_store())
                    .await
            })
            .await
    }

    pub fn identity_cache(&self) -> &IdentityCache {
        &self.identity_cache
    }

    pub fn workspace_store(&self) -> &WorkspaceStore {
        self.provider.workspace_store()
    }

    pub fn history(&self) -> &ExecutionHistoryStore {
        self.provider.history_store()
    }

    pub fn provider(&self) -> &Arc<ArtifactCacheProvider> {
        &self.provider
    }
}

/// Holds the cache weakly so a long-lived session does not keep it alive
struct ClearOnBuildComplete {
    cache: Weak<IdentityCache>,
}

#[async_trait]
impl RootBuildListener for ClearOnBuildComplete {
    fn name(&self) -> &str {
        "identity-cache-clear"
    }

    async fn before_complete(&self) -> CacheResult<()> {
        if let Some(cache) = self.cache.upgrade() {
            debug!("Root build completing, clearing identity cache");
            cache.clear();
        }
        Ok(())
    }

    fn is_detached(&self) -> bool {
        self.cache.strong_count() == 0
    }
}
