//! Artifact cache provider
//!
//! Owns the cache root, its lock and its metadata. Destructive cleanup
//! only ever happens here, inside [`ArtifactCacheProvider::with_lock`].

use crate::cache::cleanup::{self, CleanupReport, CleanupTargets};
use crate::cache::lock::FileLock;
use crate::cache::root::{CacheMetadata, CacheRoot};
use crate::cache::workspace::WorkspaceStore;
use crate::config::{CleanupSettings, Settings};
use crate::error::{CacheError, CacheResult};
use crate::history::ExecutionHistoryStore;
use crate::session::RootBuildListener;
use async_trait::async_trait;
use chrono::Utc;
use semver::Version;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Whether this provider currently holds the root lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Locked,
}

/// Owner of a cache root directory
#[derive(Debug)]
pub struct ArtifactCacheProvider {
    root: CacheRoot,
    lock: FileLock,
    producer_version: Version,
    cleanup: CleanupSettings,
    workspaces: WorkspaceStore,
    history: ExecutionHistoryStore,
    locked: AtomicBool,
}

impl ArtifactCacheProvider {
    /// Open (creating if needed) the cache root described by `settings`
    ///
    /// Records the producing tool version in the root's metadata.
    pub async fn open(settings: &Settings) -> CacheResult<Self> {
        let cache = &settings.cache;
        let producer_version =
            Version::parse(&cache.producer_version).map_err(|e| CacheError::ConfigInvalid {
                path: "cache.producer_version".into(),
                reason: e.to_string(),
            })?;

        let root = CacheRoot::new(cache.root_dir());
        root.ensure_layout().await?;

        let lock = FileLock::new(
            root.lock_file(),
            cache.lock_timeout(),
            cache.lock_poll_interval(),
        );
        let workspaces = WorkspaceStore::new(
            root.clone(),
            cache.lock_timeout(),
            cache.lock_poll_interval(),
        );
        let history =
            ExecutionHistoryStore::new(root.history_dir(), producer_version.to_string());

        let provider = Self {
            root,
            lock,
            producer_version,
            cleanup: settings.cleanup.clone(),
            workspaces,
            history,
            locked: AtomicBool::new(false),
        };

        provider
            .with_lock(|| async {
                let path = provider.root.metadata_file();
                let mut metadata = CacheMetadata::load(&path)
                    .await?
                    .unwrap_or_else(|| CacheMetadata::new(provider.producer_version.clone()));
                metadata.record_use(&provider.producer_version, Utc::now());
                metadata.save(&path).await
            })
            .await?;

        info!(
            "Opened artifact cache at {} (version {})",
            provider.root.dir().display(),
            provider.producer_version
        );
        Ok(provider)
    }

    /// Cache root layout
    pub fn root(&self) -> &CacheRoot {
        &self.root
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.root.workspaces_dir()
    }

    pub fn history_dir(&self) -> PathBuf {
        self.root.history_dir()
    }

    /// Version recorded as producer of new entries
    pub fn producer_version(&self) -> &Version {
        &self.producer_version
    }

    /// Workspace store for this root
    pub fn workspace_store(&self) -> &WorkspaceStore {
        &self.workspaces
    }

    /// Execution history for this root
    pub fn history_store(&self) -> &ExecutionHistoryStore {
        &self.history
    }

    /// Current metadata as stored on disk
    pub async fn metadata(&self) -> CacheResult<CacheMetadata> {
        Ok(CacheMetadata::load(&self.root.metadata_file())
            .await?
            .unwrap_or_else(|| CacheMetadata::new(self.producer_version.clone())))
    }

    /// Whether this provider is inside [`with_lock`](Self::with_lock)
    pub fn lock_state(&self) -> LockState {
        if self.locked.load(Ordering::SeqCst) {
            LockState::Locked
        } else {
            LockState::Unlocked
        }
    }

    /// Run `op` while holding the root lock
    ///
    /// Waits for other holders in this or other processes. The lock is
    /// released however `op` ends: return, error, panic or cancellation.
    /// Not reentrant; `op` must not call `with_lock` again.
    pub async fn with_lock<F, Fut, T>(&self, op: F) -> CacheResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<T>>,
    {
        let _guard = self.lock.acquire().await?;
        let _state = LockedState::enter(&self.locked);
        op().await
    }

    /// Run a cleanup sweep if one is due
    ///
    /// Always takes the root lock, even when no sweep is due, so that a
    /// root build completing always passes through the lock.
    pub async fn cleanup(&self) -> CacheResult<Option<CleanupReport>> {
        self.with_lock(|| self.cleanup_locked(false)).await
    }

    /// Run a cleanup sweep regardless of the interval
    pub async fn force_cleanup(&self) -> CacheResult<CleanupReport> {
        let report = self.with_lock(|| self.cleanup_locked(true)).await?;
        report.ok_or_else(|| CacheError::Internal("forced cleanup did not run".into()))
    }

    async fn cleanup_locked(&self, force: bool) -> CacheResult<Option<CleanupReport>> {
        if !self.cleanup.enabled && !force {
            debug!("Cache cleanup disabled");
            return Ok(None);
        }

        let now = Utc::now();
        let mut metadata = self.metadata().await?;
        if !force && !metadata.cleanup_due(self.cleanup.interval_hours, now) {
            debug!("Cache cleanup not due yet");
            return Ok(None);
        }

        let targets = CleanupTargets {
            workspaces: &self.workspaces,
            history: &self.history,
        };
        metadata.record_use(&self.producer_version, now);
        let report =
            cleanup::sweep(&targets, &mut metadata, &self.cleanup, &self.producer_version, now)
                .await?;
        metadata.save(&self.root.metadata_file()).await?;

        if report.is_empty() {
            debug!("Cache cleanup found nothing to remove");
        } else {
            info!("Cache cleanup: {}", report);
        }
        Ok(Some(report))
    }

    /// Listener running the end-of-build cleanup pass
    pub fn cleanup_listener(self: &Arc<Self>) -> Arc<dyn RootBuildListener> {
        Arc::new(CleanupOnBuildComplete {
            provider: Arc::clone(self),
        })
    }
}

/// Marks the provider locked for as long as it lives
struct LockedState<'a>(&'a AtomicBool);

impl<'a> LockedState<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for LockedState<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct CleanupOnBuildComplete {
    provider: Arc<ArtifactCacheProvider>,
}

#[async_trait]
impl RootBuildListener for CleanupOnBuildComplete {
    fn name(&self) -> &str {
        "artifact-cache-cleanup"
    }

    async fn before_complete(&self) -> CacheResult<()> {
        self.provider.cleanup().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::BuildSession;
    use std::time::Duration;
    use tempfile::TempDir;

    fn settings(temp: &TempDir) -> Settings {
        let mut settings = Settings::default();
        settings.cache.root = Some(temp.path().join("cache"));
        settings.cache.lock_timeout_secs = 2;
        settings.cache.lock_poll_millis = 5;
        settings.cache.producer_version = "1.4.0".to_string();
        settings
    }

    #[tokio::test]
    async fn open_records_version() {
        let temp = TempDir::new().unwrap();
        let provider = ArtifactCacheProvider::open(&settings(&temp)).await.unwrap();

        let metadata = provider.metadata().await.unwrap();
        assert_eq!(metadata.producer_version, Version::parse("1.4.0").unwrap());
        assert!(metadata.is_version_in_use("1.4.0"));
        assert!(provider.root().history_dir().is_dir());
    }

    #[tokio::test]
    async fn reopen_with_new_version_keeps_old() {
        let temp = TempDir::new().unwrap();
        ArtifactCacheProvider::open(&settings(&temp)).await.unwrap();

        let mut upgraded = settings(&temp);
        upgraded.cache.producer_version = "1.5.0".to_string();
        let provider = ArtifactCacheProvider::open(&upgraded).await.unwrap();

        let metadata = provider.metadata().await.unwrap();
        assert!(metadata.is_version_in_use("1.4.0"));
        assert!(metadata.is_version_in_use("1.5.0"));
        assert_eq!(metadata.producer_version, Version::parse("1.5.0").unwrap());
    }

    #[tokio::test]
    async fn invalid_version_is_config_error() {
        let temp = TempDir::new().unwrap();
        let mut bad = settings(&temp);
        bad.cache.producer_version = "not-a-version".to_string();

        let err = ArtifactCacheProvider::open(&bad).await.unwrap_err();
        assert!(matches!(err, CacheError::ConfigInvalid { .. }));
    }

    #[tokio::test]
    async fn with_lock_holds_lock_during_op() {
        let temp = TempDir::new().unwrap();
        let provider = ArtifactCacheProvider::open(&settings(&temp)).await.unwrap();
        let other = FileLock::new(
            provider.root().lock_file(),
            Duration::from_millis(10),
            Duration::from_millis(5),
        );

        let observed = provider
            .with_lock(|| async {
                Ok((provider.lock_state(), other.try_acquire()?.is_some()))
            })
            .await
            .unwrap();

        assert_eq!(observed, (LockState::Locked, false));
        assert_eq!(provider.lock_state(), LockState::Unlocked);
        assert!(other.try_acquire().unwrap().is_some());
    }

    #[tokio::test]
    async fn with_lock_releases_on_error() {
        let temp = TempDir::new().unwrap();
        let provider = ArtifactCacheProvider::open(&settings(&temp)).await.unwrap();

        let result: CacheResult<()> = provider
            .with_lock(|| async { Err(CacheError::Internal("op failed".into())) })
            .await;

        assert!(matches!(result, Err(CacheError::Internal(_))));
        assert_eq!(provider.lock_state(), LockState::Unlocked);
        let other = FileLock::new(
            provider.root().lock_file(),
            Duration::from_millis(10),
            Duration::from_millis(5),
        );
        assert!(other.try_acquire().unwrap().is_some());
    }

    #[tokio::test]
    async fn with_lock_releases_on_panic() {
        let temp = TempDir::new().unwrap();
        let provider = Arc::new(ArtifactCacheProvider::open(&settings(&temp)).await.unwrap());

        let panicking = Arc::clone(&provider);
        let joined = tokio::spawn(async move {
            panicking
                .with_lock(|| async {
                    if true {
                        panic!("op panicked");
                    }
                    Ok(())
                })
                .await
        })
        .await;

        assert!(joined.is_err());
        assert_eq!(provider.lock_state(), LockState::Unlocked);
        provider.with_lock(|| async { Ok(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn with_lock_fails_when_held_elsewhere() {
        let temp = TempDir::new().unwrap();
        let mut quick = settings(&temp);
        quick.cache.lock_timeout_secs = 0;
        let provider = ArtifactCacheProvider::open(&quick).await.unwrap();

        let holder = FileLock::new(
            provider.root().lock_file(),
            Duration::from_secs(1),
            Duration::from_millis(5),
        );
        let _held = holder.acquire().await.unwrap();

        let err = provider.with_lock(|| async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, CacheError::LockAcquisition { .. }));
    }

    #[tokio::test]
    async fn cleanup_respects_interval() {
        let temp = TempDir::new().unwrap();
        let provider = ArtifactCacheProvider::open(&settings(&temp)).await.unwrap();

        assert!(provider.cleanup().await.unwrap().is_some());
        assert!(provider.cleanup().await.unwrap().is_none());
        assert!(provider.metadata().await.unwrap().last_cleanup.is_some());

        provider.force_cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn extreme_limits_mean_no_limit() {
        let temp = TempDir::new().unwrap();
        let mut unbounded = settings(&temp);
        unbounded.cache.lock_timeout_secs = u64::MAX;
        unbounded.cleanup.max_age_days = u32::MAX;
        unbounded.cleanup.version_retention_days = u32::MAX;

        let provider = ArtifactCacheProvider::open(&unbounded).await.unwrap();
        let report = provider.force_cleanup().await.unwrap();

        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn build_completion_takes_lock_without_cache_activity() {
        let temp = TempDir::new().unwrap();
        let mut every_build = settings(&temp);
        every_build.cleanup.interval_hours = 0;
        let provider = Arc::new(ArtifactCacheProvider::open(&every_build).await.unwrap());

        let session = BuildSession::new();
        session.add_listener(provider.cleanup_listener());
        session.root_build_started().await;
        session.root_build_completed(()).await;

        let first = provider.metadata().await.unwrap().last_cleanup.unwrap();
        session.root_build_completed(()).await;
        let second = provider.metadata().await.unwrap().last_cleanup.unwrap();

        assert!(second >= first);
        assert_eq!(provider.lock_state(), LockState::Unlocked);
    }
}
