//! Immutable workspaces
//!
//! Every identity owns one directory under `workspaces/`. Work runs in a
//! private staging directory; only when it succeeds is a completion marker
//! written and the staging directory renamed into place. A workspace
//! without the marker is never trusted, and a stale or corrupt one is
//! removed wholesale before recomputation.

use crate::cache::journal::AccessJournal;
use crate::cache::lock::{FileLock, LockGuard};
use crate::cache::root::CacheRoot;
use crate::error::{CacheError, CacheResult};
use crate::history::ExecutionHistoryStore;
use crate::identity::{Identity, InputFingerprint};
use crate::work::{CapturedFailure, ExecutionOutcome, UnitOfWork};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};

/// Name of the completion marker inside a workspace
pub const COMPLETION_MARKER: &str = ".complete";

/// State of a workspace on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceState {
    /// No directory exists
    Miss,
    /// Directory exists without a completion marker (in progress or crashed)
    Building,
    /// Completion marker present; contents are immutable
    Complete,
}

impl fmt::Display for WorkspaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Miss => write!(f, "miss"),
            Self::Building => write!(f, "building"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// Contents of the completion marker
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CompletionMarker {
    identity: Identity,
    completed_at: DateTime<Utc>,
}

/// Allocates and resolves workspaces under a cache root
#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    root: CacheRoot,
    journal: AccessJournal,
    lock_timeout: Duration,
    lock_poll_interval: Duration,
}

impl WorkspaceStore {
    /// Store for `root`
    pub fn new(root: CacheRoot, lock_timeout: Duration, lock_poll_interval: Duration) -> Self {
        let journal = AccessJournal::new(root.journal_dir());
        Self {
            root,
            journal,
            lock_timeout,
            lock_poll_interval,
        }
    }

    /// Access journal shared with cleanup
    pub fn journal(&self) -> &AccessJournal {
        &self.journal
    }

    /// Directory of an identity's workspace
    pub fn workspace_dir(&self, identity: &Identity) -> PathBuf {
        self.root.workspaces_dir().join(identity.as_str())
    }

    /// Per-identity workspace lock
    ///
    /// Lock files outlive their workspaces. Unlinking a lock file another
    /// process has already opened would let two holders lock different
    /// inodes under the same path, so they are never removed.
    pub fn lock_for(&self, identity: &Identity) -> FileLock {
        FileLock::new(
            self.root
                .workspaces_dir()
                .join(format!("{}.lock", identity)),
            self.lock_timeout,
            self.lock_poll_interval,
        )
    }

    /// Current on-disk state of a workspace
    pub async fn state(&self, identity: &Identity) -> WorkspaceState {
        state_of(&self.workspace_dir(identity)).await
    }

    /// Directory of a complete workspace, without locking or creating it
    pub async fn resolve(&self, identity: &Identity) -> Option<PathBuf> {
        let dir = self.workspace_dir(identity);
        if state_of(&dir).await == WorkspaceState::Complete {
            self.journal.touch(identity, Utc::now()).await;
            Some(dir)
        } else {
            None
        }
    }

    /// Lock the workspace of `identity` for writing
    ///
    /// Waits while another handle (in this or another process) holds it.
    pub async fn resolve_or_create(&self, identity: &Identity) -> CacheResult<WorkspaceHandle> {
        let guard = self.lock_for(identity).acquire().await?;
        Ok(WorkspaceHandle {
            identity: identity.clone(),
            dir: self.workspace_dir(identity),
            staging_root: self.root.staging_dir(),
            _guard: guard,
        })
    }

    /// Reuse a valid workspace for `work` or recompute it
    ///
    /// History problems degrade to recomputation. Lock and directory
    /// failures are returned as errors; a failure of the work itself is a
    /// [`ExecutionOutcome::Failure`].
    pub async fn execute_immutable(
        &self,
        work: &dyn UnitOfWork,
        history: &ExecutionHistoryStore,
    ) -> CacheResult<ExecutionOutcome> {
        let identity = work.identity();
        let fingerprint = work.input_fingerprint();

        if let Ok(outputs) = self.check_reusable(&identity, &fingerprint, history).await {
            debug!("Reusing workspace for {}", work.display_name());
            self.journal.touch(&identity, Utc::now()).await;
            return Ok(ExecutionOutcome::Success(outputs));
        }

        let handle = self.resolve_or_create(&identity).await?;

        // Another process may have finished while we waited for the lock
        match self.check_reusable(&identity, &fingerprint, history).await {
            Ok(outputs) => {
                debug!(
                    "Workspace for {} completed by another process",
                    work.display_name()
                );
                self.journal.touch(&identity, Utc::now()).await;
                return Ok(ExecutionOutcome::Success(outputs));
            }
            Err(reason) => {
                if handle.state().await != WorkspaceState::Miss {
                    info!(
                        "Recreating workspace for {}: {}",
                        work.display_name(),
                        reason
                    );
                }
            }
        }

        let staging = handle.begin().await?;
        let produced = match work.execute(staging.path()).await {
            Ok(outputs) => outputs,
            Err(failure) => {
                info!("{} failed: {}", work.display_name(), failure);
                staging.abandon().await;
                return Ok(ExecutionOutcome::Failure(failure));
            }
        };

        let relative = match relativize_outputs(staging.path(), &produced) {
            Ok(relative) => relative,
            Err(failure) => {
                warn!("{} produced invalid outputs: {}", work.display_name(), failure);
                staging.abandon().await;
                return Ok(ExecutionOutcome::Failure(failure));
            }
        };

        let dir = handle.complete(staging).await?;

        if let Err(e) = history.record(&identity, &fingerprint, &relative).await {
            warn!("{}", e);
        }
        self.journal.touch(&identity, Utc::now()).await;

        Ok(ExecutionOutcome::Success(
            relative.iter().map(|p| dir.join(p)).collect(),
        ))
    }

    /// Identities with a workspace directory
    pub async fn identities(&self) -> CacheResult<Vec<Identity>> {
        let mut identities = vec![];
        let mut entries = match fs::read_dir(self.root.workspaces_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(identities),
            Err(e) => return Err(CacheError::io("reading workspaces directory", e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::io("reading workspace entry", e))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            if let Some(identity) = entry.file_name().to_str().and_then(|n| Identity::parse(n).ok())
            {
                identities.push(identity);
            }
        }

        identities.sort();
        Ok(identities)
    }

    /// Staging directories with the identity they were created for
    pub async fn staging_entries(&self) -> CacheResult<Vec<(Identity, PathBuf)>> {
        let mut staged = vec![];
        let mut entries = match fs::read_dir(self.root.staging_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(staged),
            Err(e) => return Err(CacheError::io("reading staging directory", e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::io("reading staging entry", e))?
        {
            let name = entry.file_name();
            let identity = name
                .to_str()
                .and_then(|n| n.split_once('-'))
                .and_then(|(id, _)| Identity::parse(id).ok());
            if let Some(identity) = identity {
                staged.push((identity, entry.path()));
            }
        }

        Ok(staged)
    }

    /// Remove a workspace unless someone is using it
    ///
    /// Returns `false` when the workspace lock is held elsewhere.
    pub async fn remove_if_idle(&self, identity: &Identity) -> CacheResult<bool> {
        let Some(guard) = self.try_lock(identity)? else {
            return Ok(false);
        };
        self.remove_locked(identity, &guard).await?;
        Ok(true)
    }

    /// Lock the workspace of `identity` only if nobody else holds it
    pub fn try_lock(&self, identity: &Identity) -> CacheResult<Option<LockGuard>> {
        self.lock_for(identity).try_acquire()
    }

    /// Remove a workspace whose lock the caller holds
    pub async fn remove_locked(&self, identity: &Identity, _guard: &LockGuard) -> CacheResult<()> {
        remove_dir_if_exists(&self.workspace_dir(identity)).await?;
        self.journal.forget(identity).await;
        Ok(())
    }

    /// Remove a staging directory unless its identity is being computed
    pub async fn remove_staging_if_idle(&self, identity: &Identity, path: &Path) -> CacheResult<bool> {
        let Some(_guard) = self.lock_for(identity).try_acquire()? else {
            return Ok(false);
        };
        remove_dir_if_exists(path).await?;
        Ok(true)
    }

    /// Outputs of a complete, up-to-date workspace
    ///
    /// The error describes why the workspace cannot be reused.
    async fn check_reusable(
        &self,
        identity: &Identity,
        fingerprint: &InputFingerprint,
        history: &ExecutionHistoryStore,
    ) -> Result<Vec<PathBuf>, CacheError> {
        let dir = self.workspace_dir(identity);
        match state_of(&dir).await {
            WorkspaceState::Complete => {}
            state => {
                return Err(CacheError::WorkspaceCorruption {
                    path: dir,
                    reason: format!("workspace is {}", state),
                })
            }
        }

        read_marker(&dir, identity).await?;

        let record = history
            .load(identity)
            .await
            .ok_or_else(|| CacheError::WorkspaceCorruption {
                path: dir.clone(),
                reason: "no execution history".to_string(),
            })?;

        if !record.matches(fingerprint) {
            return Err(CacheError::WorkspaceCorruption {
                path: dir,
                reason: "inputs changed since it was produced".to_string(),
            });
        }

        let outputs = record.outputs_in(&dir);
        for output in &outputs {
            if fs::symlink_metadata(output).await.is_err() {
                return Err(CacheError::WorkspaceCorruption {
                    path: dir,
                    reason: format!("output {} is missing", output.display()),
                });
            }
        }

        Ok(outputs)
    }
}

/// Exclusive write access to one workspace
///
/// The lock is released when the handle is dropped.
#[derive(Debug)]
pub struct WorkspaceHandle {
    identity: Identity,
    dir: PathBuf,
    staging_root: PathBuf,
    _guard: LockGuard,
}

impl WorkspaceHandle {
    /// Identity owning the workspace
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Final directory of the workspace
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current on-disk state
    pub async fn state(&self) -> WorkspaceState {
        state_of(&self.dir).await
    }

    /// Remove the workspace wholesale
    pub async fn discard(&self) -> CacheResult<()> {
        remove_dir_if_exists(&self.dir).await?;
        debug!("Discarded workspace {}", self.identity.short());
        Ok(())
    }

    /// Discard prior contents and create a fresh staging directory
    pub async fn begin(&self) -> CacheResult<StagingDir> {
        self.discard().await?;

        let path = self
            .staging_root
            .join(format!("{}-{}", self.identity, uuid::Uuid::new_v4().simple()));
        fs::create_dir_all(&path)
            .await
            .map_err(|e| CacheError::unusable(&path, &e))?;

        debug!("Staging {} in {}", self.identity.short(), path.display());
        Ok(StagingDir { path })
    }

    /// Mark staged contents complete and move them into place
    pub async fn complete(&self, staging: StagingDir) -> CacheResult<PathBuf> {
        let marker = CompletionMarker {
            identity: self.identity.clone(),
            completed_at: Utc::now(),
        };
        let content = serde_json::to_vec_pretty(&marker)?;
        let marker_path = staging.path.join(COMPLETION_MARKER);
        fs::write(&marker_path, content)
            .await
            .map_err(|e| CacheError::unusable(&marker_path, &e))?;

        if let Some(parent) = self.dir.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CacheError::unusable(parent, &e))?;
        }
        if let Err(e) = fs::rename(&staging.path, &self.dir).await {
            staging.abandon().await;
            return Err(CacheError::unusable(&self.dir, &e));
        }

        debug!("Completed workspace {}", self.identity.short());
        Ok(self.dir.clone())
    }
}

/// Private directory a computation writes into
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    /// Directory to produce outputs in
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the staging directory and everything in it
    ///
    /// Leftovers from a crash are removed by cleanup instead.
    pub async fn abandon(self) {
        if let Err(e) = remove_dir_if_exists(&self.path).await {
            warn!("Failed to remove staging directory: {}", e);
        }
    }
}

async fn state_of(dir: &Path) -> WorkspaceState {
    if fs::metadata(dir.join(COMPLETION_MARKER)).await.is_ok() {
        WorkspaceState::Complete
    } else if fs::metadata(dir).await.is_ok() {
        WorkspaceState::Building
    } else {
        WorkspaceState::Miss
    }
}

async fn read_marker(dir: &Path, identity: &Identity) -> CacheResult<CompletionMarker> {
    let corrupt = |reason: String| CacheError::WorkspaceCorruption {
        path: dir.to_path_buf(),
        reason,
    };

    let content = fs::read(dir.join(COMPLETION_MARKER))
        .await
        .map_err(|e| corrupt(format!("unreadable completion marker: {}", e)))?;
    let marker: CompletionMarker = serde_json::from_slice(&content)
        .map_err(|e| corrupt(format!("invalid completion marker: {}", e)))?;

    if marker.identity != *identity {
        return Err(corrupt(format!(
            "completion marker belongs to {}",
            marker.identity
        )));
    }
    Ok(marker)
}

async fn remove_dir_if_exists(dir: &Path) -> CacheResult<()> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CacheError::unusable(dir, &e)),
    }
}

/// Express outputs relative to the workspace they were produced in
fn relativize_outputs(
    workspace: &Path,
    outputs: &[PathBuf],
) -> Result<Vec<PathBuf>, CapturedFailure> {
    outputs
        .iter()
        .map(|output| {
            let relative = if output.is_absolute() {
                output.strip_prefix(workspace).map(Path::to_path_buf).map_err(|_| {
                    CapturedFailure::new(format!(
                        "output {} is outside the workspace",
                        output.display()
                    ))
                })?
            } else {
                output.clone()
            };

            if relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
            {
                return Err(CapturedFailure::new(format!(
                    "output {} escapes the workspace",
                    output.display()
                )));
            }
            if !workspace.join(&relative).exists() {
                return Err(CapturedFailure::new(format!(
                    "declared output {} was not produced",
                    relative.display()
                )));
            }
            Ok(relative)
        })
        .collect()
}
