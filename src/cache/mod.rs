//! Persistent and in-memory result caching
//!
//! Results are cached at two levels:
//!
//! - [`IdentityCache`] remembers outcomes for the current root build, so a
//!   unit of work runs at most once per identity per build.
//! - [`ArtifactCacheProvider`] owns a directory shared between builds and
//!   processes. Each identity gets an immutable workspace directory.
//!
//! # Workspace States
//!
//! | State | On disk | Description |
//! |-------|---------|-------------|
//! | Miss | nothing | Never built or removed by cleanup |
//! | Building | dir without marker | In progress or crashed, discarded and rebuilt |
//! | Complete | dir with `.complete` | Finalized, never modified again |
//!
//! Workspaces are produced in a staging directory and renamed into place
//! once the completion marker is written, so a reader never observes a
//! half-written Complete workspace.

pub mod cleanup;
pub mod identity;
pub mod journal;
pub mod lock;
pub mod provider;
pub mod root;
pub mod workspace;

pub use cleanup::CleanupReport;
pub use identity::IdentityCache;
pub use journal::AccessJournal;
pub use lock::{FileLock, LockGuard};
pub use provider::{ArtifactCacheProvider, LockState};
pub use root::{CacheMetadata, CacheRoot, CACHE_LAYOUT_VERSION};
pub use workspace::{StagingDir, WorkspaceHandle, WorkspaceState, WorkspaceStore, COMPLETION_MARKER};
