//! workcache - Persistent, concurrency-safe result caching for build work
//!
//! Caches the outcome of deterministic units of work keyed by an identity
//! derived from their inputs. Outcomes are kept in memory for the duration
//! of a root build and in immutable on-disk workspaces shared between
//! builds and processes.

pub mod cache;
pub mod config;
pub mod error;
pub mod history;
pub mod identity;
pub mod logging;
pub mod services;
pub mod session;
pub mod work;

pub use cache::{ArtifactCacheProvider, IdentityCache, WorkspaceStore};
pub use error::{CacheError, CacheResult};
pub use history::ExecutionHistoryStore;
pub use identity::{Identity, IdentityHasher, InputFingerprint};
pub use logging::{run_with_logging_scope, CapturedOutput, LogLevel};
pub use services::WorkspaceServices;
pub use session::{BuildSession, RootBuildListener};
pub use work::{CapturedFailure, ExecutionOutcome, UnitOfWork};
