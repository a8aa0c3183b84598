//! Error types for workcache
//!
//! All modules use `CacheResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for workcache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// All errors that can occur in workcache
#[derive(Error, Debug)]
pub enum CacheError {
    // Unit of work errors
    #[error("Work {work} failed: {message}")]
    ComputationFailure { work: String, message: String },

    // History errors
    #[error("Failed to read execution history {path}: {reason}")]
    HistoryRead { path: PathBuf, reason: String },

    #[error("Failed to write execution history {path}: {reason}")]
    HistoryWrite { path: PathBuf, reason: String },

    // Locking errors
    #[error("Failed to acquire lock {path}: {reason}")]
    LockAcquisition { path: PathBuf, reason: String },

    // Workspace errors
    #[error("Workspace {path} is corrupt: {reason}")]
    WorkspaceCorruption { path: PathBuf, reason: String },

    #[error("Workspace directory {path} is unusable: {reason}")]
    WorkspaceUnusable { path: PathBuf, reason: String },

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a lock acquisition error
    pub fn lock(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::LockAcquisition {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a workspace unusable error
    pub fn unusable(path: impl Into<PathBuf>, source: &std::io::Error) -> Self {
        Self::WorkspaceUnusable {
            path: path.into(),
            reason: source.to_string(),
        }
    }

    /// Whether the cache degrades to recomputation instead of failing
    ///
    /// History store problems and workspace corruption only cost time;
    /// everything else is fatal for the unit of work that hit it.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::HistoryRead { .. } | Self::HistoryWrite { .. } | Self::WorkspaceCorruption { .. }
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::LockAcquisition { .. } => {
                Some("Another process may be holding the cache lock; retry once it finishes")
            }
            Self::WorkspaceUnusable { .. } => {
                Some("Check permissions and free space of the cache directory")
            }
            Self::ConfigInvalid { .. } => Some("Fix or remove the workcache configuration file"),
            _ => None,
        }
    }
}
