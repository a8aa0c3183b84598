//! Unit of work abstraction and cached outcomes
//!
//! The work itself is computed by the build engine. The cache only needs
//! its identity, its input fingerprint and a way to run it into a
//! workspace directory.

use crate::identity::{Identity, InputFingerprint};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// A deterministic piece of work whose outputs can be cached
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// Identity derived from all declared inputs
    fn identity(&self) -> Identity;

    /// Fingerprint of the inputs, compared against execution history
    fn input_fingerprint(&self) -> InputFingerprint;

    /// Human-readable name for logs and errors
    fn display_name(&self) -> String;

    /// Produce outputs under `workspace` and return their paths in order
    ///
    /// Returned paths must live inside `workspace`; they may be absolute
    /// or relative to it.
    async fn execute(&self, workspace: &Path) -> Result<Vec<PathBuf>, CapturedFailure>;
}

/// Failure captured from a unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedFailure {
    /// Top-level failure message
    pub message: String,

    /// Underlying causes, outermost first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
}

impl CapturedFailure {
    /// Create a failure with no causes
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            causes: vec![],
        }
    }

    /// Capture an error and its source chain
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut causes = vec![];
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        Self {
            message: err.to_string(),
            causes,
        }
    }

    /// Attach a cause
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }
}

impl fmt::Display for CapturedFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for cause in &self.causes {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for CapturedFailure {}

/// Outcome of executing a unit of work, as held by the identity cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Ordered output files
    Success(Vec<PathBuf>),
    /// The work failed; the failure is replayed on every lookup
    Failure(CapturedFailure),
}

impl ExecutionOutcome {
    /// Whether this is a success
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Output files, if successful
    pub fn outputs(&self) -> Option<&[PathBuf]> {
        match self {
            Self::Success(outputs) => Some(outputs),
            Self::Failure(_) => None,
        }
    }

    /// Convert into a standard result
    pub fn into_result(self) -> Result<Vec<PathBuf>, CapturedFailure> {
        match self {
            Self::Success(outputs) => Ok(outputs),
            Self::Failure(failure) => Err(failure),
        }
    }
}

impl From<Result<Vec<PathBuf>, CapturedFailure>> for ExecutionOutcome {
    fn from(result: Result<Vec<PathBuf>, CapturedFailure>) -> Self {
        match result {
            Ok(outputs) => Self::Success(outputs),
            Err(failure) => Self::Failure(failure),
        }
    }
}
