//! History record persisted per identity

use crate::identity::{Identity, InputFingerprint};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What a previous execution of an identity produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Identity the record belongs to
    pub identity: Identity,

    /// Fingerprint of the inputs at execution time
    pub fingerprint: InputFingerprint,

    /// Outputs relative to the workspace, in order
    pub outputs: Vec<PathBuf>,

    /// Tool version that wrote the record
    pub producer_version: String,

    /// When the record was written
    pub recorded_at: DateTime<Utc>,
}

impl HistoryRecord {
    /// Create a record stamped now
    pub fn new(
        identity: Identity,
        fingerprint: InputFingerprint,
        outputs: Vec<PathBuf>,
        producer_version: impl Into<String>,
    ) -> Self {
        Self {
            identity,
            fingerprint,
            outputs,
            producer_version: producer_version.into(),
            recorded_at: Utc::now(),
        }
    }

    /// Whether the record was produced from `fingerprint`
    pub fn matches(&self, fingerprint: &InputFingerprint) -> bool {
        self.fingerprint == *fingerprint
    }

    /// Outputs resolved against a workspace directory
    pub fn outputs_in(&self, workspace: &Path) -> Vec<PathBuf> {
        self.outputs.iter().map(|p| workspace.join(p)).collect()
    }
}
