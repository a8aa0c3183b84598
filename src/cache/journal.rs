//! Access-time journal for workspaces
//!
//! Records when each identity's workspace was last handed out so that
//! cleanup can evict entries nobody has used for a while. Journal
//! failures only cost eviction accuracy and are never propagated.

use crate::cache::root::write_atomic;
use crate::identity::Identity;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// One timestamp file per identity
#[derive(Debug, Clone)]
pub struct AccessJournal {
    dir: PathBuf,
}

impl AccessJournal {
    /// Journal stored in `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the journal
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record an access at `at`
    pub async fn touch(&self, identity: &Identity, at: DateTime<Utc>) {
        let path = self.entry_path(identity);
        if let Err(e) = write_atomic(&path, at.to_rfc3339().as_bytes()).await {
            warn!("Failed to update access journal for {}: {}", identity.short(), e);
        }
    }

    /// Last recorded access, if any
    pub async fn last_access(&self, identity: &Identity) -> Option<DateTime<Utc>> {
        let content = fs::read_to_string(self.entry_path(identity)).await.ok()?;
        match DateTime::parse_from_rfc3339(content.trim()) {
            Ok(at) => Some(at.with_timezone(&Utc)),
            Err(e) => {
                debug!("Unreadable journal entry for {}: {}", identity.short(), e);
                None
            }
        }
    }

    /// Drop the entry for an identity
    pub async fn forget(&self, identity: &Identity) {
        let path = self.entry_path(identity);
        if let Err(e) = fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove journal entry {}: {}", path.display(), e);
            }
        }
    }

    fn entry_path(&self, identity: &Identity) -> PathBuf {
        self.dir.join(identity.as_str())
    }
}
