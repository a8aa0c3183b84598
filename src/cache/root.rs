//! Cache root layout and version metadata
//!
//! ```text
//! <root>/
//!   cache.lock                     root lock
//!   metadata.json                  CacheMetadata
//!   history/<identity>.json        execution history
//!   workspaces/<identity>/         complete workspaces
//!   workspaces/<identity>.lock     per-identity workspace locks
//!   workspaces/.staging/           in-progress computations
//!   journal/<identity>             last access timestamps
//! ```

use crate::error::{CacheError, CacheResult};
use chrono::{DateTime, Duration, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Layout version written into metadata
pub const CACHE_LAYOUT_VERSION: u32 = 1;

/// Paths inside a cache root directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRoot {
    dir: PathBuf,
}

impl CacheRoot {
    /// Root at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Root directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Root lock file
    pub fn lock_file(&self) -> PathBuf {
        self.dir.join("cache.lock")
    }

    /// Metadata file
    pub fn metadata_file(&self) -> PathBuf {
        self.dir.join("metadata.json")
    }

    /// Execution history directory
    pub fn history_dir(&self) -> PathBuf {
        self.dir.join("history")
    }

    /// Workspaces directory
    pub fn workspaces_dir(&self) -> PathBuf {
        self.dir.join("workspaces")
    }

    /// Staging directory for in-progress computations
    pub fn staging_dir(&self) -> PathBuf {
        self.workspaces_dir().join(".staging")
    }

    /// Access journal directory
    pub fn journal_dir(&self) -> PathBuf {
        self.dir.join("journal")
    }

    /// Create all directories of the layout
    pub async fn ensure_layout(&self) -> CacheResult<()> {
        for dir in [
            self.dir.clone(),
            self.history_dir(),
            self.workspaces_dir(),
            self.staging_dir(),
            self.journal_dir(),
        ] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| CacheError::unusable(&dir, &e))?;
        }
        Ok(())
    }
}

/// Metadata describing who uses a cache root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// Layout version of the directory tree
    pub layout_version: u32,

    /// Tool version that last opened the root
    pub producer_version: Version,

    /// When the root was first created
    pub created_at: DateTime<Utc>,

    /// Tool versions and when each last used the root
    #[serde(default)]
    pub used_versions: BTreeMap<String, DateTime<Utc>>,

    /// When the last cleanup sweep ran
    #[serde(default)]
    pub last_cleanup: Option<DateTime<Utc>>,
}

impl CacheMetadata {
    /// Fresh metadata for a new root
    pub fn new(producer_version: Version) -> Self {
        let now = Utc::now();
        let mut metadata = Self {
            layout_version: CACHE_LAYOUT_VERSION,
            producer_version: producer_version.clone(),
            created_at: now,
            used_versions: BTreeMap::new(),
            last_cleanup: None,
        };
        metadata.record_use(&producer_version, now);
        metadata
    }

    /// Load metadata, treating unreadable files as absent
    pub async fn load(path: &Path) -> CacheResult<Option<Self>> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CacheError::io(
                    format!("reading cache metadata {}", path.display()),
                    e,
                ))
            }
        };

        match serde_json::from_str(&content) {
            Ok(metadata) => Ok(Some(metadata)),
            Err(e) => {
                warn!("Ignoring corrupt cache metadata {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    /// Save metadata atomically
    pub async fn save(&self, path: &Path) -> CacheResult<()> {
        let content = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &content).await
    }

    /// Mark `version` as using the root at `now`
    pub fn record_use(&mut self, version: &Version, now: DateTime<Utc>) {
        self.producer_version = version.clone();
        self.used_versions.insert(version.to_string(), now);
    }

    /// Whether `version` is still recorded as in use
    pub fn is_version_in_use(&self, version: &str) -> bool {
        self.used_versions.contains_key(version)
    }

    /// Forget versions not used within `retention`
    ///
    /// `current` is always kept. Returns the removed versions.
    pub fn prune_versions(
        &mut self,
        current: &Version,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        let current = current.to_string();
        let Some(cutoff) = now.checked_sub_signed(retention) else {
            return vec![];
        };
        let stale: Vec<String> = self
            .used_versions
            .iter()
            .filter(|(version, last_used)| **version != current && **last_used < cutoff)
            .map(|(version, _)| version.clone())
            .collect();

        for version in &stale {
            self.used_versions.remove(version);
            debug!("Version {} no longer uses the cache", version);
        }
        stale
    }

    /// Whether a sweep is due given the interval
    pub fn cleanup_due(&self, interval_hours: u32, now: DateTime<Utc>) -> bool {
        match self.last_cleanup {
            None => true,
            Some(_) if interval_hours == 0 => true,
            Some(last) => now - last >= Duration::hours(i64::from(interval_hours)),
        }
    }
}

/// Write `contents` to a temp file next to `path`, then rename over it
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> CacheResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| CacheError::io(format!("creating directory {}", parent.display()), e))?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    fs::write(&temp_path, contents)
        .await
        .map_err(|e| CacheError::io(format!("writing {}", temp_path.display()), e))?;

    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(CacheError::io(format!("replacing {}", path.display()), e));
    }
    Ok(())
}
