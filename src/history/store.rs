//! File-backed execution history store
//!
//! One JSON document per identity, replaced atomically on every write.
//! Readers that race a writer see either the old or the new document,
//! never a torn one; anything that still fails to parse is a miss.

use crate::cache::root::write_atomic;
use crate::error::{CacheError, CacheResult};
use crate::history::record::HistoryRecord;
use crate::identity::{Identity, InputFingerprint};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Persistent history keyed by identity
#[derive(Debug, Clone)]
pub struct ExecutionHistoryStore {
    dir: PathBuf,
    producer_version: String,
}

impl ExecutionHistoryStore {
    /// Store in `dir`, stamping records with `producer_version`
    pub fn new(dir: impl Into<PathBuf>, producer_version: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            producer_version: producer_version.into(),
        }
    }

    /// Directory holding the records
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load the record for an identity
    ///
    /// Read failures are logged and reported as a miss.
    pub async fn load(&self, identity: &Identity) -> Option<HistoryRecord> {
        match self.try_load(identity).await {
            Ok(record) => record,
            Err(e) => {
                warn!("Treating execution history as missing: {}", e);
                None
            }
        }
    }

    /// Load the record for an identity, reporting read failures
    pub async fn try_load(&self, identity: &Identity) -> CacheResult<Option<HistoryRecord>> {
        let path = self.record_path(identity);
        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CacheError::HistoryRead {
                    path,
                    reason: e.to_string(),
                })
            }
        };

        let record: HistoryRecord =
            serde_json::from_slice(&content).map_err(|e| CacheError::HistoryRead {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        if record.identity != *identity {
            return Err(CacheError::HistoryRead {
                path,
                reason: format!("record belongs to {}", record.identity),
            });
        }

        Ok(Some(record))
    }

    /// Record the outputs an execution produced
    ///
    /// `outputs` are relative to the workspace.
    pub async fn record(
        &self,
        identity: &Identity,
        fingerprint: &InputFingerprint,
        outputs: &[PathBuf],
    ) -> CacheResult<()> {
        let path = self.record_path(identity);
        let record = HistoryRecord::new(
            identity.clone(),
            fingerprint.clone(),
            outputs.to_vec(),
            self.producer_version.clone(),
        );

        let content = serde_json::to_vec_pretty(&record).map_err(|e| CacheError::HistoryWrite {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        write_atomic(&path, &content)
            .await
            .map_err(|e| CacheError::HistoryWrite {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        debug!(
            "Recorded execution history for {} ({} outputs)",
            identity.short(),
            outputs.len()
        );
        Ok(())
    }

    /// Remove the record for an identity
    pub async fn remove(&self, identity: &Identity) -> CacheResult<()> {
        let path = self.record_path(identity);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::HistoryWrite {
                path,
                reason: e.to_string(),
            }),
        }
    }

    /// All identities with a record file
    pub async fn identities(&self) -> CacheResult<Vec<Identity>> {
        let mut identities = vec![];
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(identities),
            Err(e) => return Err(CacheError::io("reading history directory", e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::io("reading history entry", e))?
        {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            if let Ok(identity) = Identity::parse(stem) {
                identities.push(identity);
            }
        }

        identities.sort();
        Ok(identities)
    }

    fn record_path(&self, identity: &Identity) -> PathBuf {
        self.dir.join(format!("{}.json", identity))
    }
}
