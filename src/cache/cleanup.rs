//! End-of-build cleanup sweep
//!
//! Runs with the root lock held. Anything whose workspace lock is held by
//! a live computation is skipped and picked up by a later sweep.

use crate::cache::root::CacheMetadata;
use crate::cache::workspace::{WorkspaceState, WorkspaceStore};
use crate::config::CleanupSettings;
use crate::error::CacheResult;
use crate::history::ExecutionHistoryStore;
use crate::identity::Identity;
use chrono::{DateTime, Duration, Utc};
use semver::Version;
use std::fmt;
use tracing::{debug, warn};

/// What a sweep removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Tool versions no longer recorded as in use
    pub versions_pruned: Vec<String>,
    /// Complete workspaces removed
    pub workspaces_removed: usize,
    /// History records removed
    pub history_removed: usize,
    /// Orphaned staging directories removed
    pub staging_removed: usize,
    /// Entries skipped because they were in use
    pub skipped_busy: usize,
}

impl CleanupReport {
    /// Whether the sweep removed anything
    pub fn is_empty(&self) -> bool {
        self.versions_pruned.is_empty()
            && self.workspaces_removed == 0
            && self.history_removed == 0
            && self.staging_removed == 0
    }
}

impl fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} workspaces, {} history records, {} staging dirs removed; {} versions pruned",
            self.workspaces_removed,
            self.history_removed,
            self.staging_removed,
            self.versions_pruned.len()
        )
    }
}

/// Stores a sweep operates on
pub struct CleanupTargets<'a> {
    pub workspaces: &'a WorkspaceStore,
    pub history: &'a ExecutionHistoryStore,
}

/// Sweep the cache root
///
/// Updates `metadata` in memory (pruned versions, `last_cleanup`); the
/// caller persists it.
pub async fn sweep(
    targets: &CleanupTargets<'_>,
    metadata: &mut CacheMetadata,
    policy: &CleanupSettings,
    current: &Version,
    now: DateTime<Utc>,
) -> CacheResult<CleanupReport> {
    let mut report = CleanupReport {
        versions_pruned: metadata.prune_versions(
            current,
            Duration::days(i64::from(policy.version_retention_days)),
            now,
        ),
        ..CleanupReport::default()
    };

    prune_unused_versions(targets, metadata, &mut report).await?;
    if policy.max_age_days > 0 {
        match cutoff_before(now, policy.max_age_days) {
            Some(cutoff) => evict_unused_workspaces(targets, cutoff, now, &mut report).await?,
            None => debug!("max_age_days {} never expires", policy.max_age_days),
        }
    }
    remove_orphaned_staging(targets, &mut report).await?;
    remove_orphaned_history(targets, &mut report).await?;

    metadata.last_cleanup = Some(now);
    Ok(report)
}

/// `days` before `now`, or `None` when that is out of range
fn cutoff_before(now: DateTime<Utc>, days: u32) -> Option<DateTime<Utc>> {
    Duration::try_days(i64::from(days)).and_then(|age| now.checked_sub_signed(age))
}

/// Drop history (and workspaces) written by versions no longer in use
async fn prune_unused_versions(
    targets: &CleanupTargets<'_>,
    metadata: &CacheMetadata,
    report: &mut CleanupReport,
) -> CacheResult<()> {
    for identity in targets.history.identities().await? {
        if !written_by_unused_version(targets, metadata, &identity).await {
            continue;
        }
        let Some(guard) = targets.workspaces.try_lock(&identity)? else {
            report.skipped_busy += 1;
            continue;
        };
        // A concurrent build may have rewritten it before we got the lock
        if !written_by_unused_version(targets, metadata, &identity).await {
            continue;
        }

        if targets.workspaces.state(&identity).await != WorkspaceState::Miss {
            report.workspaces_removed += 1;
        }
        targets.workspaces.remove_locked(&identity, &guard).await?;
        remove_history(targets, &identity, report).await;
    }
    Ok(())
}

async fn written_by_unused_version(
    targets: &CleanupTargets<'_>,
    metadata: &CacheMetadata,
    identity: &Identity,
) -> bool {
    match targets.history.try_load(identity).await {
        Ok(Some(record)) => !metadata.is_version_in_use(&record.producer_version),
        Ok(None) => false,
        Err(e) => {
            debug!("Removing unreadable history: {}", e);
            true
        }
    }
}

/// Evict workspaces not accessed since `cutoff`
async fn evict_unused_workspaces(
    targets: &CleanupTargets<'_>,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
    report: &mut CleanupReport,
) -> CacheResult<()> {
    let journal = targets.workspaces.journal();
    for identity in targets.workspaces.identities().await? {
        let Some(last_access) = journal.last_access(&identity).await else {
            // Start aging workspaces the journal has never seen
            journal.touch(&identity, now).await;
            continue;
        };
        if last_access >= cutoff {
            continue;
        }

        let Some(guard) = targets.workspaces.try_lock(&identity)? else {
            report.skipped_busy += 1;
            continue;
        };
        if journal
            .last_access(&identity)
            .await
            .is_some_and(|accessed| accessed >= cutoff)
        {
            continue;
        }

        targets.workspaces.remove_locked(&identity, &guard).await?;
        debug!("Evicted workspace {} last used {}", identity.short(), last_access);
        report.workspaces_removed += 1;
        remove_history(targets, &identity, report).await;
    }
    Ok(())
}

async fn remove_orphaned_staging(
    targets: &CleanupTargets<'_>,
    report: &mut CleanupReport,
) -> CacheResult<()> {
    for (identity, path) in targets.workspaces.staging_entries().await? {
        if targets
            .workspaces
            .remove_staging_if_idle(&identity, &path)
            .await?
        {
            debug!("Removed orphaned staging directory {}", path.display());
            report.staging_removed += 1;
        } else {
            report.skipped_busy += 1;
        }
    }
    Ok(())
}

/// Drop history whose workspace no longer exists
///
/// History is written while holding the workspace lock, so the workspace
/// is re-checked under that lock before its history goes.
async fn remove_orphaned_history(
    targets: &CleanupTargets<'_>,
    report: &mut CleanupReport,
) -> CacheResult<()> {
    for identity in targets.history.identities().await? {
        if targets.workspaces.state(&identity).await != WorkspaceState::Miss {
            continue;
        }
        let Some(_guard) = targets.workspaces.try_lock(&identity)? else {
            report.skipped_busy += 1;
            continue;
        };
        if targets.workspaces.state(&identity).await == WorkspaceState::Miss {
            remove_history(targets, &identity, report).await;
        }
    }
    Ok(())
}

async fn remove_history(targets: &CleanupTargets<'_>, identity: &Identity, report: &mut CleanupReport) {
    match targets.history.remove(identity).await {
        Ok(()) => report.history_removed += 1,
        Err(e) => warn!("{}", e),
    }
}
