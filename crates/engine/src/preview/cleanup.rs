//! Retention for the preview cache.
//!
//! Entries are removed a whole directory at a time. Age is measured from the
//! manifest's `last_accessed`, falling back to the directory's modification
//! time for entries without a manifest.

use super::manifest::CacheManifest;
use crate::config::CleanupPolicy;
use serde::Serialize;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// What a cleanup pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub removed: usize,
    pub kept: usize,
    pub freed_bytes: u64,
}

/// Total size of every file below `root`; 0 when the root does not exist.
pub fn cache_size_bytes(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// When an entry was last used.
pub fn entry_last_accessed(dir: &Path) -> Option<SystemTime> {
    if let Some(manifest) = CacheManifest::load(dir) {
        if manifest.last_accessed > 0 {
            return Some(UNIX_EPOCH + Duration::from_secs(manifest.last_accessed));
        }
    }
    std::fs::metadata(dir).and_then(|m| m.modified()).ok()
}

fn remove_entry(dir: &Path, report: &mut CleanupReport) -> io::Result<()> {
    let bytes = cache_size_bytes(dir);
    std::fs::remove_dir_all(dir)?;
    report.removed += 1;
    report.freed_bytes += bytes;
    Ok(())
}

/// Remove entries for which `expired` returns true.
fn sweep(root: &Path, expired: impl Fn(&Path) -> bool) -> io::Result<CleanupReport> {
    let mut report = CleanupReport::default();
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(report),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        if !expired(&path) {
            report.kept += 1;
            continue;
        }
        if let Err(e) = remove_entry(&path, &mut report) {
            warn!(dir = %path.display(), error = %e, "failed to remove cache entry");
            report.kept += 1;
        }
    }
    Ok(report)
}

/// Remove every cache entry.
pub fn clear_all(root: &Path) -> io::Result<CleanupReport> {
    let report = sweep(root, |_| true)?;
    info!(
        removed = report.removed,
        freed_bytes = report.freed_bytes,
        "preview cache cleared"
    );
    Ok(report)
}

/// Apply `policy` as of `now`.
///
/// Time-based policies remove entries not accessed within their window;
/// `PurgeOnStart` removes everything and `Manual` removes nothing.
pub fn apply_cleanup(root: &Path, policy: CleanupPolicy, now: SystemTime) -> io::Result<CleanupReport> {
    if policy == CleanupPolicy::PurgeOnStart {
        return clear_all(root);
    }
    let Some(days) = policy.retention_days() else {
        debug!("manual cache cleanup policy; nothing to do");
        return Ok(CleanupReport::default());
    };

    let cutoff = now.checked_sub(DAY * days).unwrap_or(UNIX_EPOCH);
    let report = sweep(root, |dir| match entry_last_accessed(dir) {
        Some(at) => at < cutoff,
        None => false,
    })?;
    if report.removed > 0 {
        info!(
            removed = report.removed,
            kept = report.kept,
            freed_bytes = report.freed_bytes,
            retention_days = days,
            "expired preview cache entries"
        );
    }
    Ok(report)
}

/// Cleanup run once when the application starts.
pub fn cleanup_on_start(root: &Path, policy: CleanupPolicy) -> io::Result<CleanupReport> {
    apply_cleanup(root, policy, SystemTime::now())
}
