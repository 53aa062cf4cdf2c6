//! Watch folder monitor.
//!
//! Polls one directory (non-recursively) on a fixed interval. A file is
//! reported once its size is nonzero and unchanged across two consecutive
//! polls; it is not reported again unless its size changes. Files past the
//! configured age thresholds are deleted or ignored before the size check.

use crate::config::WatchConfig;
use std::collections::HashMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("cannot read watch folder {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("no watch folder configured")]
    NotConfigured,
}

/// Size bookkeeping across polls.
#[derive(Debug, Default)]
pub struct StabilityTracker {
    /// Size seen on the previous poll
    observed: HashMap<PathBuf, u64>,
    /// Size at which a file was last reported stable
    reported: HashMap<PathBuf, u64>,
}

impl StabilityTracker {
    /// Feed one poll's worth of `(path, size)` pairs; returns the files that
    /// became stable on this poll. Files absent from `current` are forgotten.
    pub fn observe(&mut self, current: &[(PathBuf, u64)]) -> Vec<PathBuf> {
        let mut stable = Vec::new();
        let mut next = HashMap::with_capacity(current.len());

        for (path, size) in current {
            if self.reported.get(path) == Some(size) {
                continue;
            }
            self.reported.remove(path);

            let previous = self.observed.get(path).copied();
            if *size > 0 && previous == Some(*size) {
                self.reported.insert(path.clone(), *size);
                stable.push(path.clone());
            } else {
                next.insert(path.clone(), *size);
            }
        }

        self.reported.retain(|p, _| current.iter().any(|(c, _)| c == p));
        self.observed = next;
        stable
    }

    /// Stop tracking a path entirely.
    pub fn forget(&mut self, path: &Path) {
        self.observed.remove(path);
        self.reported.remove(path);
    }

    pub fn tracked(&self) -> usize {
        self.observed.len()
    }
}

/// What one poll found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollReport {
    pub stable: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
    pub ignored: Vec<PathBuf>,
}

/// When a file arrived: creation time, else modification time, else `now`.
pub fn added_time(meta: &Metadata, now: SystemTime) -> SystemTime {
    meta.created().or_else(|_| meta.modified()).unwrap_or(now)
}

/// Working files written next to outputs; never picked up.
fn is_working_file(name: &str) -> bool {
    name.starts_with('.') || name.contains(".partial.") || name.contains(".orig.")
}

/// Polls a single directory for newly arrived, fully written files.
#[derive(Debug)]
pub struct FolderWatcher {
    dir: PathBuf,
    extensions: Vec<String>,
    poll_interval: Duration,
    ignore_after: Option<Duration>,
    delete_after: Option<Duration>,
    tracker: StabilityTracker,
}

impl FolderWatcher {
    pub fn new(dir: &Path, cfg: &WatchConfig) -> Self {
        Self {
            dir: dir.to_path_buf(),
            extensions: cfg
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            poll_interval: Duration::from_secs(cfg.poll_interval_secs.max(1)),
            ignore_after: cfg.ignore_after.map(|a| a.as_duration()),
            delete_after: cfg.delete_after.map(|a| a.as_duration()),
            tracker: StabilityTracker::default(),
        }
    }

    /// Watcher for `[watch].dir`.
    pub fn from_config(cfg: &WatchConfig) -> Result<Self, WatchError> {
        let dir = cfg.dir.as_deref().ok_or(WatchError::NotConfigured)?;
        Ok(Self::new(dir, cfg))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn accepts(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if is_working_file(name) {
            return false;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }

    /// One scan of the folder as of `now`.
    pub fn poll_once(&mut self, now: SystemTime) -> Result<PollReport, WatchError> {
        let mut report = PollReport::default();
        let mut sizes = Vec::new();

        let walker = WalkDir::new(&self.dir).min_depth(1).max_depth(1);
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => {
                    return Err(WatchError::Unreadable {
                        path: self.dir.clone(),
                        source: e,
                    })
                }
                Err(e) => {
                    debug!(error = %e, "skipping unreadable watch entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !self.accepts(entry.path()) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let path = entry.into_path();
            let age = now
                .duration_since(added_time(&meta, now))
                .unwrap_or_default();

            if self.delete_after.is_some_and(|limit| age >= limit) {
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        info!(path = %path.display(), "deleted file past watch-folder age limit");
                        report.deleted.push(path.clone());
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to delete aged file"),
                }
                self.tracker.forget(&path);
                continue;
            }
            if self.ignore_after.is_some_and(|limit| age >= limit) {
                self.tracker.forget(&path);
                report.ignored.push(path);
                continue;
            }
            sizes.push((path, meta.len()));
        }

        report.stable = self.tracker.observe(&sizes);
        for path in &report.stable {
            info!(path = %path.display(), "watch-folder file is stable");
        }
        Ok(report)
    }

    /// Poll until `shutdown` fires, sending each non-empty batch of stable files.
    pub async fn run(
        mut self,
        tx: mpsc::UnboundedSender<Vec<PathBuf>>,
        shutdown: CancellationToken,
    ) -> Result<(), WatchError> {
        info!(dir = %self.dir.display(), interval = ?self.poll_interval, "watching folder");
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("watch loop stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            // Directory walks and deletions run on the blocking pool.
            let polled = tokio::task::spawn_blocking(move || {
                let report = self.poll_once(SystemTime::now());
                (self, report)
            })
            .await;
            let report = match polled {
                Ok((watcher, report)) => {
                    self = watcher;
                    report
                }
                Err(e) => {
                    error!(error = %e, "watch poll panicked; stopping");
                    return Ok(());
                }
            };

            match report {
                Ok(report) if !report.stable.is_empty() => {
                    if tx.send(report.stable).is_err() {
                        debug!("watch receiver dropped; stopping");
                        return Ok(());
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "watch poll failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgeThreshold, AgeUnit};
    use proptest::prelude::*;
    use std::fs;
    use tempfile::TempDir;

    fn config() -> WatchConfig {
        WatchConfig {
            extensions: vec!["mov".to_string(), "MP4".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_accepts_extensions_case_insensitively() {
        let w = FolderWatcher::new(Path::new("/in"), &config());
        assert!(w.accepts(Path::new("/in/a.MOV")));
        assert!(w.accepts(Path::new("/in/a.mp4")));
        assert!(!w.accepts(Path::new("/in/a.txt")));
        assert!(!w.accepts(Path::new("/in/.hidden.mov")));
        assert!(!w.accepts(Path::new("/in/a_h264.partial.mp4")));
        assert!(!w.accepts(Path::new("/in/noext")));
    }

    #[test]
    fn test_stable_after_two_polls_reported_once() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("clip.mov");
        fs::write(&file, b"12345").unwrap();
        let mut w = FolderWatcher::new(dir.path(), &config());
        let now = SystemTime::now();

        assert!(w.poll_once(now).unwrap().stable.is_empty());
        assert_eq!(w.poll_once(now).unwrap().stable, vec![file.clone()]);
        assert!(w.poll_once(now).unwrap().stable.is_empty());

        // A further change makes it eligible again.
        fs::write(&file, b"1234567").unwrap();
        assert!(w.poll_once(now).unwrap().stable.is_empty());
        assert_eq!(w.poll_once(now).unwrap().stable, vec![file]);
    }

    #[test]
    fn test_growing_and_empty_files_are_not_stable() {
        let dir = TempDir::new().unwrap();
        let growing = dir.path().join("growing.mov");
        let empty = dir.path().join("empty.mov");
        fs::write(&growing, b"1").unwrap();
        fs::write(&empty, b"").unwrap();
        let mut w = FolderWatcher::new(dir.path(), &config());
        let now = SystemTime::now();

        w.poll_once(now).unwrap();
        fs::write(&growing, b"12").unwrap();
        assert!(w.poll_once(now).unwrap().stable.is_empty());
        assert!(w.poll_once(now).unwrap().stable.contains(&growing));
        assert!(!w.poll_once(now).unwrap().stable.contains(&empty));
    }

    #[test]
    fn test_age_thresholds() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("old.mov");
        fs::write(&file, b"data").unwrap();
        let later = SystemTime::now() + Duration::from_secs(3 * 3600);

        let mut cfg = config();
        cfg.ignore_after = Some(AgeThreshold::new(2, AgeUnit::Hours));
        let mut w = FolderWatcher::new(dir.path(), &cfg);
        let report = w.poll_once(later).unwrap();
        assert_eq!(report.ignored, vec![file.clone()]);
        assert!(w.poll_once(later).unwrap().stable.is_empty());
        assert!(file.exists());

        cfg.delete_after = Some(AgeThreshold::new(1, AgeUnit::Hours));
        let mut w = FolderWatcher::new(dir.path(), &cfg);
        let report = w.poll_once(later).unwrap();
        assert_eq!(report.deleted, vec![file.clone()]);
        assert!(!file.exists());
    }

    #[test]
    fn test_subdirectories_are_not_scanned() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("converted")).unwrap();
        fs::write(dir.path().join("converted/out.mp4"), b"data").unwrap();
        let mut w = FolderWatcher::new(dir.path(), &config());
        let now = SystemTime::now();
        w.poll_once(now).unwrap();
        assert!(w.poll_once(now).unwrap().stable.is_empty());
    }

    #[test]
    fn test_missing_folder_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut w = FolderWatcher::new(&dir.path().join("absent"), &config());
        assert!(matches!(
            w.poll_once(SystemTime::now()),
            Err(WatchError::Unreadable { .. })
        ));
        assert!(matches!(
            FolderWatcher::from_config(&WatchConfig::default()),
            Err(WatchError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn test_run_sends_batches_until_shutdown() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("clip.mp4");
        fs::write(&file, b"data").unwrap();
        let cfg = WatchConfig {
            poll_interval_secs: 1,
            ..config()
        };
        let w = FolderWatcher::new(dir.path(), &cfg);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(w.run(tx, shutdown.clone()));

        let batch = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch, vec![file]);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_stability_matches_size_history(sizes in proptest::collection::vec(0u64..4, 1..20)) {
            let path = PathBuf::from("/in/a.mov");
            let mut tracker = StabilityTracker::default();
            let mut previous: Option<u64> = None;
            let mut reported_at: Option<u64> = None;

            for size in sizes {
                let stable = !tracker.observe(&[(path.clone(), size)]).is_empty();

                if previous.is_some_and(|p| p != size) {
                    prop_assert!(!stable, "size changed between polls");
                }
                let expected = reported_at != Some(size)
                    && size > 0
                    && previous == Some(size);
                prop_assert_eq!(stable, expected);

                if reported_at.is_some_and(|r| r != size) {
                    reported_at = None;
                }
                if stable {
                    reported_at = Some(size);
                    previous = None;
                } else if reported_at.is_some() {
                    previous = None;
                } else {
                    previous = Some(size);
                }
            }
        }
    }
}
