//! Change detector task.
//!
//! Polls the watch directory on a fixed interval and streams tracked files
//! that are new or have a newer modification time to the Batcher.

use crate::error::{Result, ShipError};
use crate::shipping::channel::{ChangeEvent, ChangeKind, RelaySender, ShipStats};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Detector configuration
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Directory to watch (not recursive)
    pub root: PathBuf,
    /// File names worth shipping
    pub tracked: Vec<String>,
    /// Sleep between poll cycles
    pub poll_interval: Duration,
    /// Emit files already present at startup instead of recording them silently
    pub emit_existing: bool,
}

/// Detector state
pub struct ChangeDetector {
    config: DetectorConfig,
    root: PathBuf,
    observed: HashMap<PathBuf, SystemTime>,
    // Paths dropped from `observed` because their mtime advanced; the next
    // cycle re-detects them as new and reports them as modified.
    redetect: HashSet<PathBuf>,
    primed: bool,
    /// Events accepted by the downstream relay
    emitted: u64,
}

impl ChangeDetector {
    pub fn new(config: DetectorConfig) -> Self {
        let root = std::path::absolute(&config.root).unwrap_or_else(|_| config.root.clone());
        Self {
            config,
            root,
            observed: HashMap::new(),
            redetect: HashSet::new(),
            primed: false,
            emitted: 0,
        }
    }

    /// Number of paths currently in the observation table.
    pub fn observed_len(&self) -> usize {
        self.observed.len()
    }

    pub fn stats(&self) -> ShipStats {
        ShipStats {
            events_detected: self.emitted,
            ..ShipStats::default()
        }
    }

    pub fn is_observed(&self, path: &std::path::Path) -> bool {
        self.observed.contains_key(path)
    }

    /// Run one poll cycle and return the changes it found.
    ///
    /// New paths within a cycle are reported in file-name order.
    pub async fn poll(&mut self) -> Result<Vec<ChangeEvent>> {
        let listed = self.list_tracked().await?;

        if !self.primed {
            self.primed = true;
            if !self.config.emit_existing {
                debug!(count = listed.len(), "Recorded startup baseline");
                self.observed = listed.into_iter().collect();
                return Ok(Vec::new());
            }
        }

        let mut events = Vec::new();
        for (path, mtime) in &listed {
            if self.observed.contains_key(path) {
                continue;
            }
            let kind = if self.redetect.remove(path) {
                ChangeKind::Modified
            } else {
                ChangeKind::New
            };
            self.observed.insert(path.clone(), *mtime);
            events.push(ChangeEvent {
                path: path.clone(),
                kind,
                mtime: *mtime,
            });
        }

        let redetect = &mut self.redetect;
        self.observed.retain(|path, recorded| match listed.get(path) {
            None => {
                debug!(path = %path.display(), "Tracked file disappeared");
                false
            }
            Some(current) if current > recorded => {
                redetect.insert(path.clone());
                false
            }
            Some(_) => true,
        });
        self.redetect.retain(|path| listed.contains_key(path));

        Ok(events)
    }

    /// Run the detector until cancelled, sending changes downstream.
    pub async fn run(
        &mut self,
        tx: RelaySender<ChangeEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!(
            root = %self.root.display(),
            interval = ?self.config.poll_interval,
            "Watching for snapshot changes"
        );

        while !cancel.is_cancelled() {
            for event in self.poll().await? {
                info!(path = %event.path.display(), kind = ?event.kind, "Detected change");
                if tx.send(event, &cancel).await? {
                    self.emitted += 1;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        Ok(())
    }

    async fn list_tracked(&self) -> Result<BTreeMap<PathBuf, SystemTime>> {
        let watch_err = |source| ShipError::WatchDir {
            path: self.root.clone(),
            source,
        };

        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(watch_err)?;
        let mut listed = BTreeMap::new();

        while let Some(entry) = entries.next_entry().await.map_err(watch_err)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !self.config.tracked.iter().any(|t| t == name) {
                continue;
            }

            // Removed between listing and stat: treat as gone
            let Ok(meta) = tokio::fs::metadata(entry.path()).await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let mtime = meta.modified().map_err(watch_err)?;
            listed.insert(self.root.join(name), mtime);
        }

        Ok(listed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SNAPSHOT_FILES;
    use filetime::FileTime;
    use std::fs;
    use tempfile::TempDir;

    fn detector(root: &std::path::Path) -> ChangeDetector {
        ChangeDetector::new(DetectorConfig {
            root: root.to_path_buf(),
            tracked: SNAPSHOT_FILES.iter().map(|s| s.to_string()).collect(),
            poll_interval: Duration::from_millis(10),
            emit_existing: false,
        })
    }

    fn bump_mtime(path: &std::path::Path, secs: i64) {
        let meta = fs::metadata(path).unwrap();
        let mtime = FileTime::from_last_modification_time(&meta);
        let newer = FileTime::from_unix_time(mtime.unix_seconds() + secs, 0);
        filetime::set_file_mtime(path, newer).unwrap();
    }

    #[tokio::test]
    async fn test_existing_files_are_baseline() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("snapshot.meta"), "m").unwrap();

        let mut det = detector(tmp.path());
        assert!(det.poll().await.unwrap().is_empty());
        assert_eq!(det.observed_len(), 1);
        assert!(det.poll().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_emit_existing() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("snapshot.meta"), "m").unwrap();

        let mut det = detector(tmp.path());
        det.config.emit_existing = true;

        let events = det.poll().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::New);
    }

    #[tokio::test]
    async fn test_new_files_emitted_once_in_name_order() {
        let tmp = TempDir::new().unwrap();
        let mut det = detector(tmp.path());
        det.poll().await.unwrap();

        fs::write(tmp.path().join("snapshot.state"), "s").unwrap();
        fs::write(tmp.path().join("snapshot.meta"), "m").unwrap();

        let events = det.poll().await.unwrap();
        let names: Vec<_> = events
            .iter()
            .map(|e| e.path.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["snapshot.meta", "snapshot.state"]);
        assert!(events.iter().all(|e| e.kind == ChangeKind::New));
        assert!(events.iter().all(|e| e.path.is_absolute()));

        // Unchanged directory never re-emits
        for _ in 0..3 {
            assert!(det.poll().await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_untracked_files_ignored() {
        let tmp = TempDir::new().unwrap();
        let mut det = detector(tmp.path());
        det.poll().await.unwrap();

        fs::write(tmp.path().join("notes.txt"), "x").unwrap();
        fs::create_dir(tmp.path().join("snapshot.gc")).unwrap();

        assert!(det.poll().await.unwrap().is_empty());
        assert_eq!(det.observed_len(), 0);
    }

    #[tokio::test]
    async fn test_modified_file_redetected_next_cycle() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("snapshot.state");
        fs::write(&file, "v1").unwrap();

        let mut det = detector(tmp.path());
        det.poll().await.unwrap();

        bump_mtime(&file, 10);

        // The cycle that notices the newer mtime drops the record
        assert!(det.poll().await.unwrap().is_empty());
        assert!(!det.is_observed(&det.root.join("snapshot.state")));

        let events = det.poll().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Modified);
        assert_eq!(events[0].mtime, fs::metadata(&file).unwrap().modified().unwrap());

        assert!(det.poll().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rapid_modifications_collapse() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("snapshot.meta");
        fs::write(&file, "v1").unwrap();

        let mut det = detector(tmp.path());
        det.poll().await.unwrap();

        bump_mtime(&file, 10);
        bump_mtime(&file, 10);

        let mut total = 0;
        for _ in 0..4 {
            total += det.poll().await.unwrap().len();
        }
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_disappeared_file_dropped_silently() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("snapshot.gc");
        fs::write(&file, "gc").unwrap();

        let mut det = detector(tmp.path());
        det.poll().await.unwrap();
        assert_eq!(det.observed_len(), 1);

        fs::remove_file(&file).unwrap();
        assert!(det.poll().await.unwrap().is_empty());
        assert_eq!(det.observed_len(), 0);

        // Reappearing counts as new
        fs::write(&file, "gc").unwrap();
        let events = det.poll().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::New);
    }

    #[tokio::test]
    async fn test_missing_directory_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let mut det = detector(&tmp.path().join("missing"));

        let err = det.poll().await.unwrap_err();
        assert!(matches!(err, ShipError::WatchDir { .. }));
    }

    #[tokio::test]
    async fn test_run_sends_events_until_cancelled() {
        use crate::shipping::channel::{relay, OverflowPolicy};

        let tmp = TempDir::new().unwrap();
        let (tx, mut rx) = relay("paths", 16, OverflowPolicy::Block);
        let cancel = CancellationToken::new();

        let mut det = detector(tmp.path());
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            det.run(tx, token).await.unwrap();
            det.stats()
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        fs::write(tmp.path().join("snapshot.meta.bkp"), "b").unwrap();

        let event = rx
            .recv(Duration::from_secs(5), &cancel)
            .await
            .unwrap()
            .unwrap();
        assert!(event.path.ends_with("snapshot.meta.bkp"));

        cancel.cancel();
        assert_eq!(handle.await.unwrap().events_detected, 1);
    }

    #[tokio::test]
    async fn test_event_cut_off_by_cancel_is_not_counted() {
        use crate::shipping::channel::{relay, OverflowPolicy};

        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("snapshot.gc"), "g").unwrap();
        fs::write(tmp.path().join("snapshot.meta"), "m").unwrap();

        // Room for one event; nobody drains the relay
        let (tx, _rx) = relay("paths", 1, OverflowPolicy::Block);
        let cancel = CancellationToken::new();

        let mut det = detector(tmp.path());
        det.config.emit_existing = true;
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            det.run(tx, token).await.unwrap();
            det.stats()
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        assert_eq!(handle.await.unwrap().events_detected, 1);
    }
}
