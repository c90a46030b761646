#![forbid(unsafe_code)]

//! Removal of temporary files.
//!
//! Two mechanisms work together: one-shot timers for files the server knows
//! it just produced, and a periodic sweep of the temp directory that deletes
//! anything older than the retention window. The sweep also runs at startup,
//! so files left behind by a crash or restart do not accumulate.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Answers whether a file in the temp directory is still in use and must be
/// left alone by the sweep.
pub trait ActiveFiles: Send + Sync + 'static {
    fn is_active(&self, path: &Path) -> bool;
}

#[derive(Debug, Clone)]
pub struct Reaper {
    temp_dir: PathBuf,
    retention: Duration,
}

impl Reaper {
    pub fn new(temp_dir: PathBuf, retention: Duration) -> Self {
        Self {
            temp_dir,
            retention,
        }
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Deletes `path` once `delay` has passed. A file that is already gone is
    /// not an error.
    pub fn schedule_deletion(&self, path: PathBuf, delay: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "deleted temporary file"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to delete temporary file")
                }
            }
        })
    }

    /// Removes every regular file directly inside the temp directory whose
    /// modification time is older than the retention window and which is not
    /// active. Returns how many files were deleted.
    pub fn sweep_now(&self, active: &dyn ActiveFiles) -> usize {
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in WalkDir::new(&self.temp_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let Some(modified) = entry
                .metadata()
                .ok()
                .and_then(|meta| meta.modified().ok())
            else {
                continue;
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age < self.retention || active.is_active(path) {
                continue;
            }
            match remove_if_exists(path) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(err) => warn!(path = %path.display(), error = %err, "sweep could not delete file"),
            }
        }
        removed
    }

    pub async fn sweep(&self, active: Arc<dyn ActiveFiles>) -> usize {
        let reaper = self.clone();
        tokio::task::spawn_blocking(move || reaper.sweep_now(active.as_ref()))
            .await
            .unwrap_or_else(|err| {
                warn!(error = %err, "sweep task failed");
                0
            })
    }

    /// Sweeps immediately, then every `interval`, until the runtime shuts
    /// down.
    pub fn spawn_sweeper(&self, interval: Duration, active: Arc<dyn ActiveFiles>) -> JoinHandle<()> {
        let reaper = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = reaper.sweep(active.clone()).await;
                if removed > 0 {
                    info!(removed, dir = %reaper.temp_dir.display(), "swept expired temporary files");
                }
            }
        })
    }
}

/// `Ok(false)` when the file did not exist.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashSet, fs};
    use tempfile::tempdir;

    struct NoActiveFiles;

    impl ActiveFiles for NoActiveFiles {
        fn is_active(&self, _path: &Path) -> bool {
            false
        }
    }

    struct Held(HashSet<PathBuf>);

    impl ActiveFiles for Held {
        fn is_active(&self, path: &Path) -> bool {
            self.0.contains(path)
        }
    }

    #[tokio::test]
    async fn scheduled_deletion_removes_file_after_delay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("song.mp3");
        fs::write(&path, b"data").unwrap();
        let reaper = Reaper::new(dir.path().to_path_buf(), Duration::from_secs(300));

        let handle = reaper.schedule_deletion(path.clone(), Duration::from_millis(50));
        assert!(path.exists());
        handle.await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn scheduled_deletion_of_missing_file_is_quiet() {
        let dir = tempdir().unwrap();
        let reaper = Reaper::new(dir.path().to_path_buf(), Duration::from_secs(300));
        reaper
            .schedule_deletion(dir.path().join("ghost.mp3"), Duration::ZERO)
            .await
            .unwrap();
    }

    #[test]
    fn sweep_respects_retention_and_active_files() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old.mp3");
        let held = dir.path().join("held.mp3");
        fs::write(&old, b"old").unwrap();
        fs::write(&held, b"held").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        let fresh_only = Reaper::new(dir.path().to_path_buf(), Duration::from_secs(3600));
        assert_eq!(fresh_only.sweep_now(&NoActiveFiles), 0);
        assert!(old.exists());

        let expired = Reaper::new(dir.path().to_path_buf(), Duration::ZERO);
        let active = Held(HashSet::from([held.clone()]));
        assert_eq!(expired.sweep_now(&active), 1);
        assert!(!old.exists());
        assert!(held.exists());
        assert!(dir.path().join("nested").exists());
    }

    #[tokio::test]
    async fn sweeper_runs_at_startup() {
        let dir = tempdir().unwrap();
        let leftover = dir.path().join("leftover.mp3");
        fs::write(&leftover, b"from a previous run").unwrap();
        let reaper = Reaper::new(dir.path().to_path_buf(), Duration::ZERO);

        let handle = reaper.spawn_sweeper(Duration::from_secs(3600), Arc::new(NoActiveFiles));
        for _ in 0..50 {
            if !leftover.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.abort();
        assert!(!leftover.exists());
    }

    #[test]
    fn remove_if_exists_reports_missing_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x");
        assert!(!remove_if_exists(&path).unwrap());
        fs::write(&path, b"x").unwrap();
        assert!(remove_if_exists(&path).unwrap());
    }
}
