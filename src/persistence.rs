//! Optional best-effort snapshotting of non-terminal tasks, grounded on
//! `augment_adam/core/task_persistence.py`. Snapshots are informational: a
//! restored task list is not re-bound to executable callables, because the
//! callable reference is never serialisable (§9).

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::error::KernelResult;
use crate::task::QueueSnapshot;

const FILE_PREFIX: &str = "tasks_";
const FILE_SUFFIX: &str = ".json";

/// Reads, writes, lists, and prunes queue snapshot files under a directory.
pub struct TaskPersistence {
    dir: PathBuf,
    max_history_files: usize,
}

impl TaskPersistence {
    pub fn new(dir: impl Into<PathBuf>, max_history_files: usize) -> Self {
        Self { dir: dir.into(), max_history_files }
    }

    fn file_path(&self, timestamp: u64) -> PathBuf {
        self.dir.join(format!("{FILE_PREFIX}{timestamp}{FILE_SUFFIX}"))
    }

    /// Writes `snapshot` to a timestamped file, then prunes files beyond
    /// `max_history_files`, oldest first. I/O failures are logged and
    /// swallowed per §7's recovered-locally policy.
    pub async fn save(&self, snapshot: &QueueSnapshot) {
        if let Err(err) = self.try_save(snapshot).await {
            error!(error = %err, "failed to save task queue snapshot");
        }
    }

    async fn try_save(&self, snapshot: &QueueSnapshot) -> KernelResult<()> {
        fs::create_dir_all(&self.dir).await?;

        let timestamp = snapshot.timestamp as u64;
        let path = self.file_path(timestamp);
        let body = serde_json::to_vec_pretty(snapshot)?;
        fs::write(&path, body).await?;

        info!(path = %path.display(), "saved task queue snapshot");
        self.prune_old_files().await;
        Ok(())
    }

    /// Loads the newest snapshot file in the directory, if any.
    pub async fn load_latest(&self) -> Option<QueueSnapshot> {
        let path = self.latest_file().await?;
        match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(snapshot) => {
                    info!(path = %path.display(), "loaded task queue snapshot");
                    Some(snapshot)
                }
                Err(err) => {
                    error!(error = %err, path = %path.display(), "snapshot file is not valid JSON");
                    None
                }
            },
            Err(err) => {
                error!(error = %err, path = %path.display(), "failed to read snapshot file");
                None
            }
        }
    }

    async fn latest_file(&self) -> Option<PathBuf> {
        let mut files = self.list_files().await;
        files.sort();
        files.pop()
    }

    async fn list_files(&self) -> Vec<PathBuf> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut files = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(FILE_PREFIX) && name.ends_with(FILE_SUFFIX) {
                files.push(entry.path());
            }
        }
        files
    }

    async fn prune_old_files(&self) {
        let mut files = self.list_files().await;
        if files.len() <= self.max_history_files {
            return;
        }
        files.sort();
        let excess = files.len() - self.max_history_files;
        for path in files.into_iter().take(excess) {
            if let Err(err) = fs::remove_file(&path).await {
                warn!(error = %err, path = %path.display(), "failed to prune old snapshot file");
            } else {
                debug!(path = %path.display(), "pruned old snapshot file");
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Seconds since the Unix epoch, used to stamp snapshot filenames and the
/// snapshot's own `timestamp` field.
pub fn epoch_secs_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::QueueSnapshot;
    use std::collections::HashMap;

    #[tokio::test]
    async fn save_then_load_round_trips_policy_knobs() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = TaskPersistence::new(dir.path(), 5);

        let snapshot = QueueSnapshot {
            timestamp: epoch_secs_now() as f64,
            max_workers: 4,
            max_queue_size: 100,
            tasks: HashMap::new(),
        };

        persistence.save(&snapshot).await;
        let loaded = persistence.load_latest().await.unwrap();
        assert_eq!(loaded.max_workers, 4);
        assert_eq!(loaded.max_queue_size, 100);
    }

    #[tokio::test]
    async fn prunes_all_but_the_newest_files() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = TaskPersistence::new(dir.path(), 2);

        for i in 0..4u64 {
            let snapshot = QueueSnapshot {
                timestamp: (1_700_000_000 + i) as f64,
                max_workers: 1,
                max_queue_size: 1,
                tasks: HashMap::new(),
            };
            let path = persistence.file_path(1_700_000_000 + i);
            tokio::fs::write(&path, serde_json::to_vec(&snapshot).unwrap()).await.unwrap();
        }

        persistence.prune_old_files().await;
        assert_eq!(persistence.list_files().await.len(), 2);
    }
}
