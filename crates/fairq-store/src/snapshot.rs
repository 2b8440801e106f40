//! Snapshots of the scheduler's three job collections

use fairq_core::{FairqError, FairqResult, Job};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One of the persisted job collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    History,
    Pending,
    Running,
}

impl QueueKind {
    pub const ALL: [QueueKind; 3] = [QueueKind::History, QueueKind::Pending, QueueKind::Running];

    /// File name of the blob inside the state directory
    pub fn file_name(&self) -> &'static str {
        match self {
            QueueKind::History => "history.json",
            QueueKind::Pending => "pending.json",
            QueueKind::Running => "running.json",
        }
    }
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueKind::History => write!(f, "history"),
            QueueKind::Pending => write!(f, "pending"),
            QueueKind::Running => write!(f, "running"),
        }
    }
}

/// The three collections as restored from disk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueSnapshot {
    /// Most recent first
    pub history: Vec<Job>,
    pub pending: Vec<Job>,
    pub running: Vec<Job>,
}

/// Snapshot storage rooted at the configured state directory
#[derive(Debug, Clone)]
pub struct QueueStore {
    dir: PathBuf,
}

impl QueueStore {
    /// Open the state directory, creating it when missing
    ///
    /// Fails when the directory cannot be created or written to.
    pub async fn open(dir: impl Into<PathBuf>) -> FairqResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| persistence_error("create", &dir, e))?;

        let probe = dir.join(".probe");
        tokio::fs::write(&probe, b"")
            .await
            .map_err(|e| persistence_error("write to", &dir, e))?;
        let _ = tokio::fs::remove_file(&probe).await;

        info!(path = %dir.display(), "Opened queue state directory");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, kind: QueueKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    /// Serialize a collection, replacing the previous blob atomically
    pub async fn save<'a, I>(&self, kind: QueueKind, jobs: I) -> FairqResult<()>
    where
        I: IntoIterator<Item = &'a Job>,
    {
        let jobs: Vec<Job> = jobs
            .into_iter()
            .map(|job| {
                let mut job = job.clone();
                job.release_handles();
                job
            })
            .collect();
        let json = serde_json::to_vec_pretty(&jobs)?;

        let path = self.path(kind);
        let tmp = self.dir.join(format!(".{}.tmp", kind.file_name()));
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| persistence_error("write", &tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| persistence_error("replace", &path, e))?;

        debug!(queue = %kind, jobs = jobs.len(), "Saved queue snapshot");
        Ok(())
    }

    /// Load a collection; a missing or unreadable blob yields an empty one
    pub async fn restore(&self, kind: QueueKind) -> Vec<Job> {
        let path = self.path(kind);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(queue = %kind, "No snapshot found, starting empty");
                return Vec::new();
            }
            Err(e) => {
                warn!(queue = %kind, path = %path.display(), error = %e, "Failed to read snapshot");
                return Vec::new();
            }
        };

        match serde_json::from_slice::<Vec<Job>>(&bytes) {
            Ok(jobs) => {
                info!(queue = %kind, jobs = jobs.len(), "Restored queue snapshot");
                jobs
            }
            Err(e) => {
                warn!(queue = %kind, path = %path.display(), error = %e, "Corrupt snapshot, starting empty");
                Vec::new()
            }
        }
    }

    pub async fn restore_all(&self) -> QueueSnapshot {
        QueueSnapshot {
            history: self.restore(QueueKind::History).await,
            pending: self.restore(QueueKind::Pending).await,
            running: self.restore(QueueKind::Running).await,
        }
    }
}

fn persistence_error(action: &str, path: &Path, err: std::io::Error) -> FairqError {
    FairqError::Persistence(format!("failed to {} {}: {}", action, path.display(), err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fairq_core::{JobConfig, OutputCursor};

    fn job(name: &str, executor: &str) -> Job {
        Job::new(JobConfig::new(name, executor))
    }

    #[tokio::test]
    async fn test_save_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::open(dir.path().join("state")).await.unwrap();

        let mut running = job("train-net", "ilja");
        running.mark_running("c0ffee".to_string(), vec![0, 1]).unwrap();
        running.output = Some(OutputCursor {
            since: chrono::Utc::now(),
            path: dir.path().join("train-net.log"),
        });
        let pending = vec![job("eval-net", "markus"), job("prep-data", "ilja")];

        store.save(QueueKind::Pending, &pending).await.unwrap();
        store.save(QueueKind::Running, [&running]).await.unwrap();
        store.save(QueueKind::History, &Vec::<Job>::new()).await.unwrap();

        let restored = store.restore_all().await;
        assert_eq!(restored.pending, pending);
        assert!(restored.history.is_empty());
        assert_eq!(restored.running.len(), 1);
        assert_eq!(restored.running[0].runtime_handle.as_deref(), Some("c0ffee"));
        assert_eq!(restored.running[0].assigned_gpus, vec![0, 1]);
        assert!(restored.running[0].output.is_none());
    }

    #[tokio::test]
    async fn test_restore_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::open(dir.path()).await.unwrap();
        assert_eq!(store.restore_all().await, QueueSnapshot::default());
    }

    #[tokio::test]
    async fn test_restore_corrupt_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::open(dir.path()).await.unwrap();
        std::fs::write(store.path(QueueKind::History), b"{not json").unwrap();

        assert!(store.restore(QueueKind::History).await.is_empty());
    }

    #[tokio::test]
    async fn test_save_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::open(dir.path()).await.unwrap();
        store
            .save(QueueKind::Pending, &vec![job("eval-net", "markus")])
            .await
            .unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["pending.json".to_string()]);
    }

    #[tokio::test]
    async fn test_open_unusable_location_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"").unwrap();

        let err = QueueStore::open(file.join("state")).await.unwrap_err();
        assert!(matches!(err, FairqError::Persistence(_)));
    }
}
