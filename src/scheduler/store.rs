use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use fs4::FileExt;
use tokio::io::AsyncWriteExt;

use crate::error::StoreError;
use crate::scheduler::task::{Task, TaskId};

/// Durable backing for the work queue. Each `put` must be atomic per record:
/// after a crash a reader sees either the previous or the new version.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<Task>, StoreError>;
    async fn put(&self, task: &Task) -> Result<(), StoreError>;
    async fn remove(&self, id: &TaskId) -> Result<(), StoreError>;
}

/// Non-durable store, used by `WorkQueue::in_memory` in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<TaskId, Task>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, Task>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stored copy of a record, bypassing the queue's in-memory view.
    pub fn record(&self, id: &TaskId) -> Option<Task> {
        self.records().get(id).cloned()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn load_all(&self) -> Result<Vec<Task>, StoreError> {
        Ok(self.records().values().cloned().collect())
    }

    async fn put(&self, task: &Task) -> Result<(), StoreError> {
        self.records().insert(task.id, task.clone());
        Ok(())
    }

    async fn remove(&self, id: &TaskId) -> Result<(), StoreError> {
        self.records().remove(id);
        Ok(())
    }
}

const TASKS_DIR: &str = "tasks";
const LOCK_FILE: &str = "queue.lock";
const TMP_SUFFIX: &str = ".json.tmp";

/// One JSON file per task under `<root>/tasks/`. Writes go to a temporary
/// sibling which is synced and renamed over the record.
///
/// A writable store holds an exclusive lock on `<root>/queue.lock` for its
/// lifetime so two orchestrators never share a queue directory.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    tasks_dir: PathBuf,
    lock: Option<File>,
}

impl FileStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        let tasks_dir = root.join(TASKS_DIR);
        std::fs::create_dir_all(&tasks_dir)?;

        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(root.join(LOCK_FILE))?;
        lock.try_lock_exclusive()
            .map_err(|_| StoreError::Locked(root.display().to_string()))?;

        tracing::info!(root = %root.display(), "Opened task store");
        Ok(Self {
            root,
            tasks_dir,
            lock: Some(lock),
        })
    }

    /// Opens without taking the lock, for inspecting a queue another
    /// process owns. Mutating calls are still possible but unsafe.
    pub fn open_read_only(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        let tasks_dir = root.join(TASKS_DIR);
        if !tasks_dir.is_dir() {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no task directory at {}", tasks_dir.display()),
            )));
        }
        Ok(Self {
            root,
            tasks_dir,
            lock: None,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: &TaskId) -> PathBuf {
        self.tasks_dir.join(format!("{id}.json"))
    }

    fn tmp_path(&self, id: &TaskId) -> PathBuf {
        self.tasks_dir.join(format!("{id}{TMP_SUFFIX}"))
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if let Some(lock) = &self.lock {
            let _ = FileExt::unlock(lock);
        }
    }
}

#[async_trait]
impl TaskStore for FileStore {
    async fn load_all(&self) -> Result<Vec<Task>, StoreError> {
        let mut tasks = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.tasks_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();

            if name.ends_with(TMP_SUFFIX) {
                // Interrupted write; the previous record (if any) is intact.
                if self.lock.is_some() {
                    tracing::warn!(path = %path.display(), "Removing partial task record");
                    let _ = tokio::fs::remove_file(&path).await;
                }
                continue;
            }
            if !name.ends_with(".json") {
                continue;
            }

            let bytes = tokio::fs::read(&path).await?;
            let task: Task = serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            tasks.push(task);
        }

        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn put(&self, task: &Task) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(task)?;
        let tmp = self.tmp_path(&task.id);

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, self.record_path(&task.id)).await?;
        Ok(())
    }

    async fn remove(&self, id: &TaskId) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.record_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
