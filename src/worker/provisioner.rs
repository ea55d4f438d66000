use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProvisionError;
use crate::platform::CapabilityProfile;
use crate::scheduler::TaskId;

/// Everything a provisioner needs to build one worker environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub worker_id: Uuid,
    pub task_id: TaskId,
    pub source_id: String,
    /// Exactly the capabilities to install, nothing more.
    pub profile: CapabilityProfile,
    pub image: Option<String>,
    pub payload: serde_json::Value,
}

/// Opaque reference to a created environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    /// Container name, process label, or whatever the provisioner keys on.
    pub id: String,
    pub worker_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstanceStatus {
    Starting,
    /// `heartbeat_at` is the worker's own last report, when it has one.
    Running { heartbeat_at: Option<DateTime<Utc>> },
    Done { result: serde_json::Value },
    Error { message: String },
}

/// Creates and tears down isolated execution environments.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn create(&self, spec: &WorkerSpec) -> Result<InstanceHandle, ProvisionError>;

    async fn signal_status(&self, instance: &InstanceHandle)
        -> Result<InstanceStatus, ProvisionError>;

    /// Must tolerate an instance that is already gone.
    async fn destroy(&self, instance: &InstanceHandle) -> Result<(), ProvisionError>;

    /// Tear down environments left behind by an earlier run. Only safe
    /// before this process has created any. Returns how many were removed.
    async fn sweep(&self) -> Result<usize, ProvisionError> {
        Ok(0)
    }
}

pub const TASK_FILE: &str = "task.json";
pub const HEARTBEAT_FILE: &str = "heartbeat";
pub const RESULT_FILE: &str = "result.json";
pub const LOG_FILE: &str = "worker.log";

/// Per-worker scratch directory shared with the worker process.
///
/// The orchestrator writes `task.json`; the worker touches `heartbeat` while
/// alive and writes `result.json` on success.
#[derive(Debug, Clone)]
pub struct WorkerDir {
    path: PathBuf,
}

impl WorkerDir {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn prepare(root: &Path, spec: &WorkerSpec) -> Result<Self, ProvisionError> {
        let path = root.join(spec.worker_id.to_string());
        tokio::fs::create_dir_all(&path).await?;

        let task = serde_json::json!({
            "task_id": spec.task_id,
            "source_id": spec.source_id,
            "worker_id": spec.worker_id,
            "platforms": spec.profile,
            "payload": spec.payload,
        });
        let bytes = serde_json::to_vec_pretty(&task)
            .map_err(|e| ProvisionError::Create(format!("encode task file: {e}")))?;
        tokio::fs::write(path.join(TASK_FILE), bytes).await?;

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Environment handed to the worker process.
    pub fn env(&self, spec: &WorkerSpec, dir_in_worker: &Path) -> Vec<(String, String)> {
        vec![
            ("TASK_ID".to_string(), spec.task_id.to_string()),
            ("SOURCE_ID".to_string(), spec.source_id.clone()),
            ("WORKER_ID".to_string(), spec.worker_id.to_string()),
            ("ENABLED_PLATFORMS".to_string(), spec.profile.to_string()),
            (
                "BOT_WORKER_DIR".to_string(),
                dir_in_worker.display().to_string(),
            ),
        ]
    }

    /// Modification time of the heartbeat file.
    pub async fn heartbeat(&self) -> Option<DateTime<Utc>> {
        let meta = tokio::fs::metadata(self.path.join(HEARTBEAT_FILE)).await.ok()?;
        meta.modified().ok().map(DateTime::<Utc>::from)
    }

    pub async fn result(&self) -> Option<serde_json::Value> {
        let bytes = tokio::fs::read(self.path.join(RESULT_FILE)).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Last `lines` lines of the worker log, for error reports.
    pub async fn log_tail(&self, lines: usize) -> String {
        let Ok(text) = tokio::fs::read_to_string(self.path.join(LOG_FILE)).await else {
            return String::new();
        };
        let all: Vec<&str> = text.lines().collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }

    /// Every worker directory currently under `root`.
    pub async fn list(root: &Path) -> Result<Vec<WorkerDir>, ProvisionError> {
        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut dirs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(WorkerDir::at(entry.path()));
            }
        }
        Ok(dirs)
    }

    pub async fn remove(&self) -> Result<(), ProvisionError> {
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
