use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use uuid::Uuid;

use crate::config::WorkersConfig;
use crate::error::{DispatchError, Result};
use crate::platform::CapabilityProfile;
use crate::scheduler::{Task, TaskId};
use crate::worker::provisioner::{InstanceHandle, InstanceStatus, Provisioner, WorkerSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Running,
    Reporting,
    TimedOut,
    Crashed,
    Terminated,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Starting => write!(f, "starting"),
            WorkerStatus::Running => write!(f, "running"),
            WorkerStatus::Reporting => write!(f, "reporting"),
            WorkerStatus::TimedOut => write!(f, "timed_out"),
            WorkerStatus::Crashed => write!(f, "crashed"),
            WorkerStatus::Terminated => write!(f, "terminated"),
        }
    }
}

/// How a worker's single task ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum WorkerOutcome {
    Success(serde_json::Value),
    /// The worker ran and reported an error.
    Failure(String),
    /// Exceeded the maximum lifetime.
    TimedOut,
    /// Stopped responding or vanished.
    Crashed(String),
}

impl WorkerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, WorkerOutcome::Success(_))
    }

    /// Error text recorded on the task for anything but success.
    pub fn error_message(&self) -> Option<String> {
        match self {
            WorkerOutcome::Success(_) => None,
            WorkerOutcome::Failure(e) => Some(e.clone()),
            WorkerOutcome::TimedOut => Some("worker exceeded its maximum lifetime".to_string()),
            WorkerOutcome::Crashed(reason) => Some(format!("worker crashed: {reason}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct WorkerHandle {
    pub worker_id: Uuid,
    pub task_id: TaskId,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub worker_id: Uuid,
    pub task_id: TaskId,
    pub source_id: String,
    pub instance: String,
    pub profile: CapabilityProfile,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

struct WorkerRecord {
    info: WorkerInfo,
    instance: InstanceHandle,
    outcome: Option<WorkerOutcome>,
    /// Capacity slot, returned when the record is dropped.
    _permit: OwnedSemaphorePermit,
}

/// Destroys an instance whose record never reached the worker table, e.g.
/// when `spawn` is cancelled between creation and registration.
struct ProvisionGuard {
    provisioner: Arc<dyn Provisioner>,
    instance: Option<InstanceHandle>,
}

impl ProvisionGuard {
    fn disarm(&mut self) {
        self.instance = None;
    }
}

impl Drop for ProvisionGuard {
    fn drop(&mut self) {
        let Some(instance) = self.instance.take() else {
            return;
        };
        let provisioner = self.provisioner.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = provisioner.destroy(&instance).await {
                    tracing::warn!(instance = %instance.id, error = %e, "Orphan cleanup failed");
                }
            });
        }
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}

/// Spawns one isolated worker per task, watches it, and guarantees its
/// environment is destroyed.
///
/// The concurrency ceiling is a semaphore: each live worker record owns a
/// permit, so removing the record frees the slot on every path.
pub struct WorkerManager {
    provisioner: Arc<dyn Provisioner>,
    slots: Arc<Semaphore>,
    max_concurrent: usize,
    max_lifetime: Duration,
    heartbeat_grace: Duration,
    poll_interval: Duration,
    workers: RwLock<HashMap<Uuid, WorkerRecord>>,
}

impl WorkerManager {
    pub fn new(provisioner: Arc<dyn Provisioner>, config: &WorkersConfig) -> Self {
        Self {
            provisioner,
            slots: Arc::new(Semaphore::new(config.max_concurrent)),
            max_concurrent: config.max_concurrent,
            max_lifetime: config.max_lifetime(),
            heartbeat_grace: config.heartbeat_grace(),
            poll_interval: config.poll_interval(),
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Provision a fresh environment with exactly `profile` for `task`.
    ///
    /// Fails with `CapacityExceeded` when every slot is taken; nothing is
    /// provisioned in that case.
    pub async fn spawn(
        &self,
        task: &Task,
        profile: CapabilityProfile,
        image: Option<String>,
    ) -> Result<WorkerHandle> {
        let permit = self
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| DispatchError::CapacityExceeded {
                max: self.max_concurrent,
            })?;

        let spec = WorkerSpec {
            worker_id: Uuid::new_v4(),
            task_id: task.id,
            source_id: task.source_id.clone(),
            profile,
            image,
            payload: task.payload.clone(),
        };

        let instance = self.provisioner.create(&spec).await?;
        let mut guard = ProvisionGuard {
            provisioner: self.provisioner.clone(),
            instance: Some(instance.clone()),
        };

        let handle = WorkerHandle {
            worker_id: spec.worker_id,
            task_id: spec.task_id,
        };
        let record = WorkerRecord {
            info: WorkerInfo {
                worker_id: spec.worker_id,
                task_id: spec.task_id,
                source_id: spec.source_id,
                instance: instance.id.clone(),
                profile: spec.profile,
                status: WorkerStatus::Starting,
                started_at: Utc::now(),
                last_heartbeat: None,
            },
            instance,
            outcome: None,
            _permit: permit,
        };

        self.workers.write().await.insert(handle.worker_id, record);
        guard.disarm();

        tracing::info!(
            worker_id = %handle.worker_id,
            task_id = %handle.task_id,
            active = self.max_concurrent - self.slots.available_permits(),
            "Worker spawned"
        );
        Ok(handle)
    }

    /// Non-blocking status check. `None` while the worker is still working.
    ///
    /// Once an outcome is decided it is sticky: later polls return it again
    /// until the worker is terminated.
    pub async fn poll(&self, handle: &WorkerHandle) -> Result<Option<WorkerOutcome>> {
        let instance = {
            let workers = self.workers.read().await;
            let record = workers
                .get(&handle.worker_id)
                .ok_or(DispatchError::WorkerNotFound(handle.worker_id))?;
            if let Some(outcome) = &record.outcome {
                return Ok(Some(outcome.clone()));
            }
            record.instance.clone()
        };

        let status = self.provisioner.signal_status(&instance).await;
        let now = Utc::now();

        let mut workers = self.workers.write().await;
        let Some(record) = workers.get_mut(&handle.worker_id) else {
            // Terminated while we were asking.
            return Err(DispatchError::WorkerNotFound(handle.worker_id));
        };

        let reported = match status {
            Ok(InstanceStatus::Starting) => None,
            Ok(InstanceStatus::Running { heartbeat_at }) => {
                record.info.status = WorkerStatus::Running;
                // No worker-side heartbeat: a live environment is proof enough.
                let beat = heartbeat_at.unwrap_or(now);
                if record.info.last_heartbeat.map_or(true, |prev| beat > prev) {
                    record.info.last_heartbeat = Some(beat);
                }
                None
            }
            Ok(InstanceStatus::Done { result }) => {
                record.info.status = WorkerStatus::Reporting;
                Some(WorkerOutcome::Success(result))
            }
            Ok(InstanceStatus::Error { message }) => {
                record.info.status = WorkerStatus::Reporting;
                Some(WorkerOutcome::Failure(message))
            }
            Err(e) => {
                tracing::warn!(worker_id = %handle.worker_id, error = %e, "Worker status query failed");
                None
            }
        };

        let outcome = reported.or_else(|| {
            let last_seen = record.info.last_heartbeat.unwrap_or(record.info.started_at);
            if elapsed(record.info.started_at, now) > self.max_lifetime {
                record.info.status = WorkerStatus::TimedOut;
                Some(WorkerOutcome::TimedOut)
            } else if elapsed(last_seen, now) > self.heartbeat_grace {
                record.info.status = WorkerStatus::Crashed;
                Some(WorkerOutcome::Crashed(format!(
                    "no heartbeat for {}s",
                    self.heartbeat_grace.as_secs()
                )))
            } else {
                None
            }
        });

        if let Some(outcome) = &outcome {
            tracing::info!(
                worker_id = %handle.worker_id,
                task_id = %handle.task_id,
                status = %record.info.status,
                success = outcome.is_success(),
                "Worker finished"
            );
            record.outcome = Some(outcome.clone());
        }
        Ok(outcome)
    }

    /// Polls until the worker reports or `timeout` elapses; a timeout yields
    /// `TimedOut`.
    pub async fn await_completion(
        &self,
        handle: &WorkerHandle,
        timeout: Duration,
    ) -> Result<WorkerOutcome> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(outcome) = self.poll(handle).await? {
                return Ok(outcome);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                let mut workers = self.workers.write().await;
                if let Some(record) = workers.get_mut(&handle.worker_id) {
                    record.info.status = WorkerStatus::TimedOut;
                    record.outcome = Some(WorkerOutcome::TimedOut);
                }
                return Ok(WorkerOutcome::TimedOut);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Destroy the worker's environment and free its slot. Safe to call
    /// more than once.
    pub async fn terminate(&self, handle: &WorkerHandle) -> Result<()> {
        let Some(mut record) = self.workers.write().await.remove(&handle.worker_id) else {
            tracing::debug!(worker_id = %handle.worker_id, "Worker already terminated");
            return Ok(());
        };
        record.info.status = WorkerStatus::Terminated;

        // The slot is released when `record` drops, even if destroy fails.
        let destroyed = self.provisioner.destroy(&record.instance).await;
        match &destroyed {
            Ok(()) => tracing::info!(worker_id = %handle.worker_id, "Worker terminated"),
            Err(e) => tracing::warn!(
                worker_id = %handle.worker_id,
                instance = %record.instance.id,
                error = %e,
                "Worker environment teardown failed"
            ),
        }
        drop(record);
        destroyed.map_err(DispatchError::from)
    }

    pub async fn info(&self, handle: &WorkerHandle) -> Option<WorkerInfo> {
        self.workers
            .read()
            .await
            .get(&handle.worker_id)
            .map(|r| r.info.clone())
    }

    pub async fn workers(&self) -> Vec<WorkerInfo> {
        let mut infos: Vec<WorkerInfo> = self
            .workers
            .read()
            .await
            .values()
            .map(|r| r.info.clone())
            .collect();
        infos.sort_by_key(|i| i.started_at);
        infos
    }

    pub async fn active_count(&self) -> usize {
        self.workers.read().await.len()
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Remove environments an earlier run left behind. Call before the first
    /// `spawn`; tracked workers are never touched.
    pub async fn sweep_orphans(&self) -> Result<usize> {
        if !self.workers.read().await.is_empty() {
            return Ok(0);
        }
        let removed = self.provisioner.sweep().await?;
        if removed > 0 {
            tracing::warn!(removed, "Removed workers left by a previous run");
        }
        Ok(removed)
    }

    /// Terminate every live worker; returns the handles that were stopped.
    pub async fn shutdown(&self) -> Vec<WorkerHandle> {
        let handles: Vec<WorkerHandle> = self
            .workers
            .read()
            .await
            .values()
            .map(|r| WorkerHandle {
                worker_id: r.info.worker_id,
                task_id: r.info.task_id,
            })
            .collect();

        for handle in &handles {
            if let Err(e) = self.terminate(handle).await {
                tracing::warn!(worker_id = %handle.worker_id, error = %e, "Shutdown teardown failed");
            }
        }
        handles
    }
}
