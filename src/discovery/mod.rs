//! Task discovery: turns triggering issues into queued tasks.

pub mod gh;
pub mod source;

use std::path::PathBuf;
use std::sync::Arc;

pub use gh::GhCliSource;
pub use source::{IssueSource, IssueStatus, SourceItem};

use crate::backoff::Backoff;
use crate::config::PollRetryConfig;
use crate::error::{DispatchError, Result};
use crate::platform::{Detector, Manifests, TaskMetadata};
use crate::scheduler::{Priority, Task, WorkQueue};

pub struct TaskDiscoverer {
    source: Arc<dyn IssueSource>,
    queue: Arc<WorkQueue>,
    detector: Detector,
    workspace_dir: Option<PathBuf>,
    backoff: Backoff,
    max_attempts: u32,
}

impl TaskDiscoverer {
    pub fn new(source: Arc<dyn IssueSource>, queue: Arc<WorkQueue>, detector: Detector) -> Self {
        let retry = PollRetryConfig::default();
        Self {
            source,
            queue,
            detector,
            workspace_dir: None,
            backoff: retry.backoff(),
            max_attempts: retry.max_attempts,
        }
    }

    /// Read manifests from this checkout when inferring requirements.
    pub fn with_workspace(mut self, dir: Option<PathBuf>) -> Self {
        self.workspace_dir = dir;
        self
    }

    pub fn with_retry(mut self, retry: &PollRetryConfig) -> Self {
        self.backoff = retry.backoff();
        self.max_attempts = retry.max_attempts.max(1);
        self
    }

    async fn fetch(&self) -> Result<Vec<SourceItem>> {
        let mut attempt = 1;
        loop {
            match self.source.list_triggering_items().await {
                Ok(items) => return Ok(items),
                Err(e) if attempt >= self.max_attempts => {
                    return Err(DispatchError::PollFailure(e.to_string()));
                }
                Err(e) => {
                    let delay = self.backoff.delay(attempt);
                    tracing::warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "Issue poll failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Fetch triggering items and enqueue the new ones.
    ///
    /// Never fails: an unreachable source yields an empty batch, and the
    /// next cycle tries again. Returns the tasks enqueued this cycle.
    pub async fn poll(&self) -> Vec<Task> {
        let items = match self.fetch().await {
            Ok(items) => items,
            Err(e) => {
                tracing::error!(error = %e, "Discovery poll gave up");
                return Vec::new();
            }
        };

        let manifests = match &self.workspace_dir {
            Some(dir) => Manifests::read_from(dir).await,
            None => Manifests::new(),
        };

        let mut enqueued = Vec::new();
        for item in items {
            if let Some(status) = item.status().filter(IssueStatus::blocks_rediscovery) {
                tracing::debug!(source_id = %item.source_id, status = %status, "Skipping handled item");
                continue;
            }
            if self.queue.is_known(&item.source_id).await {
                continue;
            }

            let text = item.text();
            let requirements = self.detector.infer_requirements(&TaskMetadata {
                manifests: &manifests,
                issue_text: &text,
            });
            let mut task = Task::new(
                item.source_id.clone(),
                item.payload.clone(),
                requirements,
                Priority::from_labels(&item.labels),
            );
            if let Some(created_at) = item.created_at {
                task = task.with_created_at(created_at);
            }

            match self.queue.enqueue(task.clone()).await {
                Ok(()) => {}
                Err(DispatchError::DuplicateTask(_)) => continue,
                Err(e) => {
                    tracing::error!(source_id = %item.source_id, error = %e, "Failed to enqueue task");
                    continue;
                }
            }

            if let Err(e) = self
                .source
                .set_status(&item.source_id, IssueStatus::Queued, None)
                .await
            {
                tracing::warn!(source_id = %item.source_id, error = %e, "Failed to mark item queued");
            }
            enqueued.push(task);
        }

        tracing::info!(discovered = enqueued.len(), "Discovery cycle finished");
        enqueued
    }
}
