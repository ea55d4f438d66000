use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::scheduler::{Priority, QueueCounts, Task, TaskId, TaskState, WorkQueue};
use crate::worker::{WorkerInfo, WorkerManager};

#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub source_id: String,
    pub state: TaskState,
    pub priority: Priority,
    pub requirements: String,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            source_id: task.source_id.clone(),
            state: task.state,
            priority: task.priority,
            requirements: task.requirements.to_string(),
            retry_count: task.retry_count,
            last_error: task.last_error.clone(),
            created_at: task.created_at,
            assigned_at: task.assigned_at,
            completed_at: task.completed_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Capacity {
    pub active: usize,
    pub max: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub generated_at: DateTime<Utc>,
    pub queue: QueueCounts,
    pub capacity: Capacity,
    pub tasks: Vec<TaskSummary>,
    pub workers: Vec<WorkerInfo>,
}

/// Read-only projection over the queue and, when running in-process, the
/// live workers.
#[derive(Clone)]
pub struct StatusAggregator {
    queue: Arc<WorkQueue>,
    workers: Option<Arc<WorkerManager>>,
}

impl StatusAggregator {
    pub fn new(queue: Arc<WorkQueue>, workers: Arc<WorkerManager>) -> Self {
        Self {
            queue,
            workers: Some(workers),
        }
    }

    /// Queue-only view, for tools reading a queue directory from outside the
    /// orchestration process.
    pub fn queue_only(queue: Arc<WorkQueue>) -> Self {
        Self {
            queue,
            workers: None,
        }
    }

    pub async fn tasks(&self, state: Option<TaskState>) -> Vec<TaskSummary> {
        self.queue
            .list(state)
            .await
            .iter()
            .map(TaskSummary::from)
            .collect()
    }

    pub async fn workers(&self) -> Vec<WorkerInfo> {
        match &self.workers {
            Some(manager) => manager.workers().await,
            None => Vec::new(),
        }
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        let workers = self.workers().await;
        let max = self.workers.as_ref().map_or(0, |m| m.max_concurrent());
        StatusSnapshot {
            generated_at: Utc::now(),
            queue: self.queue.counts().await,
            capacity: Capacity {
                active: workers.len(),
                max,
            },
            tasks: self.tasks(None).await,
            workers,
        }
    }
}
