use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::backoff::Backoff;
use crate::error::{DispatchError, Result};
use crate::platform::{satisfies, CapabilityProfile, RequirementSet};
use crate::scheduler::store::{MemoryStore, TaskStore};
use crate::scheduler::task::{Task, TaskId, TaskState};

const DEFAULT_MAX_TASKS: usize = 10_000;

/// How failed attempts are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before a task becomes `Failed`.
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::new(Duration::from_secs(30), Duration::from_secs(300)),
        }
    }
}

/// What `fail` did with the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum FailDisposition {
    Requeued {
        retry_count: u32,
        not_before: DateTime<Utc>,
    },
    Exhausted {
        retry_count: u32,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub assigned: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.pending + self.assigned + self.completed + self.failed
    }
}

type Entry = Arc<Mutex<Task>>;

/// Durable, priority-ordered work queue.
///
/// Every record sits behind its own mutex; the index lock is only held to
/// add, remove, or snapshot entries. A transition is written to the store
/// before it becomes visible in memory, so a failed write leaves the task
/// unchanged.
pub struct WorkQueue {
    store: Arc<dyn TaskStore>,
    entries: RwLock<HashMap<TaskId, Entry>>,
    policy: RetryPolicy,
    max_tasks: usize,
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

fn require_assigned(task: &Task) -> Result<()> {
    if task.state == TaskState::Assigned {
        Ok(())
    } else {
        Err(DispatchError::NotAssigned {
            task_id: task.id,
            state: task.state,
        })
    }
}

fn apply_failure(
    task: &mut Task,
    error: String,
    now: DateTime<Utc>,
    policy: &RetryPolicy,
) -> FailDisposition {
    task.retry_count += 1;
    task.last_error = Some(error);
    task.assigned_at = None;
    task.last_heartbeat = None;

    if task.retry_count >= policy.max_retries {
        task.state = TaskState::Failed;
        task.completed_at = Some(now);
        task.not_before = None;
        FailDisposition::Exhausted {
            retry_count: task.retry_count,
        }
    } else {
        let not_before = now + to_chrono(policy.backoff.delay(task.retry_count));
        task.state = TaskState::Pending;
        task.not_before = Some(not_before);
        FailDisposition::Requeued {
            retry_count: task.retry_count,
            not_before,
        }
    }
}

impl WorkQueue {
    /// Loads every persisted record. Unreadable records abort the load.
    pub async fn open(store: Arc<dyn TaskStore>, policy: RetryPolicy) -> Result<Self> {
        let tasks = store.load_all().await?;
        let assigned = tasks
            .iter()
            .filter(|t| t.state == TaskState::Assigned)
            .count();

        let entries: HashMap<TaskId, Entry> = tasks
            .into_iter()
            .map(|t| (t.id, Arc::new(Mutex::new(t))))
            .collect();

        tracing::info!(tasks = entries.len(), assigned, "Work queue loaded");

        Ok(Self {
            store,
            entries: RwLock::new(entries),
            policy,
            max_tasks: DEFAULT_MAX_TASKS,
        })
    }

    pub fn in_memory(policy: RetryPolicy) -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            entries: RwLock::new(HashMap::new()),
            policy,
            max_tasks: DEFAULT_MAX_TASKS,
        }
    }

    pub fn with_max_tasks(mut self, max_tasks: usize) -> Self {
        self.max_tasks = max_tasks;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn entry(&self, id: &TaskId) -> Result<Entry> {
        self.entries
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(DispatchError::TaskNotFound(*id))
    }

    async fn snapshot(&self) -> Vec<Entry> {
        self.entries.read().await.values().cloned().collect()
    }

    /// Applies `change` to a copy of the record, persists the copy, then
    /// publishes it.
    async fn transition<T>(
        &self,
        id: &TaskId,
        change: impl FnOnce(&mut Task) -> Result<T>,
    ) -> Result<T> {
        let entry = self.entry(id).await?;
        let mut task = entry.lock().await;
        let mut next = task.clone();
        let out = change(&mut next)?;
        next.revision += 1;
        self.store.put(&next).await?;
        *task = next;
        Ok(out)
    }

    /// Add a new task as `Pending`.
    ///
    /// Rejects a source that already has a live (non-terminal) task. A
    /// terminal record for the same source is replaced.
    pub async fn enqueue(&self, mut task: Task) -> Result<()> {
        let mut entries = self.entries.write().await;

        match entries.get(&task.id) {
            Some(existing) => {
                let existing = existing.lock().await;
                if !existing.state.is_terminal() {
                    return Err(DispatchError::DuplicateTask(task.source_id));
                }
                task.revision = existing.revision + 1;
            }
            None if entries.len() >= self.max_tasks => {
                return Err(DispatchError::QueueFull {
                    max: self.max_tasks,
                });
            }
            None => {}
        }

        task.state = TaskState::Pending;
        self.store.put(&task).await?;

        tracing::info!(
            task_id = %task.id,
            source_id = %task.source_id,
            priority = %task.priority,
            requirements = %task.requirements,
            "Task enqueued"
        );
        entries.insert(task.id, Arc::new(Mutex::new(task)));
        Ok(())
    }

    /// Claim the best pending task `profile` satisfies.
    pub async fn claim_next(&self, profile: &CapabilityProfile) -> Result<Option<Task>> {
        self.claim_matching(|reqs| satisfies(profile, reqs)).await
    }

    /// Claim the highest-priority, oldest pending task whose requirements
    /// `accepts` approves, moving it to `Assigned`.
    ///
    /// Concurrent callers never receive the same task: candidates are
    /// re-checked under their own lock before the transition.
    pub async fn claim_matching<F>(&self, mut accepts: F) -> Result<Option<Task>>
    where
        F: FnMut(&RequirementSet) -> bool,
    {
        let now = Utc::now();
        let mut candidates = Vec::new();

        for entry in self.snapshot().await {
            let key = {
                let task = entry.lock().await;
                if task.is_claimable_at(now) && accepts(&task.requirements) {
                    Some((Reverse(task.priority), task.created_at, task.id))
                } else {
                    None
                }
            };
            if let Some(key) = key {
                candidates.push((key, entry));
            }
        }
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        for (_, entry) in candidates {
            let mut task = entry.lock().await;
            if !task.is_claimable_at(now) {
                continue;
            }

            let mut next = task.clone();
            next.state = TaskState::Assigned;
            next.assigned_at = Some(now);
            next.last_heartbeat = None;
            next.not_before = None;
            next.revision += 1;
            self.store.put(&next).await?;
            *task = next;

            tracing::info!(
                task_id = %task.id,
                source_id = %task.source_id,
                attempt = task.retry_count + 1,
                "Task claimed"
            );
            return Ok(Some(task.clone()));
        }

        Ok(None)
    }

    pub async fn complete(&self, id: &TaskId, result: serde_json::Value) -> Result<()> {
        self.transition(id, |task| {
            require_assigned(task)?;
            task.state = TaskState::Completed;
            task.completed_at = Some(Utc::now());
            task.result = Some(result);
            Ok(())
        })
        .await?;
        tracing::info!(task_id = %id, "Task completed");
        Ok(())
    }

    /// Record a failed attempt: requeue with backoff, or mark `Failed` once
    /// retries are exhausted.
    pub async fn fail(&self, id: &TaskId, error: &str) -> Result<FailDisposition> {
        let policy = self.policy;
        let disposition = self
            .transition(id, |task| {
                require_assigned(task)?;
                Ok(apply_failure(task, error.to_string(), Utc::now(), &policy))
            })
            .await?;

        match disposition {
            FailDisposition::Requeued {
                retry_count,
                not_before,
            } => tracing::warn!(task_id = %id, retry_count, %not_before, error, "Task requeued"),
            FailDisposition::Exhausted { retry_count } => {
                tracing::error!(task_id = %id, retry_count, error, "Task failed permanently")
            }
        }
        Ok(disposition)
    }

    /// Return an assigned task to `Pending` without spending a retry.
    pub async fn release(&self, id: &TaskId) -> Result<()> {
        self.transition(id, |task| {
            require_assigned(task)?;
            task.state = TaskState::Pending;
            task.assigned_at = None;
            task.last_heartbeat = None;
            Ok(())
        })
        .await?;
        tracing::debug!(task_id = %id, "Task released");
        Ok(())
    }

    /// Record proof of life for an assigned task. Older timestamps are
    /// ignored.
    pub async fn heartbeat(&self, id: &TaskId, at: DateTime<Utc>) -> Result<()> {
        let entry = self.entry(id).await?;
        let mut task = entry.lock().await;
        require_assigned(&task)?;
        if task.last_heartbeat.is_some_and(|hb| hb >= at) {
            return Ok(());
        }

        let mut next = task.clone();
        next.last_heartbeat = Some(at);
        next.revision += 1;
        self.store.put(&next).await?;
        *task = next;
        Ok(())
    }

    pub async fn reap_stale(&self, grace: Duration) -> Result<Vec<(TaskId, FailDisposition)>> {
        self.reap_stale_at(Utc::now(), grace).await
    }

    /// Fail every assigned task not seen within `grace` of `now`, counting
    /// the lost worker as one attempt.
    pub async fn reap_stale_at(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<Vec<(TaskId, FailDisposition)>> {
        let grace_delta = to_chrono(grace);
        let mut reaped = Vec::new();

        for entry in self.snapshot().await {
            let mut task = entry.lock().await;
            if task.state != TaskState::Assigned {
                continue;
            }
            let Some(seen) = task.last_seen() else {
                continue;
            };
            if now - seen <= grace_delta {
                continue;
            }

            let mut next = task.clone();
            let error = format!("worker lost: no heartbeat for {}s", grace.as_secs());
            let disposition = apply_failure(&mut next, error, now, &self.policy);
            next.revision += 1;
            self.store.put(&next).await?;
            *task = next;

            tracing::warn!(
                task_id = %task.id,
                source_id = %task.source_id,
                last_seen = %seen,
                "Reaped stale task"
            );
            reaped.push((task.id, disposition));
        }

        Ok(reaped)
    }

    pub async fn purge_expired(&self, retention: Duration) -> Result<usize> {
        self.purge_expired_at(Utc::now(), retention).await
    }

    /// Drop terminal records that finished more than `retention` ago.
    pub async fn purge_expired_at(&self, now: DateTime<Utc>, retention: Duration) -> Result<usize> {
        let retention = to_chrono(retention);
        let mut entries = self.entries.write().await;

        let mut expired = Vec::new();
        for (id, entry) in entries.iter() {
            let task = entry.lock().await;
            if task.state.is_terminal() && task.completed_at.is_some_and(|t| now - t > retention) {
                expired.push(*id);
            }
        }

        for id in &expired {
            self.store.remove(id).await?;
            entries.remove(id);
        }

        if !expired.is_empty() {
            tracing::info!(purged = expired.len(), "Purged expired task records");
        }
        Ok(expired.len())
    }

    /// Whether the queue holds any record, live or terminal, for `source_id`.
    pub async fn is_known(&self, source_id: &str) -> bool {
        self.entries
            .read()
            .await
            .contains_key(&TaskId::from_source(source_id))
    }

    pub async fn get(&self, id: &TaskId) -> Option<Task> {
        let entry = self.entry(id).await.ok()?;
        let task = entry.lock().await;
        Some(task.clone())
    }

    /// Tasks in claim order, optionally filtered by state.
    pub async fn list(&self, state: Option<TaskState>) -> Vec<Task> {
        let mut tasks = Vec::new();
        for entry in self.snapshot().await {
            let task = entry.lock().await;
            if state.map_or(true, |s| task.state == s) {
                tasks.push(task.clone());
            }
        }
        tasks.sort_by_key(|t| (Reverse(t.priority), t.created_at, t.id));
        tasks
    }

    pub async fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for entry in self.snapshot().await {
            match entry.lock().await.state {
                TaskState::Pending => counts.pending += 1,
                TaskState::Assigned => counts.assigned += 1,
                TaskState::Completed => counts.completed += 1,
                TaskState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
