use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::platform::RequirementSet;

/// Stable task identity derived from the source item, so rediscovering the
/// same issue always yields the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn from_source(source_id: &str) -> Self {
        let name = format!("issue-dispatch:{source_id}");
        Self(Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Assigned,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Assigned => write!(f, "assigned"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskState::Pending),
            "assigned" => Ok(TaskState::Assigned),
            "completed" => Ok(TaskState::Completed),
            "failed" => Ok(TaskState::Failed),
            other => Err(format!("unknown task state: {other}")),
        }
    }
}

/// Dispatch priority band. Higher bands are claimed first; within a band
/// tasks are claimed oldest first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// Maps issue labels onto a band. The highest matching band wins;
    /// unlabeled items are `Normal`.
    pub fn from_labels<S: AsRef<str>>(labels: &[S]) -> Self {
        labels
            .iter()
            .filter_map(|l| {
                let label = l.as_ref().to_ascii_lowercase();
                let band = label
                    .strip_prefix("priority:")
                    .or_else(|| label.strip_prefix("priority/"))
                    .unwrap_or(&label);
                match band {
                    "urgent" | "critical" | "p0" => Some(Priority::Urgent),
                    "high" | "important" | "p1" => Some(Priority::High),
                    "medium" | "normal" | "p2" => Some(Priority::Normal),
                    "low" | "minor" | "p3" => Some(Priority::Low),
                    _ => None,
                }
            })
            .max()
            .unwrap_or_default()
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Urgent => write!(f, "urgent"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// External item reference, e.g. `owner/repo#42`.
    pub source_id: String,
    pub payload: serde_json::Value,
    pub requirements: RequirementSet,
    pub priority: Priority,
    pub state: TaskState,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Earliest time a requeued task may be claimed again.
    pub not_before: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Bumped on every persisted transition.
    #[serde(default)]
    pub revision: u64,
}

impl Task {
    pub fn new(
        source_id: impl Into<String>,
        payload: serde_json::Value,
        requirements: RequirementSet,
        priority: Priority,
    ) -> Self {
        let source_id = source_id.into();
        Self {
            id: TaskId::from_source(&source_id),
            source_id,
            payload,
            requirements,
            priority,
            state: TaskState::Pending,
            retry_count: 0,
            last_error: None,
            result: None,
            created_at: Utc::now(),
            assigned_at: None,
            last_heartbeat: None,
            not_before: None,
            completed_at: None,
            revision: 0,
        }
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Pending and past any retry backoff.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.state == TaskState::Pending && self.not_before.map_or(true, |t| t <= now)
    }

    /// Most recent proof of life for an assigned task.
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        match (self.last_heartbeat, self.assigned_at) {
            (Some(hb), Some(at)) => Some(hb.max(at)),
            (hb, at) => hb.or(at),
        }
    }
}
