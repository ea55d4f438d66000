use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SourceError;

/// One triggering item from the issue source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceItem {
    /// Stable external reference, e.g. `owner/repo#42`.
    pub source_id: String,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    /// Handed to the worker untouched.
    pub payload: serde_json::Value,
}

impl SourceItem {
    /// Title and body, the text keyword detection runs over.
    pub fn text(&self) -> String {
        format!("{}\n{}", self.title, self.body)
    }

    /// Bot status already recorded on the item, if any.
    pub fn status(&self) -> Option<IssueStatus> {
        self.labels
            .iter()
            .filter_map(|l| IssueStatus::from_label(l))
            .max_by_key(|s| *s as u8)
    }
}

/// Processing status mirrored onto the source item as a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
}

impl IssueStatus {
    pub const ALL: [IssueStatus; 4] = [
        IssueStatus::Queued,
        IssueStatus::InProgress,
        IssueStatus::Completed,
        IssueStatus::Failed,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            IssueStatus::Queued => "bot:queued",
            IssueStatus::InProgress => "bot:in-progress",
            IssueStatus::Completed => "bot:completed",
            IssueStatus::Failed => "bot:failed",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.label() == label)
    }

    /// Items in these states are never rediscovered. `Queued` items are, so
    /// a lost queue directory repopulates itself.
    pub fn blocks_rediscovery(&self) -> bool {
        !matches!(self, IssueStatus::Queued)
    }
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[async_trait]
pub trait IssueSource: Send + Sync {
    /// Open items carrying the trigger label.
    async fn list_triggering_items(&self) -> Result<Vec<SourceItem>, SourceError>;

    /// Replace the item's status label and optionally leave a comment.
    async fn set_status(
        &self,
        source_id: &str,
        status: IssueStatus,
        comment: Option<&str>,
    ) -> Result<(), SourceError>;
}
