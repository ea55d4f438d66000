#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use issue_dispatch::backoff::Backoff;
use issue_dispatch::config::WorkersConfig;
use issue_dispatch::discovery::{IssueSource, IssueStatus, SourceItem};
use issue_dispatch::error::{ProvisionError, SourceError};
use issue_dispatch::platform::RequirementSet;
use issue_dispatch::scheduler::{Priority, RetryPolicy, Task};
use issue_dispatch::worker::{InstanceHandle, InstanceStatus, Provisioner, WorkerSpec};

pub const REPO: &str = "acme/web";

/// Retries immediately and gives up after `max_retries` attempts.
pub fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        backoff: Backoff::new(Duration::ZERO, Duration::ZERO),
    }
}

pub fn workers_config(max_concurrent: usize) -> WorkersConfig {
    WorkersConfig {
        max_concurrent,
        poll_interval_ms: 10,
        ..WorkersConfig::default()
    }
}

pub fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap()
}

pub fn source_id(number: u64) -> String {
    format!("{REPO}#{number}")
}

pub fn task(number: u64, requirements: RequirementSet) -> Task {
    Task::new(
        source_id(number),
        serde_json::json!({ "number": number }),
        requirements,
        Priority::Normal,
    )
}

pub fn node_task(number: u64) -> Task {
    task(number, RequirementSet::new().require("nodejs", ">=18"))
}

pub fn item(number: u64, title: &str, body: &str, labels: &[&str]) -> SourceItem {
    SourceItem {
        source_id: source_id(number),
        title: title.to_string(),
        body: body.to_string(),
        labels: labels.iter().map(|l| l.to_string()).collect(),
        created_at: Some(at(number as u32 % 60)),
        payload: serde_json::json!({ "repo": REPO, "number": number, "title": title }),
    }
}

// =============================================================================
// Provisioner fake
// =============================================================================

/// In-memory provisioner. Every instance reports `Running` until a status is
/// scripted for its source id.
#[derive(Default)]
pub struct MockProvisioner {
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
    /// Most instances alive at once.
    pub peak: AtomicUsize,
    pub fail_create: AtomicBool,
    specs: Mutex<Vec<WorkerSpec>>,
    live: Mutex<HashMap<String, String>>,
    scripted: Mutex<HashMap<String, InstanceStatus>>,
}

impl MockProvisioner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Status reported for every instance serving `source_id`.
    pub fn script(&self, source_id: &str, status: InstanceStatus) {
        self.scripted
            .lock()
            .unwrap()
            .insert(source_id.to_string(), status);
    }

    pub fn succeed(&self, source_id: &str, result: serde_json::Value) {
        self.script(source_id, InstanceStatus::Done { result });
    }

    pub fn error(&self, source_id: &str, message: &str) {
        self.script(
            source_id,
            InstanceStatus::Error {
                message: message.to_string(),
            },
        );
    }

    pub fn specs(&self) -> Vec<WorkerSpec> {
        self.specs.lock().unwrap().clone()
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn create(&self, spec: &WorkerSpec) -> Result<InstanceHandle, ProvisionError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ProvisionError::Create("runtime unavailable".to_string()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        self.specs.lock().unwrap().push(spec.clone());

        let id = format!("mock-{}", spec.worker_id);
        let mut live = self.live.lock().unwrap();
        live.insert(id.clone(), spec.source_id.clone());
        self.peak.fetch_max(live.len(), Ordering::SeqCst);
        drop(live);
        Ok(InstanceHandle {
            id,
            worker_dir: None,
        })
    }

    async fn signal_status(
        &self,
        instance: &InstanceHandle,
    ) -> Result<InstanceStatus, ProvisionError> {
        let Some(source_id) = self.live.lock().unwrap().get(&instance.id).cloned() else {
            return Ok(InstanceStatus::Error {
                message: "instance not found".to_string(),
            });
        };
        Ok(self
            .scripted
            .lock()
            .unwrap()
            .get(&source_id)
            .cloned()
            .unwrap_or(InstanceStatus::Running { heartbeat_at: None }))
    }

    async fn destroy(&self, instance: &InstanceHandle) -> Result<(), ProvisionError> {
        if self.live.lock().unwrap().remove(&instance.id).is_some() {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// =============================================================================
// Issue source fake
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub source_id: String,
    pub status: IssueStatus,
    pub comment: Option<String>,
}

/// In-memory issue tracker. `set_status` rewrites the item's bot labels the
/// way the real tracker would.
#[derive(Default)]
pub struct MockIssueSource {
    items: Mutex<Vec<SourceItem>>,
    annotations: Mutex<Vec<Annotation>>,
    pub list_calls: AtomicUsize,
    failures_left: AtomicU32,
}

impl MockIssueSource {
    pub fn new(items: Vec<SourceItem>) -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(items),
            ..Self::default()
        })
    }

    pub fn add(&self, item: SourceItem) {
        self.items.lock().unwrap().push(item);
    }

    /// The next `n` listings fail.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn annotations(&self) -> Vec<Annotation> {
        self.annotations.lock().unwrap().clone()
    }

    pub fn annotations_for(&self, source_id: &str) -> Vec<Annotation> {
        self.annotations()
            .into_iter()
            .filter(|a| a.source_id == source_id)
            .collect()
    }

    pub fn last_status(&self, source_id: &str) -> Option<IssueStatus> {
        self.annotations_for(source_id).last().map(|a| a.status)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IssueSource for MockIssueSource {
    async fn list_triggering_items(&self) -> Result<Vec<SourceItem>, SourceError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(SourceError::Command {
                command: "gh issue list".to_string(),
                reason: "HTTP 502".to_string(),
            });
        }
        Ok(self.items.lock().unwrap().clone())
    }

    async fn set_status(
        &self,
        source_id: &str,
        status: IssueStatus,
        comment: Option<&str>,
    ) -> Result<(), SourceError> {
        let mut items = self.items.lock().unwrap();
        let item = items
            .iter_mut()
            .find(|i| i.source_id == source_id)
            .ok_or_else(|| SourceError::UnknownSource(source_id.to_string()))?;
        item.labels.retain(|l| IssueStatus::from_label(l).is_none());
        item.labels.push(status.label().to_string());

        self.annotations.lock().unwrap().push(Annotation {
            source_id: source_id.to_string(),
            status,
            comment: comment.map(str::to_string),
        });
        Ok(())
    }
}
