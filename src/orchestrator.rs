use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::discovery::{IssueSource, IssueStatus, TaskDiscoverer};
use crate::error::{DispatchError, Result};
use crate::platform::{
    satisfies, select_template, CapabilityProfile, PlatformCatalog, RequirementSet,
    WorkerTemplate,
};
use crate::scheduler::{FailDisposition, Task, TaskId, WorkQueue};
use crate::worker::{WorkerHandle, WorkerManager, WorkerOutcome};

/// Timing knobs for the orchestration loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub discovery_interval: Duration,
    pub dispatch_interval: Duration,
    /// Assigned tasks unseen for this long are reaped.
    pub heartbeat_grace: Duration,
    pub retention: Duration,
    /// Upper bound for waiting on a worker in `run_once`.
    pub worker_timeout: Duration,
    /// Provision on demand from the catalog when no template fits.
    pub provision_fresh: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            discovery_interval: config.discovery_interval(),
            dispatch_interval: config.dispatch_interval(),
            heartbeat_grace: config.queue.heartbeat_grace(),
            retention: config.queue.retention(),
            worker_timeout: config.workers.max_lifetime(),
            provision_fresh: true,
        }
    }
}

/// What one dispatch cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub reaped: usize,
    pub spawned: usize,
    pub completed: usize,
    pub requeued: usize,
    pub failed: usize,
    pub purged: usize,
}

impl CycleReport {
    fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

enum Note {
    Status {
        source_id: String,
        status: IssueStatus,
        comment: Option<String>,
    },
    Flush(oneshot::Sender<()>),
}

/// Delivers issue annotations in order on a background task, so a slow
/// tracker never holds up a dispatch cycle.
struct Annotator {
    source: Arc<dyn IssueSource>,
    tx: mpsc::UnboundedSender<Note>,
    rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Note>>>,
}

impl Annotator {
    fn new(source: Arc<dyn IssueSource>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            source,
            tx,
            rx: std::sync::Mutex::new(Some(rx)),
        }
    }

    /// Start the delivery task on first use; it ends once the sender drops.
    fn ensure_running(&self) {
        let rx = self.rx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(rx) = rx {
            tokio::spawn(Self::deliver(self.source.clone(), rx));
        }
    }

    fn post(&self, source_id: &str, status: IssueStatus, comment: Option<String>) {
        self.ensure_running();
        let note = Note::Status {
            source_id: source_id.to_string(),
            status,
            comment,
        };
        if self.tx.send(note).is_err() {
            tracing::warn!(source_id, status = %status, "Annotation dropped");
        }
    }

    /// Wait until everything posted so far has been delivered.
    async fn flush(&self) {
        self.ensure_running();
        let (done, delivered) = oneshot::channel();
        if self.tx.send(Note::Flush(done)).is_ok() {
            let _ = delivered.await;
        }
    }

    async fn deliver(source: Arc<dyn IssueSource>, mut rx: mpsc::UnboundedReceiver<Note>) {
        while let Some(note) = rx.recv().await {
            match note {
                Note::Status {
                    source_id,
                    status,
                    comment,
                } => {
                    if let Err(e) = source
                        .set_status(&source_id, status, comment.as_deref())
                        .await
                    {
                        tracing::warn!(%source_id, status = %status, error = %e, "Failed to annotate issue");
                    }
                }
                Note::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    handle: WorkerHandle,
    source_id: String,
}

/// Drives discovery and dispatch on independent cadences.
///
/// Each dispatch cycle:
/// 1. reaps stale assignments
/// 2. claims and spawns while worker slots are free
/// 3. polls in-flight workers and reconciles finished ones
/// 4. purges expired terminal records
pub struct Orchestrator {
    queue: Arc<WorkQueue>,
    workers: Arc<WorkerManager>,
    discoverer: Arc<TaskDiscoverer>,
    annotator: Annotator,
    templates: Vec<WorkerTemplate>,
    catalog: PlatformCatalog,
    settings: OrchestratorSettings,
    in_flight: Mutex<HashMap<TaskId, InFlight>>,
}

impl Orchestrator {
    pub fn new(
        queue: Arc<WorkQueue>,
        workers: Arc<WorkerManager>,
        discoverer: Arc<TaskDiscoverer>,
        source: Arc<dyn IssueSource>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            queue,
            workers,
            discoverer,
            annotator: Annotator::new(source),
            templates: Vec::new(),
            catalog: PlatformCatalog::default(),
            settings,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_templates(mut self, templates: Vec<WorkerTemplate>) -> Self {
        self.templates = templates;
        self
    }

    pub fn with_catalog(mut self, catalog: PlatformCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn workers(&self) -> &Arc<WorkerManager> {
        &self.workers
    }

    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Whether some template or the catalog can host `requirements`.
    fn can_serve(&self, requirements: &RequirementSet) -> bool {
        self.templates
            .iter()
            .any(|t| satisfies(&t.capabilities, requirements))
            || (self.settings.provision_fresh && self.catalog.can_provision(requirements))
    }

    /// Profile and image to provision for `requirements`: the first fitting
    /// template, else a minimal profile from the catalog.
    fn placement(&self, requirements: &RequirementSet) -> Option<(CapabilityProfile, Option<String>)> {
        if let Some(template) = select_template(&self.templates, requirements) {
            return Some((template.capabilities.clone(), template.image.clone()));
        }
        if !self.settings.provision_fresh {
            return None;
        }
        self.catalog
            .minimal_profile_for(requirements)
            .ok()
            .map(|profile| (profile, None))
    }

    fn annotate(&self, source_id: &str, status: IssueStatus, comment: Option<String>) {
        self.annotator.post(source_id, status, comment);
    }

    /// Wait for every annotation queued so far to reach the issue source.
    pub async fn flush_annotations(&self) {
        self.annotator.flush().await;
    }

    async fn after_failure(
        &self,
        task_id: &TaskId,
        disposition: FailDisposition,
        report: &mut CycleReport,
    ) {
        let Some(task) = self.queue.get(task_id).await else {
            return;
        };
        match disposition {
            FailDisposition::Requeued { .. } => {
                report.requeued += 1;
                self.annotate(&task.source_id, IssueStatus::Queued, None);
            }
            FailDisposition::Exhausted { retry_count } => {
                report.failed += 1;
                let comment = format!(
                    "Task failed after {} attempt(s): {}",
                    retry_count,
                    task.last_error.as_deref().unwrap_or("unknown error")
                );
                self.annotate(&task.source_id, IssueStatus::Failed, Some(comment));
            }
        }
    }

    async fn reconcile(
        &self,
        task_id: &TaskId,
        source_id: &str,
        outcome: WorkerOutcome,
        report: &mut CycleReport,
    ) -> Result<()> {
        let result = match outcome {
            WorkerOutcome::Success(result) => {
                let comment = match result.get("pr_url").and_then(|u| u.as_str()) {
                    Some(url) => format!("Task completed: {url}"),
                    None => "Task completed.".to_string(),
                };
                self.queue.complete(task_id, result).await.map(|()| {
                    report.completed += 1;
                    Some(comment)
                })
            }
            other => {
                let error = other.error_message().unwrap_or_default();
                match self.queue.fail(task_id, &error).await {
                    Ok(disposition) => {
                        self.after_failure(task_id, disposition, report).await;
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            }
        };

        match result {
            Ok(Some(comment)) => {
                self.annotate(source_id, IssueStatus::Completed, Some(comment));
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(DispatchError::NotAssigned { task_id, state }) => {
                // The reaper got there first; its decision stands.
                tracing::warn!(%task_id, %state, "Discarding late worker outcome");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn stop_worker(&self, handle: &WorkerHandle) {
        if let Err(e) = self.workers.terminate(handle).await {
            tracing::warn!(worker_id = %handle.worker_id, error = %e, "Worker teardown failed");
        }
    }

    async fn reap(&self, report: &mut CycleReport) -> Result<()> {
        for (task_id, disposition) in self.queue.reap_stale(self.settings.heartbeat_grace).await? {
            report.reaped += 1;
            let flight = self.in_flight.lock().await.remove(&task_id);
            if let Some(flight) = flight {
                self.stop_worker(&flight.handle).await;
            }
            self.after_failure(&task_id, disposition, report).await;
        }
        Ok(())
    }

    async fn spawn_pending(&self, report: &mut CycleReport) -> Result<()> {
        while self.workers.available_slots() > 0 {
            let Some(task) = self.queue.claim_matching(|r| self.can_serve(r)).await? else {
                break;
            };
            let Some((profile, image)) = self.placement(&task.requirements) else {
                self.queue.release(&task.id).await?;
                break;
            };

            match self.workers.spawn(&task, profile, image).await {
                Ok(handle) => {
                    report.spawned += 1;
                    self.in_flight.lock().await.insert(
                        task.id,
                        InFlight {
                            handle,
                            source_id: task.source_id.clone(),
                        },
                    );
                    self.annotate(&task.source_id, IssueStatus::InProgress, None);
                }
                Err(DispatchError::CapacityExceeded { .. }) => {
                    self.queue.release(&task.id).await?;
                    break;
                }
                Err(e) => {
                    tracing::error!(task_id = %task.id, error = %e, "Failed to spawn worker");
                    let disposition = self.queue.fail(&task.id, &e.to_string()).await?;
                    self.after_failure(&task.id, disposition, report).await;
                }
            }
        }
        Ok(())
    }

    fn flights(map: &HashMap<TaskId, InFlight>) -> Vec<(TaskId, InFlight)> {
        map.iter().map(|(id, f)| (*id, f.clone())).collect()
    }

    async fn finish(
        &self,
        task_id: TaskId,
        flight: &InFlight,
        outcome: WorkerOutcome,
        report: &mut CycleReport,
    ) -> Result<()> {
        self.in_flight.lock().await.remove(&task_id);
        self.stop_worker(&flight.handle).await;
        self.reconcile(&task_id, &flight.source_id, outcome, report)
            .await
    }

    async fn poll_in_flight(&self, report: &mut CycleReport) -> Result<()> {
        let flights = Self::flights(&*self.in_flight.lock().await);

        for (task_id, flight) in flights {
            let outcome = match self.workers.poll(&flight.handle).await {
                Ok(Some(outcome)) => outcome,
                Ok(None) => {
                    let heartbeat = self
                        .workers
                        .info(&flight.handle)
                        .await
                        .and_then(|i| i.last_heartbeat);
                    if let Some(at) = heartbeat {
                        if let Err(e) = self.queue.heartbeat(&task_id, at).await {
                            tracing::debug!(%task_id, error = %e, "Heartbeat not recorded");
                        }
                    }
                    continue;
                }
                Err(DispatchError::WorkerNotFound(_)) => {
                    WorkerOutcome::Crashed("worker record lost".to_string())
                }
                Err(e) => {
                    tracing::warn!(%task_id, error = %e, "Worker poll failed");
                    continue;
                }
            };
            self.finish(task_id, &flight, outcome, report).await?;
        }
        Ok(())
    }

    /// One pass of reap, spawn, reconcile, purge.
    pub async fn dispatch_cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        self.reap(&mut report).await?;
        self.spawn_pending(&mut report).await?;
        self.poll_in_flight(&mut report).await?;
        report.purged = self.queue.purge_expired(self.settings.retention).await?;

        Ok(report)
    }

    /// One discovery pass and one dispatch pass, then wait for the workers
    /// that pass started.
    pub async fn run_once(&self) -> Result<CycleReport> {
        self.discoverer.poll().await;
        let mut report = self.dispatch_cycle().await?;

        let flights = Self::flights(&*self.in_flight.lock().await);
        for (task_id, flight) in flights {
            let outcome = match self
                .workers
                .await_completion(&flight.handle, self.settings.worker_timeout)
                .await
            {
                Ok(outcome) => outcome,
                Err(DispatchError::WorkerNotFound(_)) => {
                    WorkerOutcome::Crashed("worker record lost".to_string())
                }
                Err(e) => return Err(e),
            };
            self.finish(task_id, &flight, outcome, &mut report).await?;
        }
        self.flush_annotations().await;
        Ok(report)
    }

    /// Run until `shutdown` is cancelled, then drain.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut discovery_tick = tokio::time::interval(self.settings.discovery_interval);
        let mut dispatch_tick = tokio::time::interval(self.settings.dispatch_interval);
        discovery_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        dispatch_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Discovery may sit in retries; it runs beside the loop so dispatch
        // keeps its cadence.
        let mut discovery: Option<JoinHandle<Vec<Task>>> = None;

        tracing::info!(
            discovery_interval_secs = self.settings.discovery_interval.as_secs(),
            dispatch_interval_secs = self.settings.dispatch_interval.as_secs(),
            max_workers = self.workers.max_concurrent(),
            templates = self.templates.len(),
            "Orchestrator started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Orchestrator shutting down");
                    break;
                }
                _ = discovery_tick.tick() => {
                    if discovery.as_ref().is_some_and(|h| !h.is_finished()) {
                        tracing::debug!("Previous discovery still running");
                    } else {
                        let discoverer = self.discoverer.clone();
                        discovery = Some(tokio::spawn(async move { discoverer.poll().await }));
                    }
                }
                _ = dispatch_tick.tick() => {
                    match self.dispatch_cycle().await {
                        Ok(report) if report.is_idle() => {
                            tracing::debug!("Dispatch cycle idle");
                        }
                        Ok(report) => {
                            tracing::info!(
                                reaped = report.reaped,
                                spawned = report.spawned,
                                completed = report.completed,
                                requeued = report.requeued,
                                failed = report.failed,
                                purged = report.purged,
                                "Dispatch cycle"
                            );
                        }
                        Err(e) if e.is_fatal() => {
                            tracing::error!(error = %e, "Fatal dispatch error");
                            if let Some(handle) = discovery.take() {
                                handle.abort();
                            }
                            self.drain().await;
                            return Err(e);
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Dispatch cycle failed");
                        }
                    }
                }
            }
        }

        if let Some(handle) = discovery.take() {
            handle.abort();
        }
        self.drain().await;
        Ok(())
    }

    /// Terminate every live worker and hand its task back to the queue
    /// without spending a retry.
    pub async fn drain(&self) {
        let flights: Vec<(TaskId, InFlight)> = self.in_flight.lock().await.drain().collect();
        let released = flights.len();

        for (task_id, flight) in flights {
            self.stop_worker(&flight.handle).await;
            match self.queue.release(&task_id).await {
                Ok(()) => self.annotate(&flight.source_id, IssueStatus::Queued, None),
                Err(e) => tracing::warn!(%task_id, error = %e, "Failed to release task"),
            }
        }

        let stray = self.workers.shutdown().await;
        self.flush_annotations().await;
        tracing::info!(released, stray = stray.len(), "Drained in-flight work");
    }
}
