use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::error::ProvisionError;
use crate::worker::provisioner::{
    InstanceHandle, InstanceStatus, Provisioner, WorkerDir, WorkerSpec, LOG_FILE,
};

const PID_FILE: &str = "pid";

/// Runs each worker as a local child process, for hosts without a container
/// runtime. Same directory protocol as the Docker provisioner; the worker
/// directory is also the process's working directory.
///
/// `command` is executed as given, without a shell. Wrap it as
/// `["sh", "-c", "..."]` to run a script.
#[derive(Debug)]
pub struct ProcessProvisioner {
    command: Vec<String>,
    workers_root: PathBuf,
    children: Mutex<HashMap<String, Child>>,
}

impl ProcessProvisioner {
    pub fn new(command: Vec<String>, workers_root: PathBuf) -> Self {
        // The child runs inside its worker directory, so relative paths
        // handed to it would resolve wrongly.
        let workers_root = if workers_root.is_relative() {
            std::env::current_dir()
                .map(|cwd| cwd.join(&workers_root))
                .unwrap_or(workers_root)
        } else {
            workers_root
        };
        Self {
            command,
            workers_root,
            children: Mutex::new(HashMap::new()),
        }
    }

    fn children(&self) -> std::sync::MutexGuard<'_, HashMap<String, Child>> {
        self.children.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Whether `pid` is still a process running inside `dir`. Guards against a
/// recycled pid; hosts without `/proc` never match.
fn runs_in(pid: u32, dir: &Path) -> bool {
    let Ok(cwd) = std::fs::read_link(format!("/proc/{}/cwd", pid)) else {
        return false;
    };
    match (cwd.canonicalize(), dir.canonicalize()) {
        (Ok(cwd), Ok(dir)) => cwd == dir,
        _ => false,
    }
}

async fn kill_orphan(pid: u32) {
    let killed = Command::new("kill")
        .args(["-KILL", &pid.to_string()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = killed {
        tracing::warn!(pid, error = %e, "Failed to kill orphaned worker");
    }
}

#[async_trait]
impl Provisioner for ProcessProvisioner {
    async fn create(&self, spec: &WorkerSpec) -> Result<InstanceHandle, ProvisionError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| ProvisionError::Create("empty worker command".to_string()))?;

        let dir = WorkerDir::prepare(&self.workers_root, spec).await?;
        let log = std::fs::File::create(dir.path().join(LOG_FILE))?;
        let log_err = log.try_clone()?;

        let spawned = Command::new(program)
            .args(args)
            .envs(dir.env(spec, dir.path()))
            .current_dir(dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn();

        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let _ = dir.remove().await;
                return Err(ProvisionError::Create(format!("spawn {}: {}", program, e)));
            }
        };

        let id = format!("process-{}", spec.worker_id);
        tracing::info!(
            worker_id = %spec.worker_id,
            task_id = %spec.task_id,
            pid = child.id(),
            "Started worker process"
        );
        if let Some(pid) = child.id() {
            if let Err(e) = tokio::fs::write(dir.path().join(PID_FILE), pid.to_string()).await {
                tracing::warn!(worker_id = %spec.worker_id, error = %e, "Failed to record worker pid");
            }
        }
        self.children().insert(id.clone(), child);

        Ok(InstanceHandle {
            id,
            worker_dir: Some(dir.path().to_path_buf()),
        })
    }

    async fn signal_status(
        &self,
        instance: &InstanceHandle,
    ) -> Result<InstanceStatus, ProvisionError> {
        let exit = {
            let mut children = self.children();
            let Some(child) = children.get_mut(&instance.id) else {
                return Ok(InstanceStatus::Error {
                    message: "worker process is not tracked".to_string(),
                });
            };
            child.try_wait().map_err(|e| ProvisionError::Status {
                instance: instance.id.clone(),
                reason: e.to_string(),
            })?
        };

        let dir = instance.worker_dir.as_ref().map(WorkerDir::at);
        match exit {
            None => {
                let heartbeat_at = match &dir {
                    Some(dir) => dir.heartbeat().await,
                    None => None,
                };
                Ok(InstanceStatus::Running { heartbeat_at })
            }
            Some(status) if status.success() => {
                let result = match &dir {
                    Some(dir) => dir.result().await,
                    None => None,
                };
                Ok(InstanceStatus::Done {
                    result: result.unwrap_or_else(|| serde_json::json!({ "exit_code": 0 })),
                })
            }
            Some(status) => {
                let tail = match &dir {
                    Some(dir) => dir.log_tail(20).await,
                    None => String::new(),
                };
                let message = if tail.is_empty() {
                    format!("worker exited with {}", status)
                } else {
                    format!("worker exited with {}: {}", status, tail)
                };
                Ok(InstanceStatus::Error { message })
            }
        }
    }

    async fn destroy(&self, instance: &InstanceHandle) -> Result<(), ProvisionError> {
        let child = self.children().remove(&instance.id);
        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                // Already exited.
                tracing::debug!(instance = %instance.id, error = %e, "Kill skipped");
            }
            let _ = child.wait().await;
        }
        if let Some(dir) = instance.worker_dir.as_ref().map(WorkerDir::at) {
            dir.remove().await?;
        }
        Ok(())
    }

    async fn sweep(&self) -> Result<usize, ProvisionError> {
        let mut killed = 0;
        for dir in WorkerDir::list(&self.workers_root).await? {
            let pid = tokio::fs::read_to_string(dir.path().join(PID_FILE))
                .await
                .ok()
                .and_then(|text| text.trim().parse::<u32>().ok());
            if let Some(pid) = pid.filter(|pid| runs_in(*pid, dir.path())) {
                kill_orphan(pid).await;
                tracing::info!(pid, dir = %dir.path().display(), "Killed orphaned worker process");
                killed += 1;
            }
            dir.remove().await?;
        }
        Ok(killed)
    }
}
