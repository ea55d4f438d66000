use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::SandboxConfig;
use crate::error::ProvisionError;
use crate::worker::provisioner::{InstanceHandle, InstanceStatus, Provisioner, WorkerDir, WorkerSpec};

const WORKER_MOUNT: &str = "/bot/worker";
const CONTAINER_PREFIX: &str = "issue-dispatch-";
const WORKER_LABEL: &str = "issue-dispatch.worker";

/// Runs each worker in a detached, sandboxed Docker container.
///
/// Containers get:
/// - Dropped capabilities and no privilege escalation
/// - Memory and CPU limits
/// - Optional network isolation and read-only root filesystem
/// - The worker directory bind-mounted at `/bot/worker`
#[derive(Debug, Clone)]
pub struct DockerProvisioner {
    sandbox: SandboxConfig,
    command: Vec<String>,
    workers_root: PathBuf,
    command_timeout: Duration,
    program: String,
}

impl DockerProvisioner {
    pub fn new(sandbox: SandboxConfig, command: Vec<String>, workers_root: PathBuf) -> Self {
        Self {
            sandbox,
            command,
            workers_root,
            command_timeout: Duration::from_secs(60),
            program: "docker".to_string(),
        }
    }

    /// Use another executable in place of `docker`.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Arguments for `docker run`.
    pub fn run_args(&self, spec: &WorkerSpec, worker_dir: &Path) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            format!("--name={}{}", CONTAINER_PREFIX, spec.worker_id),
            format!("--label=issue-dispatch.task={}", spec.task_id),
            format!("--label={}={}", WORKER_LABEL, spec.worker_id),
        ];

        // Network isolation
        if self.sandbox.network_disabled {
            args.push("--network=none".to_string());
        }

        if let Some(ref limit) = self.sandbox.memory_limit {
            args.push(format!("--memory={}", limit));
        }

        if let Some(ref limit) = self.sandbox.cpu_limit {
            args.push(format!("--cpus={}", limit));
        }

        // Security: drop all capabilities, no new privileges
        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());

        if self.sandbox.read_only_root {
            args.push("--read-only".to_string());
            args.push("--tmpfs=/tmp".to_string());
        }

        args.push(format!("--volume={}:{}", worker_dir.display(), WORKER_MOUNT));
        let dir = WorkerDir::at(worker_dir);
        for (key, value) in dir.env(spec, Path::new(WORKER_MOUNT)) {
            args.push(format!("--env={}={}", key, value));
        }

        args.push(
            spec.image
                .clone()
                .unwrap_or_else(|| self.sandbox.image.clone()),
        );
        args.extend(self.command.iter().cloned());
        args
    }

    async fn docker(&self, args: &[String]) -> Result<std::process::Output, String> {
        let run = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.command_timeout, run).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("docker timed out after {:?}", self.command_timeout)),
        }
    }

    fn worker_dir(instance: &InstanceHandle) -> Option<WorkerDir> {
        instance.worker_dir.as_ref().map(WorkerDir::at)
    }

    /// Best-effort cleanup of a container that failed to come up.
    async fn discard(&self, name: &str, dir: &WorkerDir) {
        let args = ["rm".to_string(), "-f".to_string(), name.to_string()];
        match self.docker(&args).await {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !is_missing_container(&stderr) {
                    tracing::warn!(container = %name, error = %stderr.trim(), "Failed to remove container");
                }
            }
            Err(reason) => {
                tracing::warn!(container = %name, error = %reason, "Failed to remove container");
            }
        }
        if let Err(e) = dir.remove().await {
            tracing::warn!(container = %name, error = %e, "Failed to remove worker directory");
        }
    }
}

fn is_missing_container(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("No such object")
}

#[async_trait]
impl Provisioner for DockerProvisioner {
    async fn create(&self, spec: &WorkerSpec) -> Result<InstanceHandle, ProvisionError> {
        let dir = WorkerDir::prepare(&self.workers_root, spec).await?;
        let args = self.run_args(spec, dir.path());
        let name = format!("{}{}", CONTAINER_PREFIX, spec.worker_id);

        tracing::info!(
            worker_id = %spec.worker_id,
            task_id = %spec.task_id,
            platforms = %spec.profile,
            "Starting worker container"
        );

        let output = match self.docker(&args).await {
            Ok(output) => output,
            Err(reason) => {
                // The daemon may still start the container after the CLI
                // gave up.
                self.discard(&name, &dir).await;
                return Err(ProvisionError::Create(reason));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            self.discard(&name, &dir).await;
            return Err(ProvisionError::Create(if stderr.is_empty() {
                format!("docker run exited with {:?}", output.status.code())
            } else {
                stderr
            }));
        }

        Ok(InstanceHandle {
            id: name,
            worker_dir: Some(dir.path().to_path_buf()),
        })
    }

    async fn signal_status(
        &self,
        instance: &InstanceHandle,
    ) -> Result<InstanceStatus, ProvisionError> {
        let args = [
            "inspect".to_string(),
            "--format={{.State.Status}}|{{.State.ExitCode}}".to_string(),
            instance.id.clone(),
        ];
        let output = self.docker(&args).await.map_err(|reason| ProvisionError::Status {
            instance: instance.id.clone(),
            reason,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if is_missing_container(&stderr) {
                return Ok(InstanceStatus::Error {
                    message: "container disappeared".to_string(),
                });
            }
            return Err(ProvisionError::Status {
                instance: instance.id.clone(),
                reason: stderr.trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let (state, exit_code) = stdout.split_once('|').unwrap_or((stdout.as_str(), ""));
        let dir = Self::worker_dir(instance);

        match state {
            "created" => Ok(InstanceStatus::Starting),
            "running" | "restarting" | "paused" => {
                let heartbeat_at = match &dir {
                    Some(dir) => dir.heartbeat().await,
                    None => None,
                };
                Ok(InstanceStatus::Running { heartbeat_at })
            }
            "exited" | "dead" => {
                let code: i64 = exit_code.trim().parse().unwrap_or(-1);
                if code == 0 {
                    let result = match &dir {
                        Some(dir) => dir.result().await,
                        None => None,
                    };
                    Ok(InstanceStatus::Done {
                        result: result.unwrap_or_else(|| serde_json::json!({ "exit_code": 0 })),
                    })
                } else {
                    let logs = self
                        .docker(&[
                            "logs".to_string(),
                            "--tail=20".to_string(),
                            instance.id.clone(),
                        ])
                        .await
                        .map(|o| {
                            let mut text = String::from_utf8_lossy(&o.stdout).to_string();
                            text.push_str(&String::from_utf8_lossy(&o.stderr));
                            text.trim().to_string()
                        })
                        .unwrap_or_default();
                    Ok(InstanceStatus::Error {
                        message: if logs.is_empty() {
                            format!("exit code {}", code)
                        } else {
                            format!("exit code {}: {}", code, logs)
                        },
                    })
                }
            }
            other => Err(ProvisionError::Status {
                instance: instance.id.clone(),
                reason: format!("unexpected container state `{}`", other),
            }),
        }
    }

    async fn destroy(&self, instance: &InstanceHandle) -> Result<(), ProvisionError> {
        let args = ["rm".to_string(), "-f".to_string(), instance.id.clone()];
        let output = self.docker(&args).await.map_err(|reason| ProvisionError::Destroy {
            instance: instance.id.clone(),
            reason,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if !is_missing_container(&stderr) {
                return Err(ProvisionError::Destroy {
                    instance: instance.id.clone(),
                    reason: stderr.trim().to_string(),
                });
            }
        }

        if let Some(dir) = Self::worker_dir(instance) {
            dir.remove().await?;
        }
        tracing::debug!(instance = %instance.id, "Worker container removed");
        Ok(())
    }

    async fn sweep(&self) -> Result<usize, ProvisionError> {
        let sweep_error = |reason: String| ProvisionError::Destroy {
            instance: format!("label={}", WORKER_LABEL),
            reason,
        };

        let list = [
            "ps".to_string(),
            "-a".to_string(),
            "-q".to_string(),
            format!("--filter=label={}", WORKER_LABEL),
        ];
        let output = self.docker(&list).await.map_err(sweep_error)?;
        if !output.status.success() {
            return Err(sweep_error(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let ids: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .map(str::to_string)
            .collect();

        if !ids.is_empty() {
            let mut args = vec!["rm".to_string(), "-f".to_string()];
            args.extend(ids.iter().cloned());
            let output = self.docker(&args).await.map_err(sweep_error)?;
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !output.status.success() && !is_missing_container(&stderr) {
                return Err(sweep_error(stderr.trim().to_string()));
            }
        }

        for dir in WorkerDir::list(&self.workers_root).await? {
            dir.remove().await?;
        }
        Ok(ids.len())
    }
}
