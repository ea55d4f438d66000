use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;
use crate::error::ConfigError;
use crate::platform::{
    select_template, CapabilityProfile, PlatformCatalog, RequirementSet, Version, WorkerTemplate,
};
use crate::scheduler::RetryPolicy;

/// Configuration for Docker-based workers.
///
/// Every worker runs in its own sandboxed container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Image used when the worker's template does not name one
    pub image: String,
    /// Disable network access in the container. Workers that open pull
    /// requests need the network, so this is off by default.
    pub network_disabled: bool,
    /// Memory limit (e.g., "2g")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "1.5")
    pub cpu_limit: Option<String>,
    /// Mount the root filesystem read-only (the worker directory and /tmp
    /// stay writable)
    pub read_only_root: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "issue-dispatch-worker:latest".to_string(),
            network_disabled: false,
            memory_limit: Some("2g".to_string()),
            cpu_limit: Some("1.0".to_string()),
            read_only_root: false,
        }
    }
}

/// Where tasks come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// `owner/repo`; required for `run`.
    pub repo: Option<String>,
    pub trigger_label: String,
    /// Checkout whose manifests drive requirement inference.
    pub workspace_dir: Option<PathBuf>,
    pub command_timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            repo: None,
            trigger_label: "claude-bot".to_string(),
            workspace_dir: Some(PathBuf::from("/workspace")),
            command_timeout_secs: 60,
        }
    }
}

/// Retry schedule for a failing discovery poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollRetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for PollRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter: true,
        }
    }
}

impl PollRetryConfig {
    pub fn backoff(&self) -> Backoff {
        let backoff = Backoff::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        );
        if self.jitter {
            backoff.with_jitter()
        } else {
            backoff
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_retries: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub retention_hours: u64,
    /// An assigned task unseen for this long is reaped.
    pub heartbeat_grace_secs: u64,
    pub max_tasks: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_secs: 30,
            backoff_max_secs: 300,
            retention_hours: 168,
            heartbeat_grace_secs: 300,
            max_tasks: 10_000,
        }
    }
}

impl QueueConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: Backoff::new(
                Duration::from_secs(self.backoff_base_secs),
                Duration::from_secs(self.backoff_max_secs),
            ),
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }

    pub fn heartbeat_grace(&self) -> Duration {
        Duration::from_secs(self.heartbeat_grace_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionerKind {
    Docker,
    Process,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub max_concurrent: usize,
    pub max_lifetime_secs: u64,
    pub heartbeat_grace_secs: u64,
    pub poll_interval_ms: u64,
    pub provisioner: ProvisionerKind,
    /// Entry command run inside the worker environment.
    pub command: Vec<String>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_lifetime_secs: 3600,
            heartbeat_grace_secs: 300,
            poll_interval_ms: 1000,
            provisioner: ProvisionerKind::Docker,
            command: vec![
                "python3".to_string(),
                "/bot/scripts/worker_executor.py".to_string(),
            ],
        }
    }
}

impl WorkersConfig {
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    pub fn heartbeat_grace(&self) -> Duration {
        Duration::from_secs(self.heartbeat_grace_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_profile() -> CapabilityProfile {
    let mut profile = CapabilityProfile::new();
    profile.insert("nodejs", Version::new(18, 16, 0));
    profile
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bot_id: String,
    pub data_dir: PathBuf,
    pub discovery_interval_secs: u64,
    pub dispatch_interval_secs: u64,
    pub dashboard_port: Option<u16>,
    pub source: SourceConfig,
    pub retry: PollRetryConfig,
    pub queue: QueueConfig,
    pub workers: WorkersConfig,
    pub sandbox: SandboxConfig,
    pub templates: Vec<WorkerTemplate>,
    pub platforms: PlatformCatalog,
    pub default_profile: CapabilityProfile,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bot_id: "issue-dispatch".to_string(),
            data_dir: PathBuf::from("/bot/data"),
            discovery_interval_secs: 600,
            dispatch_interval_secs: 30,
            dashboard_port: None,
            source: SourceConfig::default(),
            retry: PollRetryConfig::default(),
            queue: QueueConfig::default(),
            workers: WorkersConfig::default(),
            sandbox: SandboxConfig::default(),
            templates: Vec::new(),
            platforms: PlatformCatalog::default(),
            default_profile: default_profile(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch_interval_secs)
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.data_dir.join("queue")
    }

    pub fn workers_dir(&self) -> PathBuf {
        self.data_dir.join("workers")
    }

    pub fn repo(&self) -> Result<&str, ConfigError> {
        self.source
            .repo
            .as_deref()
            .filter(|r| r.contains('/'))
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "source.repo".to_string(),
                message: "expected owner/repo".to_string(),
            })
    }

    /// Rejects settings the orchestrator cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.to_string(),
        };

        if self.workers.max_concurrent == 0 {
            return Err(invalid("workers.max_concurrent", "must be at least 1"));
        }
        if self.dispatch_interval_secs == 0 {
            return Err(invalid("dispatch_interval_secs", "must be at least 1"));
        }
        // Heartbeats reach the queue once per dispatch cycle; a grace of
        // less than two cycles reaps healthy workers.
        if self.queue.heartbeat_grace_secs < self.dispatch_interval_secs.saturating_mul(2) {
            return Err(ConfigError::InvalidValue {
                key: "queue.heartbeat_grace_secs".to_string(),
                message: format!(
                    "must be at least twice dispatch_interval_secs ({})",
                    self.dispatch_interval_secs
                ),
            });
        }
        if self.discovery_interval_secs == 0 {
            return Err(invalid("discovery_interval_secs", "must be at least 1"));
        }
        if self.queue.max_retries == 0 {
            return Err(invalid("queue.max_retries", "must be at least 1"));
        }
        if self.workers.command.is_empty() {
            return Err(invalid("workers.command", "must not be empty"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }

        let defaults = RequirementSet::from_profile(&self.default_profile);
        if select_template(&self.templates, &defaults).is_none()
            && !self.platforms.can_provision(&defaults)
        {
            return Err(ConfigError::UnsatisfiableDefault(
                self.default_profile.to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_config_default() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.image, "issue-dispatch-worker:latest");
        assert!(!cfg.network_disabled);
        assert_eq!(cfg.memory_limit.as_deref(), Some("2g"));
        assert_eq!(cfg.cpu_limit.as_deref(), Some("1.0"));
    }

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Config::default();
        assert_eq!(cfg.workers.max_concurrent, 3);
        assert_eq!(cfg.queue.max_retries, 3);
        assert_eq!(cfg.discovery_interval(), Duration::from_secs(600));
        assert_eq!(cfg.queue.retention(), Duration::from_secs(7 * 24 * 3600));
        assert_eq!(cfg.default_profile.to_string(), "nodejs:18.16.0");
        cfg.validate().unwrap();
    }

    #[test]
    fn test_partial_file_overrides_defaults() {
        let cfg = Config::from_toml_str(
            r#"
            dispatch_interval_secs = 5

            [source]
            repo = "acme/web"

            [workers]
            max_concurrent = 8
            provisioner = "process"
            command = ["sh", "-c", "./agent.sh"]

            [[templates]]
            name = "node-python"
            capabilities = { nodejs = "20.11.1", python = "3.11" }

            [default_profile]
            python = "3.11"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.dispatch_interval_secs, 5);
        assert_eq!(cfg.discovery_interval_secs, 600);
        assert_eq!(cfg.repo().unwrap(), "acme/web");
        assert_eq!(cfg.source.trigger_label, "claude-bot");
        assert_eq!(cfg.workers.max_concurrent, 8);
        assert_eq!(cfg.workers.provisioner, ProvisionerKind::Process);
        assert_eq!(cfg.workers.heartbeat_grace_secs, 300);
        assert_eq!(cfg.templates.len(), 1);
        assert_eq!(cfg.templates[0].capabilities.len(), 2);
        assert_eq!(cfg.default_profile.to_string(), "python:3.11");
        cfg.validate().unwrap();
    }

    #[test]
    fn test_zero_limits_are_rejected() {
        let mut cfg = Config::default();
        cfg.workers.max_concurrent = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "workers.max_concurrent"
        ));

        let mut cfg = Config::default();
        cfg.queue.max_retries = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.dispatch_interval_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_heartbeat_grace_must_span_two_dispatch_cycles() {
        let mut cfg = Config::default();
        cfg.dispatch_interval_secs = 300;
        cfg.queue.heartbeat_grace_secs = 300;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "queue.heartbeat_grace_secs"
        ));

        cfg.queue.heartbeat_grace_secs = 600;
        cfg.validate().unwrap();
    }

    #[test]
    fn test_unsatisfiable_default_profile_is_rejected() {
        let mut cfg = Config::default();
        cfg.default_profile = CapabilityProfile::parse_pairs("cobol:85").unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::UnsatisfiableDefault(_))
        ));
    }

    #[test]
    fn test_repo_must_be_owner_slash_name() {
        let mut cfg = Config::default();
        assert!(cfg.repo().is_err());
        cfg.source.repo = Some("justaname".to_string());
        assert!(cfg.repo().is_err());
    }

    #[test]
    fn test_malformed_file_is_a_parse_error() {
        let err = Config::from_toml_str("workers = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
