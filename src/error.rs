use thiserror::Error;

use crate::scheduler::{TaskId, TaskState};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Task for source {0} is already queued")]
    DuplicateTask(String),

    #[error("Task {task_id} is not assigned (state: {state})")]
    NotAssigned { task_id: TaskId, state: TaskState },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Queue is full ({max} tasks)")]
    QueueFull { max: usize },

    #[error("Provision error: {0}")]
    Provision(#[from] ProvisionError),

    #[error("Worker capacity exceeded ({max} concurrent workers)")]
    CapacityExceeded { max: usize },

    #[error("Worker not found: {0}")]
    WorkerNotFound(uuid::Uuid),

    #[error("Issue source unreachable: {0}")]
    PollFailure(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DispatchError {
    /// Errors after which the orchestration loop must stop rather than retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DispatchError::Storage(StoreError::Corrupt { .. } | StoreError::Locked(_))
                | DispatchError::Config(_)
        )
    }
}

/// Failures of the execution environment provisioner.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Failed to create worker environment: {0}")]
    Create(String),

    #[error("Failed to query worker environment {instance}: {reason}")]
    Status { instance: String, reason: String },

    #[error("Failed to destroy worker environment {instance}: {reason}")]
    Destroy { instance: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable store failures. `Corrupt` is fatal to the orchestration process.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Corrupt task record {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("Queue directory {0} is locked by another process")]
    Locked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Issue source failures.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Unknown source id: {0}")]
    UnknownSource(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Default profile is unsatisfiable: {0}")]
    UnsatisfiableDefault(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
