//! Worker lifecycle: one isolated environment per task.
//!
//! - [`Provisioner`]: creates, inspects and destroys environments
//! - [`DockerProvisioner`]: sandboxed Docker containers
//! - [`ProcessProvisioner`]: local child processes
//! - [`WorkerManager`]: concurrency ceiling, liveness, guaranteed teardown
//!
//! # Worker protocol
//!
//! Each worker gets a private directory (mounted at `/bot/worker` in
//! containers) and the variables `TASK_ID`, `SOURCE_ID`, `WORKER_ID`,
//! `ENABLED_PLATFORMS` and `BOT_WORKER_DIR`:
//!
//! 1. `task.json` holds the task payload and the provisioned platforms
//! 2. the worker touches `heartbeat` while it makes progress
//! 3. on success it writes `result.json` and exits 0
//! 4. a non-zero exit is a reported failure

pub mod docker;
pub mod manager;
pub mod process;
pub mod provisioner;

pub use docker::DockerProvisioner;
pub use manager::{WorkerHandle, WorkerInfo, WorkerManager, WorkerOutcome, WorkerStatus};
pub use process::ProcessProvisioner;
pub use provisioner::{InstanceHandle, InstanceStatus, Provisioner, WorkerDir, WorkerSpec};
