pub mod backoff;
pub mod config;
pub mod dashboard;
pub mod discovery;
pub mod error;
pub mod orchestrator;
pub mod platform;
pub mod scheduler;
pub mod shutdown;
pub mod status;
pub mod worker;

pub use error::{DispatchError, Result};
