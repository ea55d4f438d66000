pub mod queue;
pub mod store;
pub mod task;

pub use queue::{FailDisposition, QueueCounts, RetryPolicy, WorkQueue};
pub use store::{FileStore, MemoryStore, TaskStore};
pub use task::{Priority, Task, TaskId, TaskState};
