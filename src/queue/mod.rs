//! Durable task queue with retries, leases, and a dead-letter signal

mod engine;
mod store;
mod task;

pub use engine::{Delivery, EngineConfig, QueueEngine, TerminalFailure};
pub use store::{FjallQueue, QueueCounts, QueueError, TaskHeader, TaskRow, TaskState};
pub use task::{ReplayMarker, RestoreTask};
