//! Background tasks.
//!
//! Callers submit a [`TaskSpec`] and get a [`TaskId`] back immediately. An
//! identical spec submitted while the first is still queued or running
//! attaches to it instead of starting new work. Scans and hashing run on the
//! local pool, registry traffic on the network pool; each pool serves its
//! queue in FIFO order.

mod executor;
mod orchestrator;
mod table;
mod types;

pub use executor::TaskExecutor;
pub use orchestrator::{OrchestratorConfig, TaskOrchestrator, TaskSubscription};
pub use types::{
    Pool, Task, TaskEvent, TaskId, TaskKind, TaskOutput, TaskProgress, TaskSpec, TaskStatus,
};
