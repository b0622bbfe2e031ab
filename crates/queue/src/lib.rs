//! Task scheduling for tracelens
//!
//! Two building blocks:
//! - [`run_batch`]: ordered, settlement-preserving batch execution with a
//!   parallelism cap
//! - [`TaskQueue`]: a priority-ordered, coalescing queue for named
//!   per-session tasks under a global concurrency ceiling, with bounded
//!   execution history and an optional background drain loop
//!
//! The queue is cache-agnostic: task bodies receive the force-refresh flag
//! and decide for themselves whether to consult the result cache.

mod batch;
mod error;
mod queue;

pub use batch::run_batch;
pub use error::TaskError;
pub use queue::{
    BackgroundTask, CompletedEntry, PendingSnapshot, Priority, ProcessingSnapshot, QueueConfig,
    QueueKey, QueueStatus, SubmitOpts, SubmitWait, TaskFuture, TaskOutcome, TaskQueue, TaskThunk,
    task_thunk,
};
