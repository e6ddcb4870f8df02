//! Task Dispatch
//!
//! - [`record`]: shared lifecycle state of each task and the caller's handle
//! - [`queue`]: bounded priority queue feeding the workers
//! - [`worker`]: worker pool and the per-task executor

pub mod queue;
pub mod record;
pub mod worker;

pub use queue::PriorityDispatchQueue;
pub use record::{CancelDisposition, TaskHandle, TaskOutcome, TaskProgress, TaskRecord};
pub use worker::{TaskExecutor, WorkerPool};
