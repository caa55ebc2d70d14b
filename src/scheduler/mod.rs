//! Fiber task scheduler engine
//!
//! A fixed pool of worker threads runs tasks on pooled fibers. A task may
//! suspend itself to wait for subtasks or for a task group, and is later
//! resumed on whichever worker satisfies the wait, without blocking a worker
//! thread in the meantime.

mod core;
mod fiber;
mod group;
mod queue;
mod steal;
mod worker;

pub use self::core::{SchedulerConfig, SchedulerStats, TaskScheduler};
pub use fiber::TaskContext;
pub use group::TaskGroup;
pub use queue::BoundedQueue;
