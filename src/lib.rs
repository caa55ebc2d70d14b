//! # fiber-tasks
//!
//! Cooperative fiber-based task scheduler for frame-loop style workloads:
//! many small, dependent jobs with low submission and wakeup overhead.
//!
//! ## Features
//!
//! - **Task groups**: batch-completion trackers with a blocking wait for
//!   callers outside the worker pool
//! - **Subtask fan-in**: a task spawns subtasks and suspends until all of them
//!   finished, then resumes on whichever worker finished the last one
//! - **Group waits from tasks**: a task suspends until another group completes
//!   without blocking its worker thread
//! - **Priority tiers and stack classes**: high/normal/low draining order and
//!   standard/extended fiber pools
//! - **Work stealing**: idle workers take the oldest task of a busy worker
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fiber_tasks::prelude::*;
//! use std::time::Duration;
//!
//! let scheduler = TaskScheduler::new(SchedulerConfig::default()).unwrap();
//! let group = scheduler.create_group().unwrap();
//!
//! scheduler
//!     .submit(group, (0..4).map(|i| {
//!         TaskDesc::new(move |ctx| {
//!             let group = ctx.group();
//!             let subtasks = (0..8).map(|_| TaskDesc::new(|_| {}));
//!             ctx.run_subtasks_and_yield(group, subtasks).unwrap();
//!             println!("task {} done on worker {}", i, ctx.worker_index());
//!         })
//!     }))
//!     .unwrap();
//!
//! assert!(scheduler.wait_group(group, Duration::from_secs(1)));
//! scheduler.release_group(group).unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod error;
pub mod event;
pub mod listener;
pub mod pool;
pub mod scheduler;
pub mod task;

pub use error::{Error, Result};
pub use listener::SchedulerListener;
pub use pool::{PoolHandle, PooledTask, TaskPool};
pub use scheduler::{
    BoundedQueue, SchedulerConfig, SchedulerStats, TaskContext, TaskGroup, TaskScheduler,
};
pub use task::{Priority, StackClass, TaskDesc};

/// Convenient re-exports for common functionality
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::pool::{PoolHandle, PooledTask, TaskPool};
    pub use crate::scheduler::{SchedulerConfig, TaskContext, TaskGroup, TaskScheduler};
    pub use crate::task::{Priority, StackClass, TaskDesc};
}
