//! Common test harness for fiber-tasks integration tests
//!
//! Builds schedulers with small pools so many tests can run side by side,
//! plus a few helpers for recording what tasks observed.

#![allow(dead_code)]

use fiber_tasks::prelude::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound for waits that are expected to succeed
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Scheduler configuration sized for tests
pub fn config(num_workers: usize) -> SchedulerConfig {
    SchedulerConfig {
        num_workers,
        thread_name_prefix: "test-worker".to_string(),
        queue_capacity: 1024,
        standard_fibers: 64,
        extended_fibers: 4,
        max_groups: 16,
        ..Default::default()
    }
}

/// Scheduler with `num_workers` workers and test-sized pools
pub fn scheduler(num_workers: usize) -> TaskScheduler {
    TaskScheduler::new(config(num_workers)).expect("scheduler creation")
}

/// Poll `condition` until it holds or `timeout` expires
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Thread-safe append-only log shared between tasks and the test body
pub type Log<T> = Arc<Mutex<Vec<T>>>;

pub fn log<T>() -> Log<T> {
    Arc::new(Mutex::new(Vec::new()))
}
