//! Diagnostics listener
//!
//! Optional observer for task start/stop/yield notifications, for trace
//! recorders or profilers living outside the scheduler. Every method has an
//! empty default and is called on the worker thread that triggered it, so
//! implementations must be cheap.

/// Receives scheduler events
pub trait SchedulerListener: Send + Sync {
    /// A worker thread entered its loop
    fn on_worker_started(&self, _worker: usize) {}

    /// A worker thread left its loop
    fn on_worker_stopped(&self, _worker: usize) {}

    /// A task body is about to start or continue on `worker`
    fn on_task_started(&self, _worker: usize, _label: &'static str, _color: u32) {}

    /// A task body returned
    fn on_task_finished(&self, _worker: usize, _label: &'static str) {}

    /// A task body suspended itself
    fn on_task_yielded(&self, _worker: usize, _label: &'static str) {}
}
