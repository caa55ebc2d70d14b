//! Worker threads
//!
//! Each worker owns a tiered task queue and a wake event. The loop pops its
//! own newest task first, steals the oldest task of another worker when it
//! runs dry, and parks on the wake event with a timeout when there is no work
//! anywhere.

use std::cell::Cell;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use super::core::Shared;
use super::fiber::{FiberStatus, Resume, Suspend};
use super::queue::{GroupedTask, Job, WorkerQueue};
use super::steal::{StealRng, Victims};
use crate::event::{Event, ResetMode};

/// Unique identifier for a worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct WorkerId(pub usize);

impl WorkerId {
    /// Get the numeric ID
    pub(crate) fn as_usize(&self) -> usize {
        self.0
    }
}

thread_local! {
    /// (scheduler id, worker index) of the worker this thread is acting for
    static CURRENT: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

/// Mark the calling thread as running on behalf of `worker`
pub(crate) fn enter(scheduler_id: usize, worker: usize) {
    CURRENT.with(|current| current.set(Some((scheduler_id, worker))));
}

pub(crate) fn leave() {
    CURRENT.with(|current| current.set(None));
}

/// Worker index the calling thread acts for, if it belongs to `scheduler_id`
pub(crate) fn current(scheduler_id: usize) -> Option<usize> {
    CURRENT.with(|current| match current.get() {
        Some((id, worker)) if id == scheduler_id => Some(worker),
        _ => None,
    })
}

/// Per-worker state shared with the rest of the scheduler
pub(crate) struct ThreadContext {
    pub(crate) queue: WorkerQueue,
    wake: Event,
}

impl ThreadContext {
    pub(crate) fn new(queue_capacity: usize) -> Self {
        Self {
            queue: WorkerQueue::with_capacity(queue_capacity),
            wake: Event::new(ResetMode::Automatic, false),
        }
    }

    /// Wake the worker if it is parked
    pub(crate) fn wake(&self) {
        self.wake.signal();
    }

    fn park(&self, timeout: Duration) -> bool {
        self.wake.wait(timeout)
    }
}

/// Main worker loop
pub(crate) fn worker_main(shared: Arc<Shared>, id: WorkerId) {
    let worker = id.as_usize();
    enter(shared.id, worker);
    let mut rng = StealRng::for_worker(shared.id, id);

    log::debug!("Worker {} started", worker);
    shared.notify(|listener| listener.on_worker_started(worker));

    while !shared.exit.load(Ordering::Acquire) {
        match next_job(&shared, id, &mut rng) {
            Some(job) => execute(&shared, id, job),
            None => {
                shared.stats.worker_parks.fetch_add(1, Ordering::Relaxed);
                shared.workers[worker].park(shared.config.park_timeout);
            }
        }
    }

    shared.notify(|listener| listener.on_worker_stopped(worker));
    log::debug!("Worker {} stopped", worker);
    leave();
}

fn next_job(shared: &Shared, id: WorkerId, rng: &mut StealRng) -> Option<Job> {
    if let Some(job) = shared.workers[id.as_usize()].queue.pop_local() {
        return Some(job);
    }
    if !shared.config.enable_stealing {
        return None;
    }

    for victim in Victims::new(id, shared.workers.len(), rng) {
        if let Some(job) = shared.workers[victim.as_usize()].queue.steal() {
            log::trace!(
                "Worker {} stole a task from worker {}",
                id.as_usize(),
                victim.as_usize()
            );
            shared.stats.tasks_stolen.fetch_add(1, Ordering::Relaxed);
            return Some(job);
        }
    }
    None
}

/// Run one job and every parent it cascades into on this thread
fn execute(shared: &Shared, id: WorkerId, job: Job) {
    let worker = id.as_usize();

    let (mut fiber, mut message) = match job {
        Job::Fresh(grouped) => match shared.fibers.acquire(grouped.task.stack()) {
            Some(fiber) => {
                let GroupedTask {
                    task,
                    group,
                    parent,
                } = grouped;
                let func = fiber.bind(task, group, parent);
                (fiber, Resume::Start { func, worker })
            }
            None => {
                log::warn!(
                    "Worker {} found no free {:?} fiber, deferring '{}'",
                    worker,
                    grouped.task.stack(),
                    grouped.task.label()
                );
                shared.requeue(id, grouped);

                // Only a fiber already holding a task can give one back, so
                // a resumed fiber from any tier goes ahead of the deferred task.
                let context = &shared.workers[worker];
                let Some(resumed) = context.queue.pop_resumed() else {
                    context.park(shared.config.park_timeout);
                    return;
                };
                (shared.fibers.get(resumed), Resume::Continue { worker })
            }
        },
        Job::Resume { fiber, .. } => (shared.fibers.get(fiber), Resume::Continue { worker }),
    };

    loop {
        fiber.claim(worker);
        fiber.set_status(FiberStatus::Running);
        // Guard: a child finishing concurrently must not resume this fiber
        // until the switch-back below has been interpreted.
        fiber.children.fetch_add(1, Ordering::AcqRel);

        let (label, color) = fiber.label();
        shared.notify(|listener| listener.on_task_started(worker, label, color));

        match fiber.switch_in(message) {
            Suspend::Finished => {
                fiber.set_status(FiberStatus::Finished);
                let guard = fiber.children.fetch_sub(1, Ordering::AcqRel);
                debug_assert_eq!(guard, 1, "task finished with subtasks outstanding");

                let binding = fiber.unbind();
                if let Some(destructor) = binding.destructor {
                    destructor();
                }
                shared.notify(|listener| listener.on_task_finished(worker, binding.label));
                shared.fibers.release(fiber);
                shared.task_finished(binding.group);

                let Some(parent) = binding.parent else {
                    return;
                };
                let parent = shared.fibers.get(parent);
                if parent.children.fetch_sub(1, Ordering::AcqRel) != 1 {
                    return;
                }
                // Last child out: resume the parent right here.
                shared.stats.fibers_resumed.fetch_add(1, Ordering::Relaxed);
                fiber = parent;
                message = Resume::Continue { worker };
            }
            Suspend::AwaitChildren => {
                shared.notify(|listener| listener.on_task_yielded(worker, label));
                if fiber.children.fetch_sub(1, Ordering::AcqRel) != 1 {
                    return;
                }
                // Every child already finished while the guard was held.
                message = Resume::Continue { worker };
            }
            Suspend::AwaitGroup(group) => {
                shared.notify(|listener| listener.on_task_yielded(worker, label));
                fiber.children.fetch_sub(1, Ordering::AcqRel);

                let parked = shared
                    .groups
                    .slot(group)
                    .and_then(|slot| slot.park(fiber.handle()));
                match parked {
                    Ok(true) => {
                        log::trace!("Task '{}' parked on group {}", label, group.index());
                        return;
                    }
                    Ok(false) => {}
                    Err(err) => log::error!("Could not park task '{}': {}", label, err),
                }
                message = Resume::Continue { worker };
            }
        }
    }
}
