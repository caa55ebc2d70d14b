//! Scheduler coordination
//!
//! Owns the worker threads, the fiber pool and the group table, and
//! distributes submitted tasks across the worker queues.

use crossbeam::utils::CachePadded;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::fiber::{FiberHandle, FiberPool};
use super::group::{GroupTable, TaskCounter, TaskGroup};
use super::queue::{GroupedTask, Job};
use super::worker::{self, ThreadContext, WorkerId};
use crate::error::{Error, Result};
use crate::listener::SchedulerListener;
use crate::task::TaskDesc;

static SCHEDULER_ID_COUNTER: AtomicUsize = AtomicUsize::new(1);

/// Scheduler configuration
#[derive(Clone)]
pub struct SchedulerConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub num_workers: usize,
    /// Thread name prefix
    pub thread_name_prefix: String,
    /// Capacity of each worker queue lane, per priority tier
    pub queue_capacity: usize,
    /// Fibers available to standard-stack tasks
    pub standard_fibers: usize,
    /// Fibers available to extended-stack tasks
    pub extended_fibers: usize,
    /// Stack size of a standard fiber in bytes
    pub standard_stack_size: usize,
    /// Stack size of an extended fiber in bytes
    pub extended_stack_size: usize,
    /// Size of the group table, including the default group
    pub max_groups: usize,
    /// How long an idle worker sleeps before re-checking for work and exit
    pub park_timeout: Duration,
    /// Let idle workers take tasks from other workers' queues
    pub enable_stealing: bool,
    /// Receives task start/stop/yield notifications
    pub listener: Option<Arc<dyn SchedulerListener>>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            thread_name_prefix: "fiber-worker".to_string(),
            queue_capacity: 4096,
            standard_fibers: 128,
            extended_fibers: 16,
            standard_stack_size: 256 * 1024,
            extended_stack_size: 2 * 1024 * 1024,
            max_groups: 256,
            park_timeout: Duration::from_millis(1),
            enable_stealing: true,
            listener: None,
        }
    }
}

impl fmt::Debug for SchedulerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerConfig")
            .field("num_workers", &self.num_workers)
            .field("thread_name_prefix", &self.thread_name_prefix)
            .field("queue_capacity", &self.queue_capacity)
            .field("standard_fibers", &self.standard_fibers)
            .field("extended_fibers", &self.extended_fibers)
            .field("standard_stack_size", &self.standard_stack_size)
            .field("extended_stack_size", &self.extended_stack_size)
            .field("max_groups", &self.max_groups)
            .field("park_timeout", &self.park_timeout)
            .field("enable_stealing", &self.enable_stealing)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

/// Scheduler statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tasks accepted by `submit`, `run_async` or `run_subtasks_and_yield`
    pub tasks_submitted: usize,
    /// Tasks accounted as finished: bodies that returned or panicked, and
    /// tasks dropped because every worker queue was full
    pub tasks_completed: usize,
    /// Tasks dropped without running because every worker queue was full.
    /// Also counted in `tasks_completed`.
    pub tasks_dropped: usize,
    /// Tasks taken from another worker's queue
    pub tasks_stolen: usize,
    /// Parked fibers handed back to a worker
    pub fibers_resumed: usize,
    /// Times a worker found no work and slept on its wake event
    pub worker_parks: usize,
}

/// Internal scheduler statistics using atomics
#[derive(Default)]
pub(crate) struct SchedulerStatsInternal {
    pub(crate) tasks_submitted: AtomicUsize,
    pub(crate) tasks_completed: AtomicUsize,
    pub(crate) tasks_dropped: AtomicUsize,
    pub(crate) tasks_stolen: AtomicUsize,
    pub(crate) fibers_resumed: AtomicUsize,
    pub(crate) worker_parks: AtomicUsize,
}

impl SchedulerStatsInternal {
    fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_dropped: self.tasks_dropped.load(Ordering::Relaxed),
            tasks_stolen: self.tasks_stolen.load(Ordering::Relaxed),
            fibers_resumed: self.fibers_resumed.load(Ordering::Relaxed),
            worker_parks: self.worker_parks.load(Ordering::Relaxed),
        }
    }
}

/// State shared by the scheduler handle, the workers and the fibers
pub(crate) struct Shared {
    pub(crate) id: usize,
    pub(crate) config: SchedulerConfig,
    pub(crate) workers: Vec<CachePadded<ThreadContext>>,
    pub(crate) fibers: FiberPool,
    pub(crate) groups: GroupTable,
    all_tasks: TaskCounter,
    round_robin: CachePadded<AtomicUsize>,
    pub(crate) exit: AtomicBool,
    pub(crate) stats: SchedulerStatsInternal,
}

impl Shared {
    pub(crate) fn notify(&self, event: impl FnOnce(&dyn SchedulerListener)) {
        if let Some(listener) = self.config.listener.as_deref() {
            event(listener);
        }
    }

    /// Count `tasks` into `group` and hand them to the workers
    pub(crate) fn submit_tasks(
        &self,
        group: TaskGroup,
        tasks: Vec<TaskDesc>,
        parent: Option<FiberHandle>,
    ) -> Result<()> {
        let slot = match self.groups.slot(group) {
            Ok(slot) => slot,
            Err(err) => {
                log::error!("Rejected submission of {} tasks: {}", tasks.len(), err);
                // Subtasks were already counted on the parent.
                if let Some(parent) = parent {
                    self.fibers
                        .get(parent)
                        .children
                        .fetch_sub(tasks.len(), Ordering::AcqRel);
                }
                return Err(err);
            }
        };
        if tasks.is_empty() {
            return Ok(());
        }

        let count = tasks.len();
        slot.counter().add(count);
        self.all_tasks.add(count);
        self.stats
            .tasks_submitted
            .fetch_add(count, Ordering::Relaxed);

        let jobs = tasks
            .into_iter()
            .map(|task| {
                Job::Fresh(GroupedTask {
                    task,
                    group,
                    parent,
                })
            })
            .collect();
        self.distribute(jobs)
    }

    /// Hand parked fibers back to the workers. Their tasks were never
    /// uncounted, so no counter is touched.
    fn resume_parked(&self, fibers: Vec<FiberHandle>) {
        if fibers.is_empty() {
            return;
        }
        self.stats
            .fibers_resumed
            .fetch_add(fibers.len(), Ordering::Relaxed);

        let jobs = fibers
            .into_iter()
            .map(|fiber| Job::Resume {
                fiber,
                priority: self.fibers.get(fiber).priority(),
            })
            .collect();
        if let Err(err) = self.distribute(jobs) {
            log::error!("Failed to resume parked fibers: {}", err);
        }
    }

    /// Split `jobs` into `min(workers, jobs)` interleaved buckets and push
    /// each bucket onto the next worker in round-robin order.
    fn distribute(&self, jobs: Vec<Job>) -> Result<()> {
        let num_workers = self.workers.len();
        let bucket_count = num_workers.min(jobs.len());
        if bucket_count == 0 {
            return Ok(());
        }

        let per_bucket = jobs.len().div_ceil(bucket_count);
        let mut buckets: Vec<Vec<Job>> = (0..bucket_count)
            .map(|_| Vec::with_capacity(per_bucket))
            .collect();
        for (index, job) in jobs.into_iter().enumerate() {
            buckets[index % bucket_count].push(job);
        }

        let mut overflow = Vec::new();
        for bucket in buckets {
            let target = self.round_robin.fetch_add(1, Ordering::Relaxed) % num_workers;
            let worker = &self.workers[target];
            if let Err(rejected) = worker.queue.push_batch(bucket) {
                overflow.extend(rejected);
            }
            worker.wake();
        }

        if overflow.is_empty() {
            Ok(())
        } else {
            self.place_overflow(overflow)
        }
    }

    /// Put a fresh task that found no free fiber back on the oldest end of
    /// its worker's queue
    pub(crate) fn requeue(&self, id: WorkerId, grouped: GroupedTask) {
        let worker = &self.workers[id.as_usize()];
        if let Err(job) = worker.queue.push_deferred(grouped) {
            if let Err(err) = self.place_overflow(vec![job]) {
                log::warn!(
                    "Deferred task could not be requeued on worker {}: {}",
                    id.as_usize(),
                    err
                );
            }
        }
    }

    /// Last resort for jobs that did not fit their target queue: any worker
    /// with room takes them, otherwise fresh tasks are dropped and accounted
    /// as finished.
    fn place_overflow(&self, jobs: Vec<Job>) -> Result<()> {
        log::error!("Worker queue overflow, placing {} jobs elsewhere", jobs.len());
        let mut dropped = 0;

        for job in jobs {
            let mut job = Some(job);
            for worker in &self.workers {
                let Some(pending) = job.take() else { break };
                match worker.queue.push_batch(vec![pending]) {
                    Ok(()) => worker.wake(),
                    Err(mut rejected) => job = rejected.pop(),
                }
            }

            match job {
                None => {}
                Some(Job::Fresh(grouped)) => {
                    dropped += 1;
                    self.abandon(grouped);
                }
                Some(Job::Resume { fiber, .. }) => {
                    dropped += 1;
                    log::error!("Parked fiber {:?} could not be requeued", fiber);
                }
            }
        }

        if dropped == 0 {
            Ok(())
        } else {
            log::error!("Dropped {} jobs: every worker queue is full", dropped);
            Err(Error::exhausted("worker task queue"))
        }
    }

    /// Account a task that will never run as finished
    fn abandon(&self, grouped: GroupedTask) {
        let GroupedTask {
            task,
            group,
            parent,
        } = grouped;
        if let Some(destructor) = task.destructor {
            destructor();
        }
        self.stats.tasks_dropped.fetch_add(1, Ordering::Relaxed);
        self.task_finished(group);

        if let Some(parent) = parent {
            let parent = self.fibers.get(parent);
            if parent.children.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.resume_parked(vec![parent.handle()]);
            }
        }
    }

    /// Bookkeeping after a task body returned
    pub(crate) fn task_finished(&self, group: TaskGroup) {
        self.stats.tasks_completed.fetch_add(1, Ordering::Relaxed);

        match self.groups.slot(group) {
            Ok(slot) => {
                if slot.counter().sub(1) {
                    self.resume_parked(slot.drain_waiters());
                }
            }
            Err(err) => log::error!("Finished task belongs to an invalid group: {}", err),
        }
        self.all_tasks.sub(1);
    }
}

/// The fiber task scheduler.
///
/// Dropping the scheduler stops the workers and the fibers. Tasks still
/// queued at that point never run, and suspended task bodies are unwound.
pub struct TaskScheduler {
    shared: Arc<Shared>,
    worker_threads: Vec<JoinHandle<()>>,
    fiber_threads: Vec<JoinHandle<()>>,
}

impl TaskScheduler {
    /// Create a new scheduler with the given configuration
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        let num_workers = if config.num_workers == 0 {
            num_cpus::get()
        } else {
            config.num_workers
        };

        let (fibers, pending_fibers) = FiberPool::new(&config);
        let fiber_count = pending_fibers.len();
        let workers = (0..num_workers)
            .map(|_| CachePadded::new(ThreadContext::new(config.queue_capacity)))
            .collect();

        let shared = Arc::new(Shared {
            id: SCHEDULER_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            groups: GroupTable::new(config.max_groups, fiber_count),
            config,
            workers,
            fibers,
            all_tasks: TaskCounter::new(),
            round_robin: CachePadded::new(AtomicUsize::new(0)),
            exit: AtomicBool::new(false),
            stats: SchedulerStatsInternal::default(),
        });

        // Dropping a partially started scheduler joins whatever was spawned.
        let mut scheduler = TaskScheduler {
            shared: Arc::clone(&shared),
            worker_threads: Vec::with_capacity(num_workers),
            fiber_threads: Vec::with_capacity(fiber_count),
        };

        let prefix = shared.config.thread_name_prefix.clone();
        for pending in pending_fibers {
            let handle = pending.spawn(Arc::clone(&shared), &prefix)?;
            scheduler.fiber_threads.push(handle);
        }

        for index in 0..num_workers {
            let worker_shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", prefix, index))
                .spawn(move || worker::worker_main(worker_shared, WorkerId(index)))
                .map_err(|e| Error::RuntimeError {
                    reason: format!("Failed to spawn worker thread: {}", e),
                })?;
            scheduler.worker_threads.push(handle);
        }

        log::info!(
            "Task scheduler created with {} workers and {} fibers",
            num_workers,
            fiber_count
        );
        Ok(scheduler)
    }

    /// Submit tasks to `group`.
    ///
    /// Only callable from outside the worker pool; task bodies use
    /// [`TaskContext::run_async`](crate::TaskContext::run_async) instead.
    pub fn submit<I>(&self, group: TaskGroup, tasks: I) -> Result<()>
    where
        I: IntoIterator<Item = TaskDesc>,
    {
        if self.is_worker_thread() {
            log::error!("submit called from a worker thread");
            return Err(Error::invalid("submit called from a worker thread"));
        }
        self.shared
            .submit_tasks(group, tasks.into_iter().collect(), None)
    }

    /// Allocate a task group
    pub fn create_group(&self) -> Result<TaskGroup> {
        self.shared.groups.create().map_err(|err| {
            log::error!("create_group failed: {}", err);
            err
        })
    }

    /// Return a quiescent group to the pool. The handle is invalid afterwards.
    pub fn release_group(&self, group: TaskGroup) -> Result<()> {
        self.shared.groups.release(group).map_err(|err| {
            log::error!("release_group failed: {}", err);
            err
        })
    }

    /// Block until `group` has no tasks in progress or `timeout` expires.
    ///
    /// Returns `true` if the group completed. Calling this from a worker
    /// would stall the worker and is rejected with `false`; task bodies use
    /// [`TaskContext::await_group_and_yield`](crate::TaskContext::await_group_and_yield).
    pub fn wait_group(&self, group: TaskGroup, timeout: Duration) -> bool {
        if self.is_worker_thread() {
            log::error!("wait_group called from a worker thread");
            return false;
        }
        match self.shared.groups.slot(group) {
            Ok(slot) => slot.counter().wait(timeout),
            Err(err) => {
                log::error!("wait_group failed: {}", err);
                false
            }
        }
    }

    /// Block until every submitted task finished or `timeout` expires
    pub fn wait_all(&self, timeout: Duration) -> bool {
        if self.is_worker_thread() {
            log::error!("wait_all called from a worker thread");
            return false;
        }
        self.shared.all_tasks.wait(timeout)
    }

    /// `true` if no worker has queued work (point-in-time)
    pub fn is_empty(&self) -> bool {
        self.shared
            .workers
            .iter()
            .all(|worker| worker.queue.is_empty())
    }

    /// Number of worker threads
    pub fn worker_count(&self) -> usize {
        self.shared.workers.len()
    }

    /// `true` if the calling thread is one of this scheduler's workers, or a
    /// fiber currently running on behalf of one
    pub fn is_worker_thread(&self) -> bool {
        worker::current(self.shared.id).is_some()
    }

    /// Tasks of `group` that have not finished yet
    pub fn group_in_progress(&self, group: TaskGroup) -> Result<usize> {
        Ok(self.shared.groups.slot(group)?.counter().count())
    }

    /// Number of slots in the group table, including the default group
    pub fn group_capacity(&self) -> usize {
        self.shared.groups.capacity()
    }

    /// Get scheduler statistics
    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats.snapshot()
    }

    fn shutdown(&mut self) {
        self.shared.exit.store(true, Ordering::Release);
        for worker in &self.shared.workers {
            worker.wake();
        }
        for handle in self.worker_threads.drain(..) {
            if handle.join().is_err() {
                log::error!("Worker thread panicked");
            }
        }

        let parked = self
            .shared
            .fibers
            .iter()
            .filter(|fiber| fiber.owner().is_none() && fiber.children.load(Ordering::Acquire) > 0)
            .count();
        if parked > 0 {
            log::debug!("{} fibers still waiting on subtasks at shutdown", parked);
        }

        self.shared.fibers.request_exit();
        for handle in self.fiber_threads.drain(..) {
            if handle.join().is_err() {
                log::error!("Fiber thread panicked");
            }
        }
        log::info!("Task scheduler shut down");
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("workers", &self.shared.workers.len())
            .field("stats", &self.stats())
            .finish()
    }
}
