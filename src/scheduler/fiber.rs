//! Fibers and the execution context handed to task bodies
//!
//! Every pooled fiber is a dedicated OS thread that only runs while a worker
//! has switched into it. Switching is a message handoff: the worker sends a
//! [`Resume`] and blocks until the fiber answers with a [`Suspend`], the fiber
//! sends a [`Suspend`] and blocks until the next [`Resume`]. Exactly one side
//! runs at a time, so a task body executes cooperatively exactly as if it had
//! been switched to on the worker's own stack.

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::core::{SchedulerConfig, Shared};
use super::group::TaskGroup;
use super::worker;
use crate::error::{Error, Result};
use crate::task::{Priority, StackClass, TaskDesc, TaskDestructor, TaskFn};

/// Value of [`FiberContext::owner`] while no worker runs the fiber
const NO_OWNER: usize = usize::MAX;

/// Handle to a pooled fiber, stable across the fiber's parked periods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FiberHandle {
    index: u32,
    generation: u32,
}

impl FiberHandle {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

/// Lifecycle state of a fiber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum FiberStatus {
    /// Free pool slot
    Unknown = 0,
    /// Executing a task body
    Running = 1,
    /// Task body returned
    Finished = 2,
    /// Parked until a task group completes
    AwaitingGroup = 3,
    /// Parked until its subtasks finish
    AwaitingChildren = 4,
}

impl FiberStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => FiberStatus::Running,
            2 => FiberStatus::Finished,
            3 => FiberStatus::AwaitingGroup,
            4 => FiberStatus::AwaitingChildren,
            _ => FiberStatus::Unknown,
        }
    }
}

/// Message from a worker to a fiber
pub(crate) enum Resume {
    /// Run a fresh task body
    Start { func: TaskFn, worker: usize },
    /// Continue a suspended task body
    Continue { worker: usize },
    /// Leave the fiber loop, unwinding a suspended task body if there is one
    Exit,
}

/// Message from a fiber back to the worker that switched into it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Suspend {
    Finished,
    AwaitGroup(TaskGroup),
    AwaitChildren,
}

/// Unwind payload used to tear down a suspended task body on shutdown
struct FiberExit;

/// What a fiber is currently bound to. Only touched by the owning worker or
/// by the fiber itself while it runs.
pub(crate) struct Binding {
    pub(crate) group: TaskGroup,
    pub(crate) parent: Option<FiberHandle>,
    pub(crate) priority: Priority,
    pub(crate) label: &'static str,
    pub(crate) color: u32,
    pub(crate) destructor: Option<TaskDestructor>,
}

impl Binding {
    fn unbound() -> Self {
        Self {
            group: TaskGroup::DEFAULT,
            parent: None,
            priority: Priority::Normal,
            label: "",
            color: 0,
            destructor: None,
        }
    }
}

/// One continuation slot bound to the task currently running on it
pub(crate) struct FiberContext {
    index: u32,
    class: StackClass,
    generation: AtomicU32,
    status: AtomicU8,
    owner: AtomicUsize,
    /// Outstanding subtasks, plus one while a worker interprets a switch-back
    pub(crate) children: AtomicUsize,
    binding: Mutex<Binding>,
    resume_tx: Sender<Resume>,
    suspend_rx: Receiver<Suspend>,
}

impl FiberContext {
    pub(crate) fn handle(&self) -> FiberHandle {
        FiberHandle::new(self.index, self.generation.load(Ordering::Acquire))
    }

    pub(crate) fn class(&self) -> StackClass {
        self.class
    }

    pub(crate) fn status(&self) -> FiberStatus {
        FiberStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: FiberStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Worker currently running this fiber, if any
    pub(crate) fn owner(&self) -> Option<usize> {
        match self.owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            worker => Some(worker),
        }
    }

    pub(crate) fn claim(&self, worker: usize) {
        self.owner.store(worker, Ordering::Release);
    }

    fn disown(&self) {
        self.owner.store(NO_OWNER, Ordering::Release);
    }

    /// Bind a fresh task, returning its body
    pub(crate) fn bind(
        &self,
        task: TaskDesc,
        group: TaskGroup,
        parent: Option<FiberHandle>,
    ) -> TaskFn {
        let priority = task.priority();
        let label = task.label();
        let color = task.color();
        let TaskDesc {
            func, destructor, ..
        } = task;

        *self.binding.lock() = Binding {
            group,
            parent,
            priority,
            label,
            color,
            destructor,
        };
        func
    }

    /// Take the binding of a finished task
    pub(crate) fn unbind(&self) -> Binding {
        std::mem::replace(&mut *self.binding.lock(), Binding::unbound())
    }

    pub(crate) fn group(&self) -> TaskGroup {
        self.binding.lock().group
    }

    pub(crate) fn priority(&self) -> Priority {
        self.binding.lock().priority
    }

    pub(crate) fn label(&self) -> (&'static str, u32) {
        let binding = self.binding.lock();
        (binding.label, binding.color)
    }

    /// Switch into the fiber and block until it switches back
    pub(crate) fn switch_in(&self, message: Resume) -> Suspend {
        if self.resume_tx.send(message).is_err() {
            log::error!("fiber {} is gone, treating its task as finished", self.index);
            return Suspend::Finished;
        }
        match self.suspend_rx.recv() {
            Ok(suspend) => suspend,
            Err(_) => {
                log::error!(
                    "fiber {} exited mid-switch, treating its task as finished",
                    self.index
                );
                Suspend::Finished
            }
        }
    }
}

impl fmt::Debug for FiberContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberContext")
            .field("index", &self.index)
            .field("class", &self.class)
            .field("status", &self.status())
            .field("owner", &self.owner())
            .field("children", &self.children.load(Ordering::Relaxed))
            .finish()
    }
}

/// The fiber-side ends of a fiber's channels, waiting to be spawned
pub(crate) struct FiberThread {
    index: u32,
    stack_size: usize,
    resume_rx: Receiver<Resume>,
    suspend_tx: Sender<Suspend>,
}

impl FiberThread {
    pub(crate) fn spawn(self, shared: Arc<Shared>, name_prefix: &str) -> Result<JoinHandle<()>> {
        let index = self.index;
        thread::Builder::new()
            .name(format!("{}-fiber-{}", name_prefix, index))
            .stack_size(self.stack_size)
            .spawn(move || fiber_main(shared, self))
            .map_err(|e| Error::RuntimeError {
                reason: format!("Failed to spawn fiber thread: {}", e),
            })
    }
}

/// Fixed pool of fibers with one lock-free free-list per stack class
pub(crate) struct FiberPool {
    fibers: Vec<FiberContext>,
    free: [ArrayQueue<u32>; 2],
}

impl FiberPool {
    pub(crate) fn new(config: &SchedulerConfig) -> (Self, Vec<FiberThread>) {
        let standard = config.standard_fibers.max(1);
        let extended = config.extended_fibers.max(1);
        let free = [ArrayQueue::new(standard), ArrayQueue::new(extended)];

        let mut fibers = Vec::with_capacity(standard + extended);
        let mut threads = Vec::with_capacity(standard + extended);

        let classes = std::iter::repeat(StackClass::Standard)
            .take(standard)
            .chain(std::iter::repeat(StackClass::Extended).take(extended));

        for (index, class) in classes.enumerate() {
            let index = index as u32;
            let (resume_tx, resume_rx) = channel::bounded(1);
            let (suspend_tx, suspend_rx) = channel::bounded(1);
            let stack_size = match class {
                StackClass::Standard => config.standard_stack_size,
                StackClass::Extended => config.extended_stack_size,
            };

            fibers.push(FiberContext {
                index,
                class,
                generation: AtomicU32::new(0),
                status: AtomicU8::new(FiberStatus::Unknown as u8),
                owner: AtomicUsize::new(NO_OWNER),
                children: AtomicUsize::new(0),
                binding: Mutex::new(Binding::unbound()),
                resume_tx,
                suspend_rx,
            });
            threads.push(FiberThread {
                index,
                stack_size,
                resume_rx,
                suspend_tx,
            });
            let _ = free[class.index()].push(index);
        }

        log::debug!(
            "Created fiber pool with {} standard and {} extended fibers",
            standard,
            extended
        );
        (Self { fibers, free }, threads)
    }

    /// Take a free fiber of the given class
    pub(crate) fn acquire(&self, class: StackClass) -> Option<&FiberContext> {
        let index = self.free[class.index()].pop()?;
        let fiber = &self.fibers[index as usize];
        debug_assert_eq!(fiber.children.load(Ordering::Acquire), 0);
        Some(fiber)
    }

    /// Return a finished fiber to its pool. Invalidates outstanding handles.
    pub(crate) fn release(&self, fiber: &FiberContext) {
        debug_assert_eq!(
            fiber.children.load(Ordering::Acquire),
            0,
            "released a fiber with outstanding children"
        );
        fiber.generation.fetch_add(1, Ordering::AcqRel);
        fiber.set_status(FiberStatus::Unknown);
        fiber.disown();
        if self.free[fiber.class().index()].push(fiber.index).is_err() {
            log::error!("fiber {} released twice", fiber.index);
        }
    }

    pub(crate) fn get(&self, handle: FiberHandle) -> &FiberContext {
        let fiber = &self.fibers[handle.index as usize];
        debug_assert_eq!(
            fiber.generation.load(Ordering::Acquire),
            handle.generation,
            "stale fiber handle"
        );
        fiber
    }

    fn by_index(&self, index: u32) -> &FiberContext {
        &self.fibers[index as usize]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &FiberContext> {
        self.fibers.iter()
    }

    /// Ask every fiber thread to leave its loop
    pub(crate) fn request_exit(&self) {
        for fiber in &self.fibers {
            let _ = fiber.resume_tx.try_send(Resume::Exit);
        }
    }

    #[cfg(test)]
    pub(crate) fn free_count(&self, class: StackClass) -> usize {
        self.free[class.index()].len()
    }
}

fn fiber_main(shared: Arc<Shared>, thread: FiberThread) {
    let FiberThread {
        index,
        resume_rx,
        suspend_tx,
        ..
    } = thread;

    loop {
        let (func, worker) = match resume_rx.recv() {
            Ok(Resume::Start { func, worker }) => (func, worker),
            Ok(Resume::Continue { .. }) => {
                log::error!("fiber {} resumed without a suspended task", index);
                if suspend_tx.send(Suspend::Finished).is_err() {
                    break;
                }
                continue;
            }
            Ok(Resume::Exit) | Err(_) => break,
        };

        let fiber = shared.fibers.by_index(index);
        worker::enter(shared.id, worker);

        let mut context = TaskContext {
            shared: &shared,
            fiber,
            resume_rx: &resume_rx,
            suspend_tx: &suspend_tx,
            worker,
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| func(&mut context)));
        worker::leave();

        if let Err(payload) = outcome {
            if payload.is::<FiberExit>() {
                break;
            }
            let (label, _) = fiber.label();
            log::error!("task '{}' panicked: {}", label, panic_message(&*payload));
        }

        fiber.disown();
        if suspend_tx.send(Suspend::Finished).is_err() {
            break;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Execution context passed to every task body.
///
/// Gives access to the scheduler from inside a task and provides the only two
/// operations that may suspend a task: [`TaskContext::run_subtasks_and_yield`]
/// and [`TaskContext::await_group_and_yield`]. Blocking the thread any other
/// way stalls the worker that is running the task.
pub struct TaskContext<'a> {
    shared: &'a Arc<Shared>,
    fiber: &'a FiberContext,
    resume_rx: &'a Receiver<Resume>,
    suspend_tx: &'a Sender<Suspend>,
    worker: usize,
}

impl<'a> TaskContext<'a> {
    /// Index of the worker currently running this task.
    ///
    /// May change across a yield, since a resumed task can continue on any worker.
    pub fn worker_index(&self) -> usize {
        self.worker
    }

    /// Group this task was submitted to
    pub fn group(&self) -> TaskGroup {
        self.fiber.group()
    }

    /// Number of worker threads in the scheduler
    pub fn worker_count(&self) -> usize {
        self.shared.workers.len()
    }

    /// Always `true` for a well-formed context; checks the calling thread
    pub fn is_worker_thread(&self) -> bool {
        worker::current(self.shared.id).is_some()
    }

    /// Tasks still in progress in `group`
    pub fn group_in_progress(&self, group: TaskGroup) -> Result<usize> {
        Ok(self.shared.groups.slot(group)?.counter().count())
    }

    /// Submit tasks to `group` without waiting for them
    pub fn run_async<I>(&self, group: TaskGroup, tasks: I) -> Result<()>
    where
        I: IntoIterator<Item = TaskDesc>,
    {
        self.shared.submit_tasks(group, tasks.into_iter().collect(), None)
    }

    /// Submit tasks to `group` and suspend until every one of them finished.
    ///
    /// The subtasks record this fiber as their parent; whichever worker
    /// finishes the last subtask resumes this task.
    pub fn run_subtasks_and_yield<I>(&mut self, group: TaskGroup, tasks: I) -> Result<()>
    where
        I: IntoIterator<Item = TaskDesc>,
    {
        let tasks: Vec<TaskDesc> = tasks.into_iter().collect();
        if tasks.is_empty() {
            return Ok(());
        }
        self.shared.groups.slot(group)?;

        // Children must be counted before any of them becomes visible to
        // another worker.
        self.fiber.children.fetch_add(tasks.len(), Ordering::AcqRel);
        let submitted = self
            .shared
            .submit_tasks(group, tasks, Some(self.fiber.handle()));

        self.fiber.set_status(FiberStatus::AwaitingChildren);
        self.yield_to_worker(Suspend::AwaitChildren);
        submitted
    }

    /// Suspend until `group` has no tasks in progress.
    ///
    /// Waiting on the task's own group can never complete and is rejected.
    pub fn await_group_and_yield(&mut self, group: TaskGroup) -> Result<()> {
        if group == self.group() {
            log::error!("task '{}' tried to wait on its own group", self.fiber.label().0);
            return Err(Error::invalid("a task cannot wait on its own group"));
        }
        let slot = self.shared.groups.slot(group)?;
        if slot.counter().count() == 0 {
            return Ok(());
        }

        self.fiber.set_status(FiberStatus::AwaitingGroup);
        self.yield_to_worker(Suspend::AwaitGroup(group));
        Ok(())
    }

    fn yield_to_worker(&mut self, suspend: Suspend) {
        self.fiber.disown();
        worker::leave();

        if self.suspend_tx.send(suspend).is_err() {
            panic::resume_unwind(Box::new(FiberExit));
        }
        match self.resume_rx.recv() {
            Ok(Resume::Continue { worker }) => {
                self.worker = worker;
                worker::enter(self.shared.id, worker);
            }
            Ok(Resume::Start { .. }) => {
                log::error!("fiber {} got a new task while suspended", self.fiber.index);
                panic::resume_unwind(Box::new(FiberExit));
            }
            Ok(Resume::Exit) | Err(_) => panic::resume_unwind(Box::new(FiberExit)),
        }
    }
}

impl fmt::Debug for TaskContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("worker", &self.worker)
            .field("fiber", self.fiber)
            .finish()
    }
}
