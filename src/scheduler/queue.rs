//! Bounded task queues
//!
//! [`BoundedQueue`] is a fixed-capacity ring buffer behind a single mutex. It
//! backs both the per-worker task queues and the parked-waiter lists of task
//! groups. Capacity never grows: a push that does not fit hands the items back
//! to the caller.

use parking_lot::Mutex;
use std::fmt::{self, Debug};

use super::fiber::FiberHandle;
use super::group::TaskGroup;
use crate::task::{Priority, TaskDesc};

struct Ring<T> {
    slots: Vec<Option<T>>,
    head: usize,
    len: usize,
    mask: usize,
}

impl<T> Ring<T> {
    fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            head: 0,
            len: 0,
            mask: capacity - 1,
        }
    }

    fn capacity(&self) -> usize {
        self.mask + 1
    }

    fn push_back(&mut self, value: T) {
        let tail = (self.head + self.len) & self.mask;
        self.slots[tail] = Some(value);
        self.len += 1;
    }

    fn push_front(&mut self, value: T) {
        self.head = (self.head + self.mask) & self.mask;
        self.slots[self.head] = Some(value);
        self.len += 1;
    }

    fn pop_front(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let value = self.slots[self.head].take();
        self.head = (self.head + 1) & self.mask;
        self.len -= 1;
        value
    }

    fn pop_back(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let tail = (self.head + self.len - 1) & self.mask;
        self.len -= 1;
        self.slots[tail].take()
    }
}

/// Fixed-capacity, mutex-guarded double-ended queue
pub struct BoundedQueue<T> {
    ring: Mutex<Ring<T>>,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at least `capacity` items.
    ///
    /// The capacity is rounded up to a power of two so indices can be masked.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            ring: Mutex::new(Ring::new(capacity)),
        }
    }

    /// Push one item at the back. Hands the item back if the queue is full.
    pub fn push(&self, value: T) -> std::result::Result<(), T> {
        let mut ring = self.ring.lock();
        if ring.len == ring.capacity() {
            return Err(value);
        }
        ring.push_back(value);
        Ok(())
    }

    /// Push one item at the front, so it is the next [`pop_front`] and the
    /// last [`pop_back`]. Hands the item back if the queue is full.
    ///
    /// [`pop_front`]: BoundedQueue::pop_front
    /// [`pop_back`]: BoundedQueue::pop_back
    pub fn push_front(&self, value: T) -> std::result::Result<(), T> {
        let mut ring = self.ring.lock();
        if ring.len == ring.capacity() {
            return Err(value);
        }
        ring.push_front(value);
        Ok(())
    }

    /// Push a batch of items at the back, all or nothing.
    pub fn push_range(&self, values: Vec<T>) -> std::result::Result<(), Vec<T>> {
        let mut ring = self.ring.lock();
        if ring.len + values.len() > ring.capacity() {
            return Err(values);
        }
        for value in values {
            ring.push_back(value);
        }
        Ok(())
    }

    /// Remove the oldest item
    pub fn pop_front(&self) -> Option<T> {
        self.ring.lock().pop_front()
    }

    /// Remove the newest item
    pub fn pop_back(&self) -> Option<T> {
        self.ring.lock().pop_back()
    }

    /// Drain up to `max` items in insertion order and clear the remainder
    pub fn pop_all(&self, max: usize) -> Vec<T> {
        let mut ring = self.ring.lock();
        let mut drained = Vec::with_capacity(ring.len.min(max));
        while drained.len() < max {
            match ring.pop_front() {
                Some(value) => drained.push(value),
                None => break,
            }
        }
        while ring.pop_front().is_some() {}
        ring.head = 0;
        drained
    }

    /// Point-in-time emptiness check
    pub fn is_empty(&self) -> bool {
        self.ring.lock().len == 0
    }

    /// Point-in-time length
    pub fn len(&self) -> usize {
        self.ring.lock().len
    }

    /// Maximum number of items the queue can hold
    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity()
    }
}

impl<T> Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ring = self.ring.lock();
        f.debug_struct("BoundedQueue")
            .field("len", &ring.len)
            .field("capacity", &ring.capacity())
            .finish()
    }
}

/// A task tagged with its group, and with the fiber waiting on it if it was
/// spawned through `run_subtasks_and_yield`
pub(crate) struct GroupedTask {
    pub(crate) task: TaskDesc,
    pub(crate) group: TaskGroup,
    pub(crate) parent: Option<FiberHandle>,
}

/// A unit of work sitting in a worker queue
pub(crate) enum Job {
    /// A task that has not started yet
    Fresh(GroupedTask),
    /// A parked fiber whose wait condition has been met
    Resume {
        fiber: FiberHandle,
        priority: Priority,
    },
}

impl Job {
    pub(crate) fn priority(&self) -> Priority {
        match self {
            Job::Fresh(grouped) => grouped.task.priority(),
            Job::Resume { priority, .. } => *priority,
        }
    }
}

impl Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Fresh(grouped) => f
                .debug_struct("Fresh")
                .field("task", &grouped.task)
                .field("group", &grouped.group)
                .field("parent", &grouped.parent)
                .finish(),
            Job::Resume { fiber, priority } => f
                .debug_struct("Resume")
                .field("fiber", fiber)
                .field("priority", priority)
                .finish(),
        }
    }
}

/// Jobs of one priority tier. Resumed fibers get their own lane so they are
/// never stuck behind fresh tasks waiting for a free fiber.
struct Tier {
    resumed: BoundedQueue<FiberHandle>,
    fresh: BoundedQueue<Job>,
}

impl Tier {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            resumed: BoundedQueue::with_capacity(capacity),
            fresh: BoundedQueue::with_capacity(capacity),
        }
    }
}

/// Per-worker queue with one pair of bounded lanes per priority tier
pub(crate) struct WorkerQueue {
    tiers: [Tier; Priority::COUNT],
}

impl WorkerQueue {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            tiers: [
                Tier::with_capacity(capacity),
                Tier::with_capacity(capacity),
                Tier::with_capacity(capacity),
            ],
        }
    }

    /// Push a batch, highest tier first, so a worker draining the queue while
    /// the batch is being pushed never sees a lower tier before a higher one.
    ///
    /// Returns the jobs of every lane that did not fit.
    pub(crate) fn push_batch(&self, jobs: Vec<Job>) -> std::result::Result<(), Vec<Job>> {
        let mut fresh: [Vec<Job>; Priority::COUNT] = [Vec::new(), Vec::new(), Vec::new()];
        let mut resumed: [Vec<FiberHandle>; Priority::COUNT] = [Vec::new(), Vec::new(), Vec::new()];
        for job in jobs {
            match job {
                Job::Resume { fiber, priority } => resumed[priority.index()].push(fiber),
                job => fresh[job.priority().index()].push(job),
            }
        }

        let mut rejected = Vec::new();
        for ((tier, fresh), (resumed, priority)) in self
            .tiers
            .iter()
            .zip(fresh)
            .zip(resumed.into_iter().zip(Priority::ALL))
        {
            if !resumed.is_empty() {
                if let Err(fibers) = tier.resumed.push_range(resumed) {
                    rejected.extend(
                        fibers
                            .into_iter()
                            .map(|fiber| Job::Resume { fiber, priority }),
                    );
                }
            }
            if !fresh.is_empty() {
                if let Err(fresh) = tier.fresh.push_range(fresh) {
                    rejected.extend(fresh);
                }
            }
        }

        if rejected.is_empty() {
            Ok(())
        } else {
            Err(rejected)
        }
    }

    /// Put a fresh task back at the oldest end of its lane, behind every
    /// job the worker would pop first
    pub(crate) fn push_deferred(&self, grouped: GroupedTask) -> std::result::Result<(), Job> {
        let tier = &self.tiers[grouped.task.priority().index()];
        tier.fresh.push_front(Job::Fresh(grouped))
    }

    /// Newest job of the highest non-empty tier, resumed fibers first
    pub(crate) fn pop_local(&self) -> Option<Job> {
        self.tiers.iter().zip(Priority::ALL).find_map(|(tier, priority)| {
            tier.resumed
                .pop_back()
                .map(|fiber| Job::Resume { fiber, priority })
                .or_else(|| tier.fresh.pop_back())
        })
    }

    /// Oldest job of the highest non-empty tier, resumed fibers first
    pub(crate) fn steal(&self) -> Option<Job> {
        self.tiers.iter().zip(Priority::ALL).find_map(|(tier, priority)| {
            tier.resumed
                .pop_front()
                .map(|fiber| Job::Resume { fiber, priority })
                .or_else(|| tier.fresh.pop_front())
        })
    }

    /// Newest resumed fiber of any tier, highest tier first
    pub(crate) fn pop_resumed(&self) -> Option<FiberHandle> {
        self.tiers.iter().find_map(|tier| tier.resumed.pop_back())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tiers
            .iter()
            .all(|tier| tier.resumed.is_empty() && tier.fresh.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(priority: Priority, label: &'static str) -> Job {
        Job::Fresh(GroupedTask {
            task: TaskDesc::new(|_| {}).with_priority(priority).with_label(label),
            group: TaskGroup::DEFAULT,
            parent: None,
        })
    }

    fn resume(priority: Priority, index: u32) -> Job {
        Job::Resume {
            fiber: FiberHandle::new(index, 0),
            priority,
        }
    }

    fn label(job: Job) -> &'static str {
        match job {
            Job::Fresh(grouped) => grouped.task.label(),
            Job::Resume { .. } => "resume",
        }
    }

    #[test]
    fn test_pop_back_is_lifo() {
        let queue = BoundedQueue::with_capacity(8);
        queue.push_range(vec![1, 3, 7, 10, 13]).unwrap();

        let popped: Vec<i32> = (0..5).map(|_| queue.pop_back().unwrap()).collect();
        assert_eq!(popped, vec![13, 10, 7, 3, 1]);
        assert!(queue.pop_back().is_none());
    }

    #[test]
    fn test_pop_all_is_fifo() {
        let queue = BoundedQueue::with_capacity(8);
        queue.push_range(vec![101, 103, 107, 1010, 1013]).unwrap();

        assert_eq!(queue.pop_all(16), vec![101, 103, 107, 1010, 1013]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_all_clears_remainder() {
        let queue = BoundedQueue::with_capacity(8);
        queue.push_range(vec![1, 2, 3, 4]).unwrap();

        assert_eq!(queue.pop_all(2), vec![1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_front_is_fifo() {
        let queue = BoundedQueue::with_capacity(4);
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        queue.push(3).unwrap();

        assert_eq!(queue.pop_front(), Some(1));
        assert_eq!(queue.pop_back(), Some(3));
        assert_eq!(queue.pop_front(), Some(2));
        assert_eq!(queue.pop_front(), None);
    }

    #[test]
    fn test_push_front_goes_behind_pop_back() {
        let queue = BoundedQueue::with_capacity(4);
        queue.push_range(vec![2, 3]).unwrap();
        queue.push_front(1).unwrap();

        assert_eq!(queue.pop_back(), Some(3));
        assert_eq!(queue.pop_back(), Some(2));
        assert_eq!(queue.pop_back(), Some(1));

        queue.push_range(vec![5, 6, 7]).unwrap();
        queue.push_front(4).unwrap();
        assert_eq!(queue.push_front(0), Err(0));
        assert_eq!(queue.pop_all(8), vec![4, 5, 6, 7]);
    }

    #[test]
    fn test_capacity_rounds_to_power_of_two() {
        let queue: BoundedQueue<u8> = BoundedQueue::with_capacity(5);
        assert_eq!(queue.capacity(), 8);

        let queue: BoundedQueue<u8> = BoundedQueue::with_capacity(0);
        assert_eq!(queue.capacity(), 1);
    }

    #[test]
    fn test_overflow_hands_items_back() {
        let queue = BoundedQueue::with_capacity(4);
        queue.push_range(vec![1, 2, 3]).unwrap();

        assert_eq!(queue.push_range(vec![4, 5]), Err(vec![4, 5]));
        assert_eq!(queue.len(), 3);

        queue.push(4).unwrap();
        assert_eq!(queue.push(5), Err(5));
    }

    #[test]
    fn test_wraparound() {
        let queue = BoundedQueue::with_capacity(4);
        for round in 0..10 {
            queue.push_range(vec![round, round + 1, round + 2]).unwrap();
            assert_eq!(queue.pop_front(), Some(round));
            assert_eq!(queue.pop_back(), Some(round + 2));
            assert_eq!(queue.pop_front(), Some(round + 1));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_worker_queue_drains_tiers_in_order() {
        let queue = WorkerQueue::with_capacity(8);
        queue
            .push_batch(vec![
                fresh(Priority::Low, "low"),
                fresh(Priority::High, "high"),
                fresh(Priority::Normal, "normal"),
            ])
            .unwrap();

        assert_eq!(label(queue.pop_local().unwrap()), "high");
        assert_eq!(label(queue.pop_local().unwrap()), "normal");
        assert_eq!(label(queue.pop_local().unwrap()), "low");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_worker_queue_steal_takes_oldest() {
        let queue = WorkerQueue::with_capacity(8);
        queue
            .push_batch(vec![fresh(Priority::Normal, "first"), fresh(Priority::Normal, "second")])
            .unwrap();

        assert_eq!(label(queue.steal().unwrap()), "first");
        assert_eq!(label(queue.pop_local().unwrap()), "second");
    }

    #[test]
    fn test_worker_queue_overflow_returns_rejected_tier() {
        let queue = WorkerQueue::with_capacity(1);
        let rejected = queue
            .push_batch(vec![
                fresh(Priority::High, "a"),
                fresh(Priority::High, "b"),
                fresh(Priority::Low, "c"),
            ])
            .unwrap_err();

        assert_eq!(rejected.len(), 2);
        assert_eq!(label(queue.pop_local().unwrap()), "c");
    }

    #[test]
    fn test_resumed_fibers_run_before_fresh_tasks_of_their_tier() {
        let queue = WorkerQueue::with_capacity(8);
        queue
            .push_batch(vec![fresh(Priority::Normal, "fresh"), resume(Priority::Normal, 3)])
            .unwrap();

        assert_eq!(label(queue.pop_local().unwrap()), "resume");
        assert_eq!(label(queue.pop_local().unwrap()), "fresh");
    }

    #[test]
    fn test_deferred_task_yields_to_resumed_fiber() {
        let queue = WorkerQueue::with_capacity(8);
        queue
            .push_batch(vec![fresh(Priority::High, "newer"), resume(Priority::Low, 5)])
            .unwrap();

        let Some(Job::Fresh(grouped)) = queue.pop_local() else {
            panic!("expected the high tier fresh task");
        };
        queue
            .push_batch(vec![fresh(Priority::High, "newest")])
            .unwrap();
        queue.push_deferred(grouped).unwrap();

        assert_eq!(queue.pop_resumed(), Some(FiberHandle::new(5, 0)));
        assert_eq!(queue.pop_resumed(), None);
        assert_eq!(label(queue.pop_local().unwrap()), "newest");
        assert_eq!(label(queue.pop_local().unwrap()), "newer");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_rejected_resumes_keep_their_tier() {
        let queue = WorkerQueue::with_capacity(1);
        let rejected = queue
            .push_batch(vec![resume(Priority::Low, 1), resume(Priority::Low, 2)])
            .unwrap_err();

        assert_eq!(rejected.len(), 2);
        assert!(rejected.iter().all(|job| job.priority() == Priority::Low));
        assert!(queue.is_empty());

        queue.push_batch(vec![resume(Priority::Low, 1)]).unwrap();
        assert!(matches!(queue.steal(), Some(Job::Resume { .. })));
    }
}
