//! Task groups
//!
//! A group counts the tasks submitted to it that have not finished yet. When
//! the count drops to zero its completion event fires and every fiber parked
//! on the group is handed back to the scheduler.

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use super::fiber::FiberHandle;
use super::queue::BoundedQueue;
use crate::error::{Error, Result};
use crate::event::{Event, ResetMode};

/// Handle to a task group.
///
/// Handles carry a generation so that using a group after it was released is
/// detected instead of silently aliasing the next owner of the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskGroup {
    index: u32,
    generation: u32,
}

impl TaskGroup {
    /// Pre-reserved group that always exists and cannot be released
    pub const DEFAULT: TaskGroup = TaskGroup {
        index: 0,
        generation: 0,
    };

    /// Slot index of this group in the scheduler's group table
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// In-progress counter paired with a manual-reset completion event
#[derive(Debug)]
pub(crate) struct TaskCounter {
    in_progress: AtomicUsize,
    completed: Event,
}

impl TaskCounter {
    pub(crate) fn new() -> Self {
        Self {
            in_progress: AtomicUsize::new(0),
            completed: Event::new(ResetMode::Manual, true),
        }
    }

    pub(crate) fn add(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.in_progress.fetch_add(count, Ordering::AcqRel);
        self.completed
            .reset_if(|| self.in_progress.load(Ordering::Acquire) > 0);
    }

    /// Returns `true` if this call brought the counter to zero
    pub(crate) fn sub(&self, count: usize) -> bool {
        if count == 0 {
            return false;
        }
        let previous = self.in_progress.fetch_sub(count, Ordering::AcqRel);
        debug_assert!(previous >= count, "task counter underflow");
        if previous == count {
            self.completed
                .signal_if(|| self.in_progress.load(Ordering::Acquire) == 0);
            true
        } else {
            false
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.in_progress.load(Ordering::Acquire)
    }

    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        self.completed.wait(timeout)
    }
}

pub(crate) struct GroupSlot {
    counter: TaskCounter,
    generation: AtomicU32,
    /// Serializes "check counter then park" against "counter hit zero, drain"
    park_lock: Mutex<()>,
    waiters: BoundedQueue<FiberHandle>,
}

impl GroupSlot {
    fn new(waiter_capacity: usize) -> Self {
        Self {
            counter: TaskCounter::new(),
            generation: AtomicU32::new(0),
            park_lock: Mutex::new(()),
            waiters: BoundedQueue::with_capacity(waiter_capacity),
        }
    }

    pub(crate) fn counter(&self) -> &TaskCounter {
        &self.counter
    }

    /// Park `fiber` on this group unless the group is already complete.
    ///
    /// Returns `Ok(false)` when the group has no tasks in progress, in which
    /// case the caller resumes the fiber itself.
    pub(crate) fn park(&self, fiber: FiberHandle) -> Result<bool> {
        let _guard = self.park_lock.lock();
        if self.counter.count() == 0 {
            return Ok(false);
        }
        self.waiters
            .push(fiber)
            .map_err(|_| Error::exhausted("group waiter list"))?;
        Ok(true)
    }

    /// Remove every parked fiber. Called after the counter reached zero.
    pub(crate) fn drain_waiters(&self) -> Vec<FiberHandle> {
        let _guard = self.park_lock.lock();
        self.waiters.pop_all(usize::MAX)
    }
}

/// Fixed-size table of groups with a lock-free free-list of slot indices
pub(crate) struct GroupTable {
    slots: Vec<GroupSlot>,
    free: ArrayQueue<u32>,
}

impl GroupTable {
    /// `max_groups` includes the default group
    pub(crate) fn new(max_groups: usize, waiter_capacity: usize) -> Self {
        let max_groups = max_groups.max(1);
        let slots = (0..max_groups)
            .map(|_| GroupSlot::new(waiter_capacity))
            .collect();

        // The default group never goes through the free-list.
        let free = ArrayQueue::new(max_groups.saturating_sub(1).max(1));
        for index in 1..max_groups as u32 {
            let _ = free.push(index);
        }

        Self { slots, free }
    }

    pub(crate) fn create(&self) -> Result<TaskGroup> {
        let index = self.free.pop().ok_or_else(|| Error::exhausted("task group table"))?;
        let slot = &self.slots[index as usize];
        debug_assert_eq!(slot.counter.count(), 0, "reused group still has tasks in progress");
        Ok(TaskGroup {
            index,
            generation: slot.generation.load(Ordering::Acquire),
        })
    }

    pub(crate) fn release(&self, group: TaskGroup) -> Result<()> {
        if group == TaskGroup::DEFAULT {
            return Err(Error::invalid("the default group cannot be released"));
        }
        let slot = self.slot(group)?;
        if slot.counter.count() != 0 {
            return Err(Error::invalid("released a group with tasks in progress"));
        }
        if !slot.waiters.is_empty() {
            return Err(Error::invalid("released a group with parked waiters"));
        }

        // A stale handle racing with this release loses the exchange.
        slot.generation
            .compare_exchange(
                group.generation,
                group.generation.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| Error::invalid("group handle is stale"))?;

        self.free
            .push(group.index)
            .map_err(|_| Error::invalid("group released twice"))?;
        Ok(())
    }

    pub(crate) fn slot(&self, group: TaskGroup) -> Result<&GroupSlot> {
        let slot = self
            .slots
            .get(group.index as usize)
            .ok_or_else(|| Error::invalid("group handle out of range"))?;
        if slot.generation.load(Ordering::Acquire) != group.generation {
            return Err(Error::invalid("group handle is stale"));
        }
        Ok(slot)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }
}
