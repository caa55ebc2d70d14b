//! Fixed-capacity slab for fire-and-forget tasks
//!
//! A caller that cannot keep a task object alive on its own stack until the
//! task finished allocates it here instead. Handles pair a slot index with a
//! generation tag, so destroying a slot twice or through a stale handle is an
//! observable `false` rather than a use-after-free.

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::scheduler::TaskContext;
use crate::task::TaskDesc;

/// A task object that can live in a [`TaskPool`]
pub trait PooledTask: Send + Sync + 'static {
    /// Task body
    fn run(&self, ctx: &mut TaskContext<'_>);
}

/// Handle to an allocated pool slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolHandle {
    index: u32,
    generation: u32,
}

impl PoolHandle {
    /// Slot index
    pub fn index(&self) -> usize {
        self.index as usize
    }

    /// Reuse generation of the slot when this handle was issued
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

/// Fixed-capacity slab of task objects
pub struct TaskPool<T> {
    slots: Vec<Mutex<Slot<T>>>,
    free: ArrayQueue<u32>,
}

impl<T> TaskPool<T> {
    /// Create a pool with room for `capacity` objects
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots = (0..capacity)
            .map(|_| {
                Mutex::new(Slot {
                    generation: 0,
                    value: None,
                })
            })
            .collect();
        let free = ArrayQueue::new(capacity);
        for index in 0..capacity as u32 {
            let _ = free.push(index);
        }
        Self { slots, free }
    }

    /// Store `value` in a free slot, or hand nothing back if the pool is full
    pub fn try_alloc(&self, value: T) -> Option<PoolHandle> {
        let index = self.free.pop()?;
        let mut slot = self.slots[index as usize].lock();
        debug_assert!(slot.value.is_none(), "free-list handed out a used slot");
        slot.value = Some(Arc::new(value));
        Some(PoolHandle {
            index,
            generation: slot.generation,
        })
    }

    /// Store `value` in a free slot
    pub fn alloc(&self, value: T) -> Result<PoolHandle> {
        self.try_alloc(value).ok_or_else(|| {
            log::error!("Task pool of {} slots is full", self.capacity());
            Error::exhausted("task pool")
        })
    }

    /// Object behind `handle`, if the handle is still live
    pub fn get(&self, handle: PoolHandle) -> Option<Arc<T>> {
        let slot = self.slots.get(handle.index as usize)?.lock();
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.clone()
    }

    /// Drop the object behind `handle` and free its slot.
    ///
    /// Returns `false` if the handle was already destroyed or is stale.
    pub fn destroy_by_handle(&self, handle: PoolHandle) -> bool {
        let Some(slot) = self.slots.get(handle.index as usize) else {
            return false;
        };
        let value = {
            let mut slot = slot.lock();
            if slot.generation != handle.generation || slot.value.is_none() {
                return false;
            }
            slot.generation = slot.generation.wrapping_add(1);
            slot.value.take()
        };
        // The object may own resources; drop it outside the slot lock.
        drop(value);

        if self.free.push(handle.index).is_err() {
            log::error!("Task pool free-list overflow on slot {}", handle.index);
        }
        true
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of allocated slots (point-in-time)
    pub fn len(&self) -> usize {
        self.capacity() - self.free.len()
    }

    /// `true` if no slot is allocated
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: PooledTask> TaskPool<T> {
    /// Wrap the object behind `handle` as a task whose completion destroys
    /// the slot
    pub fn task(self: &Arc<Self>, handle: PoolHandle) -> Option<TaskDesc> {
        let value = self.get(handle)?;
        let pool = Arc::clone(self);
        Some(
            TaskDesc::new(move |ctx| value.run(ctx))
                .with_label("pooled")
                .with_destructor(move || {
                    if !pool.destroy_by_handle(handle) {
                        log::error!("Pooled task slot {} was destroyed early", handle.index);
                    }
                }),
        )
    }

    /// Allocate `value` and wrap it as a fire-and-forget task
    pub fn spawn(self: &Arc<Self>, value: T) -> Result<TaskDesc> {
        let handle = self.alloc(value)?;
        self.task(handle)
            .ok_or_else(|| Error::invalid("pooled task destroyed before it was wrapped"))
    }
}
