//! Task descriptors
//!
//! A [`TaskDesc`] is the plain description of one unit of work: the body to
//! run, the fiber stack class it needs, its priority tier and some labels
//! used only for diagnostics.

use std::fmt::{self, Debug};

use crate::scheduler::TaskContext;

/// Body of a task. Receives the execution context of the fiber it runs on.
pub type TaskFn = Box<dyn FnOnce(&mut TaskContext<'_>) + Send + 'static>;

/// Callback run once after a pool-owned task has finished
pub type TaskDestructor = Box<dyn FnOnce() + Send + 'static>;

/// Priority tier of a task. Workers drain higher tiers first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Drained before everything else
    High,
    /// Default tier
    #[default]
    Normal,
    /// Drained only when the other tiers are empty
    Low,
}

impl Priority {
    /// Number of priority tiers
    pub const COUNT: usize = 3;

    /// All tiers, highest first
    pub const ALL: [Priority; Priority::COUNT] = [Priority::High, Priority::Normal, Priority::Low];

    pub(crate) fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

/// Stack-size class selecting the fiber pool a task is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StackClass {
    /// Small stacks, the common case
    #[default]
    Standard,
    /// Large stacks for deep recursion or big locals
    Extended,
}

impl StackClass {
    pub(crate) fn index(self) -> usize {
        match self {
            StackClass::Standard => 0,
            StackClass::Extended => 1,
        }
    }
}

/// A task that can be submitted to the scheduler
pub struct TaskDesc {
    pub(crate) func: TaskFn,
    pub(crate) destructor: Option<TaskDestructor>,
    priority: Priority,
    stack: StackClass,
    label: &'static str,
    color: u32,
}

impl TaskDesc {
    /// Create a new task with normal priority and a standard stack
    pub fn new<F>(func: F) -> Self
    where
        F: FnOnce(&mut TaskContext<'_>) + Send + 'static,
    {
        Self {
            func: Box::new(func),
            destructor: None,
            priority: Priority::Normal,
            stack: StackClass::Standard,
            label: "task",
            color: 0,
        }
    }

    /// Set the priority tier
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the stack-size class
    pub fn with_stack(mut self, stack: StackClass) -> Self {
        self.stack = stack;
        self
    }

    /// Set the debug label reported to listeners
    pub fn with_label(mut self, label: &'static str) -> Self {
        self.label = label;
        self
    }

    /// Set the debug color reported to listeners
    pub fn with_color(mut self, color: u32) -> Self {
        self.color = color;
        self
    }

    /// Attach a callback that runs after the task finishes.
    ///
    /// Used for pool-owned tasks; caller-owned tasks normally have none.
    pub fn with_destructor<D>(mut self, destructor: D) -> Self
    where
        D: FnOnce() + Send + 'static,
    {
        self.destructor = Some(Box::new(destructor));
        self
    }

    /// Get task priority
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Get the stack-size class
    pub fn stack(&self) -> StackClass {
        self.stack
    }

    /// Get the debug label
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Get the debug color
    pub fn color(&self) -> u32 {
        self.color
    }
}

impl Debug for TaskDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDesc")
            .field("label", &self.label)
            .field("priority", &self.priority)
            .field("stack", &self.stack)
            .field("pooled", &self.destructor.is_some())
            .finish()
    }
}
