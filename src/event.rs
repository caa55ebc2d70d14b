//! Signal/wait event built on `parking_lot`
//!
//! A manual-reset event stays signaled until [`Event::reset`] is called and
//! releases every waiter. An auto-reset event releases one waiter and clears
//! itself.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Reset behaviour of an [`Event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    /// Stays signaled until explicitly reset
    Manual,
    /// Clears itself when a waiter observes the signal
    Automatic,
}

/// A condition event with an optional timeout on wait
#[derive(Debug)]
pub struct Event {
    mode: ResetMode,
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl Event {
    /// Create a new event in the given initial state
    pub fn new(mode: ResetMode, signaled: bool) -> Self {
        Self {
            mode,
            signaled: Mutex::new(signaled),
            condvar: Condvar::new(),
        }
    }

    /// Signal the event, waking one (automatic) or all (manual) waiters
    pub fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        match self.mode {
            ResetMode::Manual => {
                self.condvar.notify_all();
            }
            ResetMode::Automatic => {
                self.condvar.notify_one();
            }
        }
    }

    /// Clear the signaled state
    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }

    /// Signal the event only if `condition` holds while the event lock is held.
    ///
    /// Paired with [`Event::reset_if`] this keeps the event state consistent
    /// with an external counter that is modified outside the lock: whichever
    /// side re-checks last decides the final state.
    pub fn signal_if(&self, condition: impl FnOnce() -> bool) {
        let mut signaled = self.signaled.lock();
        if condition() {
            *signaled = true;
            match self.mode {
                ResetMode::Manual => {
                    self.condvar.notify_all();
                }
                ResetMode::Automatic => {
                    self.condvar.notify_one();
                }
            }
        }
    }

    /// Reset the event only if `condition` holds while the event lock is held
    pub fn reset_if(&self, condition: impl FnOnce() -> bool) {
        let mut signaled = self.signaled.lock();
        if condition() {
            *signaled = false;
        }
    }

    /// Point-in-time view of the signaled state
    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }

    /// Wait until the event is signaled or `timeout` expires.
    ///
    /// Returns `true` if the event fired.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.signaled.lock();
        while !*signaled {
            if self.condvar.wait_until(&mut signaled, deadline).timed_out() {
                break;
            }
        }

        let fired = *signaled;
        if fired && self.mode == ResetMode::Automatic {
            *signaled = false;
        }
        fired
    }
}
