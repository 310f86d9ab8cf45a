// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::{Condvar, Mutex};
use core::fmt;
use core::time::Duration;

/// A one-way latch threads can block on.
///
/// Used for workload completion waits and the pool's fully-disposed signal.
/// Unlike a parker this is level-triggered: once [`set`](Event::set) the event
/// stays set (until [`reset`](Event::reset), which only pooled workloads use).
pub(crate) struct Event {
    set: Mutex<bool>,
    cvar: Condvar,
}

impl Event {
    pub(crate) fn new() -> Self {
        Self {
            set: Mutex::new(false),
            cvar: Condvar::new(),
        }
    }

    pub(crate) fn set(&self) {
        let mut set = self.set.lock().expect("event lock poisoned");
        *set = true;
        self.cvar.notify_all();
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.set.lock().expect("event lock poisoned")
    }

    /// Clears the event. Only sound while no thread can be waiting, which the
    /// workload pool guarantees by recycling exclusively owned workloads.
    pub(crate) fn reset(&self) {
        let mut set = self.set.lock().expect("event lock poisoned");
        *set = false;
    }

    pub(crate) fn wait(&self) {
        let mut set = self.set.lock().expect("event lock poisoned");
        while !*set {
            set = self.cvar.wait(set).expect("event lock poisoned");
        }
    }

    /// Waits for the event with a timeout. Returns `false` on expiry.
    #[cfg(not(loom))]
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut set = self.set.lock().expect("event lock poisoned");
        while !*set {
            let Some(remaining) = deadline.checked_duration_since(std::time::Instant::now()) else {
                return false;
            };
            let (guard, result) = self
                .cvar
                .wait_timeout(set, remaining)
                .expect("event lock poisoned");
            set = guard;
            if result.timed_out() && !*set {
                return false;
            }
        }
        true
    }

    /// Loom cannot model timeouts; under loom a timed wait is a plain wait.
    #[cfg(loom)]
    pub(crate) fn wait_timeout(&self, _timeout: Duration) -> bool {
        self.wait();
        true
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("set", &self.is_set())
            .finish_non_exhaustive()
    }
}
