// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::{Arc, Mutex};
use crate::qdisc::Handle;
use crate::workload::{ContextOptions, PayloadCell, Workload, WorkloadRef, lock};
use core::fmt;

/// Free-list pool for anonymous workloads.
///
/// Anonymous (fire-and-forget) workloads are never handed out to callers, so
/// once their continuations ran the worker holds the only reference and the
/// allocation can be reused for the next `schedule` call. The pool verifies
/// exclusivity before parking a workload; anything else is simply dropped.
pub(crate) struct WorkloadPool<H: Handle> {
    free: Mutex<Vec<WorkloadRef<H>>>,
    capacity: usize,
}

// === impl WorkloadPool ===

impl<H: Handle> WorkloadPool<H> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Rents a pooled workload reinitialized around `payload`, or builds a
    /// fresh anonymous one when the free list is empty.
    pub(crate) fn rent_or_build(
        &self,
        payload: PayloadCell<H>,
        options: ContextOptions,
    ) -> WorkloadRef<H> {
        match lock(&self.free).pop() {
            Some(workload) => {
                workload.reinitialize(payload);
                tracing::trace!(workload = %workload.id(), "rented pooled workload");
                workload
            }
            None => Workload::new(payload, true, options),
        }
    }

    /// Offers a finished anonymous workload back to the pool.
    pub(crate) fn recycle(&self, workload: WorkloadRef<H>) {
        if !workload.workload().is_anonymous() {
            return;
        }
        // the recycling invariant: no external reference survives
        if Arc::strong_count(&workload.0) != 1 {
            return;
        }
        if !workload.park_in_pool() {
            return;
        }

        let mut free = lock(&self.free);
        if free.len() < self.capacity {
            free.push(workload);
        }
    }

    #[cfg(test)]
    pub(crate) fn free_count(&self) -> usize {
        lock(&self.free).len()
    }
}

impl<H: Handle> fmt::Debug for WorkloadPool<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkloadPool")
            .field("free", &lock(&self.free).len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
