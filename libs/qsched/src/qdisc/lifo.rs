// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::SchedulerError;
use crate::loom::sync::{Arc, Mutex, Weak};
use crate::qdisc::fifo::{bind_and_schedule, collect_leaf_handle, route_to_leaf};
use crate::qdisc::{Handle, ParentLink, Predicate, Qdisc, QdiscCore, QdiscId, RoutingPath};
use crate::workload::{WorkloadRef, lock};
use core::any::Any;
use core::fmt;

/// Unbounded last-in-first-out leaf qdisc.
///
/// Serves the newest workload first. The backtrack hint is honored by
/// construction: after a failed execution the next dequeue returns the
/// element that was stacked closest to the failed one.
pub struct Lifo<H: Handle> {
    core: QdiscCore<H>,
    predicate: Option<Predicate>,
    stack: Mutex<Vec<WorkloadRef<H>>>,
    self_ref: Weak<Self>,
}

// === impl Lifo ===

impl<H: Handle> Lifo<H> {
    /// Creates a LIFO leaf.
    pub fn new(handle: H) -> Arc<Self> {
        Self::with_predicate(handle, None)
    }

    /// Creates a LIFO leaf with an own classification predicate.
    pub fn with_predicate(handle: H, predicate: Option<Predicate>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            core: QdiscCore::new(handle),
            predicate,
            stack: Mutex::new(Vec::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// The number of resident workloads. Racy, diagnostics only.
    pub fn len(&self) -> usize {
        lock(&self.stack).len()
    }
}

impl<H: Handle> Qdisc<H> for Lifo<H> {
    fn handle(&self) -> H {
        self.core.handle()
    }

    fn id(&self) -> QdiscId {
        QdiscId::of(self)
    }

    fn is_empty(&self) -> bool {
        lock(&self.stack).is_empty()
    }

    fn enqueue(&self, workload: WorkloadRef<H>) -> Result<(), SchedulerError> {
        self.core.ensure_open()?;
        if !bind_and_schedule(&workload, &self.self_ref)? {
            return Ok(());
        }
        lock(&self.stack).push(workload);
        self.core.notify_enqueued(self.id());
        Ok(())
    }

    fn can_classify(&self, state: &dyn Any) -> bool {
        self.predicate
            .as_ref()
            .is_some_and(|predicate| predicate.matches(state))
    }

    fn try_enqueue(
        &self,
        state: &dyn Any,
        workload: WorkloadRef<H>,
    ) -> Result<bool, SchedulerError> {
        self.try_enqueue_direct(state, workload)
    }

    fn try_enqueue_direct(
        &self,
        state: &dyn Any,
        workload: WorkloadRef<H>,
    ) -> Result<bool, SchedulerError> {
        if !self.can_classify(state) {
            return Ok(false);
        }
        self.enqueue(workload)?;
        Ok(true)
    }

    fn try_dequeue(&self, _worker_id: usize, _backtrack: bool) -> Option<WorkloadRef<H>> {
        lock(&self.stack).pop()
    }

    fn try_peek_unsafe(&self, _worker_id: usize) -> Option<WorkloadRef<H>> {
        lock(&self.stack).last().cloned()
    }

    fn try_remove(&self, workload: &WorkloadRef<H>) -> bool {
        let mut stack = lock(&self.stack);
        if let Some(index) = stack.iter().position(|resident| resident.ptr_eq(workload)) {
            stack.remove(index);
            true
        } else {
            false
        }
    }

    fn on_worker_terminated(&self, _worker_id: usize) {}

    fn complete(&self) {
        self.core.complete();
    }

    fn bind_parent(&self, parent: ParentLink<H>) -> Result<(), SchedulerError> {
        self.core.bind_parent(parent)
    }

    fn try_find_route(&self, handle: H) -> Option<RoutingPath<H>> {
        route_to_leaf(handle, self.handle(), &self.self_ref)
    }

    fn collect_handles(&self, out: &mut Vec<H>) {
        collect_leaf_handle(self.handle(), out);
    }
}

impl<H: Handle> fmt::Debug for Lifo<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifo")
            .field("handle", &self.handle())
            .field("len", &self.len())
            .field("parent", &self.core.parent_debug())
            .finish_non_exhaustive()
    }
}
