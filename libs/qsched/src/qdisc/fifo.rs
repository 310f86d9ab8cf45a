// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::SchedulerError;
use crate::loom::sync::{Arc, Mutex, Weak};
use crate::qdisc::{
    Handle, ParentLink, Predicate, Qdisc, QdiscCore, QdiscId, RoutingPath,
};
use crate::workload::{Lifecycle, WorkloadRef, lock};
use core::any::Any;
use core::fmt;
use std::collections::VecDeque;

/// Unbounded first-in-first-out leaf qdisc.
///
/// The workhorse leaf: dequeue order equals enqueue order under a single
/// consumer. Ignores the backtrack hint, since the oldest element is served
/// regardless of prior failures.
pub struct Fifo<H: Handle> {
    core: QdiscCore<H>,
    predicate: Option<Predicate>,
    queue: Mutex<VecDeque<WorkloadRef<H>>>,
    self_ref: Weak<Self>,
}

// === impl Fifo ===

impl<H: Handle> Fifo<H> {
    /// Creates a FIFO leaf.
    pub fn new(handle: H) -> Arc<Self> {
        Self::with_predicate(handle, None)
    }

    /// Creates a FIFO leaf with an own classification predicate.
    pub fn with_predicate(handle: H, predicate: Option<Predicate>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            core: QdiscCore::new(handle),
            predicate,
            queue: Mutex::new(VecDeque::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// The number of resident workloads. Racy, diagnostics only.
    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }
}

impl<H: Handle> Qdisc<H> for Fifo<H> {
    fn handle(&self) -> H {
        self.core.handle()
    }

    fn id(&self) -> QdiscId {
        QdiscId::of(self)
    }

    fn is_empty(&self) -> bool {
        lock(&self.queue).is_empty()
    }

    fn enqueue(&self, workload: WorkloadRef<H>) -> Result<(), SchedulerError> {
        self.core.ensure_open()?;
        if !bind_and_schedule(&workload, &self.self_ref)? {
            return Ok(());
        }
        lock(&self.queue).push_back(workload);
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
        // a leaf has no children, classification collapses to the own predicate
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
        lock(&self.queue).pop_front()
    }

    fn try_peek_unsafe(&self, _worker_id: usize) -> Option<WorkloadRef<H>> {
        lock(&self.queue).front().cloned()
    }

    fn try_remove(&self, workload: &WorkloadRef<H>) -> bool {
        let mut queue = lock(&self.queue);
        if let Some(index) = queue.iter().position(|resident| resident.ptr_eq(workload)) {
            queue.remove(index);
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

impl<H: Handle> fmt::Debug for Fifo<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fifo")
            .field("handle", &self.handle())
            .field("len", &self.len())
            .field("parent", &self.core.parent_debug())
            .finish_non_exhaustive()
    }
}

/// Shared leaf enqueue hand-off: transition the workload to `Scheduled` and
/// record the owning qdisc for removal-on-cancel.
///
/// Returns `Ok(false)` when the workload should silently *not* be queued: it
/// was canceled before reaching the queue (e.g. a cancellation token firing
/// between build and enqueue) and is already terminal. A workload that is
/// already `Scheduled` is accepted; that is the requeue shape used when a
/// removed child's stragglers are drained into the local leaf.
pub(crate) fn bind_and_schedule<H: Handle, Q>(
    workload: &WorkloadRef<H>,
    qdisc: &Weak<Q>,
) -> Result<bool, SchedulerError>
where
    Q: Qdisc<H> + 'static,
{
    match workload.workload().try_schedule() {
        Ok(()) | Err(Lifecycle::Scheduled) => {}
        Err(Lifecycle::Canceled) => {
            tracing::debug!(workload = %workload.id(), "workload canceled before it reached a queue");
            return Ok(false);
        }
        Err(stage) => {
            tracing::error!(workload = %workload.id(), ?stage, "enqueue in illegal stage");
            return Err(SchedulerError::Inconsistency(
                "workload enqueued in a stage that cannot be scheduled",
            ));
        }
    }
    let weak: Weak<dyn Qdisc<H>> = qdisc.clone();
    workload.workload().bind(weak);
    Ok(true)
}

/// Shared leaf routing: a leaf is the end of a route iff the handle matches.
pub(crate) fn route_to_leaf<H: Handle, Q>(
    requested: H,
    own: H,
    self_ref: &Weak<Q>,
) -> Option<RoutingPath<H>>
where
    Q: Qdisc<H> + 'static,
{
    if requested == own && requested != H::default() {
        let leaf: Arc<dyn Qdisc<H>> = self_ref.upgrade()?;
        Some(RoutingPath {
            hops: Vec::new(),
            leaf,
        })
    } else {
        None
    }
}

pub(crate) fn collect_leaf_handle<H: Handle>(handle: H, out: &mut Vec<H>) {
    if handle != H::default() {
        out.push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{self, noop_workload};

    #[test]
    fn fifo_order_single_consumer() {
        test_util::trace_init();
        let fifo = Fifo::new(1_u32);
        let workloads: Vec<_> = (0..4).map(|_| noop_workload()).collect();
        for workload in &workloads {
            fifo.enqueue(workload.clone()).unwrap();
        }

        for expected in &workloads {
            let got = fifo.try_dequeue(0, false).unwrap();
            assert!(got.ptr_eq(expected));
        }
        assert!(fifo.is_empty());
        assert!(fifo.try_dequeue(0, false).is_none());
    }

    #[test]
    fn peek_does_not_remove() {
        let fifo = Fifo::new(1_u32);
        let workload = noop_workload();
        fifo.enqueue(workload.clone()).unwrap();

        assert!(fifo.try_peek_unsafe(0).unwrap().ptr_eq(&workload));
        assert_eq!(fifo.len(), 1);
    }

    #[test]
    fn remove_specific_workload() {
        let fifo = Fifo::new(1_u32);
        let first = noop_workload();
        let second = noop_workload();
        fifo.enqueue(first.clone()).unwrap();
        fifo.enqueue(second.clone()).unwrap();

        assert!(fifo.try_remove(&first));
        assert!(!fifo.try_remove(&first));
        assert!(fifo.try_dequeue(0, false).unwrap().ptr_eq(&second));
    }

    #[test]
    fn completed_fifo_rejects_enqueues() {
        let fifo = Fifo::new(1_u32);
        fifo.enqueue(noop_workload()).unwrap();
        fifo.complete();

        assert_eq!(fifo.enqueue(noop_workload()), Err(SchedulerError::Closed));
        // draining still works
        assert!(fifo.try_dequeue(0, false).is_some());
    }

    #[test]
    fn classification_by_own_predicate() {
        let fifo = Fifo::with_predicate(
            1_u32,
            Some(Predicate::of::<&'static str>(|s| s.starts_with("match"))),
        );

        assert!(fifo.can_classify(&"match me"));
        assert!(!fifo.can_classify(&"nope"));
        assert!(fifo.try_enqueue(&"match me", noop_workload()).unwrap());
        assert!(!fifo.try_enqueue(&"nope", noop_workload()).unwrap());
        assert_eq!(fifo.len(), 1);
    }

    #[test]
    fn route_resolves_own_handle_only() {
        let fifo = Fifo::new(3_u32);
        assert!(fifo.try_find_route(3).is_some());
        assert!(fifo.try_find_route(4).is_none());
        // the default handle is reserved for anonymous qdiscs
        assert!(fifo.try_find_route(0).is_none());
    }

    #[test]
    fn cancel_removes_from_queue() {
        let fifo = Fifo::new(1_u32);
        let workload = noop_workload();
        fifo.enqueue(workload.clone()).unwrap();

        assert!(workload.try_cancel());
        assert!(fifo.is_empty());
    }
}
