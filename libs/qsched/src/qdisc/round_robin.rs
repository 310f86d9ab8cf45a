// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::SchedulerError;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::loom::sync::{Arc, Weak};
use crate::qdisc::classful::{Child, ChildSet};
use crate::qdisc::{
    ClassfulQdisc, Fifo, Handle, ParentLink, ParentNotify, Predicate, Qdisc, QdiscCore, QdiscId,
    RoutingPath,
};
use crate::workload::WorkloadRef;
use core::any::Any;
use core::fmt;
use crossbeam_utils::Backoff;

/// Classful round-robin qdisc.
///
/// Serves its children in rotation, skipping children whose bit in the
/// emptiness bitmap is clear, so fully idle subtrees cost nothing. The
/// rotation cursor is advanced with an atomic fetch-add, which also breaks
/// ties between workers arriving simultaneously: each gets a distinct scan
/// start.
pub struct RoundRobin<H: Handle> {
    core: QdiscCore<H>,
    children: ChildSet<H, ()>,
    /// Index of the child the next scan starts at.
    next: AtomicUsize,
    self_ref: Weak<Self>,
}

// === impl RoundRobin ===

impl<H: Handle> RoundRobin<H> {
    /// Creates a round-robin qdisc.
    pub fn new(handle: H) -> Arc<Self> {
        Self::with_predicate(handle, None)
    }

    /// Creates a round-robin qdisc with an own classification predicate
    /// (matched by the implicit local leaf).
    pub fn with_predicate(handle: H, predicate: Option<Predicate>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref: &Weak<Self>| {
            let local = Fifo::new(H::default());
            let parent: Weak<dyn ParentNotify<H>> = self_ref.clone();
            local
                .bind_parent(ParentLink::Bound(parent))
                .expect("freshly created local leaf is unbound");
            Self {
                core: QdiscCore::new(handle),
                children: ChildSet::new(local, predicate, ()),
                next: AtomicUsize::new(0),
                self_ref: self_ref.clone(),
            }
        })
    }

    fn self_notify(&self) -> Weak<dyn ParentNotify<H>> {
        self.self_ref.clone()
    }

    fn drain_into_local(&self, entry: &Child<H, ()>) {
        let local = Arc::clone(&self.children.read()[0].qdisc);
        while let Some(straggler) = entry.qdisc.try_dequeue(0, false) {
            if let Err(error) = local.enqueue(straggler) {
                tracing::error!(%error, "failed to drain removed child into local leaf");
                break;
            }
        }
    }
}

impl<H: Handle> Qdisc<H> for RoundRobin<H> {
    fn handle(&self) -> H {
        self.core.handle()
    }

    fn id(&self) -> QdiscId {
        QdiscId::of(self)
    }

    fn is_empty(&self) -> bool {
        self.children.bitmap().is_empty()
    }

    fn enqueue(&self, workload: WorkloadRef<H>) -> Result<(), SchedulerError> {
        self.core.ensure_open()?;
        // the local leaf notifies us back, which marks bit 0 and propagates
        let local = Arc::clone(&self.children.read()[0].qdisc);
        local.enqueue(workload)
    }

    fn can_classify(&self, state: &dyn Any) -> bool {
        self.children.can_classify(state)
    }

    fn try_enqueue(
        &self,
        state: &dyn Any,
        workload: WorkloadRef<H>,
    ) -> Result<bool, SchedulerError> {
        self.core.ensure_open()?;
        self.children.classify_enqueue(state, workload)
    }

    fn try_enqueue_direct(
        &self,
        state: &dyn Any,
        workload: WorkloadRef<H>,
    ) -> Result<bool, SchedulerError> {
        self.core.ensure_open()?;
        self.children.enqueue_direct(state, workload)
    }

    fn try_dequeue(&self, worker_id: usize, backtrack: bool) -> Option<WorkloadRef<H>> {
        let children = self.children.read();
        let n = children.len();
        let bitmap = self.children.bitmap();
        let backoff = Backoff::new();

        loop {
            let start = self.next.fetch_add(1, Ordering::Relaxed) % n;
            for offset in 0..n {
                let index = (start + offset) % n;
                if !bitmap.is_bit_set(index).unwrap_or(false) {
                    continue;
                }
                if let Some(workload) = children[index].qdisc.try_dequeue(worker_id, backtrack) {
                    self.next.store((index + 1) % n, Ordering::Relaxed);
                    return Some(workload);
                }
                // observed empty: try to clear the bit, losing gracefully to
                // any producer that slipped in
                self.children.declare_child_empty(&children, index);
            }

            // a full rotation served nothing; re-sample after a short
            // bounded spin so a producer that is between "push" and "mark"
            // is not declared away
            if bitmap.is_empty() {
                if backoff.is_completed() {
                    return None;
                }
                backoff.snooze();
            }
        }
    }

    fn try_peek_unsafe(&self, worker_id: usize) -> Option<WorkloadRef<H>> {
        let children = self.children.read();
        let n = children.len();
        let start = self.next.load(Ordering::Relaxed) % n;
        for offset in 0..n {
            let index = (start + offset) % n;
            if !self.children.bitmap().is_bit_set(index).unwrap_or(false) {
                continue;
            }
            if let Some(workload) = children[index].qdisc.try_peek_unsafe(worker_id) {
                return Some(workload);
            }
        }
        None
    }

    fn try_remove(&self, workload: &WorkloadRef<H>) -> bool {
        self.children.try_remove(workload)
    }

    fn on_worker_terminated(&self, worker_id: usize) {
        self.children.on_worker_terminated(worker_id);
    }

    fn complete(&self) {
        self.core.complete();
        self.children.complete_children();
    }

    fn bind_parent(&self, parent: ParentLink<H>) -> Result<(), SchedulerError> {
        self.core.bind_parent(parent)
    }

    fn try_find_route(&self, handle: H) -> Option<RoutingPath<H>> {
        let self_arc: Arc<dyn Qdisc<H>> = self.self_ref.upgrade()?;
        self.children.find_route(self_arc, self.handle(), handle)
    }

    fn collect_handles(&self, out: &mut Vec<H>) {
        self.children.collect_handles(self.handle(), out);
    }

    fn will_enqueue_from_routing_path(&self, child_offset: usize) {
        self.children.mark_offset(child_offset);
    }
}

impl<H: Handle> ParentNotify<H> for RoundRobin<H> {
    fn on_child_enqueued(&self, child: QdiscId) {
        if !self.children.mark_child_enqueued(child) {
            // the child raced a removal; its workloads get drained into the
            // local leaf, so waking the chain is still correct
            tracing::warn!("enqueue notification from a detached child");
        }
        self.core.notify_enqueued(self.id());
    }
}

impl<H: Handle> ClassfulQdisc<H> for RoundRobin<H> {
    fn try_add_child(
        &self,
        child: Arc<dyn Qdisc<H>>,
        predicate: Option<Predicate>,
    ) -> Result<(), SchedulerError> {
        self.core.ensure_open()?;
        self.children.add(self.self_notify(), child, predicate, ())
    }

    fn try_remove_child(&self, handle: H) -> Result<bool, SchedulerError> {
        match self.children.remove(handle, false)? {
            Some(entry) => {
                self.drain_into_local(&entry);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn remove_child(&self, handle: H) -> Result<(), SchedulerError> {
        let entry = self
            .children
            .remove(handle, true)?
            .expect("blocking removal always detaches");
        self.drain_into_local(&entry);
        Ok(())
    }
}

impl<H: Handle> fmt::Debug for RoundRobin<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoundRobin")
            .field("handle", &self.handle())
            .field("children", &self.children)
            .field("next", &self.next.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use crate::test_util::{self, noop_workload};

    fn three_fifo_children() -> (Arc<RoundRobin<u32>>, Vec<Arc<Fifo<u32>>>) {
        let rr = RoundRobin::new(10_u32);
        let children: Vec<_> = (1..=3).map(Fifo::new).collect();
        for child in &children {
            rr.try_add_child(child.clone(), None).unwrap();
        }
        (rr, children)
    }

    #[test]
    fn rotation_over_three_children() {
        test_util::trace_init();
        let (rr, children) = three_fifo_children();

        // A,A,A,B,B,B,C,C,C
        let mut expected_rotation = Vec::new();
        let mut per_child = vec![Vec::new(); 3];
        for (child_index, child) in children.iter().enumerate() {
            for _ in 0..3 {
                let workload = noop_workload();
                per_child[child_index].push(workload.clone());
                child.enqueue(workload).unwrap();
            }
        }
        // first of A, first of B, first of C, second of A, ...
        for round in 0..3 {
            for queue in &per_child {
                expected_rotation.push(queue[round].clone());
            }
        }

        for expected in &expected_rotation {
            let got = rr.try_dequeue(0, false).expect("workload available");
            assert!(got.ptr_eq(expected), "rotation order violated");
        }
        assert!(rr.try_dequeue(0, false).is_none());
        assert!(rr.is_empty());
    }

    #[test]
    fn empty_children_are_skipped() {
        let (rr, children) = three_fifo_children();
        let workload = noop_workload();
        children[2].enqueue(workload.clone()).unwrap();

        assert!(rr.try_dequeue(0, false).unwrap().ptr_eq(&workload));
        assert!(rr.try_dequeue(0, false).is_none());
    }

    #[test]
    fn direct_enqueue_lands_in_the_local_leaf() {
        let (rr, _children) = three_fifo_children();
        let workload = noop_workload();
        rr.enqueue(workload.clone()).unwrap();

        assert!(!rr.is_empty());
        assert!(rr.try_dequeue(0, false).unwrap().ptr_eq(&workload));
    }

    #[test]
    fn classification_delegates_to_children() {
        let rr = RoundRobin::with_predicate(
            10_u32,
            Some(Predicate::of::<i64>(|_| true)),
        );
        let evens = Fifo::new(1_u32);
        rr.try_add_child(evens.clone(), Some(Predicate::of::<u32>(|value| value % 2 == 0)))
            .unwrap();

        assert!(rr.try_enqueue(&4_u32, noop_workload()).unwrap());
        assert_eq!(evens.len(), 1);

        // odd numbers match no child, and the own predicate only takes i64
        assert!(!rr.try_enqueue(&3_u32, noop_workload()).unwrap());

        // the own predicate routes to the local leaf
        assert!(rr.try_enqueue(&3_i64, noop_workload()).unwrap());
        assert_eq!(evens.len(), 1);
        assert!(rr.can_classify(&3_i64));
    }

    #[test]
    fn duplicate_handles_are_rejected() {
        let (rr, _children) = three_fifo_children();
        assert_eq!(
            rr.try_add_child(Fifo::new(2_u32), None),
            Err(SchedulerError::Configuration(ConfigError::DuplicateHandle))
        );
    }

    #[test]
    fn bound_children_cannot_be_attached_twice() {
        let (rr, children) = three_fifo_children();
        let other = RoundRobin::new(20_u32);
        assert!(matches!(
            other.try_add_child(children[0].clone(), None),
            Err(SchedulerError::Inconsistency(_))
        ));
        let _ = rr;
    }

    #[test]
    fn routing_descends_to_the_right_leaf() {
        let (rr, children) = three_fifo_children();
        let route = rr.try_find_route(2).expect("handle 2 exists");
        assert_eq!(route.hops.len(), 1);

        let workload = noop_workload();
        route.enqueue(workload.clone()).unwrap();
        assert_eq!(children[1].len(), 1);
        assert!(rr.try_dequeue(0, false).unwrap().ptr_eq(&workload));
    }

    #[test]
    fn remove_child_drains_stragglers_into_local() {
        let (rr, children) = three_fifo_children();
        let workload = noop_workload();
        children[0].enqueue(workload.clone()).unwrap();

        // non-blocking removal refuses while the child holds work
        assert!(!rr.try_remove_child(1).unwrap());

        let got = rr.try_dequeue(0, false).unwrap();
        assert!(got.ptr_eq(&workload));
        assert!(rr.try_remove_child(1).unwrap());

        // the detached child rejects new work
        assert_eq!(
            children[0].enqueue(noop_workload()),
            Err(SchedulerError::Closed)
        );
        assert_eq!(rr.try_remove_child(1), Err(SchedulerError::UnknownHandle));
    }

    #[test]
    fn complete_cascades() {
        let (rr, children) = three_fifo_children();
        rr.complete();
        assert_eq!(rr.enqueue(noop_workload()), Err(SchedulerError::Closed));
        assert_eq!(
            children[0].enqueue(noop_workload()),
            Err(SchedulerError::Closed)
        );
    }

    #[test]
    fn fan_out_limit() {
        let rr = RoundRobin::new(0_u32);
        // child 0 is the local leaf, so MAX_CHILDREN - 1 more fit
        for handle in 1..crate::qdisc::MAX_CHILDREN {
            rr.try_add_child(Fifo::new(u32::try_from(handle).unwrap()), None)
                .unwrap();
        }
        assert!(matches!(
            rr.try_add_child(Fifo::new(9999), None),
            Err(SchedulerError::Configuration(ConfigError::FanOutExceeded { .. }))
        ));
    }
}
