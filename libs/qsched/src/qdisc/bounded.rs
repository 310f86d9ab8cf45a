// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Bounded leaves: fixed-capacity ring buffers that evict on overflow.
//!
//! When full, [`BoundedFifo`] overwrites the *oldest* resident and
//! [`BoundedLifo`] the *current top*; the evicted workload transitions to
//! `Canceled` with reason
//! [`Overwritten`](crate::workload::CancelReason::Overwritten). Capacity is
//! fixed at construction.

use crate::error::{ConfigError, SchedulerError};
use crate::loom::sync::{Arc, Mutex, Weak};
use crate::qdisc::fifo::{bind_and_schedule, collect_leaf_handle, route_to_leaf};
use crate::qdisc::{Handle, ParentLink, Predicate, Qdisc, QdiscCore, QdiscId, RoutingPath};
use crate::workload::{CancelReason, WorkloadRef, lock};
use core::any::Any;
use core::fmt;
use std::collections::VecDeque;

/// Which end of the ring an overflow eviction takes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Overflow {
    /// Evict the oldest resident (bounded FIFO).
    Oldest,
    /// Evict the current top (bounded LIFO).
    Top,
}

/// The shared bounded ring. `VecDeque` with a hard cap; the deque's front is
/// the oldest resident, its back the newest.
struct Ring<H: Handle> {
    core: QdiscCore<H>,
    predicate: Option<Predicate>,
    capacity: usize,
    overflow: Overflow,
    slots: Mutex<VecDeque<WorkloadRef<H>>>,
}

// === impl Ring ===

impl<H: Handle> Ring<H> {
    fn new(
        handle: H,
        predicate: Option<Predicate>,
        capacity: usize,
        overflow: Overflow,
    ) -> Result<Self, SchedulerError> {
        if capacity == 0 {
            return Err(ConfigError::ZeroCapacity.into());
        }
        Ok(Self {
            core: QdiscCore::new(handle),
            predicate,
            capacity,
            overflow,
            slots: Mutex::new(VecDeque::with_capacity(capacity)),
        })
    }

    /// Inserts at the back, evicting per the overflow policy when full.
    ///
    /// The eviction happens outside the ring lock: the evictee's binding is
    /// cleared while the slot lock is held (so its own cancel path will not
    /// re-enter this queue), then it is canceled lock-free.
    fn push(&self, workload: WorkloadRef<H>, id: QdiscId) {
        let evicted = {
            let mut slots = lock(&self.slots);
            let evicted = if slots.len() == self.capacity {
                let evicted = match self.overflow {
                    Overflow::Oldest => slots.pop_front(),
                    Overflow::Top => slots.pop_back(),
                };
                if let Some(evicted) = &evicted {
                    evicted.workload().clear_binding();
                }
                evicted
            } else {
                None
            };
            slots.push_back(workload);
            evicted
        };

        if let Some(evicted) = evicted {
            tracing::debug!(workload = %evicted.id(), "bounded qdisc overwrote a resident");
            evicted.cancel_with(CancelReason::Overwritten);
        }
        self.core.notify_enqueued(id);
    }
}

macro_rules! bounded_qdisc {
    (
        $(#[$meta:meta])*
        $name:ident, $overflow:expr, $dequeue:ident, $peek:ident
    ) => {
        $(#[$meta])*
        pub struct $name<H: Handle> {
            ring: Ring<H>,
            self_ref: Weak<Self>,
        }

        impl<H: Handle> $name<H> {
            /// Creates the qdisc with the given fixed capacity.
            ///
            /// # Errors
            ///
            /// [`ConfigError::ZeroCapacity`] for `capacity == 0`.
            pub fn new(handle: H, capacity: usize) -> Result<Arc<Self>, SchedulerError> {
                Self::with_predicate(handle, capacity, None)
            }

            /// Creates the qdisc with an own classification predicate.
            ///
            /// # Errors
            ///
            /// [`ConfigError::ZeroCapacity`] for `capacity == 0`.
            pub fn with_predicate(
                handle: H,
                capacity: usize,
                predicate: Option<Predicate>,
            ) -> Result<Arc<Self>, SchedulerError> {
                let ring = Ring::new(handle, predicate, capacity, $overflow)?;
                Ok(Arc::new_cyclic(|self_ref| Self {
                    ring,
                    self_ref: self_ref.clone(),
                }))
            }

            /// The fixed capacity.
            pub fn capacity(&self) -> usize {
                self.ring.capacity
            }

            /// The number of resident workloads. Racy, diagnostics only.
            pub fn len(&self) -> usize {
                lock(&self.ring.slots).len()
            }
        }

        impl<H: Handle> Qdisc<H> for $name<H> {
            fn handle(&self) -> H {
                self.ring.core.handle()
            }

            fn id(&self) -> QdiscId {
                QdiscId::of(self)
            }

            fn is_empty(&self) -> bool {
                lock(&self.ring.slots).is_empty()
            }

            fn enqueue(&self, workload: WorkloadRef<H>) -> Result<(), SchedulerError> {
                self.ring.core.ensure_open()?;
                if !bind_and_schedule(&workload, &self.self_ref)? {
                    return Ok(());
                }
                self.ring.push(workload, self.id());
                Ok(())
            }

            fn can_classify(&self, state: &dyn Any) -> bool {
                self.ring
                    .predicate
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
                lock(&self.ring.slots).$dequeue()
            }

            fn try_peek_unsafe(&self, _worker_id: usize) -> Option<WorkloadRef<H>> {
                lock(&self.ring.slots).$peek().cloned()
            }

            fn try_remove(&self, workload: &WorkloadRef<H>) -> bool {
                let mut slots = lock(&self.ring.slots);
                if let Some(index) = slots.iter().position(|resident| resident.ptr_eq(workload)) {
                    slots.remove(index);
                    true
                } else {
                    false
                }
            }

            fn on_worker_terminated(&self, _worker_id: usize) {}

            fn complete(&self) {
                self.ring.core.complete();
            }

            fn bind_parent(&self, parent: ParentLink<H>) -> Result<(), SchedulerError> {
                self.ring.core.bind_parent(parent)
            }

            fn try_find_route(&self, handle: H) -> Option<RoutingPath<H>> {
                route_to_leaf(handle, self.handle(), &self.self_ref)
            }

            fn collect_handles(&self, out: &mut Vec<H>) {
                collect_leaf_handle(self.handle(), out);
            }
        }

        impl<H: Handle> fmt::Debug for $name<H> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("handle", &self.handle())
                    .field("len", &self.len())
                    .field("capacity", &self.capacity())
                    .finish_non_exhaustive()
            }
        }
    };
}

bounded_qdisc! {
    /// Bounded first-in-first-out leaf: a ring of fixed capacity that
    /// overwrites the *oldest* resident when full.
    BoundedFifo, Overflow::Oldest, pop_front, front
}

bounded_qdisc! {
    /// Bounded last-in-first-out leaf: a ring of fixed capacity that
    /// overwrites the *top* (newest resident) when full.
    BoundedLifo, Overflow::Top, pop_back, back
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{self, noop_workload};
    use crate::workload::{Lifecycle, WorkloadResult};

    #[test]
    fn zero_capacity_is_rejected() {
        assert_eq!(
            BoundedFifo::<u32>::new(1, 0).err(),
            Some(SchedulerError::Configuration(ConfigError::ZeroCapacity))
        );
        assert!(BoundedLifo::<u32>::new(1, 0).is_err());
    }

    #[test]
    fn bounded_fifo_evicts_oldest() {
        test_util::trace_init();
        let qdisc = BoundedFifo::new(1_u32, 2).unwrap();
        let workloads: Vec<_> = (0..3).map(|_| noop_workload()).collect();
        for workload in &workloads {
            qdisc.enqueue(workload.clone()).unwrap();
        }

        assert_eq!(qdisc.len(), 2);
        assert_eq!(workloads[0].workload().lifecycle(), Lifecycle::Canceled);
        assert_eq!(
            workloads[0].workload().result(),
            Some(WorkloadResult::Canceled {
                reason: CancelReason::Overwritten
            })
        );

        assert!(qdisc.try_dequeue(0, false).unwrap().ptr_eq(&workloads[1]));
        assert!(qdisc.try_dequeue(0, false).unwrap().ptr_eq(&workloads[2]));
    }

    #[test]
    fn bounded_lifo_overwrite_scenario() {
        // capacity 4, w1..w6: w4 and w5 are overwritten at the top,
        // residents end up {w1, w2, w3, w6}, dequeue order w6, w3, w2, w1
        test_util::trace_init();
        let qdisc = BoundedLifo::new(1_u32, 4).unwrap();
        let workloads: Vec<_> = (0..6).map(|_| noop_workload()).collect();
        for workload in &workloads {
            qdisc.enqueue(workload.clone()).unwrap();
        }

        assert_eq!(qdisc.len(), 4);
        for evicted in [&workloads[3], &workloads[4]] {
            assert_eq!(
                evicted.workload().result(),
                Some(WorkloadResult::Canceled {
                    reason: CancelReason::Overwritten
                })
            );
        }

        for expected in [&workloads[5], &workloads[2], &workloads[1], &workloads[0]] {
            assert!(qdisc.try_dequeue(0, false).unwrap().ptr_eq(expected));
        }
        assert!(qdisc.is_empty());
    }

    #[test]
    fn residency_never_exceeds_capacity() {
        let qdisc = BoundedFifo::new(1_u32, 4).unwrap();
        for _ in 0..32 {
            qdisc.enqueue(noop_workload()).unwrap();
            assert!(qdisc.len() <= 4);
        }
        assert_eq!(qdisc.len(), 4);
    }
}
