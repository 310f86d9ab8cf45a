// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The qdisc tree: capability traits, parent linkage and classification.
//!
//! A qdisc is a node of the scheduling tree, either a *classless* leaf
//! holding workloads ([`Fifo`], [`Lifo`], [`BoundedFifo`], [`BoundedLifo`])
//! or a *classful* router owning an ordered list of children
//! ([`RoundRobin`], [`WeightedFair`]). The tree is strictly acyclic: every
//! qdisc has exactly one parent after binding (the root's parent is the
//! worker pool), and detaching writes a `Completed` sentinel into the parent
//! slot that makes further enqueues fail with
//! [`SchedulerError::Closed`].
//!
//! Every enqueue into a leaf notifies the parent chain: each classful parent
//! marks the notifying child's bit in its emptiness bitmap and passes the
//! notification up until it reaches the worker pool, which may claim a
//! worker slot. Workers clear those bits through the bitmap's token CAS when
//! they observe a child empty, which cannot race-lose against a concurrent
//! producer (see the `concurrent-bitmap` crate docs).

mod bounded;
mod classful;
mod fifo;
mod lifo;
mod round_robin;
mod weighted_fair;

pub use bounded::{BoundedFifo, BoundedLifo};
pub use fifo::Fifo;
pub use lifo::Lifo;
pub use round_robin::RoundRobin;
pub use weighted_fair::{WeightedFair, WeightedFairConfig};

pub(crate) use classful::{Child, ChildSet, MAX_CHILDREN};

use crate::error::SchedulerError;
use crate::loom::sync::{Arc, Mutex, Weak};
use crate::workload::{WorkloadRef, lock};
use core::any::Any;
use core::fmt;
use core::hash::Hash;

/// Bound for caller-chosen qdisc identifiers.
///
/// `H::default()` is reserved for anonymous qdiscs (local leaves, unnamed
/// roots); handle-addressed routing only considers non-default handles.
pub trait Handle:
    Copy + Eq + Hash + Default + fmt::Debug + Send + Sync + 'static
{
}

impl<T> Handle for T where T: Copy + Eq + Hash + Default + fmt::Debug + Send + Sync + 'static {}

/// A classification predicate over caller-supplied state.
///
/// Predicates are typed at construction and run against `&dyn Any`: state of
/// any other type simply does not match.
pub struct Predicate(Box<dyn Fn(&dyn Any) -> bool + Send + Sync>);

// === impl Predicate ===

impl Predicate {
    /// A predicate matching state of type `T` for which `matches` holds.
    pub fn of<T: 'static>(matches: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self(Box::new(move |state| {
            state.downcast_ref::<T>().is_some_and(&matches)
        }))
    }

    /// The disjunction of `predicates`; matches if any of them does.
    #[must_use]
    pub fn any_of(predicates: Vec<Predicate>) -> Self {
        Self(Box::new(move |state| {
            predicates.iter().any(|predicate| predicate.matches(state))
        }))
    }

    pub(crate) fn matches(&self, state: &dyn Any) -> bool {
        (self.0)(state)
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Predicate(..)")
    }
}

/// Identity of a qdisc, used by parents to locate the notifying child in
/// their emptiness bitmap.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct QdiscId(usize);

impl QdiscId {
    pub(crate) fn of<T: ?Sized>(qdisc: &T) -> Self {
        Self(core::ptr::from_ref(qdisc).cast::<()>().addr())
    }

    pub(crate) fn of_arc<H: Handle>(qdisc: &Arc<dyn Qdisc<H>>) -> Self {
        Self(Arc::as_ptr(qdisc).cast::<()>().addr())
    }
}

/// The single-writer parent slot of a qdisc.
pub enum ParentLink<H: Handle> {
    /// Not yet attached to a tree.
    Unbound,
    /// Attached; the referent is the parent qdisc or the worker pool.
    Bound(Weak<dyn ParentNotify<H>>),
    /// Detached for good; the sentinel parent rejects all new work.
    Completed,
}

impl<H: Handle> fmt::Debug for ParentLink<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParentLink::Unbound => f.pad("Unbound"),
            ParentLink::Bound(_) => f.pad("Bound(..)"),
            ParentLink::Completed => f.pad("Completed"),
        }
    }
}

/// Upward notification seam of the tree.
///
/// Implemented by classful qdiscs (mark the child's bit, notify own parent)
/// and by the worker pool (claim a worker slot).
pub trait ParentNotify<H: Handle>: Send + Sync {
    /// Called by `child` after every enqueue anywhere in its subtree.
    fn on_child_enqueued(&self, child: QdiscId);
}

/// A resolved root-to-leaf route for handle-addressed scheduling.
///
/// Walking the path lets every classful node update its emptiness tracking
/// before the enqueue commits, without re-running classification predicates.
/// Opaque to callers; produced by [`Qdisc::try_find_route`] and consumed by
/// the factory.
pub struct RoutingPath<H: Handle> {
    pub(crate) hops: Vec<(Arc<dyn Qdisc<H>>, usize)>,
    pub(crate) leaf: Arc<dyn Qdisc<H>>,
}

impl<H: Handle> RoutingPath<H> {
    /// Marks the emptiness bits along the path, then enqueues at the leaf.
    pub(crate) fn enqueue(&self, workload: WorkloadRef<H>) -> Result<(), SchedulerError> {
        for (qdisc, offset) in &self.hops {
            qdisc.will_enqueue_from_routing_path(*offset);
        }
        self.leaf.enqueue(workload)
    }
}

impl<H: Handle> fmt::Debug for RoutingPath<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingPath")
            .field("hops", &self.hops.len())
            .field("leaf", &self.leaf.handle())
            .finish()
    }
}

/// A node in the scheduling tree.
///
/// Object-safe so trees mix leaf shapes and policies freely; classful
/// qdiscs additionally implement [`ClassfulQdisc`].
pub trait Qdisc<H: Handle>: Send + Sync + fmt::Debug {
    /// This qdisc's handle; `H::default()` for anonymous qdiscs.
    fn handle(&self) -> H;

    /// This qdisc's identity (see [`QdiscId`]).
    fn id(&self) -> QdiscId;

    /// `true` iff no descendant holds a pending workload.
    ///
    /// For classful qdiscs this consults the per-child emptiness bitmap
    /// (O(children), no descent) and is therefore a conservative snapshot
    /// under concurrent enqueues.
    fn is_empty(&self) -> bool;

    /// Hands `workload` to this qdisc directly (for classful qdiscs: to the
    /// local leaf), transferring ownership and notifying the parent chain.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Closed`] after the qdisc was completed;
    /// [`SchedulerError::Inconsistency`] if the workload is in a stage that
    /// can never legally be enqueued.
    fn enqueue(&self, workload: WorkloadRef<H>) -> Result<(), SchedulerError>;

    /// `true` iff this qdisc's own predicate matches `state` or any child
    /// can classify it.
    fn can_classify(&self, state: &dyn Any) -> bool;

    /// Depth-first classification: delegates to the first child that can
    /// classify `state`, falling back to the own predicate. Returns
    /// `Ok(false)` when no classifier in the subtree matched.
    ///
    /// # Errors
    ///
    /// Same as [`enqueue`](Qdisc::enqueue).
    fn try_enqueue(
        &self,
        state: &dyn Any,
        workload: WorkloadRef<H>,
    ) -> Result<bool, SchedulerError>;

    /// Tests only the own predicate; on match, enqueues directly.
    ///
    /// # Errors
    ///
    /// Same as [`enqueue`](Qdisc::enqueue).
    fn try_enqueue_direct(
        &self,
        state: &dyn Any,
        workload: WorkloadRef<H>,
    ) -> Result<bool, SchedulerError>;

    /// Removes and returns the next workload according to this qdisc's
    /// policy, or `None` iff the qdisc is empty at call time.
    ///
    /// `backtrack` hints that the previous execution on this worker failed
    /// and the same element would be preferred again; policies are free to
    /// ignore it.
    fn try_dequeue(&self, worker_id: usize, backtrack: bool) -> Option<WorkloadRef<H>>;

    /// The workload [`try_dequeue`](Qdisc::try_dequeue) would return next,
    /// without removing it. May be stale under contention.
    fn try_peek_unsafe(&self, worker_id: usize) -> Option<WorkloadRef<H>>;

    /// Best-effort removal of a specific workload (cancellation support).
    /// Queue shapes that cannot remove from the middle return `false`.
    fn try_remove(&self, workload: &WorkloadRef<H>) -> bool;

    /// A worker is about to release its slot; qdiscs may flush worker-local
    /// state.
    fn on_worker_terminated(&self, worker_id: usize);

    /// Detaches this qdisc (and its subtree): the parent slot becomes the
    /// `Completed` sentinel and new enqueues fail with
    /// [`SchedulerError::Closed`]. Pending workloads may still be dequeued.
    fn complete(&self);

    /// Initializes the parent slot.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Inconsistency`] if the qdisc is already bound,
    /// [`SchedulerError::Closed`] if it was completed.
    fn bind_parent(&self, parent: ParentLink<H>) -> Result<(), SchedulerError>;

    /// DFS for the qdisc with the given (non-default) handle; returns the
    /// root-to-leaf path used by enqueue-by-handle.
    fn try_find_route(&self, handle: H) -> Option<RoutingPath<H>>;

    /// Appends the non-default handles of this subtree, for duplicate
    /// validation when attaching children.
    fn collect_handles(&self, out: &mut Vec<H>);

    /// Pre-commit emptiness marking during a routing-path walk; meaningful
    /// for classful qdiscs only.
    fn will_enqueue_from_routing_path(&self, child_offset: usize) {
        let _ = child_offset;
    }
}

/// Child management surface of classful qdiscs.
pub trait ClassfulQdisc<H: Handle>: Qdisc<H> {
    /// Attaches `child` with an optional classification predicate.
    ///
    /// # Errors
    ///
    /// [`ConfigError::DuplicateHandle`](crate::ConfigError::DuplicateHandle)
    /// if a non-default handle in the child's subtree collides,
    /// [`ConfigError::FanOutExceeded`](crate::ConfigError::FanOutExceeded)
    /// past [`MAX_CHILDREN`] children, [`SchedulerError::Closed`] if this
    /// qdisc was completed, [`SchedulerError::Inconsistency`] if the child
    /// is already bound elsewhere.
    fn try_add_child(
        &self,
        child: Arc<dyn Qdisc<H>>,
        predicate: Option<Predicate>,
    ) -> Result<(), SchedulerError>;

    /// Non-blocking removal: if the child with `handle` is empty it is
    /// completed, drained and detached (`Ok(true)`); otherwise `Ok(false)`.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::UnknownHandle`] if no direct child carries `handle`.
    fn try_remove_child(&self, handle: H) -> Result<bool, SchedulerError>;

    /// Blocking removal: waits for the child to drain, then detaches it.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::UnknownHandle`] if no direct child carries `handle`.
    fn remove_child(&self, handle: H) -> Result<(), SchedulerError>;
}

/// The handle/parent plumbing shared by every qdisc shape.
pub(crate) struct QdiscCore<H: Handle> {
    handle: H,
    parent: Mutex<ParentLink<H>>,
}

// === impl QdiscCore ===

impl<H: Handle> QdiscCore<H> {
    pub(crate) fn new(handle: H) -> Self {
        Self {
            handle,
            parent: Mutex::new(ParentLink::Unbound),
        }
    }

    pub(crate) fn handle(&self) -> H {
        self.handle
    }

    /// Fails with [`SchedulerError::Closed`] once the qdisc was completed.
    pub(crate) fn ensure_open(&self) -> Result<(), SchedulerError> {
        if matches!(*lock(&self.parent), ParentLink::Completed) {
            Err(SchedulerError::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn bind_parent(&self, link: ParentLink<H>) -> Result<(), SchedulerError> {
        let mut parent = lock(&self.parent);
        match *parent {
            ParentLink::Unbound => {
                *parent = link;
                Ok(())
            }
            ParentLink::Bound(_) => Err(SchedulerError::Inconsistency(
                "qdisc is already bound to a parent",
            )),
            ParentLink::Completed => Err(SchedulerError::Closed),
        }
    }

    /// Writes the `Completed` sentinel into the parent slot.
    pub(crate) fn complete(&self) {
        *lock(&self.parent) = ParentLink::Completed;
    }

    /// Reports an enqueue in the subtree of `child` (usually the caller
    /// itself) to the parent, if any.
    pub(crate) fn notify_enqueued(&self, child: QdiscId) {
        let parent = {
            let parent = lock(&self.parent);
            match &*parent {
                ParentLink::Bound(weak) => weak.upgrade(),
                ParentLink::Unbound | ParentLink::Completed => None,
            }
        };
        if let Some(parent) = parent {
            parent.on_child_enqueued(child);
        }
    }

    pub(crate) fn parent_debug(&self) -> &'static str {
        match &*lock(&self.parent) {
            ParentLink::Unbound => "unbound",
            ParentLink::Bound(_) => "bound",
            ParentLink::Completed => "completed",
        }
    }
}

impl<H: Handle> fmt::Debug for QdiscCore<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QdiscCore")
            .field("handle", &self.handle)
            .field("parent", &self.parent_debug())
            .finish()
    }
}
