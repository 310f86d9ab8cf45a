// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::{ConfigError, SchedulerError};
use crate::loom::sync::atomic::{AtomicU64, Ordering};
use crate::loom::sync::{Arc, RwLock, RwLockReadGuard, Weak};
use crate::qdisc::{Handle, ParentLink, ParentNotify, Predicate, Qdisc, QdiscId, RoutingPath};
use crate::workload::WorkloadRef;
use concurrent_bitmap::ConcurrentBitmap;
use core::any::Any;
use core::fmt;
use crossbeam_utils::Backoff;
use hashbrown::HashSet;

/// Fixed fan-out limit per classful qdisc.
///
/// One summary word of the emptiness bitmap, and far wider than any
/// practical scheduling tree.
pub(crate) const MAX_CHILDREN: usize = 64;

/// One attached child: the sub-qdisc, its optional classification predicate
/// and per-policy state (`()` for round-robin, the fair slot for
/// weighted-fair).
pub(crate) struct Child<H: Handle, S> {
    pub(crate) qdisc: Arc<dyn Qdisc<H>>,
    pub(crate) predicate: Option<Predicate>,
    pub(crate) state: S,
}

/// The shared core of classful qdiscs: the ordered child array under the
/// child-modification lock, the per-child emptiness bitmap, and a generation
/// counter bumped on every structural change (and, by the weighted-fair
/// policy, on every candidate claim).
///
/// Child 0 is always the owner's implicit local leaf, carrying the owner's
/// own classification predicate.
///
/// Lock order: the child lock is the outermost; per-child policy mutexes
/// nest inside it and are never held across calls into foreign qdiscs other
/// than the child they guard.
pub(crate) struct ChildSet<H: Handle, S> {
    children: RwLock<Vec<Child<H, S>>>,
    bitmap: ConcurrentBitmap,
    generation: AtomicU64,
}

// === impl ChildSet ===

impl<H: Handle, S> ChildSet<H, S> {
    /// Creates the set with the implicit local leaf as child 0.
    pub(crate) fn new(
        local: Arc<dyn Qdisc<H>>,
        own_predicate: Option<Predicate>,
        local_state: S,
    ) -> Self {
        Self {
            children: RwLock::new(vec![Child {
                qdisc: local,
                predicate: own_predicate,
                state: local_state,
            }]),
            bitmap: ConcurrentBitmap::new(1),
            generation: AtomicU64::new(0),
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Vec<Child<H, S>>> {
        self.children.read().expect("child lock poisoned")
    }

    pub(crate) fn bitmap(&self) -> &ConcurrentBitmap {
        &self.bitmap
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Marks the child's bit after an enqueue in its subtree. Returns `false`
    /// if the notifying child is not (or no longer) attached.
    pub(crate) fn mark_child_enqueued(&self, child: QdiscId) -> bool {
        let children = self.read();
        let Some(index) = children
            .iter()
            .position(|entry| QdiscId::of_arc(&entry.qdisc) == child)
        else {
            return false;
        };
        // always bumps the segment token, invalidating concurrent
        // declare-empty attempts
        let _ = self.bitmap.update_bit(index, true);
        true
    }

    /// Pre-commit marking for the routing-path walk.
    pub(crate) fn mark_offset(&self, offset: usize) {
        let _ = self.bitmap.update_bit(offset, true);
    }

    /// Declares child `index` empty, unless a producer interferes: the token
    /// is read first, the child confirmed empty, and the clear committed only
    /// if no mutation of the bit's segment happened in between.
    pub(crate) fn declare_child_empty(&self, children: &[Child<H, S>], index: usize) {
        let Ok(token) = self.bitmap.get_token(index) else {
            return;
        };
        if children[index].qdisc.is_empty() {
            let _ = self.bitmap.try_update_bit(index, token, false);
        }
    }

    /// Attaches a child, binding it to `owner`.
    pub(crate) fn add(
        &self,
        owner: Weak<dyn ParentNotify<H>>,
        child: Arc<dyn Qdisc<H>>,
        predicate: Option<Predicate>,
        state: S,
    ) -> Result<(), SchedulerError> {
        let mut children = self.children.write().expect("child lock poisoned");

        if children.len() >= MAX_CHILDREN {
            return Err(ConfigError::FanOutExceeded { max: MAX_CHILDREN }.into());
        }

        // handle uniqueness across the subtree rooted here plus the incoming
        // subtree; the default handle is exempt (anonymous qdiscs)
        let mut handles = Vec::new();
        for entry in children.iter() {
            entry.qdisc.collect_handles(&mut handles);
        }
        child.collect_handles(&mut handles);
        let mut seen = HashSet::with_capacity(handles.len());
        if handles.iter().any(|handle| !seen.insert(*handle)) {
            return Err(ConfigError::DuplicateHandle.into());
        }

        child.bind_parent(ParentLink::Bound(owner))?;

        let index = children.len();
        self.bitmap.grow(1);
        if !child.is_empty() {
            let _ = self.bitmap.update_bit(index, true);
        }

        children.push(Child {
            qdisc: child,
            predicate,
            state,
        });
        self.bump_generation();
        Ok(())
    }

    /// Detaches the child with `handle`.
    ///
    /// When `block` is set, waits for the child to drain first; otherwise
    /// returns `Ok(None)` if the child still holds work. On success the
    /// removed entry is returned so the caller can drain late stragglers
    /// (and policy state) into its local leaf.
    pub(crate) fn remove(
        &self,
        handle: H,
        block: bool,
    ) -> Result<Option<Child<H, S>>, SchedulerError> {
        let find = |children: &Vec<Child<H, S>>| {
            children
                .iter()
                .skip(1)
                .position(|entry| entry.qdisc.handle() == handle)
                .map(|position| position + 1)
        };

        if block {
            // wait outside the lock so enqueues and workers keep flowing
            let backoff = Backoff::new();
            loop {
                let children = self.read();
                let Some(index) = find(&children) else {
                    return Err(SchedulerError::UnknownHandle);
                };
                if children[index].qdisc.is_empty() {
                    break;
                }
                drop(children);
                if backoff.is_completed() {
                    std::thread::yield_now();
                } else {
                    backoff.snooze();
                }
            }
        }

        let mut children = self.children.write().expect("child lock poisoned");
        let Some(index) = find(&children) else {
            return Err(SchedulerError::UnknownHandle);
        };
        if !block && !children[index].qdisc.is_empty() {
            return Ok(None);
        }

        let entry = children.remove(index);
        entry.qdisc.complete();
        let _ = self.bitmap.remove_bit_at(index, true);
        self.bump_generation();
        Ok(Some(entry))
    }

    /// Depth-first classification over the children, own predicate last.
    pub(crate) fn classify_enqueue(
        &self,
        state: &dyn Any,
        workload: WorkloadRef<H>,
    ) -> Result<bool, SchedulerError> {
        let children = self.read();
        for entry in children.iter().skip(1) {
            if entry.qdisc.can_classify(state) {
                return entry.qdisc.try_enqueue(state, workload);
            }
            if entry
                .predicate
                .as_ref()
                .is_some_and(|predicate| predicate.matches(state))
            {
                entry.qdisc.enqueue(workload)?;
                return Ok(true);
            }
        }
        // fall back to the own predicate: direct enqueue into the local leaf
        let local = &children[0];
        if local
            .predicate
            .as_ref()
            .is_some_and(|predicate| predicate.matches(state))
        {
            local.qdisc.enqueue(workload)?;
            return Ok(true);
        }
        Ok(false)
    }

    pub(crate) fn can_classify(&self, state: &dyn Any) -> bool {
        let children = self.read();
        children.iter().skip(1).any(|entry| {
            entry.qdisc.can_classify(state)
                || entry
                    .predicate
                    .as_ref()
                    .is_some_and(|predicate| predicate.matches(state))
        }) || children[0]
            .predicate
            .as_ref()
            .is_some_and(|predicate| predicate.matches(state))
    }

    /// Own-predicate-only enqueue (the classful `try_enqueue_direct`).
    pub(crate) fn enqueue_direct(
        &self,
        state: &dyn Any,
        workload: WorkloadRef<H>,
    ) -> Result<bool, SchedulerError> {
        let children = self.read();
        let local = &children[0];
        if local
            .predicate
            .as_ref()
            .is_some_and(|predicate| predicate.matches(state))
        {
            local.qdisc.enqueue(workload)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// DFS route resolution; `self_arc` is the owner as a trait object.
    pub(crate) fn find_route(
        &self,
        self_arc: Arc<dyn Qdisc<H>>,
        own_handle: H,
        requested: H,
    ) -> Option<RoutingPath<H>> {
        if requested == H::default() {
            return None;
        }
        let children = self.read();
        if own_handle == requested {
            return Some(RoutingPath {
                leaf: Arc::clone(&children[0].qdisc),
                hops: vec![(self_arc, 0)],
            });
        }
        for (index, entry) in children.iter().enumerate().skip(1) {
            if let Some(mut path) = entry.qdisc.try_find_route(requested) {
                path.hops.insert(0, (self_arc, index));
                return Some(path);
            }
        }
        None
    }

    pub(crate) fn collect_handles(&self, own_handle: H, out: &mut Vec<H>) {
        if own_handle != H::default() {
            out.push(own_handle);
        }
        for entry in self.read().iter().skip(1) {
            entry.qdisc.collect_handles(out);
        }
    }

    /// Best-effort removal across all children.
    pub(crate) fn try_remove(&self, workload: &WorkloadRef<H>) -> bool {
        self.read()
            .iter()
            .any(|entry| entry.qdisc.try_remove(workload))
    }

    /// Completes every child (subtree detach).
    pub(crate) fn complete_children(&self) {
        for entry in self.read().iter() {
            entry.qdisc.complete();
        }
    }

    pub(crate) fn on_worker_terminated(&self, worker_id: usize) {
        for entry in self.read().iter() {
            entry.qdisc.on_worker_terminated(worker_id);
        }
    }
}

impl<H: Handle, S> fmt::Debug for ChildSet<H, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildSet")
            .field("children", &self.read().len())
            .field("bitmap", &self.bitmap)
            .field("generation", &self.generation())
            .finish()
    }
}

