// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Weighted-fair / earliest-due-date classful scheduling.
//!
//! Approximates processor sharing: every candidate workload gets a *virtual
//! execution time* (its estimated duration scaled by the inverse of its
//! child's weight), and workers always serve the candidate whose *virtual
//! finish time* is earliest. Execution times are learned at runtime through
//! the per-payload [`VirtualTimeTable`], so the policy adapts to
//! heterogeneous workloads without any caller annotations.

use crate::error::{ConfigError, SchedulerError};
use crate::loom::sync::{Arc, Mutex, MutexGuard, Weak};
use crate::qdisc::classful::{Child, ChildSet};
use crate::qdisc::{
    ClassfulQdisc, Fifo, Handle, ParentLink, ParentNotify, Predicate, Qdisc, QdiscCore, QdiscId,
    RoutingPath,
};
use crate::time::{Clock, Fairness, TimeModel, VirtualTimeTable};
use crate::workload::WorkloadRef;
use core::any::Any;
use core::fmt;
use crossbeam_utils::Backoff;

/// Tuning knobs of a [`WeightedFair`] qdisc.
#[derive(Copy, Clone, Debug)]
pub struct WeightedFairConfig {
    /// Whether virtual finish times chase the wall clock (`ShortTerm`) or
    /// accumulate per child (`LongTerm`).
    pub fairness: Fairness,
    /// Statistic used on the enqueue side to estimate a workload's virtual
    /// execution time.
    pub scheduler_time_model: TimeModel,
    /// Statistic used on the dequeue side to advance the served child's
    /// virtual finish time.
    pub execution_time_model: TimeModel,
    /// Averaging window (and, without precise measurements, the sampling
    /// stop) of the execution time table.
    pub sample_limit: u64,
    /// Keep measuring every execution instead of stopping at `sample_limit`
    /// samples per payload identity.
    pub precise_measurements: bool,
}

impl Default for WeightedFairConfig {
    fn default() -> Self {
        Self {
            fairness: Fairness::LongTerm,
            scheduler_time_model: TimeModel::Average,
            execution_time_model: TimeModel::Average,
            sample_limit: 128,
            precise_measurements: false,
        }
    }
}

/// Per-policy state attached to workloads passing through a weighted-fair
/// qdisc.
struct FairState {
    virtual_execution_time: f64,
}

/// The 1-entry lookahead slot plus accounting of one child.
struct FairSlot<H: Handle> {
    /// The next workload to consider, with its virtual execution time.
    candidate: Option<(WorkloadRef<H>, f64)>,
    /// Monotone non-decreasing between structural modifications.
    last_virtual_finish: f64,
}

pub(crate) struct FairChild<H: Handle> {
    weight: f64,
    punishment: f64,
    slot: Mutex<FairSlot<H>>,
}

impl<H: Handle> FairChild<H> {
    fn new(weight: f64, punishment: f64) -> Self {
        Self {
            weight,
            punishment,
            slot: Mutex::new(FairSlot {
                candidate: None,
                last_virtual_finish: 0.0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FairSlot<H>> {
        self.slot.lock().expect("fair slot lock poisoned")
    }
}

/// Classful weighted-fair / earliest-due-date qdisc.
pub struct WeightedFair<H: Handle> {
    core: QdiscCore<H>,
    children: ChildSet<H, FairChild<H>>,
    config: WeightedFairConfig,
    table: VirtualTimeTable,
    self_ref: Weak<Self>,
}

// === impl WeightedFair ===

impl<H: Handle> WeightedFair<H> {
    /// Creates a weighted-fair qdisc.
    pub fn new(handle: H, config: WeightedFairConfig) -> Arc<Self> {
        Self::with_predicate(handle, config, None)
    }

    /// Creates a weighted-fair qdisc with an own classification predicate.
    pub fn with_predicate(
        handle: H,
        config: WeightedFairConfig,
        predicate: Option<Predicate>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref: &Weak<Self>| {
            let local = Fifo::new(H::default());
            let parent: Weak<dyn ParentNotify<H>> = self_ref.clone();
            local
                .bind_parent(ParentLink::Bound(parent))
                .expect("freshly created local leaf is unbound");
            Self {
                core: QdiscCore::new(handle),
                children: ChildSet::new(local, predicate, FairChild::new(1.0, 1.0)),
                config,
                table: VirtualTimeTable::new(config.sample_limit, config.precise_measurements),
                self_ref: self_ref.clone(),
            }
        })
    }

    /// Attaches `child` with an explicit scheduling weight and execution
    /// punishment factor.
    ///
    /// All per-child virtual finish times are reset to zero so the newcomer
    /// is neither starved nor unfairly favored against accumulated credit.
    ///
    /// # Errors
    ///
    /// Everything [`ClassfulQdisc::try_add_child`] reports, plus
    /// [`ConfigError::InvalidWeight`] for non-positive weights or punishment
    /// factors.
    pub fn try_add_child_weighted(
        &self,
        child: Arc<dyn Qdisc<H>>,
        predicate: Option<Predicate>,
        weight: f64,
        punishment: f64,
    ) -> Result<(), SchedulerError> {
        if !(weight > 0.0) || !(punishment > 0.0) {
            return Err(ConfigError::InvalidWeight.into());
        }
        self.core.ensure_open()?;
        self.children.add(
            self.self_notify(),
            child,
            predicate,
            FairChild::new(weight, punishment),
        )?;
        for entry in self.children.read().iter() {
            entry.state.lock().last_virtual_finish = 0.0;
        }
        Ok(())
    }

    fn self_notify(&self) -> Weak<dyn ParentNotify<H>> {
        self.self_ref.clone()
    }

    /// Virtual execution time of `workload` under `fair`'s weight, from the
    /// scheduler-side time model.
    fn scheduler_estimate(&self, workload: &WorkloadRef<H>, fair: &FairChild<H>) -> f64 {
        let estimate = workload.workload().fingerprint().map_or(0.0, |fingerprint| {
            self.table
                .entry(fingerprint)
                .estimate(self.config.scheduler_time_model)
        });
        estimate * fair.punishment / fair.weight
    }

    /// Attaches the enqueue-side `FairState` to a workload routed through
    /// this qdisc.
    fn attach_fair_state(&self, workload: &WorkloadRef<H>, fair: &FairChild<H>) {
        let virtual_execution_time = self.scheduler_estimate(workload, fair);
        workload
            .workload()
            .attach_scheduler_state(Box::new(FairState {
                virtual_execution_time,
            }));
    }

    /// Strips the attached `FairState` (or derives one for workloads that
    /// entered through a side door, e.g. a routing path).
    fn take_virtual_execution_time(
        &self,
        workload: &WorkloadRef<H>,
        fair: &FairChild<H>,
    ) -> f64 {
        if let Some(state) = workload.workload().take_scheduler_state() {
            match state.downcast::<FairState>() {
                Ok(fair_state) => return fair_state.virtual_execution_time,
                // some other policy's state: put it back untouched
                Err(other) => workload.workload().attach_scheduler_state(other),
            }
        }
        self.scheduler_estimate(workload, fair)
    }

    /// The dequeue-side advance of a child's virtual finish time. Falls back
    /// to the enqueue-side estimate while the execution model has no data.
    fn execution_advance(
        &self,
        workload: &WorkloadRef<H>,
        fair: &FairChild<H>,
        enqueue_estimate: f64,
    ) -> f64 {
        let estimate = workload.workload().fingerprint().map_or(0.0, |fingerprint| {
            self.table
                .entry(fingerprint)
                .estimate(self.config.execution_time_model)
        });
        let advance = estimate * fair.punishment / fair.weight;
        if advance > 0.0 { advance } else { enqueue_estimate }
    }

    /// Refills `slot` from the child's sub-qdisc, or declares the child
    /// empty when both the sub-qdisc and the slot are drained.
    fn repopulate(
        &self,
        children: &[Child<H, FairChild<H>>],
        index: usize,
        slot: &mut FairSlot<H>,
        worker_id: usize,
    ) {
        debug_assert!(slot.candidate.is_none());
        match children[index].qdisc.try_dequeue(worker_id, false) {
            Some(workload) => {
                let vet = self.take_virtual_execution_time(&workload, &children[index].state);
                slot.candidate = Some((workload, vet));
            }
            None => {
                // bit clearing happens under the slot mutex, so "bit set ⇔
                // sub-queue or candidate non-empty" is preserved
                self.children.declare_child_empty(children, index);
            }
        }
    }
}

impl<H: Handle> Qdisc<H> for WeightedFair<H> {
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
        let children = self.children.read();
        self.attach_fair_state(&workload, &children[0].state);
        let local = Arc::clone(&children[0].qdisc);
        drop(children);
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
        let children = self.children.read();
        for entry in children.iter().skip(1) {
            if entry.qdisc.can_classify(state) {
                self.attach_fair_state(&workload, &entry.state);
                return entry.qdisc.try_enqueue(state, workload);
            }
            if entry
                .predicate
                .as_ref()
                .is_some_and(|predicate| predicate.matches(state))
            {
                self.attach_fair_state(&workload, &entry.state);
                entry.qdisc.enqueue(workload)?;
                return Ok(true);
            }
        }
        let local = &children[0];
        if local
            .predicate
            .as_ref()
            .is_some_and(|predicate| predicate.matches(state))
        {
            self.attach_fair_state(&workload, &local.state);
            local.qdisc.enqueue(workload)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn try_enqueue_direct(
        &self,
        state: &dyn Any,
        workload: WorkloadRef<H>,
    ) -> Result<bool, SchedulerError> {
        self.core.ensure_open()?;
        let children = self.children.read();
        let local = &children[0];
        if local
            .predicate
            .as_ref()
            .is_some_and(|predicate| predicate.matches(state))
        {
            self.attach_fair_state(&workload, &local.state);
            local.qdisc.enqueue(workload)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// The earliest-due-date dequeue.
    ///
    /// Fairness overrides backtracking, so the hint is ignored.
    fn try_dequeue(&self, worker_id: usize, _backtrack: bool) -> Option<WorkloadRef<H>> {
        let children = self.children.read();
        let n = children.len();
        let bitmap = self.children.bitmap();
        let backoff = Backoff::new();

        'restart: loop {
            let generation = self.children.generation();
            let now = Clock::now();
            let mut best: Option<(usize, f64)> = None;

            for index in 0..n {
                if !bitmap.is_bit_set(index).unwrap_or(false) {
                    continue;
                }
                let entry = &children[index];
                // skip children another worker is currently repopulating
                let Ok(mut slot) = entry.state.slot.try_lock() else {
                    continue;
                };
                if slot.candidate.is_none() {
                    self.repopulate(&children, index, &mut slot, worker_id);
                }
                let Some((_, virtual_execution_time)) = &slot.candidate else {
                    continue;
                };
                let base = match self.config.fairness {
                    Fairness::ShortTerm => now,
                    Fairness::LongTerm => slot.last_virtual_finish,
                };
                let finish = base + virtual_execution_time;
                if best.is_none_or(|(_, current)| finish < current) {
                    best = Some((index, finish));
                }
            }

            // the candidate set moved under us: our minimum may be stale
            if self.children.generation() != generation {
                continue 'restart;
            }

            let Some((index, _)) = best else {
                if bitmap.is_empty() {
                    if backoff.is_completed() {
                        return None;
                    }
                    backoff.snooze();
                }
                continue 'restart;
            };

            let entry = &children[index];
            let mut slot = entry.state.lock();
            let Some((workload, enqueue_estimate)) = slot.candidate.take() else {
                // lost the claim race, restart the scan
                continue 'restart;
            };

            let advance = self.execution_advance(&workload, &entry.state, enqueue_estimate);
            slot.last_virtual_finish += advance;
            self.repopulate(&children, index, &mut slot, worker_id);
            drop(slot);
            self.children.bump_generation();

            if let Some(fingerprint) = workload.workload().fingerprint()
                && let Some(measurement) = self.table.start_measurement(fingerprint)
            {
                workload.workload().attach_measurement(measurement);
            }
            return Some(workload);
        }
    }

    fn try_peek_unsafe(&self, _worker_id: usize) -> Option<WorkloadRef<H>> {
        let children = self.children.read();
        let now = Clock::now();
        let mut best: Option<(WorkloadRef<H>, f64)> = None;
        for (index, entry) in children.iter().enumerate() {
            if !self.children.bitmap().is_bit_set(index).unwrap_or(false) {
                continue;
            }
            let Ok(slot) = entry.state.slot.try_lock() else {
                continue;
            };
            let candidate = match &slot.candidate {
                Some((workload, vet)) => {
                    let base = match self.config.fairness {
                        Fairness::ShortTerm => now,
                        Fairness::LongTerm => slot.last_virtual_finish,
                    };
                    Some((workload.clone(), base + vet))
                }
                None => entry
                    .qdisc
                    .try_peek_unsafe(_worker_id)
                    .map(|workload| (workload, slot.last_virtual_finish)),
            };
            if let Some((workload, finish)) = candidate
                && best.as_ref().is_none_or(|(_, current)| finish < *current)
            {
                best = Some((workload, finish));
            }
        }
        best.map(|(workload, _)| workload)
    }

    fn try_remove(&self, workload: &WorkloadRef<H>) -> bool {
        if self.children.try_remove(workload) {
            return true;
        }
        // the workload may sit in a candidate slot
        for entry in self.children.read().iter() {
            let mut slot = entry.state.lock();
            if slot
                .candidate
                .as_ref()
                .is_some_and(|(candidate, _)| candidate.ptr_eq(workload))
            {
                slot.candidate = None;
                return true;
            }
        }
        false
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

impl<H: Handle> ParentNotify<H> for WeightedFair<H> {
    fn on_child_enqueued(&self, child: QdiscId) {
        if !self.children.mark_child_enqueued(child) {
            tracing::warn!("enqueue notification from a detached child");
        }
        self.core.notify_enqueued(self.id());
    }
}

impl<H: Handle> ClassfulQdisc<H> for WeightedFair<H> {
    fn try_add_child(
        &self,
        child: Arc<dyn Qdisc<H>>,
        predicate: Option<Predicate>,
    ) -> Result<(), SchedulerError> {
        self.try_add_child_weighted(child, predicate, 1.0, 1.0)
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

impl<H: Handle> WeightedFair<H> {
    fn drain_into_local(&self, entry: &Child<H, FairChild<H>>) {
        let local = Arc::clone(&self.children.read()[0].qdisc);
        if let Some((candidate, _)) = entry.state.lock().candidate.take()
            && let Err(error) = local.enqueue(candidate)
        {
            tracing::error!(%error, "failed to drain candidate of removed child");
        }
        while let Some(straggler) = entry.qdisc.try_dequeue(0, false) {
            if let Err(error) = local.enqueue(straggler) {
                tracing::error!(%error, "failed to drain removed child into local leaf");
                break;
            }
        }
    }
}

impl<H: Handle> fmt::Debug for WeightedFair<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeightedFair")
            .field("handle", &self.handle())
            .field("children", &self.children)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
