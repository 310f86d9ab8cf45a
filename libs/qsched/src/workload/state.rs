// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use core::fmt;

/// Workload state. The workload stores its state in an atomic `usize` with
/// bitfields for the necessary information:
///
/// ```text
/// | 4                     4 | 3               3 | 2         0 |
/// | continuations invoked   | cancel requested  |  lifecycle  |
/// ```
///
/// Every transition runs inside a CAS loop and returns an action enum telling
/// the caller what follow-up work (result publication, continuation dispatch,
/// queue removal) it owes.
pub(crate) struct State {
    val: AtomicUsize,
}

mycelium_bitfield::bitfield! {
    /// A snapshot of a workload's current state.
    #[derive(PartialEq, Eq)]
    pub(crate) struct Snapshot<usize> {
        /// The lifecycle stage the workload is currently in.
        pub(crate) const LIFECYCLE: Lifecycle;
        /// If set, cooperative cancellation has been requested while the
        /// workload was already running. The payload observes this through
        /// its cancellation flag; the scheduler never interrupts the thread.
        pub(crate) const CANCEL_REQUESTED: bool;
        /// If set, continuation dispatch for this workload has begun. OR-ed
        /// onto the terminal lifecycle so racing appenders can see that they
        /// may have to run their callback themselves.
        pub(crate) const CONTINUATIONS_INVOKED: bool;
    }
}

/// The stages a workload moves through, in the only legal order:
///
/// ```text
/// Pooled ──init──▶ Created ──schedule──▶ Scheduled ──run──▶ Running
///                                │                            │──ok──▶ RanToCompletion
///                                │──cancel before run──▶      │──err──▶ Faulted
///                                ▼                            │──coop. cancel──▶
///                             Canceled ◀──────────────────────┘
/// ```
///
/// `RanToCompletion`, `Canceled` and `Faulted` are terminal; a workload is
/// never demoted out of them (pool recycling excepted, which requires
/// exclusive ownership).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Lifecycle {
    /// Resting in the anonymous-workload pool; not yet (re)initialized.
    Pooled = 0,
    /// Initialized but not yet handed to a qdisc.
    Created = 1,
    /// Owned by a qdisc, waiting to be dequeued.
    Scheduled = 2,
    /// A worker is executing the payload.
    Running = 3,
    /// The payload returned normally.
    RanToCompletion = 4,
    /// Canceled before running, or the payload honored a cancellation
    /// request.
    Canceled = 5,
    /// The payload panicked.
    Faulted = 6,
}

impl Lifecycle {
    /// Whether this stage ends the workload's life.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Lifecycle::RanToCompletion | Lifecycle::Canceled | Lifecycle::Faulted
        )
    }
}

#[must_use]
pub(crate) enum ScheduleAction {
    /// The workload is now `Scheduled` and may be handed to a qdisc.
    Scheduled,
    /// The workload was not `Created`; enqueuing it would be a scheduler bug.
    Illegal(Lifecycle),
}

#[must_use]
pub(crate) enum StartRunAction {
    /// Successful transition, execute the payload.
    Run,
    /// A cancellation won the race between dequeue and execution; skip the
    /// payload, the canceling thread has already published the result.
    CanceledBeforeRun,
    /// The workload was in a stage it can never legally be dequeued in.
    Illegal(Lifecycle),
}

#[must_use]
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum CancelAction {
    /// `Created`/`Scheduled` → `Canceled`; the caller owes result
    /// publication, queue removal and continuation dispatch.
    CanceledBeforeRun,
    /// The workload is running; the cooperative flag was raised.
    Requested,
    /// The cooperative flag was already raised by an earlier call.
    AlreadyRequested,
    /// Terminal or pooled; there is nothing to cancel.
    Uncancellable,
}

// === impl State ===

impl State {
    pub(crate) fn new() -> Self {
        Self {
            val: AtomicUsize::new(Snapshot(0).with(Snapshot::LIFECYCLE, Lifecycle::Created).0),
        }
    }

    pub(crate) fn load(&self, ordering: Ordering) -> Snapshot {
        Snapshot(self.val.load(ordering))
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        self.load(Ordering::Acquire).get(Snapshot::LIFECYCLE)
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.lifecycle().is_terminal()
    }

    /// Attempts `Created` → `Scheduled`.
    pub(crate) fn try_schedule(&self) -> ScheduleAction {
        self.transition(|s| {
            let lifecycle = s.get(Snapshot::LIFECYCLE);
            if lifecycle != Lifecycle::Created {
                return ScheduleAction::Illegal(lifecycle);
            }
            s.set(Snapshot::LIFECYCLE, Lifecycle::Scheduled);
            ScheduleAction::Scheduled
        })
    }

    /// Attempts `Scheduled` → `Running`.
    pub(crate) fn start_run(&self) -> StartRunAction {
        self.transition(|s| match s.get(Snapshot::LIFECYCLE) {
            Lifecycle::Scheduled => {
                s.set(Snapshot::LIFECYCLE, Lifecycle::Running);
                StartRunAction::Run
            }
            Lifecycle::Canceled => StartRunAction::CanceledBeforeRun,
            other => StartRunAction::Illegal(other),
        })
    }

    /// `Running` → the given terminal stage.
    pub(crate) fn finish_run(&self, outcome: Lifecycle) {
        debug_assert!(outcome.is_terminal());
        self.transition(|s| {
            debug_assert_eq!(s.get(Snapshot::LIFECYCLE), Lifecycle::Running);
            s.set(Snapshot::LIFECYCLE, outcome);
        });
    }

    /// Requests cancellation; the returned action tells the caller which of
    /// the two cancellation shapes (pre-run or cooperative) applies.
    pub(crate) fn request_cancel(&self) -> CancelAction {
        self.transition(|s| match s.get(Snapshot::LIFECYCLE) {
            Lifecycle::Created | Lifecycle::Scheduled => {
                s.set(Snapshot::LIFECYCLE, Lifecycle::Canceled);
                CancelAction::CanceledBeforeRun
            }
            Lifecycle::Running => {
                if s.get(Snapshot::CANCEL_REQUESTED) {
                    CancelAction::AlreadyRequested
                } else {
                    s.set(Snapshot::CANCEL_REQUESTED, true);
                    CancelAction::Requested
                }
            }
            _ => CancelAction::Uncancellable,
        })
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.load(Ordering::Acquire).get(Snapshot::CANCEL_REQUESTED)
    }

    /// Makes "continuation dispatch has begun" visible to racing appenders.
    pub(crate) fn mark_continuations_invoked(&self) {
        debug_assert!(self.is_terminal());
        self.transition(|s| {
            s.set(Snapshot::CONTINUATIONS_INVOKED, true);
        });
    }

    pub(crate) fn continuations_invoked(&self) -> bool {
        self.load(Ordering::Acquire)
            .get(Snapshot::CONTINUATIONS_INVOKED)
    }

    /// Terminal → `Pooled`, clearing all flags. Returns `false` if the
    /// workload is not eligible for recycling.
    pub(crate) fn release_to_pool(&self) -> bool {
        self.transition(|s| {
            if !s.get(Snapshot::LIFECYCLE).is_terminal() {
                return false;
            }
            *s = Snapshot(0).with(Snapshot::LIFECYCLE, Lifecycle::Pooled);
            true
        })
    }

    /// `Pooled` → `Created` for reuse out of the pool.
    pub(crate) fn reuse_from_pool(&self) {
        self.transition(|s| {
            debug_assert_eq!(s.get(Snapshot::LIFECYCLE), Lifecycle::Pooled);
            *s = Snapshot(0).with(Snapshot::LIFECYCLE, Lifecycle::Created);
        });
    }

    fn transition<T>(&self, mut transition: impl FnMut(&mut Snapshot) -> T) -> T {
        let mut current = self.load(Ordering::Acquire);
        loop {
            let mut next = current;
            let res = transition(&mut next);

            if current.0 == next.0 {
                return res;
            }

            match self.val.compare_exchange_weak(
                current.0,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return res,
                Err(actual) => current = Snapshot(actual),
            }
        }
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}

impl mycelium_bitfield::FromBits<usize> for Lifecycle {
    type Error = core::convert::Infallible;

    /// The number of bits required to represent a value of this type.
    const BITS: u32 = 3;

    #[inline]
    fn try_from_bits(bits: usize) -> Result<Self, Self::Error> {
        match bits {
            b if b == Self::Pooled as usize => Ok(Self::Pooled),
            b if b == Self::Created as usize => Ok(Self::Created),
            b if b == Self::Scheduled as usize => Ok(Self::Scheduled),
            b if b == Self::Running as usize => Ok(Self::Running),
            b if b == Self::RanToCompletion as usize => Ok(Self::RanToCompletion),
            b if b == Self::Canceled as usize => Ok(Self::Canceled),
            b if b == Self::Faulted as usize => Ok(Self::Faulted),
            _ => {
                // this should never happen unless the bitpacking code is broken
                unreachable!("invalid lifecycle {bits:#b}")
            }
        }
    }

    #[inline]
    fn into_bits(self) -> usize {
        self as u8 as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let state = State::new();
        assert_eq!(state.lifecycle(), Lifecycle::Created);

        assert!(matches!(state.try_schedule(), ScheduleAction::Scheduled));
        assert_eq!(state.lifecycle(), Lifecycle::Scheduled);

        assert!(matches!(state.start_run(), StartRunAction::Run));
        assert_eq!(state.lifecycle(), Lifecycle::Running);

        state.finish_run(Lifecycle::RanToCompletion);
        assert!(state.is_terminal());
        assert!(!state.continuations_invoked());

        state.mark_continuations_invoked();
        assert!(state.continuations_invoked());
    }

    #[test]
    fn double_schedule_is_illegal() {
        let state = State::new();
        assert!(matches!(state.try_schedule(), ScheduleAction::Scheduled));
        assert!(matches!(
            state.try_schedule(),
            ScheduleAction::Illegal(Lifecycle::Scheduled)
        ));
    }

    #[test]
    fn cancel_before_run() {
        let state = State::new();
        assert!(matches!(state.try_schedule(), ScheduleAction::Scheduled));

        assert_eq!(state.request_cancel(), CancelAction::CanceledBeforeRun);
        assert_eq!(state.lifecycle(), Lifecycle::Canceled);

        // the worker that raced us must observe the cancellation
        assert!(matches!(state.start_run(), StartRunAction::CanceledBeforeRun));
    }

    #[test]
    fn cooperative_cancel_while_running() {
        let state = State::new();
        assert!(matches!(state.try_schedule(), ScheduleAction::Scheduled));
        assert!(matches!(state.start_run(), StartRunAction::Run));

        assert_eq!(state.request_cancel(), CancelAction::Requested);
        assert!(state.cancel_requested());
        assert_eq!(state.request_cancel(), CancelAction::AlreadyRequested);

        // ignoring the request and completing normally is legal
        state.finish_run(Lifecycle::RanToCompletion);
        assert_eq!(state.request_cancel(), CancelAction::Uncancellable);
    }

    #[test]
    fn pool_cycle() {
        let state = State::new();
        assert!(matches!(state.try_schedule(), ScheduleAction::Scheduled));
        assert!(matches!(state.start_run(), StartRunAction::Run));
        state.finish_run(Lifecycle::Canceled);
        state.mark_continuations_invoked();

        assert!(state.release_to_pool());
        assert_eq!(state.lifecycle(), Lifecycle::Pooled);
        assert!(!state.continuations_invoked());

        state.reuse_from_pool();
        assert_eq!(state.lifecycle(), Lifecycle::Created);
    }

    #[test]
    fn non_terminal_is_not_poolable() {
        let state = State::new();
        assert!(!state.release_to_pool());
    }
}
