// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Workloads: stateful units of deferred work.
//!
//! A [`Workload`] owns a payload closure, a lifecycle state machine, an
//! ordered continuation list and the plumbing for cooperative cancellation.
//! Workloads are handled through [`WorkloadRef`]s — cheap clonable references
//! that transfer queue ownership by hand-off: exactly one qdisc owns a
//! scheduled workload, and dequeuing transfers it to the worker.

mod cancel;
mod id;
mod pool;
mod state;

pub use cancel::{CancellationSource, CancellationToken};
pub use id::Id;
pub use state::Lifecycle;
pub(crate) use pool::WorkloadPool;

use crate::error::Canceled;
use crate::loom::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use crate::loom::sync::{Arc, Mutex, MutexGuard, Weak};
use crate::qdisc::{Handle, Qdisc};
use crate::services::ServiceProvider;
use crate::sync::Event;
use crate::time::{Fingerprint, Measurement};
use crate::workload::state::{CancelAction, ScheduleAction, StartRunAction, State};
use core::any::Any;
use core::fmt;
use core::panic::AssertUnwindSafe;
use core::time::Duration;
use static_assertions::assert_impl_all;

/// The payload closure of a workload.
///
/// Receives the workload's [`WorkloadContext`] (the cancellation flag plus
/// service access) and reports cooperative cancellation by returning
/// [`Canceled`]; panics are trapped at the worker boundary and fault only the
/// workload.
pub type Payload<H> = Box<dyn FnOnce(&WorkloadContext<'_, H>) -> Result<(), Canceled> + Send>;

type Continuation<H> = Box<dyn FnOnce(&WorkloadRef<H>) + Send>;

/// Terminal outcome of a workload.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum WorkloadResult {
    /// The payload returned normally.
    Completed,
    /// The workload was canceled, before or during execution.
    Canceled {
        /// Why the workload was canceled.
        reason: CancelReason,
    },
    /// The payload panicked.
    Faulted {
        /// The panic message.
        message: String,
    },
}

/// Why a workload was canceled.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CancelReason {
    /// [`WorkloadRef::try_cancel`] or an in-payload
    /// [`mark_canceled`](WorkloadContext::mark_canceled).
    Explicit,
    /// An attached [`CancellationToken`]'s source fired.
    TokenFired,
    /// A bounded qdisc evicted the workload to make room for a newer one.
    Overwritten,
    /// The worker pool was disposed before the workload could run.
    SchedulerDisposed,
}

/// How much ambient context flows into the workload's execution.
///
/// "Execution context" is rendered as the [`tracing`] span current at
/// schedule time: flowing it makes the payload (and optionally the
/// continuations) execute inside the scheduling call site's span instead of
/// the worker's detached span.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ContextOptions {
    /// Run the payload inside the span captured at schedule time.
    pub flow_execution_context: bool,
    /// Also run continuations inside the captured span.
    pub continue_on_captured_context: bool,
}

pub(crate) struct PayloadCell<H: Handle> {
    pub(crate) func: Payload<H>,
    pub(crate) fingerprint: Fingerprint,
}

/// A unit of deferred work, handled through [`WorkloadRef`]s.
pub struct Workload<H: Handle> {
    /// Raw value of the current [`Id`]; refreshed when the workload is rented
    /// back out of the pool.
    id: AtomicU64,
    state: State,
    /// Anonymous workloads are never handed out to callers and may be
    /// recycled through the pool.
    anonymous: bool,
    options: ContextOptions,
    payload: Mutex<Option<PayloadCell<H>>>,
    /// Span captured at schedule time; entered around execution and/or
    /// continuations depending on `options`.
    span: Mutex<Option<tracing::Span>>,
    /// The leaf qdisc currently owning this workload, for removal-on-cancel.
    binding: Mutex<Option<Weak<dyn Qdisc<H>>>>,
    result: Mutex<Option<WorkloadResult>>,
    /// Reason recorded by a mid-run cancellation request, consumed when the
    /// payload honors the request.
    cancel_reason: Mutex<Option<CancelReason>>,
    continuations: Mutex<Vec<Continuation<H>>>,
    dispatch_active: AtomicBool,
    /// Opaque per-policy state attached by classful parents (e.g. the
    /// weighted-fair virtual execution time).
    scheduler_state: Mutex<Option<Box<dyn Any + Send>>>,
    measurement: Mutex<Option<Measurement>>,
    services: Mutex<Option<Arc<dyn ServiceProvider>>>,
    done: Event,
}

/// A clonable reference to a [`Workload`].
pub struct WorkloadRef<H: Handle>(Arc<Workload<H>>);

assert_impl_all!(WorkloadRef<u64>: Send, Sync);

/// The cancellation flag handed to payloads, extended with service access.
pub struct WorkloadContext<'a, H: Handle> {
    workload: &'a WorkloadRef<H>,
    worker_id: usize,
}

// === impl Workload ===

impl<H: Handle> Workload<H> {
    pub(crate) fn new(
        payload: PayloadCell<H>,
        anonymous: bool,
        options: ContextOptions,
    ) -> WorkloadRef<H> {
        let span = options
            .flow_execution_context
            .then(tracing::Span::current);
        WorkloadRef(Arc::new(Self {
            id: AtomicU64::new(Id::next().as_u64()),
            state: State::new(),
            anonymous,
            options,
            payload: Mutex::new(Some(payload)),
            span: Mutex::new(span),
            binding: Mutex::new(None),
            result: Mutex::new(None),
            cancel_reason: Mutex::new(None),
            continuations: Mutex::new(Vec::new()),
            dispatch_active: AtomicBool::new(false),
            scheduler_state: Mutex::new(None),
            measurement: Mutex::new(None),
            services: Mutex::new(None),
            done: Event::new(),
        }))
    }

    /// The workload's current unique id.
    pub fn id(&self) -> Id {
        Id::from_u64(self.id.load(Ordering::Relaxed))
    }

    /// The current lifecycle stage.
    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lifecycle()
    }

    /// Whether the workload reached a terminal stage.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether continuation dispatch has begun.
    pub fn continuations_invoked(&self) -> bool {
        self.state.continuations_invoked()
    }

    /// The terminal result, or `None` while the workload is still alive.
    pub fn result(&self) -> Option<WorkloadResult> {
        lock(&self.result).clone()
    }

    pub(crate) fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    /// Blocks until the workload reaches a terminal stage.
    pub fn wait(&self) {
        self.done.wait();
    }

    /// Blocks until the workload reaches a terminal stage or `timeout`
    /// elapses. Returns `false` on expiry; expiry does *not* cancel.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.done.wait_timeout(timeout)
    }

    /// Attaches a per-invocation service provider; payloads reach it through
    /// [`WorkloadContext::services`].
    pub fn register_service_provider(&self, provider: Arc<dyn ServiceProvider>) {
        *lock(&self.services) = Some(provider);
    }

    pub(crate) fn fingerprint(&self) -> Option<Fingerprint> {
        lock(&self.payload).as_ref().map(|cell| cell.fingerprint)
    }

    /// `Created` → `Scheduled`; the leaf qdisc performs this exactly once as
    /// part of the enqueue hand-off.
    pub(crate) fn try_schedule(&self) -> Result<(), Lifecycle> {
        match self.state.try_schedule() {
            ScheduleAction::Scheduled => Ok(()),
            ScheduleAction::Illegal(stage) => Err(stage),
        }
    }

    pub(crate) fn bind(&self, qdisc: Weak<dyn Qdisc<H>>) {
        *lock(&self.binding) = Some(qdisc);
    }

    pub(crate) fn clear_binding(&self) {
        lock(&self.binding).take();
    }

    pub(crate) fn attach_scheduler_state(&self, state: Box<dyn Any + Send>) {
        *lock(&self.scheduler_state) = Some(state);
    }

    pub(crate) fn take_scheduler_state(&self) -> Option<Box<dyn Any + Send>> {
        lock(&self.scheduler_state).take()
    }

    pub(crate) fn attach_measurement(&self, measurement: Measurement) {
        *lock(&self.measurement) = Some(measurement);
    }

    fn set_result(&self, result: WorkloadResult) {
        let mut slot = lock(&self.result);
        debug_assert!(slot.is_none(), "workload result published twice");
        *slot = Some(result);
    }

    fn panic_message(panic: &(dyn Any + Send)) -> String {
        if let Some(message) = panic.downcast_ref::<&'static str>() {
            (*message).to_string()
        } else if let Some(message) = panic.downcast_ref::<String>() {
            message.clone()
        } else {
            "payload panicked".to_string()
        }
    }
}

impl<H: Handle> fmt::Debug for Workload<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workload")
            .field("id", &self.id())
            .field("state", &self.state)
            .field("anonymous", &self.anonymous)
            .finish_non_exhaustive()
    }
}

// === impl WorkloadRef ===

impl<H: Handle> WorkloadRef<H> {
    /// The referenced workload.
    pub fn workload(&self) -> &Workload<H> {
        &self.0
    }

    /// The workload's current unique id.
    pub fn id(&self) -> Id {
        self.0.id()
    }

    /// Whether two references point at the same workload.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn downgrade(&self) -> Weak<Workload<H>> {
        Arc::downgrade(&self.0)
    }

    pub(crate) fn from_arc(inner: Arc<Workload<H>>) -> Self {
        Self(inner)
    }

    /// Requests cancellation.
    ///
    /// A workload that has not started running transitions to `Canceled`
    /// immediately (and is removed from its queue, best-effort); a running
    /// workload has its cooperative flag raised. Returns whether this call
    /// changed anything.
    pub fn try_cancel(&self) -> bool {
        self.cancel_with(CancelReason::Explicit)
    }

    pub(crate) fn cancel_with(&self, reason: CancelReason) -> bool {
        let workload = &self.0;
        match workload.state.request_cancel() {
            CancelAction::CanceledBeforeRun => {
                tracing::debug!(workload = %self.id(), ?reason, "canceled before run");
                // take the binding in its own scope: `try_remove` takes the
                // queue lock, which nests *outside* the binding lock on the
                // enqueue/eviction path
                let binding = lock(&workload.binding).take();
                if let Some(qdisc) = binding.and_then(|weak| weak.upgrade()) {
                    qdisc.try_remove(self);
                }
                workload.set_result(WorkloadResult::Canceled { reason });
                workload.done.set();
                self.run_continuations();
                true
            }
            CancelAction::Requested => {
                tracing::debug!(workload = %self.id(), ?reason, "cancellation requested mid-run");
                *lock(&workload.cancel_reason) = Some(reason);
                true
            }
            CancelAction::AlreadyRequested | CancelAction::Uncancellable => false,
        }
    }

    /// Appends a continuation, invoked exactly once after the workload's
    /// terminal status.
    ///
    /// If the workload is already terminal the callback may run inline on the
    /// appending thread; if a dispatch is in flight on another thread, that
    /// dispatcher picks the callback up instead (bounding stack growth on
    /// long continuation chains).
    pub fn continue_with(&self, continuation: impl FnOnce(&WorkloadRef<H>) + Send + 'static) {
        lock(&self.0.continuations).push(Box::new(continuation));
        self.run_continuations();
    }

    /// Transitions `Scheduled` → `Running`, executes the payload and
    /// publishes the terminal result.
    ///
    /// Returns `false` only when the workload was in an illegal state, which
    /// is a scheduler bug and is logged; payload faults and cancellations are
    /// orderly completions.
    pub(crate) fn run_synchronously(&self, worker_id: usize) -> bool {
        let workload = &self.0;

        match workload.state.start_run() {
            StartRunAction::Run => {}
            StartRunAction::CanceledBeforeRun => {
                tracing::trace!(workload = %self.id(), "dequeued a canceled workload, skipping");
                return true;
            }
            StartRunAction::Illegal(stage) => {
                tracing::error!(
                    workload = %self.id(),
                    ?stage,
                    "workload dequeued in illegal stage; this is a scheduler bug"
                );
                return false;
            }
        }

        let Some(cell) = lock(&workload.payload).take() else {
            tracing::error!(
                workload = %self.id(),
                "workload has no payload; this is a scheduler bug"
            );
            workload.set_result(WorkloadResult::Faulted {
                message: "workload payload missing".to_string(),
            });
            workload.state.finish_run(Lifecycle::Faulted);
            workload.done.set();
            return false;
        };

        let span = if workload.options.flow_execution_context {
            lock(&workload.span).clone()
        } else {
            None
        };

        let outcome = {
            let _entered = span.as_ref().map(tracing::Span::enter);
            let context = WorkloadContext {
                workload: self,
                worker_id,
            };
            std::panic::catch_unwind(AssertUnwindSafe(|| (cell.func)(&context)))
        };

        let (lifecycle, result) = match outcome {
            Ok(Ok(())) => (Lifecycle::RanToCompletion, WorkloadResult::Completed),
            Ok(Err(Canceled(()))) => {
                let reason = lock(&workload.cancel_reason)
                    .take()
                    .unwrap_or(CancelReason::Explicit);
                (Lifecycle::Canceled, WorkloadResult::Canceled { reason })
            }
            Err(panic) => (
                Lifecycle::Faulted,
                WorkloadResult::Faulted {
                    message: Workload::<H>::panic_message(&*panic),
                },
            ),
        };

        tracing::trace!(workload = %self.id(), ?lifecycle, worker_id, "workload finished");

        if let Some(measurement) = lock(&workload.measurement).take() {
            measurement.complete();
        }
        workload.set_result(result);
        workload.state.finish_run(lifecycle);
        workload.clear_binding();
        workload.done.set();
        true
    }

    /// Dispatches pending continuations if the workload is terminal.
    ///
    /// At most one thread drains at a time; callbacks appended during a drain
    /// are run by the active drainer rather than recursively by the appender.
    pub(crate) fn run_continuations(&self) {
        let workload = &self.0;
        if !workload.state.is_terminal() {
            return;
        }
        workload.state.mark_continuations_invoked();

        let span = if workload.options.continue_on_captured_context {
            lock(&workload.span).clone()
        } else {
            None
        };

        loop {
            if workload
                .dispatch_active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // the active dispatcher re-checks the list after releasing,
                // so anything we appended will be picked up
                return;
            }

            loop {
                let batch = core::mem::take(&mut *lock(&workload.continuations));
                if batch.is_empty() {
                    break;
                }
                let _entered = span.as_ref().map(tracing::Span::enter);
                for continuation in batch {
                    continuation(self);
                }
            }

            workload.dispatch_active.store(false, Ordering::Release);
            if lock(&workload.continuations).is_empty() {
                return;
            }
        }
    }

    /// Resets a recycled pool workload for its next life.
    pub(crate) fn reinitialize(&self, payload: PayloadCell<H>) {
        let workload = &self.0;
        workload.state.reuse_from_pool();
        workload.id.store(Id::next().as_u64(), Ordering::Relaxed);
        *lock(&workload.payload) = Some(payload);
        *lock(&workload.span) = workload
            .options
            .flow_execution_context
            .then(tracing::Span::current);
        *lock(&workload.result) = None;
        *lock(&workload.cancel_reason) = None;
        lock(&workload.continuations).clear();
        workload.clear_binding();
        *lock(&workload.scheduler_state) = None;
        *lock(&workload.measurement) = None;
        *lock(&workload.services) = None;
        workload.done.reset();
    }

    /// Clears payload remnants and parks the state in `Pooled`. Returns
    /// `false` when the workload is not eligible.
    pub(crate) fn park_in_pool(&self) -> bool {
        let workload = &self.0;
        if !workload.state.release_to_pool() {
            return false;
        }
        lock(&workload.payload).take();
        lock(&workload.continuations).clear();
        lock(&workload.services).take();
        true
    }
}

impl<H: Handle> Clone for WorkloadRef<H> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<H: Handle> fmt::Debug for WorkloadRef<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// === impl WorkloadContext ===

impl<H: Handle> WorkloadContext<'_, H> {
    /// The id of the worker slot executing this payload.
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// The executing workload's id.
    pub fn workload_id(&self) -> Id {
        self.workload.id()
    }

    /// Returns [`Canceled`] if cancellation has been requested, for payloads
    /// that poll at safe points and bail with `?`.
    pub fn throw_if_cancellation_requested(&self) -> Result<(), Canceled> {
        if self.workload.workload().state.cancel_requested() {
            Err(Canceled(()))
        } else {
            Ok(())
        }
    }

    /// Marks the workload as canceled from inside the payload. Return the
    /// produced error to finish with `Canceled` status.
    pub fn mark_canceled(&self) -> Canceled {
        // raise the flag so the result maps to an explicit cancellation
        let _ = self.workload.workload().state.request_cancel();
        Canceled(())
    }

    /// The service provider attached to this invocation, if any.
    pub fn services(&self) -> Option<Arc<dyn ServiceProvider>> {
        lock(&self.workload.workload().services).clone()
    }
}

impl<H: Handle> fmt::Debug for WorkloadContext<'_, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkloadContext")
            .field("workload", &self.workload.id())
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("workload lock poisoned")
}
