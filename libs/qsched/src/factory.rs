// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The factory façade: the external entry points of the scheduler.
//!
//! A [`Factory`] owns a [`WorkerPool`] and bridges scheduling calls to its
//! root qdisc. Fire-and-forget `schedule*` calls use pooled anonymous
//! workloads; the `*_awaitable` family returns a [`WorkloadRef`] the caller
//! can wait on, cancel, or chain continuations onto. One method exists per
//! semantic — awaitability is the method family, not a flag that changes
//! return types.

use crate::error::{Canceled, SchedulerError};
use crate::loom::sync::Arc;
use crate::qdisc::{Handle, Qdisc};
use crate::scheduler::WorkerPool;
use crate::sync::Event;
use crate::time::Fingerprint;
use crate::workload::{
    CancelReason, CancellationToken, ContextOptions, PayloadCell, Workload, WorkloadContext,
    WorkloadRef,
};
use core::any::Any;
use core::fmt;

/// Shorthand for the closure bound every scheduling method takes.
///
/// See [`WorkloadContext`] for what payloads receive.
pub trait PayloadFn<H: Handle>:
    FnOnce(&WorkloadContext<'_, H>) -> Result<(), Canceled> + Send + 'static
{
}

impl<H: Handle, F> PayloadFn<H> for F where
    F: FnOnce(&WorkloadContext<'_, H>) -> Result<(), Canceled> + Send + 'static
{
}

/// External entry points bridging callers to the root qdisc.
pub struct Factory<H: Handle> {
    pool: WorkerPool<H>,
    options: ContextOptions,
}

// === impl Factory ===

impl<H: Handle> Factory<H> {
    /// Wraps a worker pool with default context options.
    pub fn new(pool: WorkerPool<H>) -> Self {
        Self::with_options(pool, ContextOptions::default())
    }

    /// Wraps a worker pool; `options` apply to every workload built here.
    pub fn with_options(pool: WorkerPool<H>, options: ContextOptions) -> Self {
        Self { pool, options }
    }

    /// The underlying worker pool.
    pub fn pool(&self) -> &WorkerPool<H> {
        &self.pool
    }

    /// Disposes the underlying pool (see [`WorkerPool::dispose`]).
    pub fn dispose(&self) {
        self.pool.dispose();
    }

    /// Schedules a fire-and-forget payload on the root's implicit leaf.
    ///
    /// The workload is anonymous: recycled through the pool, not awaitable,
    /// never handed out.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Closed`] after disposal.
    pub fn schedule<F: PayloadFn<H>>(&self, payload: F) -> Result<(), SchedulerError> {
        let workload = self.build_anonymous(payload);
        self.pool.root().enqueue(workload)
    }

    /// Schedules a payload and returns the workload for awaiting,
    /// cancellation or continuations.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Closed`] after disposal.
    pub fn schedule_awaitable<F: PayloadFn<H>>(
        &self,
        payload: F,
    ) -> Result<WorkloadRef<H>, SchedulerError> {
        let workload = self.build_awaitable(payload);
        self.pool.root().enqueue(workload.clone())?;
        Ok(workload)
    }

    /// Schedules an awaitable payload tied to an external cancellation
    /// token. If the token already fired, the workload comes back `Canceled`
    /// without ever touching a queue.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Closed`] after disposal.
    pub fn schedule_with_token<F: PayloadFn<H>>(
        &self,
        payload: F,
        token: &CancellationToken,
    ) -> Result<WorkloadRef<H>, SchedulerError> {
        let workload = self.build_awaitable(payload);
        Self::attach_token(&workload, token);
        if workload.workload().is_terminal() {
            return Ok(workload);
        }
        self.pool.root().enqueue(workload.clone())?;
        Ok(workload)
    }

    /// Routes a fire-and-forget payload to the qdisc with `handle` along a
    /// pre-computed routing path, bypassing all classification predicates.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::UnknownHandle`] if no descendant carries `handle`;
    /// [`SchedulerError::Closed`] after disposal.
    pub fn schedule_by_handle<F: PayloadFn<H>>(
        &self,
        handle: H,
        payload: F,
    ) -> Result<(), SchedulerError> {
        let route = self
            .pool
            .root()
            .try_find_route(handle)
            .ok_or(SchedulerError::UnknownHandle)?;
        route.enqueue(self.build_anonymous(payload))
    }

    /// Awaitable variant of [`schedule_by_handle`](Factory::schedule_by_handle).
    ///
    /// # Errors
    ///
    /// See [`schedule_by_handle`](Factory::schedule_by_handle).
    pub fn schedule_by_handle_awaitable<F: PayloadFn<H>>(
        &self,
        handle: H,
        payload: F,
    ) -> Result<WorkloadRef<H>, SchedulerError> {
        let route = self
            .pool
            .root()
            .try_find_route(handle)
            .ok_or(SchedulerError::UnknownHandle)?;
        let workload = self.build_awaitable(payload);
        route.enqueue(workload.clone())?;
        Ok(workload)
    }

    /// Classifies `state` against the tree's predicates, starting at the
    /// root. Returns `Ok(false)` (dropping the payload) when no classifier
    /// matched.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Closed`] after disposal.
    pub fn classify<S: Any, F: PayloadFn<H>>(
        &self,
        state: &S,
        payload: F,
    ) -> Result<bool, SchedulerError> {
        let workload = self.build_anonymous(payload);
        self.pool.root().try_enqueue(state, workload)
    }

    /// Awaitable variant of [`classify`](Factory::classify); `Ok(None)` when
    /// no classifier matched.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Closed`] after disposal.
    pub fn classify_awaitable<S: Any, F: PayloadFn<H>>(
        &self,
        state: &S,
        payload: F,
    ) -> Result<Option<WorkloadRef<H>>, SchedulerError> {
        let workload = self.build_awaitable(payload);
        if self.pool.root().try_enqueue(state, workload.clone())? {
            Ok(Some(workload))
        } else {
            Ok(None)
        }
    }

    /// Blocks until every given workload is terminal.
    pub fn wait_all(workloads: &[WorkloadRef<H>]) {
        for workload in workloads {
            workload.workload().wait();
        }
    }

    /// Blocks until at least one of the given workloads is terminal and
    /// returns its index; `None` for empty input.
    pub fn wait_any(workloads: &[WorkloadRef<H>]) -> Option<usize> {
        if workloads.is_empty() {
            return None;
        }
        if let Some(index) = workloads
            .iter()
            .position(|workload| workload.workload().is_terminal())
        {
            return Some(index);
        }

        let done = Arc::new(Event::new());
        for workload in workloads {
            let done = Arc::clone(&done);
            workload.continue_with(move |_| done.set());
        }
        done.wait();

        workloads
            .iter()
            .position(|workload| workload.workload().is_terminal())
    }

    fn build_cell<F: PayloadFn<H>>(payload: F) -> PayloadCell<H> {
        PayloadCell {
            fingerprint: Fingerprint::of::<F>(),
            func: Box::new(payload),
        }
    }

    fn build_anonymous<F: PayloadFn<H>>(&self, payload: F) -> WorkloadRef<H> {
        self.pool
            .inner()
            .workload_pool
            .rent_or_build(Self::build_cell(payload), self.options)
    }

    fn build_awaitable<F: PayloadFn<H>>(&self, payload: F) -> WorkloadRef<H> {
        Workload::new(Self::build_cell(payload), false, self.options)
    }

    fn attach_token(workload: &WorkloadRef<H>, token: &CancellationToken) {
        let weak = workload.downgrade();
        token.register(Box::new(move || {
            if let Some(workload) = weak.upgrade() {
                WorkloadRef::from_arc(workload).cancel_with(CancelReason::TokenFired);
            }
        }));
    }
}

impl<H: Handle> fmt::Debug for Factory<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Factory")
            .field("pool", &self.pool)
            .field("options", &self.options)
            .finish()
    }
}
