// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The worker pool: bounded parallelism over a root qdisc.
//!
//! Workers are plain OS threads spawned on demand. Every enqueue notification
//! that reaches the pool tries to claim one of `max_concurrency` worker
//! slots; a successful claim spawns a thread that drains the tree and exits
//! when the tree is empty, using a release/re-sample/re-claim protocol that
//! cannot lose a wakeup against a racing producer:
//!
//! 1. try to dequeue from the root; on success, run the workload;
//! 2. otherwise release the worker slot *first*,
//! 3. then re-sample `disposed` and root emptiness — if either holds, exit;
//! 4. otherwise an enqueue raced the release: re-claim a slot (possibly
//!    under a different id) and go to 1. If the cap is reached instead, some
//!    other worker holds the last slot and will observe the same work.

use crate::error::{ConfigError, SchedulerError};
use crate::loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use crate::loom::sync::{Arc, Weak};
use crate::loom::thread;
use crate::qdisc::{Handle, ParentLink, ParentNotify, Qdisc, QdiscId};
use crate::services::ServiceProviderFactory;
use crate::sync::Event;
use crate::workload::{CancelReason, WorkloadPool, WorkloadRef};
use concurrent_bitmap::ConcurrentBitmap;
use core::fmt;

/// How many finished anonymous workloads are kept around for reuse.
const WORKLOAD_POOL_CAPACITY: usize = 256;

/// A bounded pool of worker threads draining a qdisc tree.
///
/// Cheap to clone (shared state); dispose exactly once via
/// [`dispose`](WorkerPool::dispose).
pub struct WorkerPool<H: Handle> {
    inner: Arc<PoolInner<H>>,
}

pub(crate) struct PoolInner<H: Handle> {
    root: Arc<dyn Qdisc<H>>,
    max_concurrency: usize,
    /// Bit `i` set ⇔ worker id `i` is free. Claims go through the token CAS
    /// so two racing claims can never share an id.
    worker_ids: ConcurrentBitmap,
    current_workers: AtomicUsize,
    disposed: AtomicBool,
    all_workers_exited: Event,
    services: Option<Arc<dyn ServiceProviderFactory>>,
    pub(crate) workload_pool: WorkloadPool<H>,
    self_ref: Weak<PoolInner<H>>,
}

// === impl WorkerPool ===

impl<H: Handle> WorkerPool<H> {
    /// Creates a pool draining `root` with at most `max_concurrency`
    /// concurrent workers, and binds `root` to the pool.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ZeroConcurrency`] for a zero cap;
    /// [`SchedulerError::Inconsistency`] if `root` is already bound to
    /// another parent.
    pub fn new(
        root: Arc<dyn Qdisc<H>>,
        max_concurrency: usize,
    ) -> Result<Self, SchedulerError> {
        Self::build(root, max_concurrency, None)
    }

    /// Like [`new`](WorkerPool::new), but every worker obtains a service
    /// provider from `services` for its lifetime and attaches it to each
    /// workload before execution.
    ///
    /// # Errors
    ///
    /// See [`new`](WorkerPool::new).
    pub fn with_services(
        root: Arc<dyn Qdisc<H>>,
        max_concurrency: usize,
        services: Arc<dyn ServiceProviderFactory>,
    ) -> Result<Self, SchedulerError> {
        Self::build(root, max_concurrency, Some(services))
    }

    fn build(
        root: Arc<dyn Qdisc<H>>,
        max_concurrency: usize,
        services: Option<Arc<dyn ServiceProviderFactory>>,
    ) -> Result<Self, SchedulerError> {
        if max_concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency.into());
        }

        let worker_ids = ConcurrentBitmap::new(max_concurrency);
        for id in 0..max_concurrency {
            let _ = worker_ids.update_bit(id, true);
        }

        let inner = Arc::new_cyclic(|self_ref: &Weak<PoolInner<H>>| PoolInner {
            root,
            max_concurrency,
            worker_ids,
            current_workers: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
            all_workers_exited: Event::new(),
            services,
            workload_pool: WorkloadPool::new(WORKLOAD_POOL_CAPACITY),
            self_ref: self_ref.clone(),
        });

        let inner_dyn: Arc<dyn ParentNotify<H>> = inner.clone();
        let parent: Weak<dyn ParentNotify<H>> = Arc::downgrade(&inner_dyn);
        inner.root.bind_parent(ParentLink::Bound(parent))?;

        tracing::info!(max_concurrency, "worker pool created");
        Ok(Self { inner })
    }

    /// The root qdisc this pool drains.
    pub fn root(&self) -> &Arc<dyn Qdisc<H>> {
        &self.inner.root
    }

    /// The fixed concurrency cap.
    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }

    /// The number of currently live workers (racy, diagnostics only).
    pub fn current_workers(&self) -> usize {
        self.inner.current_workers.load(Ordering::Acquire)
    }

    /// Whether [`dispose`](WorkerPool::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Nudges the pool to spawn a worker if below the cap. Normally driven
    /// by enqueue notifications; exposed for external schedulers.
    pub fn on_work_scheduled(&self) {
        self.inner.on_work_scheduled();
    }

    /// Disposes the pool: completes the root (new enqueues fail with
    /// [`SchedulerError::Closed`]), aborts workloads dequeued after this
    /// point via cancellation, and blocks until every worker has exited.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub(crate) fn inner(&self) -> &Arc<PoolInner<H>> {
        &self.inner
    }
}

impl<H: Handle> Clone for WorkerPool<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: Handle> fmt::Debug for WorkerPool<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("max_concurrency", &self.inner.max_concurrency)
            .field("current_workers", &self.current_workers())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

// === impl PoolInner ===

impl<H: Handle> PoolInner<H> {
    pub(crate) fn root(&self) -> &Arc<dyn Qdisc<H>> {
        &self.root
    }

    fn on_work_scheduled(&self) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        // claim a slot; if none is free the running workers will observe the
        // new work through their exit protocol
        let Some(worker_id) = self.try_claim_worker() else {
            return;
        };
        self.spawn_worker(worker_id);
    }

    /// Claims a worker slot: bumps `current_workers` below the cap and takes
    /// a free id out of the bag.
    fn try_claim_worker(&self) -> Option<usize> {
        let mut current = self.current_workers.load(Ordering::Acquire);
        loop {
            if current >= self.max_concurrency {
                return None;
            }
            match self.current_workers.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        // the count admitted us, so a free id exists or is in flight: a
        // releasing worker returns its id *before* decrementing the count
        loop {
            let Some(id) = self.worker_ids.find_first_set() else {
                core::hint::spin_loop();
                continue;
            };
            let Ok(token) = self.worker_ids.get_token(id) else {
                continue;
            };
            if self.worker_ids.try_update_bit(id, token, false).unwrap_or(false) {
                return Some(id);
            }
        }
    }

    /// Returns the id to the bag, then decrements the worker count; this
    /// order is what keeps [`try_claim_worker`]'s id search finite.
    fn release_worker(&self, worker_id: usize) {
        let _ = self.worker_ids.update_bit(worker_id, true);
        let previous = self.current_workers.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);
        if previous == 1 && self.disposed.load(Ordering::Acquire) {
            self.all_workers_exited.set();
        }
    }

    fn spawn_worker(&self, worker_id: usize) {
        let Some(inner) = self.self_ref.upgrade() else {
            self.release_worker(worker_id);
            return;
        };

        // a detached OS thread; no ambient context flows across this spawn
        let spawned = thread::Builder::new()
            .name(format!("qsched-worker-{worker_id}"))
            .spawn(move || inner.worker_loop(worker_id));

        if let Err(error) = spawned {
            tracing::error!(%error, worker_id, "failed to spawn worker thread");
            self.release_worker(worker_id);
        }
    }

    fn worker_loop(self: Arc<Self>, mut worker_id: usize) {
        let span = tracing::info_span!("worker", worker = worker_id);
        let _entered = span.enter();
        tracing::debug!("worker started");

        let provider = self.services.as_ref().map(|factory| factory.create());
        let mut backtrack = false;

        loop {
            // on None the slot has already been released inside the protocol
            let Some(workload) = self.try_dequeue_or_exit_safely(&mut worker_id, backtrack)
            else {
                break;
            };

            if self.disposed.load(Ordering::Acquire) {
                tracing::debug!(workload = %workload.id(), "aborting workload dequeued after disposal");
                workload.cancel_with(CancelReason::SchedulerDisposed);
                workload.run_continuations();
                self.root.on_worker_terminated(worker_id);
                self.release_worker(worker_id);
                break;
            }

            if let Some(provider) = &provider {
                workload.workload().register_service_provider(Arc::clone(provider));
            }

            backtrack = !workload.run_synchronously(worker_id);
            workload.run_continuations();
            if workload.workload().is_anonymous() {
                self.workload_pool.recycle(workload);
            }
        }

        if let Some(provider) = provider {
            provider.dispose();
        }
        tracing::debug!("worker exited");
    }

    /// The no-lost-wakeup exit protocol (see the module docs).
    fn try_dequeue_or_exit_safely(
        &self,
        worker_id: &mut usize,
        backtrack: bool,
    ) -> Option<WorkloadRef<H>> {
        loop {
            if let Some(workload) = self.root.try_dequeue(*worker_id, backtrack) {
                return Some(workload);
            }

            // out of work: let the tree flush worker-local state, then give
            // the slot back before deciding to exit
            self.root.on_worker_terminated(*worker_id);
            self.release_worker(*worker_id);

            if self.disposed.load(Ordering::Acquire) || self.root.is_empty() {
                return None;
            }

            // an enqueue raced our release; try to get back in
            match self.try_claim_worker() {
                Some(id) => {
                    tracing::trace!(old = *worker_id, new = id, "worker re-claimed a slot");
                    *worker_id = id;
                }
                None => return None,
            }
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            // someone else is disposing; wait with them
            self.all_workers_exited.wait();
            return;
        }
        tracing::info!("disposing worker pool");
        self.root.complete();
        if self.current_workers.load(Ordering::Acquire) == 0 {
            self.all_workers_exited.set();
        }
        self.all_workers_exited.wait();
        tracing::info!("worker pool fully disposed");
    }
}

impl<H: Handle> ParentNotify<H> for PoolInner<H> {
    fn on_child_enqueued(&self, _child: QdiscId) {
        self.on_work_scheduled();
    }
}


#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::loom::sync::Mutex;
    use crate::qdisc::{ClassfulQdisc, Fifo, RoundRobin};
    use crate::test_util::{self, workload};
    use crate::workload::Lifecycle;
    use core::time::Duration;

    fn drain_deadline(pool: &WorkerPool<u32>) {
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while pool.current_workers() > 0 {
            assert!(
                std::time::Instant::now() < deadline,
                "workers failed to exit"
            );
            std::thread::yield_now();
        }
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let root = Fifo::new(0_u32);
        assert_eq!(
            WorkerPool::<u32>::new(root, 0).err(),
            Some(SchedulerError::Configuration(ConfigError::ZeroConcurrency))
        );
    }

    #[test]
    fn rebinding_a_root_fails() {
        let root: Arc<dyn Qdisc<u32>> = Fifo::new(0_u32);
        let _pool = WorkerPool::new(Arc::clone(&root), 1).unwrap();
        assert!(matches!(
            WorkerPool::new(root, 1),
            Err(SchedulerError::Inconsistency(_))
        ));
    }

    #[test]
    fn enqueued_workloads_run_and_workers_exit() {
        test_util::trace_init();
        let root: Arc<dyn Qdisc<u32>> = Fifo::new(0_u32);
        let pool = WorkerPool::new(Arc::clone(&root), 2).unwrap();

        let workloads: Vec<_> = (0..16).map(|_| workload(|_| Ok(()))).collect();
        for item in &workloads {
            root.enqueue(item.clone()).unwrap();
        }

        for item in &workloads {
            assert!(item.workload().wait_timeout(Duration::from_secs(10)));
            assert_eq!(item.workload().lifecycle(), Lifecycle::RanToCompletion);
        }
        drain_deadline(&pool);
        assert!(root.is_empty());
    }

    #[test]
    fn concurrency_never_exceeds_the_cap() {
        test_util::trace_init();
        const CAP: usize = 3;
        let root: Arc<dyn Qdisc<u32>> = Fifo::new(0_u32);
        let pool = WorkerPool::new(Arc::clone(&root), CAP).unwrap();

        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let workloads: Vec<_> = (0..64)
            .map(|_| {
                let live = Arc::clone(&live);
                let peak = Arc::clone(&peak);
                workload(move |_| {
                    let now = live.fetch_add(1, Ordering::AcqRel) + 1;
                    peak.fetch_max(now, Ordering::AcqRel);
                    std::thread::sleep(Duration::from_millis(1));
                    live.fetch_sub(1, Ordering::AcqRel);
                    Ok(())
                })
            })
            .collect();
        for item in &workloads {
            root.enqueue(item.clone()).unwrap();
        }
        for item in &workloads {
            assert!(item.workload().wait_timeout(Duration::from_secs(30)));
        }

        assert!(peak.load(Ordering::Acquire) <= CAP);
        assert!(pool.current_workers() <= CAP);
        drain_deadline(&pool);
    }

    #[test]
    fn worker_ids_stay_within_the_cap_and_unique() {
        test_util::trace_init();
        const CAP: usize = 4;
        let root: Arc<dyn Qdisc<u32>> = Fifo::new(0_u32);
        let pool = WorkerPool::new(Arc::clone(&root), CAP).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let workloads: Vec<_> = (0..32)
            .map(|_| {
                let seen = Arc::clone(&seen);
                workload(move |ctx| {
                    seen.lock().unwrap().push(ctx.worker_id());
                    Ok(())
                })
            })
            .collect();
        for item in &workloads {
            root.enqueue(item.clone()).unwrap();
        }
        for item in &workloads {
            assert!(item.workload().wait_timeout(Duration::from_secs(10)));
        }

        for id in seen.lock().unwrap().iter() {
            assert!(*id < CAP, "worker id {id} out of range");
        }
        drain_deadline(&pool);
    }

    #[test]
    fn dispose_closes_the_tree_and_joins_workers() {
        test_util::trace_init();
        let root: Arc<dyn Qdisc<u32>> = Fifo::new(0_u32);
        let pool = WorkerPool::new(Arc::clone(&root), 2).unwrap();

        let item = workload(|_| Ok(()));
        root.enqueue(item.clone()).unwrap();
        assert!(item.workload().wait_timeout(Duration::from_secs(10)));

        pool.dispose();
        assert!(pool.is_disposed());
        assert_eq!(pool.current_workers(), 0);
        assert_eq!(
            root.enqueue(workload(|_| Ok(()))),
            Err(SchedulerError::Closed)
        );
    }

    #[test]
    fn classful_tree_under_the_pool() {
        test_util::trace_init();
        let rr = RoundRobin::new(0_u32);
        let child_a = Fifo::new(1_u32);
        let child_b = Fifo::new(2_u32);
        rr.try_add_child(child_a.clone(), None).unwrap();
        rr.try_add_child(child_b.clone(), None).unwrap();

        let root: Arc<dyn Qdisc<u32>> = rr;
        let pool = WorkerPool::new(Arc::clone(&root), 2).unwrap();

        let workloads: Vec<_> = (0..8)
            .map(|index| {
                let target = if index % 2 == 0 { &child_a } else { &child_b };
                let item = workload(|_| Ok(()));
                target.enqueue(item.clone()).unwrap();
                item
            })
            .collect();

        for item in &workloads {
            assert!(item.workload().wait_timeout(Duration::from_secs(10)));
            assert_eq!(item.workload().lifecycle(), Lifecycle::RanToCompletion);
        }
        drain_deadline(&pool);
        assert!(root.is_empty());
    }
}
