// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end scheduling scenarios through the public factory surface.

use qsched::SchedulerError;
use qsched::factory::Factory;
use qsched::qdisc::{
    ClassfulQdisc, Fifo, Predicate, Qdisc, RoundRobin, WeightedFair, WeightedFairConfig,
};
use qsched::scheduler::WorkerPool;
use qsched::services::{ServiceProvider, ServiceProviderFactory};
use qsched::time::Fairness;
use qsched::workload::{CancelReason, CancellationSource, Lifecycle, WorkloadResult};
use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .try_init();
}

/// A flag payloads can spin on, to hold a worker hostage deterministically.
#[derive(Clone, Default)]
struct Gate(Arc<AtomicBool>);

impl Gate {
    fn open(&self) {
        self.0.store(true, Ordering::Release);
    }

    fn wait(&self) {
        while !self.0.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

fn fifo_factory(max_concurrency: usize) -> Factory<u32> {
    let root: Arc<dyn Qdisc<u32>> = Fifo::new(0_u32);
    Factory::new(WorkerPool::new(root, max_concurrency).unwrap())
}

#[test]
fn schedule_runs_the_payload() {
    init_tracing();
    let factory = fifo_factory(2);
    let ran = Arc::new(AtomicUsize::new(0));

    for _ in 0..32 {
        let ran = Arc::clone(&ran);
        factory
            .schedule(move |_| {
                ran.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while ran.load(Ordering::Relaxed) < 32 {
        assert!(Instant::now() < deadline, "payloads did not all run");
        std::thread::yield_now();
    }
}

#[test]
fn fifo_order_is_preserved_under_a_single_worker() {
    init_tracing();
    let factory = fifo_factory(1);
    let order = Arc::new(Mutex::new(Vec::new()));

    let workloads: Vec<_> = (0..20)
        .map(|index| {
            let order = Arc::clone(&order);
            factory
                .schedule_awaitable(move |_| {
                    order.lock().unwrap().push(index);
                    Ok(())
                })
                .unwrap()
        })
        .collect();

    Factory::wait_all(&workloads);
    assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());
}

#[test]
fn cancel_before_run_never_executes_the_payload() {
    init_tracing();
    let factory = fifo_factory(1);
    let gate = Gate::default();

    // occupy the only worker
    let blocker = {
        let gate = gate.clone();
        factory
            .schedule_awaitable(move |_| {
                gate.wait();
                Ok(())
            })
            .unwrap()
    };

    let ran = Arc::new(AtomicBool::new(false));
    let victim = {
        let ran = Arc::clone(&ran);
        factory
            .schedule_awaitable(move |_| {
                ran.store(true, Ordering::Release);
                Ok(())
            })
            .unwrap()
    };

    assert!(victim.try_cancel());
    gate.open();

    assert!(victim.workload().wait_timeout(Duration::from_secs(10)));
    assert!(blocker.workload().wait_timeout(Duration::from_secs(10)));
    assert!(!ran.load(Ordering::Acquire), "canceled payload must not run");
    assert_eq!(victim.workload().lifecycle(), Lifecycle::Canceled);
    assert_eq!(
        victim.workload().result(),
        Some(WorkloadResult::Canceled {
            reason: CancelReason::Explicit
        })
    );
}

#[test]
fn cooperative_cancellation_mid_run() {
    init_tracing();
    let factory = fifo_factory(1);
    let entered = Gate::default();
    let requested = Gate::default();

    let workload = {
        let entered = entered.clone();
        let requested = requested.clone();
        factory
            .schedule_awaitable(move |ctx| {
                entered.open();
                requested.wait();
                // the poll observes the request and bails
                ctx.throw_if_cancellation_requested()?;
                unreachable!("cancellation must be observed")
            })
            .unwrap()
    };

    entered.wait();
    assert!(workload.try_cancel());
    requested.open();

    assert!(workload.workload().wait_timeout(Duration::from_secs(10)));
    assert_eq!(workload.workload().lifecycle(), Lifecycle::Canceled);
    assert!(matches!(
        workload.workload().result(),
        Some(WorkloadResult::Canceled { .. })
    ));
}

#[test]
fn faulted_workload_attaches_the_exception_message() {
    init_tracing();
    let factory = fifo_factory(1);
    let workload = factory
        .schedule_awaitable(|_| panic!("Test exception"))
        .unwrap();

    assert!(workload.workload().wait_timeout(Duration::from_secs(10)));
    assert_eq!(workload.workload().lifecycle(), Lifecycle::Faulted);
    assert!(workload.workload().continuations_invoked() || {
        // continuations are dispatched right after the terminal status; give
        // the worker a moment
        std::thread::sleep(Duration::from_millis(50));
        workload.workload().continuations_invoked()
    });
    assert_eq!(
        workload.workload().result(),
        Some(WorkloadResult::Faulted {
            message: "Test exception".to_string()
        })
    );
}

#[test]
fn external_cancellation_token() {
    init_tracing();
    let factory = fifo_factory(1);
    let gate = Gate::default();
    let source = CancellationSource::new();

    let blocker = {
        let gate = gate.clone();
        factory
            .schedule_awaitable(move |_| {
                gate.wait();
                Ok(())
            })
            .unwrap()
    };

    let victim = factory
        .schedule_with_token(|_| Ok(()), &source.token())
        .unwrap();

    source.cancel();
    gate.open();

    assert!(victim.workload().wait_timeout(Duration::from_secs(10)));
    assert_eq!(
        victim.workload().result(),
        Some(WorkloadResult::Canceled {
            reason: CancelReason::TokenFired
        })
    );
    assert!(blocker.workload().wait_timeout(Duration::from_secs(10)));

    // a token that already fired cancels at build time, before any queue
    let stillborn = factory
        .schedule_with_token(|_| Ok(()), &source.token())
        .unwrap();
    assert_eq!(stillborn.workload().lifecycle(), Lifecycle::Canceled);
}

#[test]
fn round_robin_rotation_across_three_children() {
    init_tracing();
    let rr = RoundRobin::new(0_u32);
    for handle in [1_u32, 2, 3] {
        rr.try_add_child(Fifo::new(handle), None).unwrap();
    }
    let root: Arc<dyn Qdisc<u32>> = rr;
    let factory = Factory::new(WorkerPool::new(root, 1).unwrap());

    let gate = Gate::default();
    let blocker = {
        let gate = gate.clone();
        factory
            .schedule_awaitable(move |_| {
                gate.wait();
                Ok(())
            })
            .unwrap()
    };

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut workloads = Vec::new();
    // A,A,A,B,B,B,C,C,C
    for handle in [1_u32, 2, 3] {
        for round in 0..3_usize {
            let order = Arc::clone(&order);
            workloads.push(
                factory
                    .schedule_by_handle_awaitable(handle, move |_| {
                        order.lock().unwrap().push((handle, round));
                        Ok(())
                    })
                    .unwrap(),
            );
        }
    }

    gate.open();
    assert!(blocker.workload().wait_timeout(Duration::from_secs(10)));
    Factory::wait_all(&workloads);

    let expected: Vec<(u32, usize)> = vec![
        (1, 0),
        (2, 0),
        (3, 0),
        (1, 1),
        (2, 1),
        (3, 1),
        (1, 2),
        (2, 2),
        (3, 2),
    ];
    assert_eq!(*order.lock().unwrap(), expected);
}

#[test]
fn classification_routes_by_predicate() {
    init_tracing();
    let rr = RoundRobin::new(0_u32);
    let evens = Fifo::new(1_u32);
    let odds = Fifo::new(2_u32);
    rr.try_add_child(evens, Some(Predicate::of::<u64>(|value| value % 2 == 0)))
        .unwrap();
    rr.try_add_child(odds, Some(Predicate::of::<u64>(|value| value % 2 == 1)))
        .unwrap();
    let root: Arc<dyn Qdisc<u32>> = rr;
    let factory = Factory::new(WorkerPool::new(root, 2).unwrap());

    let hits = Arc::new(AtomicUsize::new(0));
    let mut workloads = Vec::new();
    for value in 0..10_u64 {
        let hits = Arc::clone(&hits);
        let scheduled = factory
            .classify_awaitable(&value, move |_| {
                hits.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .unwrap();
        workloads.push(scheduled.expect("u64 state always classifies"));
    }

    // unclassifiable state is reported, not silently dropped
    assert!(
        factory
            .classify_awaitable(&"not a number", |_| Ok(()))
            .unwrap()
            .is_none()
    );

    Factory::wait_all(&workloads);
    assert_eq!(hits.load(Ordering::Relaxed), 10);
}

#[test]
fn unknown_handles_are_rejected() {
    let factory = fifo_factory(1);
    assert_eq!(
        factory.schedule_by_handle(42, |_| Ok(())).err(),
        Some(SchedulerError::UnknownHandle)
    );
}

#[test]
fn weighted_fair_completion_ratio() {
    init_tracing();
    let config = WeightedFairConfig {
        fairness: Fairness::LongTerm,
        precise_measurements: true,
        ..WeightedFairConfig::default()
    };
    let wfq = WeightedFair::new(0_u32, config);
    wfq.try_add_child_weighted(Fifo::new(1_u32), None, 2.0, 1.0)
        .unwrap();
    wfq.try_add_child_weighted(Fifo::new(2_u32), None, 1.0, 1.0)
        .unwrap();
    let root: Arc<dyn Qdisc<u32>> = wfq;
    let factory = Factory::new(WorkerPool::new(root, 1).unwrap());

    // hold the worker until both backlogs are in place
    let gate = Gate::default();
    let blocker = {
        let gate = gate.clone();
        factory
            .schedule_awaitable(move |_| {
                gate.wait();
                Ok(())
            })
            .unwrap()
    };

    fn busy_work() {
        let start = Instant::now();
        while start.elapsed() < Duration::from_micros(100) {
            std::hint::spin_loop();
        }
    }

    const PER_CHILD: usize = 400;
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut workloads = Vec::new();
    for _ in 0..PER_CHILD {
        let order_a = Arc::clone(&order);
        workloads.push(
            factory
                .schedule_by_handle_awaitable(1, move |_| {
                    busy_work();
                    order_a.lock().unwrap().push('a');
                    Ok(())
                })
                .unwrap(),
        );
        let order_b = Arc::clone(&order);
        workloads.push(
            factory
                .schedule_by_handle_awaitable(2, move |_| {
                    busy_work();
                    order_b.lock().unwrap().push('b');
                    Ok(())
                })
                .unwrap(),
        );
    }

    gate.open();
    assert!(blocker.workload().wait_timeout(Duration::from_secs(30)));
    Factory::wait_all(&workloads);

    // while both children hold backlog, the weight-2 child must complete
    // about twice as often; skip the estimate warm-up and judge a window in
    // which neither stream can have drained (b exhausts first at 2:1)
    let order = order.lock().unwrap();
    let window = &order[40..440];
    let a = window.iter().filter(|&&c| c == 'a').count();
    let b = window.len() - a;
    let ratio = a as f64 / b as f64;
    assert!(
        (1.4..=2.8).contains(&ratio),
        "expected roughly 2:1 completions, got a={a} b={b} (ratio {ratio:.2})"
    );
}

#[test]
fn wait_any_returns_the_first_finisher() {
    init_tracing();
    let factory = fifo_factory(2);
    let gate = Gate::default();

    let slow = {
        let gate = gate.clone();
        factory
            .schedule_awaitable(move |_| {
                gate.wait();
                Ok(())
            })
            .unwrap()
    };
    let fast = factory.schedule_awaitable(|_| Ok(())).unwrap();

    let winner = Factory::wait_any(&[slow.clone(), fast.clone()]).unwrap();
    assert_eq!(winner, 1);

    gate.open();
    Factory::wait_all(&[slow, fast]);
    assert!(Factory::<u32>::wait_any(&[]).is_none());
}

#[test]
fn continuations_run_after_completion() {
    init_tracing();
    let factory = fifo_factory(1);
    let sequence = Arc::new(Mutex::new(Vec::new()));

    let workload = {
        let sequence = Arc::clone(&sequence);
        factory
            .schedule_awaitable(move |_| {
                sequence.lock().unwrap().push("payload");
                Ok(())
            })
            .unwrap()
    };
    {
        let sequence = Arc::clone(&sequence);
        workload.continue_with(move |w| {
            assert!(w.workload().is_terminal());
            sequence.lock().unwrap().push("continuation");
        });
    }

    assert!(workload.workload().wait_timeout(Duration::from_secs(10)));
    let deadline = Instant::now() + Duration::from_secs(10);
    while sequence.lock().unwrap().len() < 2 {
        assert!(Instant::now() < deadline);
        std::thread::yield_now();
    }
    assert_eq!(*sequence.lock().unwrap(), ["payload", "continuation"]);
}

#[test]
fn dispose_rejects_new_work_and_joins_workers() {
    init_tracing();
    let factory = fifo_factory(2);
    let done = factory.schedule_awaitable(|_| Ok(())).unwrap();
    assert!(done.workload().wait_timeout(Duration::from_secs(10)));

    factory.dispose();
    assert!(factory.pool().is_disposed());
    assert_eq!(factory.pool().current_workers(), 0);
    assert_eq!(
        factory.schedule(|_| Ok(())).err(),
        Some(SchedulerError::Closed)
    );
}

struct StaticServices;

impl ServiceProvider for StaticServices {
    fn get(&self, type_id: TypeId) -> Option<&(dyn Any + Send + Sync)> {
        static GREETING: &str = "hello from the provider";
        (type_id == TypeId::of::<&'static str>()).then_some(&GREETING as _)
    }
}

struct StaticServiceFactory;

impl ServiceProviderFactory for StaticServiceFactory {
    fn create(&self) -> Arc<dyn ServiceProvider> {
        Arc::new(StaticServices)
    }
}

#[test]
fn service_providers_reach_the_payload() {
    init_tracing();
    let root: Arc<dyn Qdisc<u32>> = Fifo::new(0_u32);
    let pool = WorkerPool::with_services(root, 1, Arc::new(StaticServiceFactory)).unwrap();
    let factory = Factory::new(pool);

    let observed = Arc::new(Mutex::new(None));
    let workload = {
        let observed = Arc::clone(&observed);
        factory
            .schedule_awaitable(move |ctx| {
                let services = ctx.services().expect("provider attached");
                *observed.lock().unwrap() =
                    services.try_get::<&'static str>().copied();
                Ok(())
            })
            .unwrap()
    };

    assert!(workload.workload().wait_timeout(Duration::from_secs(10)));
    assert_eq!(*observed.lock().unwrap(), Some("hello from the provider"));
}

#[test]
fn tree_drains_to_empty_after_quiescence() {
    init_tracing();
    let rr = RoundRobin::new(0_u32);
    rr.try_add_child(Fifo::new(1_u32), None).unwrap();
    let root: Arc<dyn Qdisc<u32>> = rr;
    let factory = Factory::new(WorkerPool::new(Arc::clone(&root), 4).unwrap());

    let workloads: Vec<_> = (0..64)
        .map(|_| factory.schedule_by_handle_awaitable(1, |_| Ok(())).unwrap())
        .collect();
    Factory::wait_all(&workloads);

    let deadline = Instant::now() + Duration::from_secs(10);
    while !root.is_empty() || factory.pool().current_workers() > 0 {
        assert!(Instant::now() < deadline, "tree failed to drain");
        std::thread::yield_now();
    }
}
