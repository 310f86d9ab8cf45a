// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! # A hierarchical workload scheduler.
//!
//! This crate dispatches deferred units of work ([`Workload`]s) onto a bounded
//! pool of worker threads, routing each workload through a tree of *queuing
//! disciplines* ("qdiscs") in the spirit of Linux traffic control: classless
//! leaves hold workloads ([`Fifo`], [`Lifo`], [`BoundedFifo`], [`BoundedLifo`])
//! while classful inner nodes ([`RoundRobin`], [`WeightedFair`]) own ordered
//! child qdiscs and decide which child a worker serves next.
//!
//! Workloads are classified onto a leaf either by an explicit [`Handle`], by
//! running per-child predicates against caller-supplied state, or by enqueuing
//! directly at the root. Leaves notify their parent chain on every enqueue;
//! the chain terminates at the [`WorkerPool`], which claims one of its bounded
//! worker slots and spawns an OS thread to drain the tree. Workers exit as
//! soon as the tree is drained, using a claim/release protocol that cannot
//! lose a wakeup against concurrent producers.
//!
//! The [`Factory`] is the external entry point tying the pieces together.
//!
//! [`Workload`]: workload::Workload
//! [`Handle`]: qdisc::Handle
//! [`Fifo`]: qdisc::Fifo
//! [`Lifo`]: qdisc::Lifo
//! [`BoundedFifo`]: qdisc::BoundedFifo
//! [`BoundedLifo`]: qdisc::BoundedLifo
//! [`RoundRobin`]: qdisc::RoundRobin
//! [`WeightedFair`]: qdisc::WeightedFair
//! [`WorkerPool`]: scheduler::WorkerPool
//! [`Factory`]: factory::Factory

mod error;
pub mod factory;
mod loom;
pub mod qdisc;
pub mod scheduler;
pub mod services;
mod sync;
pub mod time;
pub mod workload;

pub use error::{Canceled, ConfigError, SchedulerError};

cfg_if::cfg_if! {
    if #[cfg(test)] {
        mod test_util;
    }
}
