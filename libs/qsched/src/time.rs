// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Virtual time: the monotonic scalar clock and the per-payload execution
//! time statistics that weighted-fair scheduling is built on.

mod table;

pub use table::{Fingerprint, Measurement, TimingEntry, VirtualTimeTable};

use std::sync::OnceLock;
use std::time::Instant;

/// Which recorded statistic an estimate is derived from.
///
/// Weighted-fair qdiscs select one model for the enqueue-side estimate (the
/// workload's virtual execution time) and one for the dequeue-side advance of
/// the per-child virtual finish time.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum TimeModel {
    /// The best (shortest) observed execution time.
    BestCase,
    /// The moving average.
    #[default]
    Average,
    /// The worst (longest) observed execution time.
    WorstCase,
}

/// Preference between reacting to instantaneous load and preserving long-run
/// ratios in weighted-fair scheduling.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Fairness {
    /// Virtual finish times are computed from the current virtual clock;
    /// a briefly idle child does not accumulate credit.
    ShortTerm,
    /// Virtual finish times build on each child's last virtual finish time,
    /// so long-run completion ratios converge to the configured weights.
    #[default]
    LongTerm,
}

/// The process-wide monotonic virtual clock.
///
/// Readings are unit-free scalars (seconds since the first observation);
/// only differences and ordering are meaningful.
#[derive(Debug, Clone, Copy)]
pub struct Clock(());

static EPOCH: OnceLock<Instant> = OnceLock::new();

impl Clock {
    /// The current virtual time.
    #[must_use]
    pub fn now() -> f64 {
        let epoch = *EPOCH.get_or_init(Instant::now);
        epoch.elapsed().as_secs_f64()
    }
}
