// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicU64, Ordering};
use crate::loom::sync::{Arc, RwLock};
use crate::time::TimeModel;
use core::any::TypeId;
use core::fmt;
use hashbrown::HashMap;
use std::time::Instant;

/// Stable identity of a payload for statistics pooling.
///
/// Keyed on the payload closure's *type*: every Rust closure expression has
/// its own unique type, so statistics never pool across unrelated closures,
/// while all workloads built from the same `fn` item (or the same closure
/// expression) intentionally share one entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Fingerprint(TypeId);

impl Fingerprint {
    /// The fingerprint of payload type `F`.
    #[must_use]
    pub fn of<F: 'static>() -> Self {
        Self(TypeId::of::<F>())
    }
}

/// Running execution time statistics of one payload identity.
///
/// All fields are merged under relaxed atomics: readers may observe a mix of
/// two in-flight updates, which is acceptable — estimates feed heuristics,
/// not correctness.
pub struct TimingEntry {
    samples: AtomicU64,
    /// f64 bits; moving average of the observed durations.
    avg: AtomicU64,
    /// f64 bits; shortest observed duration.
    best: AtomicU64,
    /// f64 bits; longest observed duration.
    worst: AtomicU64,
}

// === impl TimingEntry ===

impl TimingEntry {
    fn new() -> Self {
        Self {
            samples: AtomicU64::new(0),
            avg: AtomicU64::new(0.0_f64.to_bits()),
            best: AtomicU64::new(f64::INFINITY.to_bits()),
            worst: AtomicU64::new(0.0_f64.to_bits()),
        }
    }

    /// Number of recorded samples.
    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    /// The moving average duration, or zero before the first sample.
    pub fn average(&self) -> f64 {
        f64::from_bits(self.avg.load(Ordering::Relaxed))
    }

    /// The shortest observed duration, or zero before the first sample.
    pub fn best(&self) -> f64 {
        let best = f64::from_bits(self.best.load(Ordering::Relaxed));
        if best.is_finite() { best } else { 0.0 }
    }

    /// The longest observed duration, or zero before the first sample.
    pub fn worst(&self) -> f64 {
        f64::from_bits(self.worst.load(Ordering::Relaxed))
    }

    /// The estimate selected by `model`.
    pub fn estimate(&self, model: TimeModel) -> f64 {
        match model {
            TimeModel::BestCase => self.best(),
            TimeModel::Average => self.average(),
            TimeModel::WorstCase => self.worst(),
        }
    }

    /// Merges one observed duration.
    ///
    /// Up to `sample_limit` samples the average is the true running mean;
    /// beyond that it degrades into an exponential moving average with window
    /// `sample_limit`, so old behavior ages out of long-lived entries.
    fn record(&self, elapsed: f64, sample_limit: u64) {
        let n = self.samples.fetch_add(1, Ordering::Relaxed);

        let mut current = self.avg.load(Ordering::Relaxed);
        loop {
            let avg = f64::from_bits(current);
            let window = n.min(sample_limit.saturating_sub(1));
            #[expect(clippy::cast_precision_loss, reason = "window is capped well below 2^52")]
            let next = avg + (elapsed - avg) / (window as f64 + 1.0);
            match self.avg.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        atomic_min(&self.best, elapsed);
        atomic_max(&self.worst, elapsed);
    }
}

impl fmt::Debug for TimingEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimingEntry")
            .field("samples", &self.samples())
            .field("avg", &self.average())
            .field("best", &self.best())
            .field("worst", &self.worst())
            .finish()
    }
}

fn atomic_min(cell: &AtomicU64, value: f64) {
    let mut current = cell.load(Ordering::Relaxed);
    while value < f64::from_bits(current) {
        match cell.compare_exchange_weak(
            current,
            value.to_bits(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

fn atomic_max(cell: &AtomicU64, value: f64) {
    let mut current = cell.load(Ordering::Relaxed);
    while value > f64::from_bits(current) {
        match cell.compare_exchange_weak(
            current,
            value.to_bits(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

/// Per-payload-identity execution time statistics.
///
/// Entries are created on first use and live for the table's lifetime, so
/// handing out [`Arc<TimingEntry>`]s to hot paths avoids the map lock.
pub struct VirtualTimeTable {
    sample_limit: u64,
    precise_measurements: bool,
    entries: RwLock<HashMap<Fingerprint, Arc<TimingEntry>>>,
}

// === impl VirtualTimeTable ===

impl VirtualTimeTable {
    /// Creates a table.
    ///
    /// `sample_limit` bounds the averaging window. With `precise_measurements`
    /// every execution is measured forever; without it, measurement of a
    /// payload identity stops once `sample_limit` samples were collected and
    /// the entry goes into a cheap steady state.
    #[must_use]
    pub fn new(sample_limit: u64, precise_measurements: bool) -> Self {
        Self {
            sample_limit: sample_limit.max(1),
            precise_measurements,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns (creating if necessary) the entry for `fingerprint`.
    pub fn entry(&self, fingerprint: Fingerprint) -> Arc<TimingEntry> {
        if let Some(entry) = self
            .entries
            .read()
            .expect("time table lock poisoned")
            .get(&fingerprint)
        {
            return Arc::clone(entry);
        }

        let mut entries = self.entries.write().expect("time table lock poisoned");
        Arc::clone(
            entries
                .entry(fingerprint)
                .or_insert_with(|| Arc::new(TimingEntry::new())),
        )
    }

    /// Starts a measurement for one execution of `fingerprint`, or `None`
    /// when the entry is saturated and measurements are not precise.
    pub fn start_measurement(&self, fingerprint: Fingerprint) -> Option<Measurement> {
        let entry = self.entry(fingerprint);
        if !self.precise_measurements && entry.samples() >= self.sample_limit {
            return None;
        }
        Some(Measurement {
            entry,
            sample_limit: self.sample_limit,
            started: Instant::now(),
        })
    }
}

impl fmt::Debug for VirtualTimeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualTimeTable")
            .field("sample_limit", &self.sample_limit)
            .field("precise_measurements", &self.precise_measurements)
            .finish_non_exhaustive()
    }
}

/// An in-flight execution time measurement.
///
/// Created when a workload is handed to a worker and completed when the
/// payload returns.
pub struct Measurement {
    entry: Arc<TimingEntry>,
    sample_limit: u64,
    started: Instant,
}

impl Measurement {
    /// Records the elapsed time into the owning entry.
    pub fn complete(self) {
        self.entry
            .record(self.started.elapsed().as_secs_f64(), self.sample_limit);
    }
}

impl fmt::Debug for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Measurement")
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_n(entry: &TimingEntry, values: &[f64], limit: u64) {
        for &value in values {
            entry.record(value, limit);
        }
    }

    #[test]
    fn entries_are_stable_and_shared() {
        let table = VirtualTimeTable::new(16, true);
        let a = table.entry(Fingerprint::of::<fn()>());
        let b = table.entry(Fingerprint::of::<fn()>());
        assert!(Arc::ptr_eq(&a, &b));

        let c = table.entry(Fingerprint::of::<fn(u8)>());
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn running_mean_below_limit() {
        let entry = TimingEntry::new();
        record_n(&entry, &[1.0, 2.0, 3.0], 16);
        assert_eq!(entry.samples(), 3);
        assert!((entry.average() - 2.0).abs() < 1e-9);
        assert!((entry.best() - 1.0).abs() < 1e-9);
        assert!((entry.worst() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn sliding_window_past_limit() {
        let entry = TimingEntry::new();
        record_n(&entry, &[1.0; 4], 4);
        assert!((entry.average() - 1.0).abs() < 1e-9);

        // past the cap, the average chases new observations instead of
        // freezing on ancient history
        record_n(&entry, &[5.0; 32], 4);
        assert!(entry.average() > 3.0, "average = {}", entry.average());
        assert!((entry.worst() - 5.0).abs() < 1e-9);
        assert!((entry.best() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn estimates_select_the_model() {
        let entry = TimingEntry::new();
        record_n(&entry, &[1.0, 3.0], 16);
        assert!((entry.estimate(TimeModel::BestCase) - 1.0).abs() < 1e-9);
        assert!((entry.estimate(TimeModel::Average) - 2.0).abs() < 1e-9);
        assert!((entry.estimate(TimeModel::WorstCase) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn unmeasured_entry_estimates_zero() {
        let entry = TimingEntry::new();
        assert_eq!(entry.estimate(TimeModel::BestCase), 0.0);
        assert_eq!(entry.estimate(TimeModel::Average), 0.0);
        assert_eq!(entry.estimate(TimeModel::WorstCase), 0.0);
    }

    #[test]
    fn imprecise_tables_stop_measuring_at_the_limit() {
        let table = VirtualTimeTable::new(2, false);
        let fingerprint = Fingerprint::of::<fn()>();

        for _ in 0..2 {
            table
                .start_measurement(fingerprint)
                .expect("below the limit")
                .complete();
        }
        assert!(table.start_measurement(fingerprint).is_none());

        let precise = VirtualTimeTable::new(2, true);
        for _ in 0..4 {
            precise
                .start_measurement(fingerprint)
                .expect("precise tables always measure")
                .complete();
        }
    }
}
