// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// Errors produced by scheduling operations.
///
/// These surface synchronously on the *scheduling* thread; failures inside a
/// payload never take this shape — they are trapped at the worker boundary
/// and reported through the workload's
/// [`WorkloadResult`](crate::workload::WorkloadResult).
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SchedulerError {
    /// Invalid configuration input, rejected before it takes effect.
    Configuration(ConfigError),
    /// The target qdisc (or the whole scheduler) was completed/disposed.
    Closed,
    /// `schedule_by_handle` found no qdisc with the requested handle.
    UnknownHandle,
    /// An internal invariant was violated. On a scheduling thread this is
    /// propagated to the caller; workers log it and fault the workload
    /// instead of unwinding.
    Inconsistency(&'static str),
}

impl From<ConfigError> for SchedulerError {
    fn from(err: ConfigError) -> Self {
        Self::Configuration(err)
    }
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::Configuration(err) => write!(f, "invalid configuration: {err}"),
            SchedulerError::Closed => f.write_str("scheduler or qdisc was completed"),
            SchedulerError::UnknownHandle => f.write_str("no qdisc with the requested handle"),
            SchedulerError::Inconsistency(what) => {
                write!(f, "scheduler invariant violated: {what}")
            }
        }
    }
}

impl core::error::Error for SchedulerError {}

/// Invalid builder/configuration input.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ConfigError {
    /// Two qdiscs within one tree carry the same handle.
    DuplicateHandle,
    /// A bounded qdisc was requested with capacity zero.
    ZeroCapacity,
    /// A worker pool was requested with a concurrency cap of zero.
    ZeroConcurrency,
    /// Adding the child would exceed the classful fan-out limit.
    FanOutExceeded {
        /// The fixed per-qdisc child limit.
        max: usize,
    },
    /// A weighted-fair child was given a non-positive weight or punishment
    /// factor.
    InvalidWeight,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::DuplicateHandle => f.write_str("duplicate qdisc handle"),
            ConfigError::ZeroCapacity => f.write_str("bounded qdisc capacity must be non-zero"),
            ConfigError::ZeroConcurrency => f.write_str("worker pool concurrency must be >= 1"),
            ConfigError::FanOutExceeded { max } => {
                write!(f, "classful qdisc fan-out limit ({max}) exceeded")
            }
            ConfigError::InvalidWeight => {
                f.write_str("scheduling weights and punishment factors must be positive")
            }
        }
    }
}

impl core::error::Error for ConfigError {}

/// Marker error signalling cooperative cancellation out of a payload.
///
/// Returned by
/// [`throw_if_cancellation_requested`](crate::workload::WorkloadContext::throw_if_cancellation_requested)
/// so payloads can bail with `?`; the worker converts it into the `Canceled`
/// terminal status.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Canceled(pub(crate) ());

impl fmt::Display for Canceled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("canceled")
    }
}

impl core::error::Error for Canceled {}
