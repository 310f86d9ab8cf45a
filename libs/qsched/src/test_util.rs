// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::Canceled;
use crate::time::Fingerprint;
use crate::workload::{ContextOptions, PayloadCell, Workload, WorkloadContext, WorkloadRef};

pub(crate) fn trace_init() {
    #[cfg(not(loom))]
    {
        use tracing_subscriber::EnvFilter;
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_names(true)
            .try_init();
    }
}

/// Builds a plain (awaitable, non-pooled) workload around `payload` for
/// qdisc-level tests that bypass the factory.
pub(crate) fn workload<F>(payload: F) -> WorkloadRef<u32>
where
    F: FnOnce(&WorkloadContext<'_, u32>) -> Result<(), Canceled> + Send + 'static,
{
    Workload::new(
        PayloadCell {
            func: Box::new(payload),
            fingerprint: Fingerprint::of::<F>(),
        },
        false,
        ContextOptions::default(),
    )
}

/// A no-op workload.
pub(crate) fn noop_workload() -> WorkloadRef<u32> {
    workload(|_| Ok(()))
}
