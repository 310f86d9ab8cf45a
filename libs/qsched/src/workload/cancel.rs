// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicBool, Ordering};
use crate::loom::sync::{Arc, Mutex};
use core::fmt;

type Hook = Box<dyn FnOnce() + Send>;

struct TokenInner {
    canceled: AtomicBool,
    hooks: Mutex<Vec<Hook>>,
}

/// The firing end of an external cancellation pair.
///
/// Firing is idempotent; registered hooks run exactly once, on the firing
/// thread.
pub struct CancellationSource {
    inner: Arc<TokenInner>,
}

/// The observing end of an external cancellation pair.
///
/// Cloned freely; attach one to a workload at schedule time to have the
/// workload canceled (pre-run) or cancellation-requested (mid-run) when the
/// source fires.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

// === impl CancellationSource ===

impl CancellationSource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                canceled: AtomicBool::new(false),
                hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A token observing this source.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Fires the source. The first call runs all registered hooks; later
    /// calls are no-ops.
    pub fn cancel(&self) {
        if self.inner.canceled.swap(true, Ordering::AcqRel) {
            return;
        }
        let hooks = {
            let mut hooks = self.inner.hooks.lock().expect("cancellation lock poisoned");
            core::mem::take(&mut *hooks)
        };
        tracing::debug!(hooks = hooks.len(), "cancellation source fired");
        for hook in hooks {
            hook();
        }
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationSource")
            .field("canceled", &self.inner.canceled.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// === impl CancellationToken ===

impl CancellationToken {
    /// Whether the source has fired.
    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }

    /// Registers a hook to run when the source fires. If it already fired,
    /// the hook runs inline on the registering thread.
    pub(crate) fn register(&self, hook: Hook) {
        if self.is_canceled() {
            hook();
            return;
        }
        let mut hooks = self.inner.hooks.lock().expect("cancellation lock poisoned");
        // the source may have fired between the check and the lock; the drain
        // in `cancel` holds the same lock, so re-check under it
        if self.inner.canceled.load(Ordering::Acquire) {
            drop(hooks);
            hook();
        } else {
            hooks.push(hook);
        }
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("canceled", &self.is_canceled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::sync::atomic::AtomicUsize;

    #[test]
    fn hooks_fire_once() {
        let source = CancellationSource::new();
        let token = source.token();
        let fired = Arc::new(AtomicUsize::new(0));

        let count = Arc::clone(&fired);
        token.register(Box::new(move || {
            count.fetch_add(1, Ordering::Relaxed);
        }));

        assert!(!token.is_canceled());
        source.cancel();
        source.cancel();
        assert!(token.is_canceled());
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn late_registration_runs_inline() {
        let source = CancellationSource::new();
        source.cancel();

        let fired = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&fired);
        source.token().register(Box::new(move || {
            count.fetch_add(1, Ordering::Relaxed);
        }));
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }
}
