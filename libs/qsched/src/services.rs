// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The opaque service-provider seam for the dependency-injected worker pool.
//!
//! The scheduler core never interprets services: it obtains one provider per
//! worker from a [`ServiceProviderFactory`], attaches it to every workload
//! before execution, and disposes it when the worker exits. How services are
//! declared and resolved (singleton vs. transient, containers, …) is entirely
//! the provider's business.

use core::any::{Any, TypeId};
use std::sync::Arc;

/// A resolved set of services available to payloads during execution.
pub trait ServiceProvider: Send + Sync {
    /// Looks up the service registered for `type_id`, if any.
    fn get(&self, type_id: TypeId) -> Option<&(dyn Any + Send + Sync)>;

    /// Called once when the owning worker exits. Providers holding resources
    /// (connections, scoped containers) release them here.
    fn dispose(&self) {}
}

impl dyn ServiceProvider {
    /// Looks up a service of type `T`.
    pub fn try_get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.get(TypeId::of::<T>())?.downcast_ref()
    }

    /// Looks up a service of type `T`, panicking if it was not supplied.
    ///
    /// # Panics
    ///
    /// Panics if no service of type `T` is registered. Inside a payload the
    /// panic is trapped by the worker and faults only the workload.
    pub fn get_required<T: Any + Send + Sync>(&self) -> &T {
        self.try_get().unwrap_or_else(|| {
            panic!(
                "required service {} was not supplied",
                core::any::type_name::<T>()
            )
        })
    }
}

/// Produces one [`ServiceProvider`] per worker.
pub trait ServiceProviderFactory: Send + Sync {
    /// Creates the provider a freshly spawned worker will hand to its
    /// workloads.
    fn create(&self) -> Arc<dyn ServiceProvider>;
}
