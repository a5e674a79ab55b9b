// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Routing seam between pipelines and the factory. Pipelines hold a
//! [`RouterRef`] that the composition root points at itself once it is
//! fully built, so no hidden global is involved.

use crate::foreign::ForeignKernel;
use crate::kernel::KernelPtr;
use std::sync::{Arc, OnceLock, Weak};
use tracing::error;

pub trait Router: Send + Sync {
    /// Route a kernel by the routing decision table.
    fn send(&self, k: KernelPtr);

    /// Force a kernel onto the socket pipeline.
    fn send_remote(&self, k: KernelPtr);

    /// Route an opaque kernel on behalf of another application.
    fn forward(&self, k: ForeignKernel);
}

/// Late-bound, weakly held reference to the process router.
#[derive(Default)]
pub struct RouterRef {
    slot: OnceLock<Weak<dyn Router>>,
}

impl RouterRef {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the router. Only the first call takes effect.
    pub fn bind(&self, router: Weak<dyn Router>) {
        let _ = self.slot.set(router);
    }

    pub fn get(&self) -> Option<Arc<dyn Router>> {
        self.slot.get().and_then(Weak::upgrade)
    }

    pub fn send(&self, k: KernelPtr) {
        match self.get() {
            Some(router) => router.send(k),
            None => error!(id = k.base().id(), "no router bound, kernel dropped"),
        }
    }

    pub fn send_remote(&self, k: KernelPtr) {
        match self.get() {
            Some(router) => router.send_remote(k),
            None => error!(id = k.base().id(), "no router bound, kernel dropped"),
        }
    }

    pub fn forward(&self, k: ForeignKernel) {
        match self.get() {
            Some(router) => router.forward(k),
            None => error!("no router bound, foreign kernel dropped"),
        }
    }
}
