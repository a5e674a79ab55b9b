// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Common pipeline surface and shutdown bookkeeping.

use kernel::KernelPtr;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline is not running")]
    NotRunning,

    #[error("failed to spawn pipeline thread: {0}")]
    Spawn(std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PipelineState {
    #[default]
    Initial,
    Starting,
    Started,
    Stopping,
    Stopped,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Initial => "initial",
            PipelineState::Starting => "starting",
            PipelineState::Started => "started",
            PipelineState::Stopping => "stopping",
            PipelineState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Receives kernels at shutdown for graceful destruction.
#[derive(Default)]
pub struct KernelSack {
    kernels: Vec<KernelPtr>,
}

impl KernelSack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, k: KernelPtr) {
        self.kernels.push(k);
    }

    pub fn absorb(&mut self, other: KernelSack) {
        self.kernels.extend(other.kernels);
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

pub trait Pipeline: Send + Sync {
    fn name(&self) -> &'static str;

    /// Transfer ownership of a kernel into this pipeline. Thread-safe; the
    /// only handoff mechanism between pipelines.
    fn send(&self, k: KernelPtr);

    fn start(&self) -> Result<(), PipelineError>;

    /// Cooperative: sets the stopping flag and wakes waiters; queues drain
    /// before threads exit.
    fn stop(&self);

    /// Join the pipeline threads.
    fn wait(&self);

    /// Move every queued kernel into the sack.
    fn clear(&self, sack: &mut KernelSack);
}
