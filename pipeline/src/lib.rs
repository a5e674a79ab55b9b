// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Local pipelines of the arbor scheduler: the parallel worker pool that
//! executes kernels and the timer that releases scheduled kernels at their
//! due time. A pipeline is a thread (or thread pool) plus a queue; it is
//! the only unit that may run kernel code.

pub mod base;
pub mod parallel;
pub mod timer;

pub use base::{KernelSack, Pipeline, PipelineError, PipelineState};
pub use parallel::ParallelPipeline;
pub use timer::TimerPipeline;
