// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Parallel pipeline: a fixed pool of worker threads running `act` and
//! `react`.
//!
//! Upstream kernels share one FIFO. Downstream kernels go to a per-worker
//! FIFO selected by a hash of the principal id, so `react` invocations of
//! one principal are serialized on a single worker while different
//! principals proceed in parallel.

use crate::base::{KernelSack, Pipeline, PipelineError, PipelineState};
use kernel::{Context, ExitCode, IdRange, InstanceRegistry, Kernel, KernelPtr, RouterRef, Step};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error};

struct Queues {
    upstream: VecDeque<KernelPtr>,
    downstream: Vec<VecDeque<KernelPtr>>,
    state: PipelineState,
}

struct Shared {
    queues: Mutex<Queues>,
    cv: Condvar,
    router: Arc<RouterRef>,
    instances: Arc<InstanceRegistry>,
    ids: Arc<IdRange>,
}

pub struct ParallelPipeline {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    nthreads: usize,
}

impl ParallelPipeline {
    pub fn new(
        nthreads: usize,
        router: Arc<RouterRef>,
        instances: Arc<InstanceRegistry>,
        ids: Arc<IdRange>,
    ) -> Self {
        let nthreads = nthreads.max(1);
        Self {
            shared: Arc::new(Shared {
                queues: Mutex::new(Queues {
                    upstream: VecDeque::new(),
                    downstream: (0..nthreads).map(|_| VecDeque::new()).collect(),
                    state: PipelineState::Initial,
                }),
                cv: Condvar::new(),
                router,
                instances,
                ids,
            }),
            threads: Mutex::new(Vec::new()),
            nthreads,
        }
    }

    pub fn nthreads(&self) -> usize {
        self.nthreads
    }

    fn worker_index(&self, principal_id: u64) -> usize {
        // cheap stable hash; enough to spread principals over the pool
        (principal_id.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize % self.nthreads
    }

    fn worker_loop(index: usize, shared: &Shared) {
        loop {
            let item = {
                let mut q = shared.queues.lock();
                loop {
                    if let Some(k) = q.downstream[index].pop_front() {
                        break Some(k);
                    }
                    if let Some(k) = q.upstream.pop_front() {
                        break Some(k);
                    }
                    if q.state == PipelineState::Stopping {
                        break None;
                    }
                    shared.cv.wait(&mut q);
                }
            };
            let Some(k) = item else { break };
            if k.base().moves_downstream() {
                Self::deliver(shared, k);
            } else {
                Self::execute(shared, k);
            }
        }
    }

    /// Run `act` of an upstream kernel.
    fn execute(shared: &Shared, mut k: KernelPtr) {
        let Some(router) = shared.router.get() else {
            error!("parallel pipeline has no router, kernel dropped");
            return;
        };
        let mut ctx = Context::new(&*router, &shared.ids);
        let verdict = catch_unwind(AssertUnwindSafe(|| k.act(&mut ctx)));
        let pending = ctx.take_pending();
        match verdict {
            Err(payload) => {
                error!(
                    id = k.base().id(),
                    dropped_children = pending.len(),
                    panic = panic_message(&payload),
                    "kernel panicked in act"
                );
            }
            Ok(step) => {
                Self::apply(shared, &*router, k, step);
                for child in pending {
                    router.send(child);
                }
            }
        }
    }

    /// Deliver a downstream kernel to its principal's `react`/`error`.
    fn deliver(shared: &Shared, k: KernelPtr) {
        let Some(router) = shared.router.get() else {
            error!("parallel pipeline has no router, kernel dropped");
            return;
        };
        let Some(principal_id) = k.base().principal().id() else {
            error!(id = k.base().id(), "downstream kernel without principal");
            return;
        };
        let Some(mut principal) = shared.instances.take(principal_id) else {
            error!(
                id = k.base().id(),
                principal = principal_id,
                code = %ExitCode::NoPrincipalFound,
                "downstream delivery missed its target"
            );
            return;
        };
        let failed = !k.base().result().is_success();
        let mut ctx = Context::new(&*router, &shared.ids);
        let verdict = catch_unwind(AssertUnwindSafe(|| {
            if failed { principal.error(k, &mut ctx) } else { principal.react(k, &mut ctx) }
        }));
        let pending = ctx.take_pending();
        match verdict {
            Err(payload) => {
                shared.instances.discard(principal_id);
                error!(
                    principal = principal_id,
                    dropped_children = pending.len(),
                    panic = panic_message(&payload),
                    "kernel panicked in react"
                );
            }
            Ok(step) => {
                if step != Step::Park {
                    // the principal will not re-park; drop its checked-out
                    // marker before it is routed onward
                    shared.instances.discard(principal_id);
                }
                Self::apply(shared, &*router, principal, step);
                for child in pending {
                    router.send(child);
                }
            }
        }
    }

    fn apply(shared: &Shared, router: &dyn kernel::Router, mut k: KernelPtr, step: Step) {
        match step {
            Step::Park => {
                if !k.base().has_id() {
                    k.base_mut().set_id(shared.ids.allocate());
                }
                if let Err(e) = shared.instances.insert(k) {
                    error!(error = %e, "failed to park kernel");
                }
            }
            Step::Return => {
                if k.base().result().is_undefined() {
                    k.base_mut().set_result(ExitCode::Success);
                }
                router.send(k);
            }
            Step::Requeue => router.send(k),
            Step::Done => {}
        }
    }
}

impl Pipeline for ParallelPipeline {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn send(&self, k: KernelPtr) {
        if k.base().new_thread() && k.base().moves_upstream() {
            let shared = Arc::clone(&self.shared);
            match std::thread::Builder::new()
                .name("parallel/new".into())
                .spawn(move || Self::execute(&shared, k))
            {
                Ok(handle) => self.threads.lock().push(handle),
                Err(e) => error!(error = %e, "failed to spawn dedicated kernel thread"),
            }
            return;
        }
        let mut q = self.shared.queues.lock();
        if k.base().moves_downstream() {
            let index = self.worker_index(k.base().principal().id().unwrap_or(0));
            q.downstream[index].push_back(k);
            // the pinned worker shares the condvar with the pool
            self.shared.cv.notify_all();
        } else {
            q.upstream.push_back(k);
            self.shared.cv.notify_one();
        }
    }

    fn start(&self) -> Result<(), PipelineError> {
        {
            let mut q = self.shared.queues.lock();
            q.state = PipelineState::Started;
        }
        let mut threads = self.threads.lock();
        for index in 0..self.nthreads {
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name(format!("parallel/{index}"))
                .spawn(move || Self::worker_loop(index, &shared))
                .map_err(PipelineError::Spawn)?;
            threads.push(handle);
        }
        debug!(nthreads = self.nthreads, "parallel pipeline started");
        Ok(())
    }

    fn stop(&self) {
        let mut q = self.shared.queues.lock();
        q.state = PipelineState::Stopping;
        self.shared.cv.notify_all();
    }

    fn wait(&self) {
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        self.shared.queues.lock().state = PipelineState::Stopped;
    }

    fn clear(&self, sack: &mut KernelSack) {
        let mut q = self.shared.queues.lock();
        for k in q.upstream.drain(..) {
            sack.push(k);
        }
        for queue in &mut q.downstream {
            for k in queue.drain(..) {
                sack.push(k);
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel::{Kernel, KernelBase, Router, kernel_base};
    use std::sync::OnceLock;
    use std::time::Duration;

    /// Routes kernels back into the pipeline; kernels that finish with no
    /// principal are reported on a channel, like the factory's exit path.
    struct LoopRouter {
        pipeline: OnceLock<Arc<ParallelPipeline>>,
        exits: crossbeam_channel::Sender<ExitCode>,
    }

    impl Router for LoopRouter {
        fn send(&self, k: KernelPtr) {
            if k.base().moves_downstream() && k.base().principal().is_none() {
                let _ = self.exits.send(k.base().result());
                return;
            }
            self.pipeline.get().expect("bound").send(k);
        }

        fn send_remote(&self, k: KernelPtr) {
            self.send(k);
        }

        fn forward(&self, _k: kernel::ForeignKernel) {}
    }

    #[derive(Default)]
    struct Child {
        base: KernelBase,
        fail: bool,
    }

    impl Kernel for Child {
        kernel_base!(base);

        fn act(&mut self, _ctx: &mut Context<'_>) -> Step {
            if self.fail {
                self.base.set_result(ExitCode::Error);
            }
            Step::Return
        }
    }

    #[derive(Default)]
    struct Parent {
        base: KernelBase,
        children: u32,
        done: u32,
        failures: u32,
    }

    impl Kernel for Parent {
        kernel_base!(base);

        fn act(&mut self, ctx: &mut Context<'_>) -> Step {
            for i in 0..self.children {
                let child = Child { fail: i == 0 && self.children > 5, ..Default::default() };
                ctx.upstream(&mut self.base, Box::new(child));
            }
            Step::Park
        }

        fn react(&mut self, _child: KernelPtr, _ctx: &mut Context<'_>) -> Step {
            self.done += 1;
            if self.done == self.children { Step::Return } else { Step::Park }
        }

        fn error(&mut self, child: KernelPtr, ctx: &mut Context<'_>) -> Step {
            self.failures += 1;
            self.react(child, ctx)
        }
    }

    #[derive(Default)]
    struct Bomb {
        base: KernelBase,
    }

    impl Kernel for Bomb {
        kernel_base!(base);

        fn act(&mut self, _ctx: &mut Context<'_>) -> Step {
            panic!("boom");
        }
    }

    fn harness(nthreads: usize) -> (Arc<ParallelPipeline>, crossbeam_channel::Receiver<ExitCode>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let router_ref = Arc::new(RouterRef::new());
        let pipeline = Arc::new(ParallelPipeline::new(
            nthreads,
            Arc::clone(&router_ref),
            Arc::new(InstanceRegistry::new()),
            Arc::new(IdRange::default()),
        ));
        let looped = Arc::new(LoopRouter { pipeline: OnceLock::new(), exits: tx });
        let _ = looped.pipeline.set(Arc::clone(&pipeline));
        let router: Arc<dyn Router> = looped;
        router_ref.bind(Arc::downgrade(&router));
        // keep the router alive for the lifetime of the test
        std::mem::forget(router);
        pipeline.start().unwrap();
        (pipeline, rx)
    }

    #[test]
    fn fork_join_completes() {
        let (pipeline, exits) = harness(4);
        pipeline.send(Box::new(Parent { children: 10, ..Default::default() }));
        let code = exits.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(code, ExitCode::Success);
        pipeline.stop();
        pipeline.wait();
    }

    #[test]
    fn failed_child_goes_through_error() {
        let (pipeline, exits) = harness(2);
        // children > 5 makes the first child fail
        pipeline.send(Box::new(Parent { children: 6, ..Default::default() }));
        let code = exits.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(code, ExitCode::Success);
        pipeline.stop();
        pipeline.wait();
    }

    #[test]
    fn panic_kills_only_the_kernel() {
        let (pipeline, exits) = harness(1);
        pipeline.send(Box::new(Bomb::default()));
        pipeline.send(Box::new(Parent { children: 2, ..Default::default() }));
        let code = exits.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(code, ExitCode::Success);
        pipeline.stop();
        pipeline.wait();
    }

    #[test]
    fn clear_moves_queued_kernels_to_sack() {
        let router_ref = Arc::new(RouterRef::new());
        let pipeline = ParallelPipeline::new(
            2,
            router_ref,
            Arc::new(InstanceRegistry::new()),
            Arc::new(IdRange::default()),
        );
        // never started: kernels stay queued
        pipeline.send(Box::new(Child::default()));
        pipeline.send(Box::new(Child::default()));
        let mut sack = KernelSack::new();
        pipeline.clear(&mut sack);
        assert_eq!(sack.len(), 2);
    }
}
