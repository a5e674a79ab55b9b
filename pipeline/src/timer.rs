// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Timer pipeline: one thread and a priority queue keyed by due time.
//! Kernels fire in non-decreasing `at` order, ties broken by insertion
//! order; a fired kernel has its schedule cleared and goes back to the
//! router for normal routing.

use crate::base::{KernelSack, Pipeline, PipelineError, PipelineState};
use kernel::{Kernel, KernelPtr, RouterRef};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::debug;

struct Entry {
    at: Instant,
    seq: u64,
    kernel: KernelPtr,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse to pop the soonest entry first
        other.at.cmp(&self.at).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerState {
    heap: BinaryHeap<Entry>,
    seq: u64,
    state: PipelineState,
}

struct Shared {
    state: Mutex<TimerState>,
    cv: Condvar,
    router: Arc<RouterRef>,
}

pub struct TimerPipeline {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerPipeline {
    pub fn new(router: Arc<RouterRef>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(TimerState {
                    heap: BinaryHeap::new(),
                    seq: 0,
                    state: PipelineState::Initial,
                }),
                cv: Condvar::new(),
                router,
            }),
            thread: Mutex::new(None),
        }
    }

    fn run(shared: &Shared) {
        let mut st = shared.state.lock();
        loop {
            if st.state == PipelineState::Stopping {
                break;
            }
            let now = Instant::now();
            let entry = match st.heap.peek() {
                None => {
                    shared.cv.wait(&mut st);
                    continue;
                }
                Some(soonest) if soonest.at > now => {
                    let deadline = soonest.at;
                    shared.cv.wait_until(&mut st, deadline);
                    continue;
                }
                Some(_) => st.heap.pop().expect("peeked"),
            };
            MutexGuard::unlocked(&mut st, || {
                let mut k = entry.kernel;
                k.base_mut().clear_at();
                shared.router.send(k);
            });
        }
    }
}

impl Pipeline for TimerPipeline {
    fn name(&self) -> &'static str {
        "timer"
    }

    fn send(&self, k: KernelPtr) {
        let mut st = self.shared.state.lock();
        let at = k.base().at().unwrap_or_else(Instant::now);
        let seq = st.seq;
        st.seq += 1;
        st.heap.push(Entry { at, seq, kernel: k });
        self.shared.cv.notify_one();
    }

    fn start(&self) -> Result<(), PipelineError> {
        self.shared.state.lock().state = PipelineState::Started;
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("timer".into())
            .spawn(move || Self::run(&shared))
            .map_err(PipelineError::Spawn)?;
        *self.thread.lock() = Some(handle);
        debug!("timer pipeline started");
        Ok(())
    }

    fn stop(&self) {
        self.shared.state.lock().state = PipelineState::Stopping;
        self.shared.cv.notify_all();
    }

    fn wait(&self) {
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
        self.shared.state.lock().state = PipelineState::Stopped;
    }

    fn clear(&self, sack: &mut KernelSack) {
        let mut st = self.shared.state.lock();
        for entry in st.heap.drain() {
            sack.push(entry.kernel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel::{Kernel, KernelBase, KernelPtr, Router, kernel_base};
    use std::time::Duration;

    #[derive(Default)]
    struct Tick {
        base: KernelBase,
        ordinal: u32,
    }

    impl Kernel for Tick {
        kernel_base!(base);
    }

    struct Recorder {
        fired: crossbeam_channel::Sender<u32>,
    }

    impl Router for Recorder {
        fn send(&self, k: KernelPtr) {
            assert!(!k.base().scheduled(), "schedule must be cleared on fire");
            let tick = k.as_any().downcast_ref::<Tick>().expect("tick");
            let _ = self.fired.send(tick.ordinal);
        }

        fn send_remote(&self, k: KernelPtr) {
            self.send(k);
        }

        fn forward(&self, _k: kernel::ForeignKernel) {}
    }

    fn harness() -> (TimerPipeline, crossbeam_channel::Receiver<u32>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let router_ref = Arc::new(RouterRef::new());
        let router: Arc<dyn Router> = Arc::new(Recorder { fired: tx });
        router_ref.bind(Arc::downgrade(&router));
        std::mem::forget(router);
        let timer = TimerPipeline::new(router_ref);
        timer.start().unwrap();
        (timer, rx)
    }

    #[test]
    fn fires_in_due_time_order() {
        let (timer, fired) = harness();
        let base_time = Instant::now() + Duration::from_millis(50);
        // submitted in reverse chronological order
        for ordinal in (1..=10u32).rev() {
            let mut tick = Tick { ordinal, ..Default::default() };
            tick.base_mut().set_at(base_time + Duration::from_millis(10 * u64::from(ordinal)));
            timer.send(Box::new(tick));
        }
        let observed: Vec<u32> =
            (0..10).map(|_| fired.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        assert_eq!(observed, (1..=10).collect::<Vec<_>>());
        timer.stop();
        timer.wait();
    }

    #[test]
    fn ties_fire_in_insertion_order() {
        let (timer, fired) = harness();
        let at = Instant::now() + Duration::from_millis(30);
        for ordinal in [3u32, 1, 2] {
            let mut tick = Tick { ordinal, ..Default::default() };
            tick.base_mut().set_at(at);
            timer.send(Box::new(tick));
        }
        let observed: Vec<u32> =
            (0..3).map(|_| fired.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        assert_eq!(observed, vec![3, 1, 2]);
        timer.stop();
        timer.wait();
    }

    #[test]
    fn unscheduled_kernels_fire_immediately() {
        let (timer, fired) = harness();
        timer.send(Box::new(Tick { ordinal: 9, ..Default::default() }));
        assert_eq!(fired.recv_timeout(Duration::from_secs(5)).unwrap(), 9);
        timer.stop();
        timer.wait();
    }

    #[test]
    fn stop_forgets_pending_kernels_into_sack() {
        let (timer, fired) = harness();
        let mut tick = Tick { ordinal: 1, ..Default::default() };
        tick.base_mut().set_at(Instant::now() + Duration::from_secs(3600));
        timer.send(Box::new(tick));
        timer.stop();
        timer.wait();
        let mut sack = KernelSack::new();
        timer.clear(&mut sack);
        assert_eq!(sack.len(), 1);
        assert!(fired.try_recv().is_err());
    }
}
