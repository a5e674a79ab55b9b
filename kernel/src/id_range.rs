// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Kernel id allocation. Each node draws ids from a contiguous range
//! derived from its interface address position within the subnet, so ids
//! assigned by different nodes never collide.

use crate::ifaddr::InterfaceAddress;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

#[derive(Debug)]
pub struct IdRange {
    min: u64,
    max: u64,
    next: AtomicU64,
}

impl Default for IdRange {
    /// Full id space; used by standalone processes and child applications,
    /// whose ids only need to be unique within the application instance.
    fn default() -> Self {
        Self::new(1, u64::MAX)
    }
}

impl IdRange {
    /// Half-open range `[min, max)`; `min` must be non-zero (id 0 means
    /// "unassigned").
    pub fn new(min: u64, max: u64) -> Self {
        let min = min.max(1);
        debug_assert!(min < max);
        Self { min, max, next: AtomicU64::new(min) }
    }

    /// Range of the node at `position` of a subnet with `count` host
    /// positions: `(max-min)/count * position`, sized `(max-min)/count`.
    pub fn for_interface(ifaddr: &InterfaceAddress) -> Self {
        let count = ifaddr.host_count();
        let position = ifaddr.position().min(count).max(1);
        let chunk = (u64::MAX - 1) / count;
        let min = 1 + chunk * (position - 1);
        Self::new(min, min + chunk)
    }

    pub fn min(&self) -> u64 {
        self.min
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn contains(&self, id: u64) -> bool {
        (self.min..self.max).contains(&id)
    }

    /// Next id. Wraps to the start of the range on exhaustion.
    pub fn allocate(&self) -> u64 {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        if id >= self.max {
            warn!(min = self.min, max = self.max, "kernel id range exhausted, wrapping");
            self.next.store(self.min + 1, Ordering::Relaxed);
            return self.min;
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_sequential() {
        let ids = IdRange::new(10, 14);
        assert_eq!(ids.allocate(), 10);
        assert_eq!(ids.allocate(), 11);
        assert!(ids.contains(10));
        assert!(!ids.contains(14));
    }

    #[test]
    fn wraps_on_exhaustion() {
        let ids = IdRange::new(5, 7);
        assert_eq!(ids.allocate(), 5);
        assert_eq!(ids.allocate(), 6);
        assert_eq!(ids.allocate(), 5);
    }

    #[test]
    fn interface_ranges_do_not_overlap() {
        let a = IdRange::for_interface(&"10.0.0.1/24".parse().unwrap());
        let b = IdRange::for_interface(&"10.0.0.2/24".parse().unwrap());
        let c = IdRange::for_interface(&"10.0.0.254/24".parse().unwrap());
        assert!(a.max() <= b.min());
        assert!(b.max() <= c.min());
        assert!(!a.contains(b.allocate()));
        assert!(!b.contains(a.allocate()));
    }

    #[test]
    fn zero_is_never_allocated() {
        let ids = IdRange::default();
        assert!(ids.allocate() != 0);
    }
}
