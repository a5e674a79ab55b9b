// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Node discovery and hierarchy maintenance. Each bound interface runs a
//! small state machine that scans the subnet for a superior, joins its
//! subtree, and keeps subordinate weights current. All inter-node traffic
//! uses ordinary service kernels routed through the socket pipeline.

pub mod discoverer;
pub mod hierarchy;
pub mod position;
pub mod probe;
pub mod watcher;

pub use discoverer::{Discoverer, DiscovererState, DiscoveryConfig, DiscoveryState};
pub use hierarchy::{Hierarchy, HierarchyNode};
pub use position::{CandidateWalk, TreePosition, candidates};
pub use probe::{
    HIERARCHY_TYPE, HierarchyKernel, HierarchyUpdate, PROBE_TYPE, Probe, ScanKernel, ScanKind,
};
pub use watcher::NetworkWatcher;
