// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Per-interface discovery state machine and the process-wide table of
//! hierarchies consulted by routing.
//!
//! States: `Initial` (nothing probed yet), `Probing` (walking the
//! candidate list), `Joined` (has a superior, reprobed every scan
//! interval), `Head` (no reachable superior; root of the subnet). The
//! candidate order is deterministic, so two nodes that briefly both
//! consider themselves heads converge on the next scan round.

use crate::hierarchy::{Hierarchy, HierarchyNode};
use crate::position::candidates;
use crate::probe::{HierarchyKernel, HierarchyUpdate, Probe};
use kernel::{InterfaceAddress, KernelPtr, Weight};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Fan-out of the implicit candidate tree.
    pub fanout: u64,
    /// Reprobe period.
    pub scan_interval: Duration,
    /// How long a subordinate may stay disconnected before removal.
    pub failure_timeout: Duration,
    /// TCP port every daemon listens on.
    pub port: u16,
    /// Opaque scalar matched against kernel resource tags.
    pub resource_tag: u64,
    /// How often network interfaces are re-enumerated.
    pub interface_update_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            fanout: 64,
            scan_interval: Duration::from_secs(30),
            failure_timeout: Duration::from_secs(60),
            port: 33333,
            resource_tag: 0,
            interface_update_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscovererState {
    Initial,
    Probing,
    Joined,
    Head,
}

pub struct Discoverer {
    hierarchy: Hierarchy,
    state: DiscovererState,
    /// Remaining candidate positions of the current walk.
    walk: Vec<u64>,
    /// Probe in flight; answered probes clear this, a scan tick finding it
    /// still set treats the target as unreachable.
    outstanding: Option<SocketAddr>,
    last_pushed_weight: Option<Weight>,
    weight_pushed_at: Option<Instant>,
}

impl Discoverer {
    fn new(ifaddr: InterfaceAddress, port: u16) -> Self {
        let local = SocketAddr::new(ifaddr.address().into(), port);
        Self {
            hierarchy: Hierarchy::new(ifaddr, local),
            state: DiscovererState::Initial,
            walk: Vec::new(),
            outstanding: None,
            last_pushed_weight: None,
            weight_pushed_at: None,
        }
    }

    pub fn state(&self) -> DiscovererState {
        self.state
    }

    pub fn hierarchy(&self) -> &Hierarchy {
        &self.hierarchy
    }

    fn begin_walk(&mut self, fanout: u64) {
        let position = self.hierarchy.interface_address().position();
        let count = self.hierarchy.interface_address().host_count();
        self.walk = candidates(position.clamp(1, count), fanout).collect();
        self.walk.reverse(); // popped from the back
        self.state = DiscovererState::Probing;
        self.outstanding = None;
    }

    /// Address of the next candidate superior; `None` turns this node into
    /// the head of its subnet.
    fn next_candidate(&mut self) -> Option<SocketAddr> {
        let ifaddr = self.hierarchy.interface_address();
        while let Some(position) = self.walk.pop() {
            if let Some(addr) = ifaddr.address_at(position) {
                if addr != ifaddr.address() {
                    return Some(SocketAddr::new(addr.into(), self.hierarchy.local_address().port()));
                }
            }
        }
        None
    }
}

#[derive(Default)]
pub struct DiscoveryState {
    config: DiscoveryConfig,
    inner: Mutex<BTreeMap<InterfaceAddress, Discoverer>>,
}

impl DiscoveryState {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config, inner: Mutex::new(BTreeMap::new()) }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn local_resource_tag(&self) -> u64 {
        self.config.resource_tag
    }

    pub fn add_interface(&self, ifaddr: InterfaceAddress) -> bool {
        let mut inner = self.inner.lock();
        if inner.contains_key(&ifaddr) {
            return false;
        }
        inner.insert(ifaddr, Discoverer::new(ifaddr, self.config.port));
        true
    }

    pub fn remove_interface(&self, ifaddr: &InterfaceAddress) {
        self.inner.lock().remove(ifaddr);
    }

    pub fn interfaces(&self) -> Vec<InterfaceAddress> {
        self.inner.lock().keys().copied().collect()
    }

    /// Superior of the first joined interface; routing sends
    /// `SEND_TO_SUPERIOR_NODE` kernels there.
    pub fn superior_address(&self) -> Option<SocketAddr> {
        self.inner
            .lock()
            .values()
            .find_map(|d| d.hierarchy.superior().map(|n| n.socket_address))
    }

    /// Live subordinates across all interfaces, in address order.
    pub fn subordinates(&self) -> Vec<HierarchyNode> {
        let inner = self.inner.lock();
        let mut nodes: Vec<HierarchyNode> =
            inner.values().flat_map(|d| d.hierarchy.subordinates()).collect();
        nodes.sort_by_key(|n| n.socket_address);
        nodes
    }

    /// One display line per interface hierarchy.
    pub fn snapshot(&self) -> Vec<String> {
        self.inner.lock().values().map(|d| d.hierarchy.to_string()).collect()
    }

    /// Scan tick: reprobe superiors, advance candidate walks, expire lost
    /// subordinates. Returns the kernels to route.
    pub fn on_scan(&self) -> Vec<KernelPtr> {
        let now = Instant::now();
        let mut out: Vec<KernelPtr> = Vec::new();
        let mut inner = self.inner.lock();
        for d in inner.values_mut() {
            // a probe left unanswered for a whole scan interval means the
            // target is gone
            match d.state {
                DiscovererState::Initial | DiscovererState::Head => {
                    d.begin_walk(self.config.fanout);
                    self.advance(d, &mut out);
                }
                DiscovererState::Probing => {
                    if d.outstanding.take().is_some() {
                        self.advance(d, &mut out);
                    } else {
                        d.begin_walk(self.config.fanout);
                        self.advance(d, &mut out);
                    }
                }
                DiscovererState::Joined => {
                    if d.outstanding.take().is_some() {
                        info!(
                            "unset principal {}",
                            d.hierarchy.superior().map_or_else(
                                || "?".to_string(),
                                |n| n.socket_address.to_string()
                            )
                        );
                        d.hierarchy.set_superior(None);
                        d.begin_walk(self.config.fanout);
                        self.advance(d, &mut out);
                    } else if let Some(superior) = d.hierarchy.superior() {
                        let target = superior.socket_address;
                        d.outstanding = Some(target);
                        out.push(self.make_probe(d, target));
                    }
                }
            }
            // failure timeout on lost subordinates
            let removed = d.hierarchy.remove_lost(self.config.failure_timeout, now);
            for addr in &removed {
                info!("remove subordinate {}", addr.ip());
            }
            // rate-limited inside; fires immediately on weight changes
            self.push_weight(d, &mut out);
        }
        out
    }

    /// Move to the next candidate and emit a probe for it, or become head.
    fn advance(&self, d: &mut Discoverer, out: &mut Vec<KernelPtr>) {
        match d.next_candidate() {
            Some(target) => {
                d.state = DiscovererState::Probing;
                d.outstanding = Some(target);
                debug!(candidate = %target, "probing");
                out.push(self.make_probe(d, target));
            }
            None => {
                if d.state != DiscovererState::Head {
                    debug!(ifaddr = %d.hierarchy.interface_address(), "no candidates, acting as head");
                }
                d.state = DiscovererState::Head;
                d.outstanding = None;
            }
        }
    }

    fn make_probe(&self, d: &Discoverer, target: SocketAddr) -> KernelPtr {
        let sender = HierarchyNode::new(
            d.hierarchy.local_address(),
            d.hierarchy.total_weight(),
            self.config.resource_tag,
        );
        let old = d.hierarchy.superior().map(|n| n.socket_address);
        Box::new(Probe::new(d.hierarchy.interface_address(), old, target, sender))
    }

    /// A probe came back. Accept makes the target our superior; reject or
    /// failure advances the walk.
    pub fn on_probe_response(&self, probe: &Probe, failed: bool) -> Vec<KernelPtr> {
        let mut out: Vec<KernelPtr> = Vec::new();
        let mut inner = self.inner.lock();
        let Some(d) = inner.get_mut(&probe.interface_address()) else {
            return out;
        };
        let Some(target) = probe.new_superior() else { return out };
        if d.outstanding != Some(target) {
            // stale response from an earlier round
            return out;
        }
        d.outstanding = None;
        if failed || !probe.accepted() {
            match d.state {
                DiscovererState::Joined => {
                    // reprobe of the current superior failed
                    info!("unset principal {}", target);
                    d.hierarchy.set_superior(None);
                    d.begin_walk(self.config.fanout);
                    self.advance(d, &mut out);
                }
                _ => self.advance(d, &mut out),
            }
            return out;
        }
        let node = probe
            .responder()
            .copied()
            .unwrap_or_else(|| HierarchyNode::new(target, Weight::new(0), 0));
        let old = d.hierarchy.superior().map(|n| n.socket_address);
        let changed = d.hierarchy.set_superior(Some(node));
        d.state = DiscovererState::Joined;
        d.walk.clear();
        if changed {
            info!("set principal to {}", target.ip());
            // tell the old superior we left
            if let Some(old) = old.filter(|o| *o != target) {
                let me = HierarchyNode::new(
                    d.hierarchy.local_address(),
                    d.hierarchy.total_weight(),
                    self.config.resource_tag,
                );
                out.push(Box::new(HierarchyKernel::new(
                    d.hierarchy.interface_address(),
                    HierarchyUpdate::Unsubscribe,
                    me,
                    old,
                )));
            }
        }
        out
    }

    /// Remote side of the probe: decide whether the sender becomes a
    /// subordinate. Accepts unless the sender is this node itself or its
    /// current superior (which would form a cycle).
    pub fn on_probe_request(&self, probe: &Probe) -> (bool, Option<HierarchyNode>) {
        let mut inner = self.inner.lock();
        let keys = inner_keys(&inner);
        let key = interface_of(&probe.interface_address(), &keys);
        let Some(d) = inner.get_mut(&key) else {
            return (false, None);
        };
        let Some(sender) = probe.sender().copied() else { return (false, None) };
        if sender.socket_address == d.hierarchy.local_address() {
            return (false, None);
        }
        if d.hierarchy.superior().is_some_and(|s| s.socket_address == sender.socket_address) {
            // the sender is our superior; accepting would form a cycle
            return (false, None);
        }
        let target_is_me = probe
            .new_superior()
            .is_some_and(|t| t == d.hierarchy.local_address());
        if target_is_me {
            if d.hierarchy.add_subordinate(sender) {
                info!("add subordinate {}", sender.socket_address.ip());
            }
        } else if probe.old_superior().is_some_and(|o| o == d.hierarchy.local_address())
            && d.hierarchy.remove_subordinate(&sender.socket_address)
        {
            info!("remove subordinate {}", sender.socket_address.ip());
        }
        let me = HierarchyNode::new(
            d.hierarchy.local_address(),
            d.hierarchy.total_weight(),
            self.config.resource_tag,
        );
        (true, Some(me))
    }

    /// Subordinate-set or weight update pushed by a neighbor. The kernel
    /// carries the sender's interface address; match it by subnet.
    pub fn on_hierarchy(&self, hk: &HierarchyKernel) {
        let mut inner = self.inner.lock();
        let keys = inner_keys(&inner);
        let key = interface_of(&hk.interface_address(), &keys);
        let Some(d) = inner.get_mut(&key) else { return };
        let Some(node) = hk.node().copied() else { return };
        let changed = match hk.update() {
            HierarchyUpdate::Subscribe => {
                if d.hierarchy.add_subordinate(node) {
                    info!("add subordinate {}", node.socket_address.ip());
                    true
                } else {
                    false
                }
            }
            HierarchyUpdate::Unsubscribe => {
                if d.hierarchy.remove_subordinate(&node.socket_address) {
                    info!("remove subordinate {}", node.socket_address.ip());
                    true
                } else {
                    false
                }
            }
            HierarchyUpdate::Weight => {
                if d.hierarchy.superior().is_some_and(|s| s.socket_address == node.socket_address)
                {
                    d.hierarchy.set_superior_weight(node.weight)
                } else {
                    d.hierarchy.set_subordinate(&node.socket_address, node)
                }
            }
        };
        let _ = changed;
    }

    /// Weight propagation toward the superior, rate-limited to one push
    /// per scan interval unless the value changed.
    fn push_weight(&self, d: &mut Discoverer, out: &mut Vec<KernelPtr>) {
        let Some(superior) = d.hierarchy.superior() else { return };
        let weight = d.hierarchy.total_weight();
        let now = Instant::now();
        let unchanged = d.last_pushed_weight == Some(weight);
        let recent = d
            .weight_pushed_at
            .is_some_and(|t| now.duration_since(t) < self.config.scan_interval);
        if unchanged && recent {
            return;
        }
        let me = HierarchyNode::new(d.hierarchy.local_address(), weight, self.config.resource_tag);
        out.push(Box::new(HierarchyKernel::new(
            d.hierarchy.interface_address(),
            HierarchyUpdate::Weight,
            me,
            superior.socket_address,
        )));
        d.last_pushed_weight = Some(weight);
        d.weight_pushed_at = Some(now);
    }

    /// Connection lost to `ip`: mark matching subordinates.
    pub fn on_peer_lost(&self, ip: IpAddr) {
        let now = Instant::now();
        for d in self.inner.lock().values_mut() {
            d.hierarchy.mark_lost(ip, now);
        }
    }

    pub fn on_peer_seen(&self, ip: IpAddr) {
        for d in self.inner.lock().values_mut() {
            d.hierarchy.mark_seen(ip);
        }
    }

    /// Subordinates whose tag matches the kernel's requirement; `None`
    /// requirement matches everything.
    pub fn matching_subordinates(&self, tag: Option<u64>) -> Vec<HierarchyNode> {
        self.subordinates()
            .into_iter()
            .filter(|n| tag.is_none_or(|t| n.resource_tag == t))
            .collect()
    }
}

fn inner_keys(map: &BTreeMap<InterfaceAddress, Discoverer>) -> Vec<InterfaceAddress> {
    map.keys().copied().collect()
}

/// Probes carry the sender's interface address; find our own discoverer
/// for the same subnet.
fn interface_of(remote: &InterfaceAddress, local: &[InterfaceAddress]) -> InterfaceAddress {
    local
        .iter()
        .find(|ifaddr| ifaddr.network() == remote.network() && ifaddr.prefix_len() == remote.prefix_len())
        .copied()
        .unwrap_or(*remote)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel::Kernel;
    use pretty_assertions::assert_eq;

    fn config(fanout: u64) -> DiscoveryConfig {
        DiscoveryConfig { fanout, ..Default::default() }
    }

    fn probe_from(out: &KernelPtr) -> &Probe {
        out.as_any().downcast_ref::<Probe>().expect("probe kernel")
    }

    #[test]
    fn second_node_probes_the_first() {
        let state = DiscoveryState::new(config(2));
        state.add_interface("10.0.0.2/16".parse().unwrap());
        let out = state.on_scan();
        assert_eq!(out.len(), 1);
        let probe = probe_from(&out[0]);
        assert_eq!(probe.new_superior(), Some("10.0.0.1:33333".parse().unwrap()));
        assert_eq!(probe.base().destination(), Some("10.0.0.1:33333".parse().unwrap()));
    }

    #[test]
    fn the_root_becomes_head() {
        let state = DiscoveryState::new(config(2));
        state.add_interface("10.0.0.1/16".parse().unwrap());
        let out = state.on_scan();
        assert!(out.is_empty());
        let inner = state.inner.lock();
        assert_eq!(inner.values().next().unwrap().state(), DiscovererState::Head);
    }

    #[test]
    fn accepted_probe_joins_and_notifies_the_old_superior() {
        let state = DiscoveryState::new(config(2));
        let ifaddr: InterfaceAddress = "10.0.0.4/16".parse().unwrap();
        state.add_interface(ifaddr);
        let out = state.on_scan();
        // position 4 = (layer 2, offset 0): parent is position 2
        let first = probe_from(&out[0]);
        assert_eq!(first.new_superior(), Some("10.0.0.2:33333".parse().unwrap()));

        // the candidate accepts
        let mut answered = Probe::new(
            ifaddr,
            None,
            "10.0.0.2:33333".parse().unwrap(),
            HierarchyNode::new("10.0.0.4:33333".parse().unwrap(), Weight::new(4), 0),
        );
        answered.answer(
            true,
            Some(HierarchyNode::new("10.0.0.2:33333".parse().unwrap(), Weight::new(16), 0)),
        );
        let follow = state.on_probe_response(&answered, false);
        assert!(follow.is_empty(), "no old superior to notify");
        assert_eq!(state.superior_address(), Some("10.0.0.2:33333".parse().unwrap()));
        {
            let inner = state.inner.lock();
            assert_eq!(inner.values().next().unwrap().state(), DiscovererState::Joined);
        }

        // next scan reprobes the superior and pushes the current weight
        let out = state.on_scan();
        assert_eq!(out.len(), 2);
        let probe = out
            .iter()
            .find_map(|k| k.as_any().downcast_ref::<Probe>())
            .expect("reprobe");
        assert_eq!(probe.new_superior(), Some("10.0.0.2:33333".parse().unwrap()));
        assert!(
            out.iter().any(|k| k.as_any().downcast_ref::<HierarchyKernel>().is_some()),
            "weight pushed to the superior"
        );
    }

    #[test]
    fn rejected_probe_advances_the_walk_to_head() {
        let state = DiscoveryState::new(config(2));
        let ifaddr: InterfaceAddress = "10.0.0.2/16".parse().unwrap();
        state.add_interface(ifaddr);
        let out = state.on_scan();
        let target = probe_from(&out[0]).new_superior().unwrap();

        let answered = Probe::new(
            ifaddr,
            None,
            target,
            HierarchyNode::new("10.0.0.2:33333".parse().unwrap(), Weight::new(4), 0),
        );
        // only candidate (the root) rejected: head
        let follow = state.on_probe_response(&answered, true);
        assert!(follow.is_empty());
        let inner = state.inner.lock();
        assert_eq!(inner.values().next().unwrap().state(), DiscovererState::Head);
    }

    #[test]
    fn probe_request_adds_subordinate_once() {
        let state = DiscoveryState::new(config(2));
        let ifaddr: InterfaceAddress = "10.0.0.1/16".parse().unwrap();
        state.add_interface(ifaddr);
        let sender = HierarchyNode::new("10.0.0.2:33333".parse().unwrap(), Weight::new(8), 5);
        let probe = Probe::new(
            "10.0.0.2/16".parse().unwrap(),
            None,
            "10.0.0.1:33333".parse().unwrap(),
            sender,
        );
        let (accepted, responder) = state.on_probe_request(&probe);
        assert!(accepted);
        assert!(responder.is_some());
        let (accepted, _) = state.on_probe_request(&probe);
        assert!(accepted, "reprobe is idempotent");
        assert_eq!(state.subordinates().len(), 1);
        assert_eq!(state.matching_subordinates(Some(5)).len(), 1);
        assert_eq!(state.matching_subordinates(Some(6)).len(), 0);
    }

    #[test]
    fn unanswered_reprobe_unsets_the_superior() {
        let state = DiscoveryState::new(config(2));
        let ifaddr: InterfaceAddress = "10.0.0.2/16".parse().unwrap();
        state.add_interface(ifaddr);
        let _ = state.on_scan();
        let mut answered = Probe::new(
            ifaddr,
            None,
            "10.0.0.1:33333".parse().unwrap(),
            HierarchyNode::new("10.0.0.2:33333".parse().unwrap(), Weight::new(4), 0),
        );
        answered.answer(
            true,
            Some(HierarchyNode::new("10.0.0.1:33333".parse().unwrap(), Weight::new(8), 0)),
        );
        let _ = state.on_probe_response(&answered, false);
        assert!(state.superior_address().is_some());

        // scan sends a reprobe; a second scan finds it unanswered and
        // drops the superior
        let _ = state.on_scan();
        let _ = state.on_scan();
        assert_eq!(state.superior_address(), None);
    }
}
