// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Per-interface view of the node hierarchy: the superior (if any) and the
//! subordinates ordered by address, with their advertised weights.

use kernel::{InterfaceAddress, KernelBuffer, KernelError, Weight};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HierarchyNode {
    pub socket_address: SocketAddr,
    pub weight: Weight,
    pub resource_tag: u64,
}

impl HierarchyNode {
    pub fn new(socket_address: SocketAddr, weight: Weight, resource_tag: u64) -> Self {
        Self { socket_address, weight, resource_tag }
    }

    pub fn write(&self, out: &mut KernelBuffer) {
        out.write_socket_addr(Some(&self.socket_address));
        out.write_u32(self.weight.get());
        out.write_u64(self.resource_tag);
    }

    pub fn read(buf: &mut KernelBuffer) -> Result<Self, KernelError> {
        let socket_address = buf
            .read_socket_addr()?
            .ok_or(KernelError::BadAddressFamily(0))?;
        let weight = Weight::new(buf.read_u32()?);
        let resource_tag = buf.read_u64()?;
        Ok(Self { socket_address, weight, resource_tag })
    }
}

impl fmt::Display for HierarchyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}*{}", self.socket_address, self.weight)
    }
}

struct Subordinate {
    node: HierarchyNode,
    lost_at: Option<Instant>,
}

pub struct Hierarchy {
    ifaddr: InterfaceAddress,
    local: SocketAddr,
    superior: Option<HierarchyNode>,
    subordinates: BTreeMap<SocketAddr, Subordinate>,
}

impl Hierarchy {
    pub fn new(ifaddr: InterfaceAddress, local: SocketAddr) -> Self {
        Self { ifaddr, local, superior: None, subordinates: BTreeMap::new() }
    }

    pub fn interface_address(&self) -> InterfaceAddress {
        self.ifaddr
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local
    }

    pub fn superior(&self) -> Option<&HierarchyNode> {
        self.superior.as_ref()
    }

    /// Returns whether anything changed.
    pub fn set_superior(&mut self, node: Option<HierarchyNode>) -> bool {
        if self.superior == node {
            return false;
        }
        self.superior = node;
        true
    }

    pub fn set_superior_weight(&mut self, weight: Weight) -> bool {
        match &mut self.superior {
            Some(node) if node.weight != weight => {
                node.weight = weight;
                true
            }
            _ => false,
        }
    }

    /// Returns false when the subordinate was already known.
    pub fn add_subordinate(&mut self, node: HierarchyNode) -> bool {
        let addr = node.socket_address;
        match self.subordinates.get_mut(&addr) {
            Some(entry) => {
                entry.lost_at = None;
                if entry.node != node {
                    entry.node = node;
                }
                false
            }
            None => {
                self.subordinates.insert(addr, Subordinate { node, lost_at: None });
                true
            }
        }
    }

    pub fn remove_subordinate(&mut self, addr: &SocketAddr) -> bool {
        self.subordinates.remove(addr).is_some()
    }

    /// Returns whether the weight actually changed.
    pub fn set_subordinate(&mut self, addr: &SocketAddr, node: HierarchyNode) -> bool {
        match self.subordinates.get_mut(addr) {
            Some(entry) if entry.node != node => {
                entry.node = node;
                true
            }
            _ => false,
        }
    }

    /// Mark every subordinate on this IP as lost; confirmed removal happens
    /// after the failure timeout.
    pub fn mark_lost(&mut self, ip: IpAddr, now: Instant) {
        for (addr, entry) in &mut self.subordinates {
            if addr.ip() == ip && entry.lost_at.is_none() {
                entry.lost_at = Some(now);
            }
        }
    }

    pub fn mark_seen(&mut self, ip: IpAddr) {
        for (addr, entry) in &mut self.subordinates {
            if addr.ip() == ip {
                entry.lost_at = None;
            }
        }
    }

    /// Drop subordinates lost for longer than `timeout`; returns their
    /// addresses.
    pub fn remove_lost(&mut self, timeout: Duration, now: Instant) -> Vec<SocketAddr> {
        let expired: Vec<SocketAddr> = self
            .subordinates
            .iter()
            .filter(|(_, e)| e.lost_at.is_some_and(|t| now.duration_since(t) > timeout))
            .map(|(a, _)| *a)
            .collect();
        for addr in &expired {
            self.subordinates.remove(addr);
        }
        expired
    }

    /// Live subordinates in address order.
    pub fn subordinates(&self) -> Vec<HierarchyNode> {
        self.subordinates
            .values()
            .filter(|e| e.lost_at.is_none())
            .map(|e| e.node)
            .collect()
    }

    pub fn subordinate_count(&self) -> usize {
        self.subordinates.len()
    }

    /// Advertised weight of this subtree: local concurrency plus every
    /// subordinate subtree.
    pub fn total_weight(&self) -> Weight {
        Weight::local() + self.subordinates.values().map(|e| e.node.weight).sum::<Weight>()
    }
}

impl fmt::Display for Hierarchy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "interface-address={},local={},superior=", self.ifaddr, self.local)?;
        match &self.superior {
            Some(node) => write!(f, "{node}")?,
            None => write!(f, "none")?,
        }
        write!(f, ",subordinates=")?;
        let mut first = true;
        for entry in self.subordinates.values() {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{}", entry.node)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn node(addr: &str, weight: u32) -> HierarchyNode {
        HierarchyNode::new(addr.parse().unwrap(), Weight::new(weight), 0)
    }

    fn hierarchy() -> Hierarchy {
        Hierarchy::new("10.0.0.2/16".parse().unwrap(), "10.0.0.2:33333".parse().unwrap())
    }

    #[test]
    fn subordinates_stay_ordered_by_address() {
        let mut h = hierarchy();
        assert!(h.add_subordinate(node("10.0.0.9:33333", 2)));
        assert!(h.add_subordinate(node("10.0.0.3:33333", 4)));
        assert!(!h.add_subordinate(node("10.0.0.3:33333", 4)), "duplicate add");
        let addrs: Vec<SocketAddr> =
            h.subordinates().iter().map(|n| n.socket_address).collect();
        assert_eq!(addrs, vec!["10.0.0.3:33333".parse().unwrap(), "10.0.0.9:33333".parse().unwrap()]);
    }

    #[test]
    fn total_weight_sums_subtrees() {
        let mut h = hierarchy();
        h.add_subordinate(node("10.0.0.3:33333", 4));
        h.add_subordinate(node("10.0.0.4:33333", 2));
        assert_eq!(h.total_weight(), Weight::local() + Weight::new(6));
    }

    #[test]
    fn lost_subordinates_expire_after_timeout() {
        let mut h = hierarchy();
        h.add_subordinate(node("10.0.0.3:33333", 4));
        let t0 = Instant::now();
        h.mark_lost("10.0.0.3".parse().unwrap(), t0);
        assert!(h.subordinates().is_empty(), "lost nodes leave the live view");
        // not yet expired
        assert!(h.remove_lost(Duration::from_secs(60), t0 + Duration::from_secs(1)).is_empty());
        let removed = h.remove_lost(Duration::from_secs(60), t0 + Duration::from_secs(61));
        assert_eq!(removed.len(), 1);
        assert_eq!(h.subordinate_count(), 0);
    }

    #[test]
    fn reappearing_subordinate_is_unmarked() {
        let mut h = hierarchy();
        h.add_subordinate(node("10.0.0.3:33333", 4));
        h.mark_lost("10.0.0.3".parse().unwrap(), Instant::now());
        h.mark_seen("10.0.0.3".parse().unwrap());
        assert_eq!(h.subordinates().len(), 1);
    }

    #[test]
    fn node_wire_round_trip() {
        let n = node("10.7.0.1:33333", 12);
        let mut buf = KernelBuffer::new();
        n.write(&mut buf);
        assert_eq!(HierarchyNode::read(&mut buf).unwrap(), n);
    }
}
