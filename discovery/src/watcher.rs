// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Resident kernel driving discovery: re-enumerates network interfaces,
//! owns the per-interface discoverers, and receives probe responses,
//! hierarchy updates and connection events as downstream children.

use crate::discoverer::DiscoveryState;
use crate::probe::{Probe, ScanKernel, ScanKind};
use kernel::{
    Context, InterfaceAddress, Kernel, KernelBase, KernelPtr, KernelRef, Step, kernel_base,
};
use remote::{SocketEvent, SocketEventKind, SocketPipeline};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct NetworkWatcher {
    base: KernelBase,
    state: Arc<DiscoveryState>,
    servers: Arc<SocketPipeline>,
}

impl NetworkWatcher {
    pub fn new(state: Arc<DiscoveryState>, servers: Arc<SocketPipeline>) -> Self {
        Self { base: KernelBase::new_service(), state, servers }
    }

    /// Reconcile the discoverer set with the currently configured NICs.
    fn apply_interfaces(&mut self, current: Vec<InterfaceAddress>) {
        let known = self.state.interfaces();
        for ifaddr in &current {
            if self.state.add_interface(*ifaddr) {
                self.servers.add_server(*ifaddr);
            }
        }
        for ifaddr in known {
            if !current.contains(&ifaddr) {
                warn!("interface {ifaddr} disappeared");
                self.state.remove_interface(&ifaddr);
                self.servers.remove_server(ifaddr);
            }
        }
    }

    /// Give discovery kernels this watcher as principal and queue them.
    fn dispatch(&mut self, ctx: &mut Context<'_>, kernels: Vec<KernelPtr>) {
        let id = ctx.ensure_id(&mut self.base);
        for mut k in kernels {
            k.base_mut().set_principal(KernelRef::Id(id));
            ctx.send(k);
        }
    }

    fn schedule(&mut self, ctx: &mut Context<'_>, kind: ScanKind) {
        let id = ctx.ensure_id(&mut self.base);
        let interval = match kind {
            ScanKind::Interfaces => self.state.config().interface_update_interval,
            ScanKind::Discovery => self.state.config().scan_interval,
        };
        ctx.send(Box::new(ScanKernel::new(kind, id, interval)));
    }
}

impl Kernel for NetworkWatcher {
    kernel_base!(base);

    fn act(&mut self, ctx: &mut Context<'_>) -> Step {
        ctx.ensure_id(&mut self.base);
        let current = enumerate_interfaces();
        self.apply_interfaces(current);
        let probes = self.state.on_scan();
        self.dispatch(ctx, probes);
        self.schedule(ctx, ScanKind::Interfaces);
        self.schedule(ctx, ScanKind::Discovery);
        Step::Park
    }

    fn react(&mut self, child: KernelPtr, ctx: &mut Context<'_>) -> Step {
        if let Some(scan) = child.as_any().downcast_ref::<ScanKernel>() {
            match scan.kind() {
                ScanKind::Interfaces => {
                    let current = enumerate_interfaces();
                    self.apply_interfaces(current);
                    self.schedule(ctx, ScanKind::Interfaces);
                }
                ScanKind::Discovery => {
                    let probes = self.state.on_scan();
                    self.dispatch(ctx, probes);
                    self.schedule(ctx, ScanKind::Discovery);
                }
            }
        } else if let Some(probe) = child.as_any().downcast_ref::<Probe>() {
            let failed = !child.base().result().is_success();
            let follow = self.state.on_probe_response(probe, failed);
            self.dispatch(ctx, follow);
        } else if let Some(event) = child.as_any().downcast_ref::<SocketEvent>() {
            match event.kind() {
                SocketEventKind::Added => self.state.on_peer_seen(event.peer().ip()),
                SocketEventKind::Removed => self.state.on_peer_lost(event.peer().ip()),
            }
        } else {
            debug!("unrecognized child kernel at the network watcher");
        }
        Step::Park
    }
}

/// IPv4 interface addresses of this host, link-local and unspecified
/// excluded.
fn enumerate_interfaces() -> Vec<InterfaceAddress> {
    let mut found = Vec::new();
    for iface in netdev::get_interfaces() {
        for net in &iface.ipv4 {
            let addr = net.addr();
            if addr.is_unspecified() || addr.is_link_local() {
                continue;
            }
            let ifaddr = InterfaceAddress::new(addr, net.prefix_len());
            if !found.contains(&ifaddr) {
                found.push(ifaddr);
            }
        }
    }
    found
}

/// Local socket address of the daemon on the given interface.
pub fn server_address(ifaddr: &InterfaceAddress, port: u16) -> SocketAddr {
    SocketAddr::new(ifaddr.address().into(), port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel::{IdRange, InstanceRegistry, Router, RouterRef, TypeRegistry};
    use parking_lot::Mutex;
    use remote::SocketConfig;

    #[derive(Default)]
    struct SinkRouter {
        sent: Mutex<Vec<KernelPtr>>,
    }

    impl Router for SinkRouter {
        fn send(&self, k: KernelPtr) {
            self.sent.lock().push(k);
        }

        fn send_remote(&self, k: KernelPtr) {
            self.send(k);
        }

        fn forward(&self, _k: kernel::ForeignKernel) {}
    }

    fn watcher_under_test() -> (NetworkWatcher, Arc<DiscoveryState>) {
        let state = Arc::new(DiscoveryState::default());
        let servers = Arc::new(
            SocketPipeline::new(
                SocketConfig::default(),
                Arc::new(RouterRef::new()),
                Arc::new(TypeRegistry::new()),
                Arc::new(InstanceRegistry::new()),
            )
            .unwrap(),
        );
        (NetworkWatcher::new(Arc::clone(&state), servers), state)
    }

    #[test]
    fn discovery_tick_probes_and_reschedules() {
        let (mut watcher, state) = watcher_under_test();
        state.add_interface("10.0.0.2/16".parse().unwrap());
        let router = SinkRouter::default();
        let ids = IdRange::new(10, 20);
        let mut ctx = Context::new(&router, &ids);

        let tick: KernelPtr = Box::new(ScanKernel::new(
            ScanKind::Discovery,
            10,
            std::time::Duration::from_secs(1),
        ));
        let step = watcher.react(tick, &mut ctx);
        assert_eq!(step, Step::Park);

        let pending = ctx.take_pending();
        // one probe toward 10.0.0.1 plus the rescheduled tick
        assert_eq!(pending.len(), 2);
        let probe = pending
            .iter()
            .find_map(|k| k.as_any().downcast_ref::<Probe>())
            .expect("a probe");
        assert_eq!(probe.new_superior(), Some("10.0.0.1:33333".parse().unwrap()));
        assert_eq!(probe.base().principal(), KernelRef::Id(10));
        assert!(
            pending.iter().any(|k| k.as_any().downcast_ref::<ScanKernel>().is_some()),
            "tick rescheduled"
        );
    }

    #[test]
    fn peer_loss_event_marks_subordinates() {
        let (mut watcher, state) = watcher_under_test();
        let ifaddr: InterfaceAddress = "10.0.0.1/16".parse().unwrap();
        state.add_interface(ifaddr);
        let sender =
            crate::hierarchy::HierarchyNode::new("10.0.0.2:33333".parse().unwrap(), kernel::Weight::new(2), 0);
        let probe = Probe::new(
            "10.0.0.2/16".parse().unwrap(),
            None,
            "10.0.0.1:33333".parse().unwrap(),
            sender,
        );
        assert!(state.on_probe_request(&probe).0);
        assert_eq!(state.subordinates().len(), 1);

        let router = SinkRouter::default();
        let ids = IdRange::new(10, 20);
        let mut ctx = Context::new(&router, &ids);
        let event: KernelPtr = Box::new(SocketEvent::new(
            SocketEventKind::Removed,
            "10.0.0.2:40123".parse().unwrap(),
            10,
        ));
        watcher.react(event, &mut ctx);
        assert!(state.subordinates().is_empty(), "lost subordinate left the live view");
    }
}
