// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Service kernels of the discovery protocol.
//!
//! A [`Probe`] travels to a candidate superior, which accepts or rejects
//! the sender as a subordinate and sends the probe back. A
//! [`HierarchyKernel`] carries subordinate-set and weight updates between
//! neighbors. A [`ScanKernel`] is a local tick scheduled on the timer.

use crate::discoverer::DiscoveryState;
use crate::hierarchy::HierarchyNode;
use kernel::{
    Context, ExitCode, InterfaceAddress, Kernel, KernelBase, KernelBuffer, KernelError, Step,
    kernel_base,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::error;

/// Portable type ids of the discovery kernels.
pub const PROBE_TYPE: u16 = 2;
pub const HIERARCHY_TYPE: u16 = 3;

pub struct Probe {
    base: KernelBase,
    state: Option<Arc<DiscoveryState>>,
    ifaddr: InterfaceAddress,
    old_superior: Option<SocketAddr>,
    new_superior: Option<SocketAddr>,
    sender: Option<HierarchyNode>,
    accepted: bool,
    responder: Option<HierarchyNode>,
}

impl Probe {
    pub fn new(
        ifaddr: InterfaceAddress,
        old_superior: Option<SocketAddr>,
        new_superior: SocketAddr,
        sender: HierarchyNode,
    ) -> Self {
        let mut base = KernelBase::new_service();
        base.set_destination(Some(new_superior));
        Self {
            base,
            state: None,
            ifaddr,
            old_superior,
            new_superior: Some(new_superior),
            sender: Some(sender),
            accepted: false,
            responder: None,
        }
    }

    /// Constructor used by the type registry on receiving nodes; the
    /// captured state lets `act` answer the probe.
    pub fn with_state(state: Arc<DiscoveryState>) -> Self {
        Self {
            base: KernelBase::new_service(),
            state: Some(state),
            ifaddr: InterfaceAddress::new(std::net::Ipv4Addr::UNSPECIFIED, 32),
            old_superior: None,
            new_superior: None,
            sender: None,
            accepted: false,
            responder: None,
        }
    }

    pub fn interface_address(&self) -> InterfaceAddress {
        self.ifaddr
    }

    pub fn old_superior(&self) -> Option<SocketAddr> {
        self.old_superior
    }

    pub fn new_superior(&self) -> Option<SocketAddr> {
        self.new_superior
    }

    pub fn sender(&self) -> Option<&HierarchyNode> {
        self.sender.as_ref()
    }

    pub fn accepted(&self) -> bool {
        self.accepted
    }

    pub fn responder(&self) -> Option<&HierarchyNode> {
        self.responder.as_ref()
    }

    /// Record the probed node's verdict.
    pub fn answer(&mut self, accepted: bool, responder: Option<HierarchyNode>) {
        self.accepted = accepted;
        self.responder = responder;
    }
}

impl Kernel for Probe {
    kernel_base!(base);

    /// Runs on the probed node: decide whether the sender becomes (or
    /// stays) a subordinate, then flow back to the prober.
    fn act(&mut self, _ctx: &mut Context<'_>) -> Step {
        let Some(state) = self.state.clone() else {
            error!("probe kernel constructed without discovery state");
            self.base.set_result(ExitCode::Error);
            self.base.return_to_sender();
            return Step::Return;
        };
        let (accepted, responder) = state.on_probe_request(self);
        self.answer(accepted, responder);
        self.base.set_result(ExitCode::Success);
        self.base.return_to_sender();
        Step::Return
    }

    fn write(&self, out: &mut KernelBuffer) -> Result<(), KernelError> {
        self.base().write(out);
        self.ifaddr.write(out);
        out.write_socket_addr(self.old_superior.as_ref());
        out.write_socket_addr(self.new_superior.as_ref());
        match &self.sender {
            Some(node) => {
                out.write_bool(true);
                node.write(out);
            }
            None => out.write_bool(false),
        }
        out.write_bool(self.accepted);
        match &self.responder {
            Some(node) => {
                out.write_bool(true);
                node.write(out);
            }
            None => out.write_bool(false),
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut KernelBuffer) -> Result<(), KernelError> {
        self.base_mut().read(buf)?;
        self.ifaddr = InterfaceAddress::read(buf)?;
        self.old_superior = buf.read_socket_addr()?;
        self.new_superior = buf.read_socket_addr()?;
        self.sender = if buf.read_bool()? { Some(HierarchyNode::read(buf)?) } else { None };
        self.accepted = buf.read_bool()?;
        self.responder = if buf.read_bool()? { Some(HierarchyNode::read(buf)?) } else { None };
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HierarchyUpdate {
    Subscribe = 1,
    Unsubscribe = 2,
    Weight = 3,
}

impl HierarchyUpdate {
    fn from_wire(raw: u8) -> Result<Self, KernelError> {
        match raw {
            1 => Ok(Self::Subscribe),
            2 => Ok(Self::Unsubscribe),
            3 => Ok(Self::Weight),
            other => Err(KernelError::BadRecordKind(other)),
        }
    }
}

pub struct HierarchyKernel {
    base: KernelBase,
    state: Option<Arc<DiscoveryState>>,
    ifaddr: InterfaceAddress,
    update: HierarchyUpdate,
    node: Option<HierarchyNode>,
}

impl HierarchyKernel {
    pub fn new(
        ifaddr: InterfaceAddress,
        update: HierarchyUpdate,
        node: HierarchyNode,
        destination: SocketAddr,
    ) -> Self {
        let mut base = KernelBase::new_service();
        base.set_destination(Some(destination));
        Self { base, state: None, ifaddr, update, node: Some(node) }
    }

    pub fn with_state(state: Arc<DiscoveryState>) -> Self {
        Self {
            base: KernelBase::new_service(),
            state: Some(state),
            ifaddr: InterfaceAddress::new(std::net::Ipv4Addr::UNSPECIFIED, 32),
            update: HierarchyUpdate::Weight,
            node: None,
        }
    }

    pub fn interface_address(&self) -> InterfaceAddress {
        self.ifaddr
    }

    pub fn update(&self) -> HierarchyUpdate {
        self.update
    }

    pub fn node(&self) -> Option<&HierarchyNode> {
        self.node.as_ref()
    }
}

impl Kernel for HierarchyKernel {
    kernel_base!(base);

    fn act(&mut self, _ctx: &mut Context<'_>) -> Step {
        match self.state.clone() {
            Some(state) => state.on_hierarchy(self),
            None => error!("hierarchy kernel constructed without discovery state"),
        }
        Step::Done
    }

    fn write(&self, out: &mut KernelBuffer) -> Result<(), KernelError> {
        self.base().write(out);
        self.ifaddr.write(out);
        out.write_u8(self.update as u8);
        match &self.node {
            Some(node) => {
                out.write_bool(true);
                node.write(out);
            }
            None => out.write_bool(false),
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut KernelBuffer) -> Result<(), KernelError> {
        self.base_mut().read(buf)?;
        self.ifaddr = InterfaceAddress::read(buf)?;
        self.update = HierarchyUpdate::from_wire(buf.read_u8()?)?;
        self.node = if buf.read_bool()? { Some(HierarchyNode::read(buf)?) } else { None };
        Ok(())
    }
}

/// What a scheduled tick asks the network watcher to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanKind {
    /// Re-enumerate network interfaces.
    Interfaces,
    /// Run a discovery scan round (reprobe, failure timeouts).
    Discovery,
}

/// Local tick kernel; scheduled on the timer with the watcher as
/// principal, never serialized.
pub struct ScanKernel {
    base: KernelBase,
    kind: ScanKind,
}

impl ScanKernel {
    pub fn new(kind: ScanKind, principal: u64, after: std::time::Duration) -> Self {
        let mut base = KernelBase::new_service();
        base.set_result(ExitCode::Success);
        base.set_principal(kernel::KernelRef::Id(principal));
        base.after(after);
        Self { base, kind }
    }

    pub fn kind(&self) -> ScanKind {
        self.kind
    }
}

impl Kernel for ScanKernel {
    kernel_base!(base);
}
