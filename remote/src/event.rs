// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Connection add/remove notifications emitted by the socket pipeline.
//! Delivered as downstream service kernels to a configured principal
//! (the network watcher), never serialized.

use kernel::{ExitCode, Kernel, KernelBase, KernelRef, kernel_base};
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEventKind {
    Added,
    Removed,
}

pub struct SocketEvent {
    base: KernelBase,
    kind: SocketEventKind,
    peer: SocketAddr,
}

impl SocketEvent {
    pub fn new(kind: SocketEventKind, peer: SocketAddr, principal: u64) -> Self {
        let mut base = KernelBase::new_service();
        base.set_result(ExitCode::Success);
        base.set_principal(KernelRef::Id(principal));
        Self { base, kind, peer }
    }

    pub fn kind(&self) -> SocketEventKind {
        self.kind
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Kernel for SocketEvent {
    kernel_base!(base);
}
