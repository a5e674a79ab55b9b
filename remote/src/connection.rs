// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Per-peer protocol state: two byte buffers and the save lists that make
//! kernel recovery after a crashed peer possible.
//!
//! `upstream_save` holds every kernel sent to the peer whose downstream
//! counterpart has not come back yet. `downstream_save` remembers (as raw
//! frames) the kernels accepted for local execution on behalf of the peer.
//! On peer loss the former are failed toward their principal with
//! `EndpointNotConnected`, the latter with `Error`.

use ahash::AHashMap;
use kernel::{
    ExitCode, ForeignKernel, InstanceRegistry, Kernel, KernelBuffer, KernelError, KernelHeader,
    KernelPtr, Origin, ProtoFlags, TypeRegistry,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Starting,
    Started,
    Stopping,
    Stopped,
    Inactive,
}

/// Transport-level events driving the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEvent {
    Readable,
    Writable,
    TimedOut,
    Eof,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnAction {
    /// Drain the transport into the input buffer and parse frames.
    Read,
    /// Drain the output buffer into the transport.
    Flush,
    /// Run peer-loss recovery over the save lists.
    Recover,
    /// Tear the transport down and forget the connection.
    Close,
}

/// Pure transition function of the connection state machine.
pub fn transition(state: ConnectionState, event: ConnEvent) -> (ConnectionState, &'static [ConnAction]) {
    use ConnAction::*;
    use ConnEvent::*;
    use ConnectionState::*;
    match (state, event) {
        (Starting, Readable) => (Started, &[Read, Flush]),
        (Starting, Writable) => (Started, &[Flush]),
        (Started, Readable) => (Started, &[Read]),
        (Started, Writable) => (Started, &[Flush]),
        (Stopping, Readable) => (Stopping, &[Read]),
        (Stopping, Writable) => (Stopping, &[Flush]),
        (Starting | Started | Stopping, TimedOut | Eof | Failed) => (Stopped, &[Recover, Close]),
        (Stopped | Inactive, _) => (state, &[]),
    }
}

/// A kernel produced by the receive or recovery path, ready for routing.
pub enum Received {
    Native(KernelPtr),
    Foreign(ForeignKernel),
}

struct SavedFrame {
    service: bool,
    bytes: Vec<u8>,
}

pub struct Connection {
    state: ConnectionState,
    flags: ProtoFlags,
    remote: Option<SocketAddr>,
    pub input: KernelBuffer,
    pub output: KernelBuffer,
    upstream_save: AHashMap<u64, KernelPtr>,
    downstream_save: AHashMap<u64, SavedFrame>,
    foreign_save: AHashMap<u64, ForeignKernel>,
    types: Arc<TypeRegistry>,
    instances: Arc<InstanceRegistry>,
    ids: Arc<kernel::IdRange>,
    started_at: Instant,
    last_activity: Instant,
}

impl Connection {
    pub fn new(
        flags: ProtoFlags,
        types: Arc<TypeRegistry>,
        instances: Arc<InstanceRegistry>,
        ids: Arc<kernel::IdRange>,
    ) -> Self {
        let now = Instant::now();
        Self {
            state: ConnectionState::Starting,
            flags,
            remote: None,
            input: KernelBuffer::new(),
            output: KernelBuffer::new(),
            upstream_save: AHashMap::new(),
            downstream_save: AHashMap::new(),
            foreign_save: AHashMap::new(),
            types,
            instances,
            ids,
            started_at: now,
            last_activity: now,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    /// Feed a transport event through the state machine; returns the
    /// actions the owning pipeline must take.
    pub fn on_event(&mut self, event: ConnEvent) -> &'static [ConnAction] {
        let (next, actions) = transition(self.state, event);
        self.state = next;
        actions
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn set_remote(&mut self, addr: Option<SocketAddr>) {
        self.remote = addr;
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Re-enter `Starting` with a fresh start time, e.g. before a redial.
    pub fn restart(&mut self) {
        self.state = ConnectionState::Starting;
        self.started_at = Instant::now();
        self.last_activity = self.started_at;
    }

    pub fn starting_longer_than(&self, timeout: Duration, now: Instant) -> bool {
        self.state == ConnectionState::Starting && now.duration_since(self.started_at) > timeout
    }

    pub fn idle_longer_than(&self, timeout: Duration, now: Instant) -> bool {
        self.state == ConnectionState::Started
            && now.duration_since(self.last_activity) > timeout
    }

    pub fn upstream_saved(&self) -> usize {
        self.upstream_save.len()
    }

    pub fn downstream_saved(&self) -> usize {
        self.downstream_save.len()
    }

    pub fn has_pending_output(&self) -> bool {
        !self.output.is_empty()
    }

    // -- send path -----------------------------------------------------------

    /// Frame a kernel into the output buffer. Upstream kernels get an id
    /// and are parked in `upstream_save`; a downstream send clears the
    /// matching `downstream_save` entry.
    pub fn send(&mut self, mut k: KernelPtr) -> Result<(), KernelError> {
        let upstream = k.base().moves_upstream();
        if upstream && !k.base().has_id() {
            let id = self.ids.allocate();
            k.base_mut().set_id(id);
        }
        self.write_kernel(&*k)?;
        if upstream && self.flags.contains(ProtoFlags::SAVE_UPSTREAM_KERNELS) {
            self.upstream_save.insert(k.base().id(), k);
        } else if !upstream {
            self.downstream_save.remove(&k.base().id());
        }
        Ok(())
    }

    /// Reinject a foreign kernel. Upstream-moving foreign kernels are saved
    /// so work farmed out to the peer can be recovered.
    pub fn forward(&mut self, mut fk: ForeignKernel) {
        if fk.moves_upstream() && fk.id() == 0 {
            fk.set_id(self.ids.allocate());
        }
        fk.write(&mut self.output);
        if fk.moves_upstream() && self.flags.contains(ProtoFlags::SAVE_UPSTREAM_KERNELS) {
            self.foreign_save.insert(fk.id(), fk);
        } else if fk.moves_downstream() {
            self.downstream_save.remove(&fk.id());
        }
    }

    fn write_kernel(&mut self, k: &dyn Kernel) -> Result<(), KernelError> {
        let Some(type_id) = self.types.id_of(k) else {
            return Err(KernelError::UnregisteredType(std::any::type_name_of_val(k)));
        };
        let mut frame = self.output.begin_frame();
        k.base().header().write(&mut frame, self.flags);
        frame.write_u16(type_id);
        k.write(&mut frame)?;
        if k.base().carries_parent() {
            let parent_id = k.base().parent().id().unwrap_or(0);
            let types = &self.types;
            self.instances.with(parent_id, |parent| -> Result<(), KernelError> {
                match parent.and_then(|p| types.id_of(p).map(|id| (p, id))) {
                    Some((parent, parent_type)) => {
                        frame.write_u16(parent_type);
                        parent.write(&mut frame)
                    }
                    None => {
                        // type 0 marks an absent parent copy
                        frame.write_u16(0);
                        Ok(())
                    }
                }
            })?;
        }
        Ok(())
    }

    // -- receive path --------------------------------------------------------

    /// Parse every complete frame in the input buffer. Malformed frames are
    /// dropped with an error log; they never kill the pipeline.
    pub fn receive(&mut self, origin: Origin, out: &mut Vec<Received>) {
        self.touch();
        while let Some(mut frame) = self.input.take_frame() {
            let raw = frame.as_slice().to_vec();
            match self.parse_frame(&mut frame, &raw, origin) {
                Ok(item) => out.push(item),
                Err(e) => error!(error = %e, "dropping malformed frame"),
            }
        }
        self.input.compact();
    }

    fn parse_frame(
        &mut self,
        frame: &mut KernelBuffer,
        raw: &[u8],
        origin: Origin,
    ) -> Result<Received, KernelError> {
        let mut header = KernelHeader::read(frame)?;
        if let Origin::Socket(peer) = origin {
            if header.source().is_none() {
                header.set_source(Some(peer));
            }
        }
        header.set_origin(Some(origin));
        if header.is_foreign() {
            let fk = ForeignKernel::from_frame(header, frame)?;
            if fk.moves_downstream() {
                self.foreign_save.remove(&fk.id());
            }
            return Ok(Received::Foreign(fk));
        }
        let type_id = frame.read_u16()?;
        let mut k = self.types.construct(type_id)?;
        k.read(frame)?;
        let application_id = header.application_id();
        // the kernel has arrived; a stale destination must not bounce it
        // back onto the wire
        header.set_destination(None);
        k.base_mut().set_header(header);
        if k.base().carries_parent() {
            self.read_parent_copy(frame, application_id)?;
        }
        if k.base().moves_downstream() {
            self.upstream_save.remove(&k.base().id());
        } else if k.base().has_id() && self.flags.contains(ProtoFlags::SAVE_DOWNSTREAM_KERNELS) {
            self.downstream_save.insert(
                k.base().id(),
                SavedFrame { service: k.base().is_service(), bytes: raw.to_vec() },
            );
        }
        Ok(Received::Native(k))
    }

    /// A kernel flagged `carries_parent` is followed by a full copy of its
    /// parent in the same frame; park it locally so downstream delivery and
    /// failover can find the principal.
    fn read_parent_copy(
        &mut self,
        frame: &mut KernelBuffer,
        application_id: u64,
    ) -> Result<(), KernelError> {
        let parent_type = frame.read_u16()?;
        if parent_type == 0 {
            return Ok(());
        }
        let mut parent = self.types.construct(parent_type)?;
        parent.read(frame)?;
        parent.base_mut().header_mut().set_application_id(application_id);
        if parent.base().has_id() && !self.instances.contains(parent.base().id()) {
            debug!(id = parent.base().id(), "parked parent copy");
            self.instances.insert(parent)?;
        }
        Ok(())
    }

    // -- recovery ------------------------------------------------------------

    /// Peer-loss recovery over the save lists; recovered kernels are
    /// appended for normal routing.
    pub fn on_peer_loss(&mut self, out: &mut Vec<Received>) {
        let remote = self.remote;
        for (_, mut k) in self.upstream_save.drain() {
            debug!(id = k.base().id(), peer = ?remote, "recovering upstream kernel");
            k.base_mut().set_result(ExitCode::EndpointNotConnected);
            // the stale destination must not bounce the kernel back at the
            // dead peer
            k.base_mut().set_destination(None);
            out.push(Received::Native(k));
        }
        for (_, mut fk) in self.foreign_save.drain() {
            fk.set_result(ExitCode::EndpointNotConnected);
            let source = fk.header().source();
            fk.header_mut().set_destination(source);
            out.push(Received::Foreign(fk));
        }
        for (_, saved) in self.downstream_save.drain() {
            if saved.service {
                continue;
            }
            match reparse(&self.types, saved.bytes) {
                Ok(mut k) => {
                    k.base_mut().set_result(ExitCode::Error);
                    out.push(Received::Native(k));
                }
                Err(e) => warn!(error = %e, "orphaned kernel could not be reparsed"),
            }
        }
        self.state = ConnectionState::Stopped;
    }

    /// Move saved kernels into the shutdown sack.
    pub fn clear(&mut self, sack: &mut pipeline::KernelSack) {
        for (_, k) in self.upstream_save.drain() {
            sack.push(k);
        }
        self.downstream_save.clear();
        self.foreign_save.clear();
        self.input.clear();
        self.output.clear();
    }
}

fn reparse(types: &TypeRegistry, bytes: Vec<u8>) -> Result<KernelPtr, KernelError> {
    let mut frame = KernelBuffer::from_vec(bytes);
    let header = KernelHeader::read(&mut frame)?;
    let type_id = frame.read_u16()?;
    let mut k = types.construct(type_id)?;
    k.read(&mut frame)?;
    k.base_mut().set_header(header);
    Ok(k)
}
