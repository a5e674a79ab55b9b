// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! The kernel trait and its shared base state.
//!
//! Control flow is explicit: `act` and `react` return a [`Step`] verdict
//! telling the executing pipeline what to do with the kernel next. Children
//! spawned during execution are buffered in the [`Context`] and routed only
//! after the verdict is applied, so a parent is always parked in the
//! instance registry before any of its children can complete.

use crate::buffer::KernelBuffer;
use crate::errors::KernelError;
use crate::exit_code::ExitCode;
use crate::flags::KernelFlags;
use crate::header::{KernelHeader, Origin};
use crate::id_range::IdRange;
use crate::router::Router;
use std::any::Any;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::error;

pub type KernelPtr = Box<dyn Kernel>;

/// Reference to a related kernel. In-process handles of the original design
/// are replaced by ids resolved through the instance registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KernelRef {
    #[default]
    None,
    Id(u64),
}

impl KernelRef {
    pub fn id(self) -> Option<u64> {
        match self {
            KernelRef::None => None,
            KernelRef::Id(id) => Some(id),
        }
    }

    pub fn is_none(self) -> bool {
        matches!(self, KernelRef::None)
    }
}

/// What the executing pipeline does with a kernel after `act`/`react`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Park in the instance registry and wait for children.
    Park,
    /// Flow downstream to the principal with the current result
    /// (`Undefined` is promoted to `Success`).
    Return,
    /// Hand back to the router as-is, e.g. after rescheduling.
    Requeue,
    /// Consumed; destroy the kernel.
    Done,
}

#[derive(Debug, Default)]
pub struct KernelBase {
    id: u64,
    result: ExitCode,
    at: Option<Instant>,
    flags: KernelFlags,
    parent: KernelRef,
    principal: KernelRef,
    header: KernelHeader,
}

impl KernelBase {
    pub fn new_service() -> Self {
        let mut base = Self::default();
        base.header.set_application_id(crate::application::DAEMON_APPLICATION_ID);
        base
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn has_id(&self) -> bool {
        self.id != 0
    }

    pub fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    pub fn result(&self) -> ExitCode {
        self.result
    }

    pub fn set_result(&mut self, result: ExitCode) {
        self.result = result;
    }

    /// Upstream = unfinished, toward a new subordinate.
    pub fn moves_upstream(&self) -> bool {
        self.result.is_undefined()
    }

    /// Downstream = returning to the principal with a result.
    pub fn moves_downstream(&self) -> bool {
        !self.moves_upstream()
    }

    // -- scheduling ----------------------------------------------------------

    pub fn at(&self) -> Option<Instant> {
        self.at
    }

    pub fn scheduled(&self) -> bool {
        self.at.is_some()
    }

    pub fn set_at(&mut self, at: Instant) {
        self.at = Some(at);
    }

    pub fn after(&mut self, delay: Duration) {
        self.at = Some(Instant::now() + delay);
    }

    pub fn clear_at(&mut self) {
        self.at = None;
    }

    // -- flags ---------------------------------------------------------------

    pub fn flags(&self) -> KernelFlags {
        self.flags
    }

    pub fn set_flag(&mut self, flag: KernelFlags) {
        self.flags |= flag;
    }

    pub fn unset_flag(&mut self, flag: KernelFlags) {
        self.flags &= !flag;
    }

    pub fn has_flag(&self, flag: KernelFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn carries_parent(&self) -> bool {
        self.has_flag(KernelFlags::CARRIES_PARENT)
    }

    pub fn new_thread(&self) -> bool {
        self.has_flag(KernelFlags::NEW_THREAD)
    }

    pub fn transactional(&self) -> bool {
        self.has_flag(KernelFlags::TRANSACTIONAL)
    }

    // -- relations -----------------------------------------------------------

    pub fn parent(&self) -> KernelRef {
        self.parent
    }

    pub fn set_parent(&mut self, parent: KernelRef) {
        self.parent = parent;
        if !parent.is_none() {
            self.set_flag(KernelFlags::PARENT_IS_ID);
        }
    }

    pub fn principal(&self) -> KernelRef {
        self.principal
    }

    pub fn set_principal(&mut self, principal: KernelRef) {
        self.principal = principal;
        if !principal.is_none() {
            self.set_flag(KernelFlags::PRINCIPAL_IS_ID);
        }
    }

    // -- header --------------------------------------------------------------

    pub fn header(&self) -> &KernelHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut KernelHeader {
        &mut self.header
    }

    /// Replace the header wholesale, e.g. with one parsed off the wire.
    pub fn set_header(&mut self, header: KernelHeader) {
        self.header = header;
    }

    pub fn application_id(&self) -> u64 {
        self.header.application_id()
    }

    /// Service kernels belong to the daemon application; everything else is
    /// user work.
    pub fn is_service(&self) -> bool {
        self.application_id() == crate::application::DAEMON_APPLICATION_ID
    }

    pub fn source(&self) -> Option<SocketAddr> {
        self.header.source()
    }

    pub fn destination(&self) -> Option<SocketAddr> {
        self.header.destination()
    }

    pub fn set_destination(&mut self, addr: Option<SocketAddr>) {
        self.header.set_destination(addr);
    }

    pub fn origin(&self) -> Option<Origin> {
        self.header.origin()
    }

    /// Address a reply at the node this kernel came from.
    pub fn return_to_sender(&mut self) {
        let source = self.header.source();
        self.header.set_destination(source);
    }

    pub fn set_resource_tag(&mut self, tag: Option<u64>) {
        self.header.set_resource_tag(tag);
    }

    // -- wire ----------------------------------------------------------------

    /// Body fields every kernel serializes: result, id, the carries-parent
    /// bit and the parent/principal ids.
    pub fn write(&self, out: &mut KernelBuffer) {
        out.write_u16(self.result as u16);
        out.write_u64(self.id);
        out.write_bool(self.carries_parent());
        out.write_u64(self.parent.id().unwrap_or(0));
        out.write_u64(self.principal.id().unwrap_or(0));
    }

    pub fn read(&mut self, buf: &mut KernelBuffer) -> Result<(), KernelError> {
        self.result = ExitCode::from_wire(buf.read_u16()?)?;
        self.id = buf.read_u64()?;
        if buf.read_bool()? {
            self.set_flag(KernelFlags::CARRIES_PARENT);
        }
        self.parent = match buf.read_u64()? {
            0 => KernelRef::None,
            id => KernelRef::Id(id),
        };
        if !self.parent.is_none() {
            self.set_flag(KernelFlags::PARENT_IS_ID);
        }
        self.principal = match buf.read_u64()? {
            0 => KernelRef::None,
            id => KernelRef::Id(id),
        };
        if !self.principal.is_none() {
            self.set_flag(KernelFlags::PRINCIPAL_IS_ID);
        }
        Ok(())
    }
}

pub trait Kernel: Any + Send {
    fn base(&self) -> &KernelBase;

    fn base_mut(&mut self) -> &mut KernelBase;

    fn as_any(&self) -> &dyn Any;

    /// Upstream execution.
    fn act(&mut self, ctx: &mut Context<'_>) -> Step {
        let _ = ctx;
        Step::Done
    }

    /// A child came back downstream with a successful result.
    fn react(&mut self, child: KernelPtr, ctx: &mut Context<'_>) -> Step {
        let _ = ctx;
        error!(child_id = child.base().id(), "unexpected react");
        Step::Park
    }

    /// A child came back downstream with a failure. Defaults to `react`.
    fn error(&mut self, child: KernelPtr, ctx: &mut Context<'_>) -> Step {
        self.react(child, ctx)
    }

    /// Serialize the body. Implementations call `self.base().write(out)`
    /// first and append their own fields.
    fn write(&self, out: &mut KernelBuffer) -> Result<(), KernelError> {
        self.base().write(out);
        Ok(())
    }

    fn read(&mut self, buf: &mut KernelBuffer) -> Result<(), KernelError> {
        self.base_mut().read(buf)
    }

    /// Resource tag this kernel must be matched with, if any. Carried in
    /// the header so routing nodes see it without parsing the body.
    fn resource_tag(&self) -> Option<u64> {
        self.base().header().resource_tag()
    }
}

/// Implements the boilerplate accessors of [`Kernel`] for a type with a
/// [`KernelBase`] field.
#[macro_export]
macro_rules! kernel_base {
    ($field:ident) => {
        fn base(&self) -> &$crate::KernelBase {
            &self.$field
        }

        fn base_mut(&mut self) -> &mut $crate::KernelBase {
            &mut self.$field
        }

        fn as_any(&self) -> &dyn ::core::any::Any {
            self
        }
    };
}

/// Execution context of one `act`/`react` invocation.
pub struct Context<'a> {
    router: &'a dyn Router,
    ids: &'a IdRange,
    pending: Vec<KernelPtr>,
}

impl<'a> Context<'a> {
    pub fn new(router: &'a dyn Router, ids: &'a IdRange) -> Self {
        Self { router, ids, pending: Vec::new() }
    }

    pub fn router(&self) -> &dyn Router {
        self.router
    }

    /// Assign an id to `parent` if it has none yet.
    pub fn ensure_id(&self, parent: &mut KernelBase) -> u64 {
        if !parent.has_id() {
            parent.set_id(self.ids.allocate());
        }
        parent.id()
    }

    /// Send `child` upstream on behalf of `parent`: unset parent/principal
    /// references default to the parent. Routing happens after the verdict
    /// of the current invocation is applied.
    pub fn upstream(&mut self, parent: &mut KernelBase, mut child: KernelPtr) {
        let pid = self.ensure_id(parent);
        if child.base().parent().is_none() {
            child.base_mut().set_parent(KernelRef::Id(pid));
        }
        if child.base().principal().is_none() {
            child.base_mut().set_principal(KernelRef::Id(pid));
        }
        self.pending.push(child);
    }

    /// Like [`Context::upstream`], but the child is handed to the node
    /// hierarchy for distribution instead of running in this process: an
    /// application sends it up to its daemon, a daemon toward its
    /// superior.
    pub fn upstream_remote(&mut self, parent: &mut KernelBase, mut child: KernelPtr) {
        child.base_mut().set_flag(KernelFlags::SEND_TO_SUPERIOR_NODE);
        self.upstream(parent, child);
    }

    /// Queue a kernel for routing without touching its relations.
    pub fn send(&mut self, k: KernelPtr) {
        self.pending.push(k);
    }

    pub fn take_pending(&mut self) -> Vec<KernelPtr> {
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Router;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Probe9 {
        base: KernelBase,
        payload: u64,
    }

    impl Kernel for Probe9 {
        kernel_base!(base);

        fn write(&self, out: &mut KernelBuffer) -> Result<(), KernelError> {
            self.base().write(out);
            out.write_u64(self.payload);
            Ok(())
        }

        fn read(&mut self, buf: &mut KernelBuffer) -> Result<(), KernelError> {
            self.base_mut().read(buf)?;
            self.payload = buf.read_u64()?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct SinkRouter {
        seen: Mutex<Vec<u64>>,
    }

    impl Router for SinkRouter {
        fn send(&self, k: KernelPtr) {
            self.seen.lock().push(k.base().id());
        }

        fn send_remote(&self, k: KernelPtr) {
            self.send(k);
        }

        fn forward(&self, _k: crate::foreign::ForeignKernel) {}
    }

    #[test]
    fn base_wire_round_trip() {
        let mut k = Probe9 { payload: 99, ..Default::default() };
        k.base_mut().set_id(12);
        k.base_mut().set_result(ExitCode::Success);
        k.base_mut().set_parent(KernelRef::Id(3));
        k.base_mut().set_principal(KernelRef::Id(4));

        let mut buf = KernelBuffer::new();
        k.write(&mut buf).unwrap();
        let mut restored = Probe9::default();
        restored.read(&mut buf).unwrap();
        assert_eq!(restored.base().id(), 12);
        assert_eq!(restored.base().result(), ExitCode::Success);
        assert_eq!(restored.base().parent(), KernelRef::Id(3));
        assert_eq!(restored.base().principal(), KernelRef::Id(4));
        assert_eq!(restored.payload, 99);
    }

    #[test]
    fn upstream_links_child_to_parent() {
        let router = SinkRouter::default();
        let ids = IdRange::new(100, 200);
        let mut ctx = Context::new(&router, &ids);

        let mut parent = Probe9::default();
        let child = Box::new(Probe9::default());
        ctx.upstream(parent.base_mut(), child);

        assert_eq!(parent.base().id(), 100);
        let pending = ctx.take_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].base().parent(), KernelRef::Id(100));
        assert_eq!(pending[0].base().principal(), KernelRef::Id(100));
    }

    #[test]
    fn direction_follows_result() {
        let mut base = KernelBase::default();
        assert!(base.moves_upstream());
        base.set_result(ExitCode::Success);
        assert!(base.moves_downstream());
    }
}
