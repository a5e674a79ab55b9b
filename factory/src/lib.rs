// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Composition root of the scheduler: owns the pipelines, the registries
//! and the transaction log, and implements the routing decision that picks
//! the pipeline carrying each kernel next.

use config::{DaemonConfig, FactoryFlags};
use discovery::DiscoveryState;
use kernel::{
    ExitCode, ForeignKernel, IdRange, InstanceRegistry, Kernel, KernelFlags, KernelPtr, Origin,
    Router, RouterRef, TransactionLog, TransactionStatus, TypeRegistry,
};
use parking_lot::{Condvar, Mutex};
use pipeline::{KernelSack, ParallelPipeline, Pipeline, TimerPipeline};
use remote::{ChildLink, ProcessConfig, ProcessPipeline, SocketConfig, SocketPipeline, UnixPipeline};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Error, Debug)]
pub enum FactoryError {
    #[error(transparent)]
    Pipeline(#[from] pipeline::PipelineError),

    #[error(transparent)]
    Remote(#[from] remote::RemoteError),

    #[error(transparent)]
    Kernel(#[from] kernel::KernelError),
}

/// One-shot exit channel fulfilled by `graceful_shutdown`.
#[derive(Default)]
struct ExitChannel {
    code: Mutex<Option<ExitCode>>,
    cv: Condvar,
}

impl ExitChannel {
    fn fulfill(&self, code: ExitCode) {
        let mut guard = self.code.lock();
        if guard.is_none() {
            *guard = Some(code);
            self.cv.notify_all();
        }
    }

    fn wait(&self) -> ExitCode {
        let mut guard = self.code.lock();
        while guard.is_none() {
            self.cv.wait(&mut guard);
        }
        guard.expect("fulfilled")
    }
}

struct Inner {
    types: Arc<TypeRegistry>,
    instances: Arc<InstanceRegistry>,
    ids: Arc<IdRange>,
    router_ref: Arc<RouterRef>,
    local: Option<Arc<ParallelPipeline>>,
    timer: Option<Arc<TimerPipeline>>,
    remote: Option<Arc<SocketPipeline>>,
    process: Option<Arc<ProcessPipeline>>,
    unix: Option<Arc<UnixPipeline>>,
    link: Option<Arc<ChildLink>>,
    discovery: Option<Arc<DiscoveryState>>,
    transactions: Mutex<Option<TransactionLog>>,
    recovered: Mutex<Vec<KernelPtr>>,
    exit: ExitChannel,
    wrr: Mutex<u64>,
}

impl Inner {
    fn log_transaction(&self, status: TransactionStatus, k: &dyn Kernel) {
        let mut guard = self.transactions.lock();
        let Some(log) = guard.as_mut() else { return };
        let Some(type_id) = self.types.id_of(k) else { return };
        if let Err(e) = log.write(status, type_id, k) {
            error!(error = %e, "transaction log write failed");
        }
    }

    /// Weighted round-robin over the subordinate set; ties go to the
    /// lowest address because the set is address-ordered.
    fn pick_weighted(&self, nodes: &[discovery::HierarchyNode]) -> SocketAddr {
        let total: u64 = nodes.iter().map(|n| u64::from(n.weight.get()).max(1)).sum();
        let ticket = {
            let mut counter = self.wrr.lock();
            let ticket = *counter % total;
            *counter += 1;
            ticket
        };
        let mut acc = 0u64;
        for node in nodes {
            acc += u64::from(node.weight.get()).max(1);
            if ticket < acc {
                return node.socket_address;
            }
        }
        nodes[0].socket_address
    }

    fn route_upstream(&self, mut k: KernelPtr) {
        // explicit destination goes straight to the wire
        if k.base().destination().is_some() {
            if let Some(remote) = &self.remote {
                remote.send(k);
                return;
            }
            if let Some(link) = &self.link {
                link.send(k);
                return;
            }
        } else if k.base().has_flag(KernelFlags::SEND_TO_SUPERIOR_NODE) {
            // toward the superior: the daemon's elected superior, or the
            // parent daemon of an application
            if let Some(superior) =
                self.discovery.as_ref().and_then(|d| d.superior_address())
            {
                k.base_mut().set_destination(Some(superior));
                if let Some(remote) = &self.remote {
                    remote.send(k);
                    return;
                }
            } else if let Some(link) = &self.link {
                link.send(k);
                return;
            }
        } else if !k.base().is_service() {
            // user work may be farmed out to the subtree; daemon service
            // kernels always execute where they arrive
            let tag = k.resource_tag();
            if let Some(discovery) = &self.discovery {
                let subordinates = discovery.matching_subordinates(tag);
                if !subordinates.is_empty()
                    && let Some(remote) = &self.remote
                {
                    let dest = self.pick_weighted(&subordinates);
                    k.base_mut().set_destination(Some(dest));
                    remote.send(k);
                    return;
                }
                // admission: a tagged kernel only runs here if the local
                // tag matches
                if let Some(tag) = tag
                    && discovery.local_resource_tag() != tag
                {
                    debug!(tag, "no node matches the kernel's resource tag");
                    k.base_mut().set_result(ExitCode::NoResources);
                    self.send(k);
                    return;
                }
            }
        }
        if let Some(local) = &self.local {
            if k.base().transactional() {
                self.log_transaction(TransactionStatus::Start, &*k);
            }
            local.send(k);
            return;
        }
        if let Some(link) = &self.link {
            link.send(k);
            return;
        }
        error!(
            id = k.base().id(),
            code = %ExitCode::NoUpstreamServersAvailable,
            "no pipeline accepts the kernel"
        );
        k.base_mut().set_result(ExitCode::NoUpstreamServersAvailable);
        self.route_downstream(k);
    }

    fn route_downstream(&self, mut k: KernelPtr) {
        if k.base().transactional() {
            self.log_transaction(TransactionStatus::End, &*k);
        }
        // response to a control client
        if let Some(Origin::Unix(client)) = k.base().origin()
            && let Some(unix) = &self.unix
        {
            unix.reply(client, k);
            return;
        }
        // the application's final exit
        if k.base().principal().is_none() && k.base().parent().is_none() {
            debug!(code = %k.base().result(), "final kernel consumed");
            self.exit.fulfill(k.base().result());
            return;
        }
        // an explicit destination was set by the kernel itself, e.g. a
        // reply addressed back at its sender
        if k.base().destination().is_some() {
            if let Some(remote) = &self.remote {
                remote.send(k);
                return;
            }
            if let Some(link) = &self.link {
                link.send(k);
                return;
            }
        }
        // principal parked (or mid-react) in this process: delivery of one
        // principal is pinned to one worker, which serializes its reacts
        if let Some(principal) = k.base().principal().id()
            && self.instances.contains(principal)
            && let Some(local) = &self.local
        {
            local.send(k);
            return;
        }
        // a kernel executed on behalf of the parent daemon returns up the
        // pipe; the daemon routes it toward the principal's node
        if let Some(link) = &self.link {
            link.send(k);
            return;
        }
        error!(
            id = k.base().id(),
            principal = k.base().principal().id().unwrap_or(0),
            code = %ExitCode::NoPrincipalFound,
            "downstream kernel dropped"
        );
    }
}

impl Router for Inner {
    fn send(&self, k: KernelPtr) {
        if k.base().scheduled()
            && let Some(timer) = &self.timer
        {
            timer.send(k);
            return;
        }
        if k.base().moves_downstream() {
            self.route_downstream(k);
        } else {
            self.route_upstream(k);
        }
    }

    fn send_remote(&self, mut k: KernelPtr) {
        if let Some(link) = &self.link {
            link.send(k);
            return;
        }
        if k.base().destination().is_none() {
            if let Some(superior) = self.discovery.as_ref().and_then(|d| d.superior_address()) {
                k.base_mut().set_destination(Some(superior));
            } else if let Some(discovery) = &self.discovery {
                let subordinates = discovery.matching_subordinates(k.resource_tag());
                if !subordinates.is_empty() {
                    let dest = self.pick_weighted(&subordinates);
                    k.base_mut().set_destination(Some(dest));
                }
            }
        }
        match (&self.remote, k.base().destination()) {
            (Some(remote), Some(_)) => remote.send(k),
            _ => {
                k.base_mut().set_result(ExitCode::NoUpstreamServersAvailable);
                self.route_downstream(k);
            }
        }
    }

    /// Foreign kernels are never parsed here; routing works off the
    /// header. Upstream ones are distributed like local work, downstream
    /// ones travel back toward their principal's node.
    fn forward(&self, mut fk: ForeignKernel) {
        let application = fk.application_id();
        // a destination naming this node is consumed on arrival
        if let (Some(dest), Some(remote)) = (fk.header().destination(), &self.remote)
            && remote.is_local_address(&dest)
        {
            fk.header_mut().set_destination(None);
        }
        if fk.moves_upstream() {
            self.forward_upstream(fk);
        } else {
            self.forward_downstream(application, fk);
        }
    }
}

impl Inner {
    fn forward_upstream(&self, mut fk: ForeignKernel) {
        let application = fk.application_id();
        if fk.header().destination().is_some()
            && let Some(remote) = &self.remote
        {
            remote.forward(fk);
            return;
        }
        let tag = fk.header().resource_tag();
        if let (Some(discovery), Some(remote)) = (&self.discovery, &self.remote) {
            let subordinates = discovery.matching_subordinates(tag);
            if !subordinates.is_empty() {
                // hand the full descriptor along so the peer can spawn the
                // application on first contact
                if fk.header().application().is_none()
                    && let Some(app) =
                        self.process.as_ref().and_then(|p| p.application(application))
                {
                    fk.header_mut().set_application(app);
                }
                let dest = self.pick_weighted(&subordinates);
                fk.header_mut().set_destination(Some(dest));
                remote.forward(fk);
                return;
            }
        }
        // run it here when the tag admits us and the application is (or
        // can be) hosted
        let admissible = tag.is_none_or(|t| {
            self.discovery.as_ref().is_none_or(|d| d.local_resource_tag() == t)
        });
        if admissible
            && let Some(process) = &self.process
            && (process.has_application(application) || fk.header().application().is_some())
        {
            process.forward(fk);
            return;
        }
        if let (Some(discovery), Some(remote)) = (&self.discovery, &self.remote)
            && let Some(superior) = discovery.superior_address()
        {
            fk.header_mut().set_destination(Some(superior));
            remote.forward(fk);
            return;
        }
        // total: fail the kernel back toward its sender
        error!(
            application,
            code = %ExitCode::NoUpstreamServersAvailable,
            "foreign kernel has no upstream route"
        );
        fk.set_result(ExitCode::NoUpstreamServersAvailable);
        let source = fk.header().source();
        fk.header_mut().set_destination(source);
        self.forward_downstream(application, fk);
    }

    fn forward_downstream(&self, application: u64, mut fk: ForeignKernel) {
        // a reply leaving a local application travels back to the node the
        // kernel originally came from
        if matches!(fk.header().origin(), Some(Origin::Process(_)))
            && let Some(source) = fk.header().source()
            && let Some(remote) = &self.remote
            && !remote.is_local_address(&source)
        {
            fk.header_mut().set_destination(Some(source));
            remote.forward(fk);
            return;
        }
        if let Some(process) = &self.process
            && process.has_application(application)
        {
            process.forward(fk);
            return;
        }
        if fk.header().destination().is_none() {
            let source = fk.header().source();
            fk.header_mut().set_destination(source);
        }
        if let Some(remote) = &self.remote
            && fk.header().destination().is_some()
        {
            remote.forward(fk);
            return;
        }
        error!(application, "foreign kernel has no downstream route");
    }
}

pub struct Factory {
    inner: Arc<Inner>,
}

impl Factory {
    /// Full daemon composition per `factory.flags`.
    pub fn for_daemon(
        config: &DaemonConfig,
        types: TypeRegistry,
        discovery: Arc<DiscoveryState>,
    ) -> Result<Self, FactoryError> {
        let flags = config.factory_flags;
        let types = Arc::new(types);
        let instances = Arc::new(InstanceRegistry::new());
        let ids = Arc::new(IdRange::default());
        let router_ref = Arc::new(RouterRef::new());

        let local = flags.contains(FactoryFlags::LOCAL).then(|| {
            Arc::new(ParallelPipeline::new(
                std::thread::available_parallelism().map_or(2, |n| n.get()),
                Arc::clone(&router_ref),
                Arc::clone(&instances),
                Arc::clone(&ids),
            ))
        });
        let timer = Some(Arc::new(TimerPipeline::new(Arc::clone(&router_ref))));
        let remote = if flags.contains(FactoryFlags::REMOTE) {
            Some(Arc::new(SocketPipeline::new(
                SocketConfig {
                    port: config.port,
                    connection_timeout: config.connection_timeout,
                    idle_timeout: config.idle_timeout,
                    max_connection_attempts: config.max_connection_attempts,
                },
                Arc::clone(&router_ref),
                Arc::clone(&types),
                Arc::clone(&instances),
            )?))
        } else {
            None
        };
        let process = if flags.contains(FactoryFlags::PROCESS) {
            Some(Arc::new(ProcessPipeline::new(
                ProcessConfig { allow_root: config.allow_root },
                Arc::clone(&router_ref),
                Arc::clone(&types),
                Arc::clone(&instances),
            )?))
        } else {
            None
        };
        let unix = if flags.contains(FactoryFlags::UNIX) {
            Some(Arc::new(UnixPipeline::new(
                &config.unix_socket_path,
                Arc::clone(&router_ref),
                Arc::clone(&types),
                Arc::clone(&instances),
            )?))
        } else {
            None
        };
        let (transactions, recovered) = if flags.contains(FactoryFlags::TRANSACTIONS) {
            let (log, recovered) = TransactionLog::open(&config.transactions_file, &types)?;
            (Some(log), recovered)
        } else {
            (None, Vec::new())
        };

        Ok(Self::compose(Inner {
            types,
            instances,
            ids,
            router_ref,
            local,
            timer,
            remote,
            process,
            unix,
            link: None,
            discovery: Some(discovery),
            transactions: Mutex::new(transactions),
            recovered: Mutex::new(recovered),
            exit: ExitChannel::default(),
            wrr: Mutex::new(0),
        }))
    }

    /// Application-side composition: worker pool, timer and the link back
    /// to the parent daemon (when launched by one).
    pub fn for_application(types: TypeRegistry) -> Result<Self, FactoryError> {
        let types = Arc::new(types);
        let instances = Arc::new(InstanceRegistry::new());
        let ids = Arc::new(IdRange::default());
        let router_ref = Arc::new(RouterRef::new());
        let local = Some(Arc::new(ParallelPipeline::new(
            std::thread::available_parallelism().map_or(2, |n| n.get()),
            Arc::clone(&router_ref),
            Arc::clone(&instances),
            Arc::clone(&ids),
        )));
        let timer = Some(Arc::new(TimerPipeline::new(Arc::clone(&router_ref))));
        let link = match ChildLink::from_env(
            Arc::clone(&router_ref),
            Arc::clone(&types),
            Arc::clone(&instances),
            Arc::clone(&ids),
        ) {
            Some(link) => Some(Arc::new(link?)),
            None => None,
        };
        Ok(Self::compose(Inner {
            types,
            instances,
            ids,
            router_ref,
            local,
            timer,
            remote: None,
            process: None,
            unix: None,
            link,
            discovery: None,
            transactions: Mutex::new(None),
            recovered: Mutex::new(Vec::new()),
            exit: ExitChannel::default(),
            wrr: Mutex::new(0),
        }))
    }

    fn compose(inner: Inner) -> Self {
        let inner = Arc::new(inner);
        let as_router: Arc<dyn Router> = Arc::clone(&inner) as Arc<dyn Router>;
        inner.router_ref.bind(Arc::downgrade(&as_router));
        Self { inner }
    }

    /// Bring pipelines up in dependency order, then re-route kernels
    /// recovered from the transaction log.
    pub fn start(&self) -> Result<(), FactoryError> {
        if let Some(local) = &self.inner.local {
            local.start()?;
        }
        if let Some(timer) = &self.inner.timer {
            timer.start()?;
        }
        if let Some(process) = &self.inner.process {
            process.start()?;
        }
        if let Some(remote) = &self.inner.remote {
            remote.start()?;
        }
        if let Some(unix) = &self.inner.unix {
            unix.start()?;
        }
        if let Some(link) = &self.inner.link {
            link.start()?;
        }
        info!("factory started");
        let recovered: Vec<KernelPtr> =
            std::mem::take(&mut *self.inner.recovered.lock());
        for k in recovered {
            self.inner.send(k);
        }
        Ok(())
    }

    /// Reverse order of `start`; joins every pipeline thread.
    pub fn stop(&self) {
        let inner = &self.inner;
        let pipelines: Vec<&dyn Pipeline> = [
            inner.link.as_deref().map(|p| p as &dyn Pipeline),
            inner.unix.as_deref().map(|p| p as &dyn Pipeline),
            inner.remote.as_deref().map(|p| p as &dyn Pipeline),
            inner.process.as_deref().map(|p| p as &dyn Pipeline),
            inner.timer.as_deref().map(|p| p as &dyn Pipeline),
            inner.local.as_deref().map(|p| p as &dyn Pipeline),
        ]
        .into_iter()
        .flatten()
        .collect();
        for p in &pipelines {
            p.stop();
        }
        for p in &pipelines {
            p.wait();
        }
        info!("factory stopped");
    }

    /// Move every queued kernel into one sack for graceful destruction.
    pub fn clear(&self) -> KernelSack {
        let mut sack = KernelSack::new();
        let inner = &self.inner;
        for p in [
            inner.local.as_deref().map(|p| p as &dyn Pipeline),
            inner.timer.as_deref().map(|p| p as &dyn Pipeline),
            inner.remote.as_deref().map(|p| p as &dyn Pipeline),
            inner.process.as_deref().map(|p| p as &dyn Pipeline),
            inner.link.as_deref().map(|p| p as &dyn Pipeline),
        ]
        .into_iter()
        .flatten()
        {
            let mut part = KernelSack::new();
            p.clear(&mut part);
            sack.absorb(part);
        }
        for k in self.inner.instances.drain() {
            sack.push(k);
        }
        sack
    }

    /// Block until `graceful_shutdown` fulfills the exit promise.
    pub fn wait(&self) -> ExitCode {
        self.inner.exit.wait()
    }

    /// The single exit channel of the whole process.
    pub fn graceful_shutdown(&self, code: ExitCode) {
        self.inner.exit.fulfill(code);
    }

    pub fn send(&self, k: KernelPtr) {
        self.inner.send(k);
    }

    pub fn send_remote(&self, k: KernelPtr) {
        self.inner.send_remote(k);
    }

    /// Schedule a kernel at its `at` time point.
    pub fn schedule(&self, k: KernelPtr) {
        match &self.inner.timer {
            Some(timer) => timer.send(k),
            None => self.inner.send(k),
        }
    }

    pub fn allocate_id(&self) -> u64 {
        self.inner.ids.allocate()
    }

    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.inner.types
    }

    pub fn instances(&self) -> &Arc<InstanceRegistry> {
        &self.inner.instances
    }

    pub fn remote(&self) -> Option<&Arc<SocketPipeline>> {
        self.inner.remote.as_ref()
    }

    pub fn process(&self) -> Option<&Arc<ProcessPipeline>> {
        self.inner.process.as_ref()
    }

    pub fn discovery(&self) -> Option<&Arc<DiscoveryState>> {
        self.inner.discovery.as_ref()
    }

    pub fn router(&self) -> Arc<RouterRef> {
        Arc::clone(&self.inner.router_ref)
    }

    /// Transaction log path, when journaling is on.
    pub fn transactions_path(&self) -> Option<std::path::PathBuf> {
        self.inner.transactions.lock().as_ref().map(|log| log.path().to_path_buf())
    }
}

/// Build an application factory with the given user kernel types and run
/// `root` to completion, returning the process exit code. The convenience
/// entry point of application executables.
pub fn run_application(
    types: TypeRegistry,
    root: KernelPtr,
) -> Result<i32, FactoryError> {
    let factory = Factory::for_application(types)?;
    factory.start()?;
    factory.send(root);
    let code = factory.wait();
    factory.stop();
    let sack = factory.clear();
    if !sack.is_empty() {
        debug!(count = sack.len(), "kernels discarded at shutdown");
    }
    Ok(code.process_exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::Properties;
    use kernel::{Context, KernelBase, KernelBuffer, KernelError, Step, kernel_base};
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Leaf {
        base: KernelBase,
        fail: bool,
    }

    impl Kernel for Leaf {
        kernel_base!(base);

        fn act(&mut self, _ctx: &mut Context<'_>) -> Step {
            if self.fail {
                self.base.set_result(ExitCode::Error);
            }
            Step::Return
        }

        fn write(&self, out: &mut KernelBuffer) -> Result<(), KernelError> {
            self.base().write(out);
            out.write_bool(self.fail);
            Ok(())
        }

        fn read(&mut self, buf: &mut KernelBuffer) -> Result<(), KernelError> {
            self.base_mut().read(buf)?;
            self.fail = buf.read_bool()?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct Spawner {
        base: KernelBase,
        children: u32,
        done: u32,
    }

    impl Kernel for Spawner {
        kernel_base!(base);

        fn act(&mut self, ctx: &mut Context<'_>) -> Step {
            for _ in 0..self.children {
                ctx.upstream(&mut self.base, Box::new(Leaf::default()));
            }
            Step::Park
        }

        fn react(&mut self, _child: KernelPtr, _ctx: &mut Context<'_>) -> Step {
            self.done += 1;
            if self.done == self.children { Step::Return } else { Step::Park }
        }
    }

    fn local_only_config() -> DaemonConfig {
        let mut props = Properties::new();
        props.apply_token("factory.flags=-remote -process -unix").unwrap();
        DaemonConfig::from_properties(&props).unwrap()
    }

    fn local_factory() -> Factory {
        let mut types = TypeRegistry::new();
        types.register::<Leaf>(100).unwrap();
        types.register::<Spawner>(101).unwrap();
        let factory =
            Factory::for_daemon(&local_only_config(), types, Arc::new(DiscoveryState::default()))
                .unwrap();
        factory.start().unwrap();
        factory
    }

    #[test]
    fn standalone_fork_join_reaches_the_exit_channel() {
        let factory = local_factory();
        factory.send(Box::new(Spawner { children: 10, ..Default::default() }));
        assert_eq!(factory.wait(), ExitCode::Success);
        factory.stop();
    }

    #[test]
    fn scheduled_kernels_go_through_the_timer() {
        let factory = local_factory();
        let mut k = Leaf::default();
        k.base_mut().after(Duration::from_millis(80));
        let begun = Instant::now();
        factory.send(Box::new(k));
        assert_eq!(factory.wait(), ExitCode::Success);
        assert!(begun.elapsed() >= Duration::from_millis(80));
        factory.stop();
    }

    #[test]
    fn routing_is_total_without_pipelines() {
        // everything off except the timer: an upstream kernel must come
        // back with no-upstream-servers-available, not vanish
        let mut props = Properties::new();
        props.apply_token("factory.flags=-local -remote -process -unix").unwrap();
        let config = DaemonConfig::from_properties(&props).unwrap();
        let factory = Factory::for_daemon(
            &config,
            TypeRegistry::new(),
            Arc::new(DiscoveryState::default()),
        )
        .unwrap();
        factory.start().unwrap();
        factory.send(Box::new(Leaf::default()));
        assert_eq!(factory.wait(), ExitCode::NoUpstreamServersAvailable);
        factory.stop();
    }

    #[test]
    fn failed_kernel_reports_its_code() {
        let factory = local_factory();
        factory.send(Box::new(Leaf { fail: true, ..Default::default() }));
        assert_eq!(factory.wait(), ExitCode::Error);
        factory.stop();
    }

    #[test]
    fn transactional_kernels_are_journaled_and_completed() {
        let path = std::env::temp_dir().join("arbor-factory-txn.log");
        let _ = std::fs::remove_file(&path);
        let mut props = Properties::new();
        props.apply_token("factory.flags=+transactions -remote -process -unix").unwrap();
        props
            .apply_token(&format!("transactions.file={}", path.display()))
            .unwrap();
        let config = DaemonConfig::from_properties(&props).unwrap();
        let mut types = TypeRegistry::new();
        types.register::<Leaf>(100).unwrap();
        let factory =
            Factory::for_daemon(&config, types, Arc::new(DiscoveryState::default())).unwrap();
        factory.start().unwrap();

        let mut k = Leaf::default();
        k.base_mut().set_flag(KernelFlags::TRANSACTIONAL);
        factory.send(Box::new(k));
        assert_eq!(factory.wait(), ExitCode::Success);
        factory.stop();

        // both records landed, so a replay recovers nothing
        let mut types = TypeRegistry::new();
        types.register::<Leaf>(100).unwrap();
        let (_log, recovered) = TransactionLog::open(&path, &types).unwrap();
        assert!(recovered.is_empty());
        let _ = std::fs::remove_file(&path);
    }
}
