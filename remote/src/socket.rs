// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Socket pipeline: one listening TCP socket per configured interface plus
//! outbound connections to peers, multiplexed by a single poller thread.
//! Cross-thread sends go through a command channel drained on waker
//! wake-ups.

use crate::connection::{Connection, ConnectionState, Received};
use crate::event::{SocketEvent, SocketEventKind};
use ahash::AHashMap;
use crossbeam_channel as chan;
use kernel::{
    ExitCode, ForeignKernel, IdRange, InstanceRegistry, InterfaceAddress, Kernel, KernelPtr,
    Origin, ProtoFlags, RouterRef, TypeRegistry,
};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use pipeline::{KernelSack, Pipeline, PipelineError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const WAKER: Token = Token(0);
const POLL_TICK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub port: u16,
    /// T1: how long an outbound connection may linger in `Starting`.
    pub connection_timeout: Duration,
    /// T2: teardown threshold for idle established connections.
    pub idle_timeout: Duration,
    pub max_connection_attempts: u32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            port: 33333,
            connection_timeout: Duration::from_secs(7),
            idle_timeout: Duration::from_secs(60),
            max_connection_attempts: 3,
        }
    }
}

fn proto_flags() -> ProtoFlags {
    ProtoFlags::PREPEND_SOURCE_AND_DESTINATION
        | ProtoFlags::PREPEND_APPLICATION
        | ProtoFlags::SAVE_UPSTREAM_KERNELS
        | ProtoFlags::SAVE_DOWNSTREAM_KERNELS
}

enum Cmd {
    Send(KernelPtr),
    Forward(ForeignKernel),
    AddServer(InterfaceAddress),
    RemoveServer(InterfaceAddress),
    EventPrincipal(u64),
    Stop,
}

pub struct SocketPipeline {
    tx: chan::Sender<Cmd>,
    waker: Arc<Waker>,
    thread: Mutex<Option<JoinHandle<()>>>,
    parts: Mutex<Option<(Poll, chan::Receiver<Cmd>)>>,
    config: SocketConfig,
    router: Arc<RouterRef>,
    types: Arc<TypeRegistry>,
    instances: Arc<InstanceRegistry>,
    local: Arc<Mutex<AHashMap<InterfaceAddress, SocketAddr>>>,
    leftovers: Arc<Mutex<KernelSack>>,
}

impl SocketPipeline {
    pub fn new(
        config: SocketConfig,
        router: Arc<RouterRef>,
        types: Arc<TypeRegistry>,
        instances: Arc<InstanceRegistry>,
    ) -> Result<Self, PipelineError> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (tx, rx) = chan::unbounded();
        Ok(Self {
            tx,
            waker,
            thread: Mutex::new(None),
            parts: Mutex::new(Some((poll, rx))),
            config,
            router,
            types,
            instances,
            local: Arc::new(Mutex::new(AHashMap::new())),
            leftovers: Arc::new(Mutex::new(KernelSack::new())),
        })
    }

    fn command(&self, cmd: Cmd) {
        if self.tx.send(cmd).is_err() {
            error!("socket pipeline command channel closed");
            return;
        }
        let _ = self.waker.wake();
    }

    /// Bind a listening server on the interface.
    pub fn add_server(&self, ifaddr: InterfaceAddress) {
        self.command(Cmd::AddServer(ifaddr));
    }

    pub fn remove_server(&self, ifaddr: InterfaceAddress) {
        self.command(Cmd::RemoveServer(ifaddr));
    }

    /// Kernel parked under this id receives connection add/remove events.
    pub fn set_event_principal(&self, id: u64) {
        self.command(Cmd::EventPrincipal(id));
    }

    pub fn forward(&self, fk: ForeignKernel) {
        self.command(Cmd::Forward(fk));
    }

    /// Bound servers, by interface.
    pub fn servers(&self) -> Vec<(InterfaceAddress, SocketAddr)> {
        self.local.lock().iter().map(|(k, v)| (*k, *v)).collect()
    }

    pub fn has_servers(&self) -> bool {
        !self.local.lock().is_empty()
    }

    /// Whether `addr` is one of this node's own listening addresses.
    pub fn is_local_address(&self, addr: &SocketAddr) -> bool {
        self.local.lock().values().any(|local| local == addr)
    }
}

impl Pipeline for SocketPipeline {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn send(&self, k: KernelPtr) {
        self.command(Cmd::Send(k));
    }

    fn start(&self) -> Result<(), PipelineError> {
        let Some((poll, rx)) = self.parts.lock().take() else {
            return Err(PipelineError::NotRunning);
        };
        let mut lp = Loop {
            poll,
            rx,
            config: self.config.clone(),
            router: Arc::clone(&self.router),
            types: Arc::clone(&self.types),
            instances: Arc::clone(&self.instances),
            local: Arc::clone(&self.local),
            leftovers: Arc::clone(&self.leftovers),
            ids: Arc::new(IdRange::default()),
            event_principal: None,
            next_token: 1,
            servers: AHashMap::new(),
            peers: AHashMap::new(),
            by_addr: AHashMap::new(),
            retries: Vec::new(),
            stopping: false,
        };
        let handle = std::thread::Builder::new()
            .name("remote".into())
            .spawn(move || lp.run())
            .map_err(PipelineError::Spawn)?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        self.command(Cmd::Stop);
    }

    fn wait(&self) {
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    fn clear(&self, sack: &mut KernelSack) {
        let mut leftovers = self.leftovers.lock();
        *sack = std::mem::take(&mut *leftovers);
    }
}

struct Server {
    listener: TcpListener,
    ifaddr: InterfaceAddress,
}

struct Peer {
    stream: TcpStream,
    conn: Connection,
    addr: SocketAddr,
    outbound: bool,
    attempts: u32,
}

struct Retry {
    addr: SocketAddr,
    conn: Connection,
    attempts: u32,
    due: Instant,
}

struct Loop {
    poll: Poll,
    rx: chan::Receiver<Cmd>,
    config: SocketConfig,
    router: Arc<RouterRef>,
    types: Arc<TypeRegistry>,
    instances: Arc<InstanceRegistry>,
    local: Arc<Mutex<AHashMap<InterfaceAddress, SocketAddr>>>,
    leftovers: Arc<Mutex<KernelSack>>,
    /// Allocation range of the active interface; swapped when a
    /// non-loopback server is added.
    ids: Arc<IdRange>,
    event_principal: Option<u64>,
    next_token: usize,
    servers: AHashMap<Token, Server>,
    peers: AHashMap<Token, Peer>,
    by_addr: AHashMap<SocketAddr, Token>,
    retries: Vec<Retry>,
    stopping: bool,
}

impl Loop {
    fn run(&mut self) {
        let mut events = Events::with_capacity(64);
        while !self.stopping {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TICK)) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "poller error");
                break;
            }
            for event in events.iter() {
                match event.token() {
                    WAKER => {}
                    token if self.servers.contains_key(&token) => self.accept_all(token),
                    token => self.peer_event(
                        token,
                        event.is_readable() || event.is_read_closed(),
                        event.is_writable(),
                        event.is_error(),
                    ),
                }
            }
            self.drain_commands();
            self.scan_timeouts();
        }
        self.shutdown();
    }

    fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.rx.try_recv() {
            match cmd {
                Cmd::Send(k) => self.send_kernel(k),
                Cmd::Forward(fk) => self.forward_foreign(fk),
                Cmd::AddServer(ifaddr) => self.add_server(ifaddr),
                Cmd::RemoveServer(ifaddr) => self.remove_server(ifaddr),
                Cmd::EventPrincipal(id) => self.event_principal = Some(id),
                Cmd::Stop => self.stopping = true,
            }
        }
    }

    fn add_server(&mut self, ifaddr: InterfaceAddress) {
        if self.servers.values().any(|s| s.ifaddr == ifaddr) {
            return;
        }
        let addr = SocketAddr::new(ifaddr.address().into(), self.config.port);
        let mut listener = match TcpListener::bind(addr) {
            Ok(listener) => listener,
            Err(e) => {
                error!(%addr, error = %e, "failed to bind server");
                return;
            }
        };
        let token = self.next_token();
        if let Err(e) = self.poll.registry().register(&mut listener, token, Interest::READABLE) {
            error!(%addr, error = %e, "failed to register server");
            return;
        }
        info!("add interface address {}", ifaddr);
        self.local.lock().insert(ifaddr, addr);
        if !ifaddr.is_loopback() {
            self.ids = Arc::new(IdRange::for_interface(&ifaddr));
        }
        self.servers.insert(token, Server { listener, ifaddr });
    }

    fn remove_server(&mut self, ifaddr: InterfaceAddress) {
        let Some(token) = self
            .servers
            .iter()
            .find_map(|(t, s)| (s.ifaddr == ifaddr).then_some(*t))
        else {
            return;
        };
        if let Some(mut server) = self.servers.remove(&token) {
            let _ = self.poll.registry().deregister(&mut server.listener);
            info!("remove interface address {}", ifaddr);
        }
        self.local.lock().remove(&ifaddr);
    }

    fn accept_all(&mut self, token: Token) {
        loop {
            let Some(server) = self.servers.get_mut(&token) else { return };
            match server.listener.accept() {
                Ok((mut stream, addr)) => {
                    let peer_token = self.next_token();
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        peer_token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        error!(%addr, error = %e, "failed to register inbound connection");
                        continue;
                    }
                    let mut conn = Connection::new(
                        proto_flags(),
                        Arc::clone(&self.types),
                        Arc::clone(&self.instances),
                        Arc::clone(&self.ids),
                    );
                    conn.set_remote(Some(addr));
                    conn.set_state(ConnectionState::Started);
                    debug!(%addr, "accepted connection");
                    self.peers.insert(
                        peer_token,
                        Peer { stream, conn, addr, outbound: false, attempts: 0 },
                    );
                    self.by_addr.insert(addr, peer_token);
                    self.emit_event(SocketEventKind::Added, addr);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn peer_event(&mut self, token: Token, readable: bool, writable: bool, errored: bool) {
        use crate::connection::{ConnAction, ConnEvent};
        let Some(peer) = self.peers.get_mut(&token) else { return };
        let addr = peer.addr;
        let mut close = false;
        let mut established = false;
        let mut received = Vec::new();
        if errored {
            if let Ok(Some(e)) = peer.stream.take_error() {
                debug!(%addr, error = %e, "connection error");
            }
            close = peer.conn.on_event(ConnEvent::Failed).contains(&ConnAction::Close);
        }
        if readable && !close {
            let was = peer.conn.state();
            let actions = peer.conn.on_event(ConnEvent::Readable);
            established |= was == ConnectionState::Starting
                && peer.conn.state() == ConnectionState::Started;
            if actions.contains(&ConnAction::Read) {
                match peer.conn.input.fill_from(&mut peer.stream) {
                    Ok((n, eof)) => {
                        if n > 0 {
                            peer.conn.receive(Origin::Socket(addr), &mut received);
                        }
                        if eof {
                            close =
                                peer.conn.on_event(ConnEvent::Eof).contains(&ConnAction::Close);
                        }
                    }
                    Err(e) => {
                        debug!(%addr, error = %e, "read failed");
                        close =
                            peer.conn.on_event(ConnEvent::Failed).contains(&ConnAction::Close);
                    }
                }
            }
            if !close
                && actions.contains(&ConnAction::Flush)
                && let Err(e) = peer.conn.output.flush_to(&mut peer.stream)
            {
                debug!(%addr, error = %e, "write failed");
                close = peer.conn.on_event(ConnEvent::Failed).contains(&ConnAction::Close);
            }
        }
        if writable && !close {
            let was = peer.conn.state();
            let actions = peer.conn.on_event(ConnEvent::Writable);
            if was == ConnectionState::Starting && peer.conn.state() == ConnectionState::Started
            {
                established = true;
                debug!(%addr, "connection established");
            }
            if actions.contains(&ConnAction::Flush)
                && let Err(e) = peer.conn.output.flush_to(&mut peer.stream)
            {
                debug!(%addr, error = %e, "write failed");
                close = peer.conn.on_event(ConnEvent::Failed).contains(&ConnAction::Close);
            }
        }
        if established {
            peer.attempts = 0;
        }
        dispatch(&self.router, received);
        if established {
            self.emit_event(SocketEventKind::Added, addr);
        }
        if close {
            self.drop_peer(token);
        }
    }

    fn send_kernel(&mut self, k: KernelPtr) {
        let Some(dest) = k.base().destination() else {
            error!(id = k.base().id(), "kernel reached socket pipeline without destination");
            let mut k = k;
            k.base_mut().set_result(ExitCode::NoUpstreamServersAvailable);
            self.router.send(k);
            return;
        };
        let Some(token) = self.connection_to(dest) else {
            let mut k = k;
            k.base_mut().set_result(ExitCode::EndpointNotConnected);
            self.router.send(k);
            return;
        };
        let Some(peer) = self.peers.get_mut(&token) else { return };
        if let Err(e) = peer.conn.send(k) {
            error!(error = %e, "failed to serialize kernel");
        }
        self.flush_peer(token);
    }

    fn forward_foreign(&mut self, fk: ForeignKernel) {
        let Some(dest) = fk.header().destination() else {
            warn!(app = fk.application_id(), "foreign kernel without destination dropped");
            return;
        };
        let Some(token) = self.connection_to(dest) else {
            warn!(app = fk.application_id(), %dest, "no route for foreign kernel");
            return;
        };
        let Some(peer) = self.peers.get_mut(&token) else { return };
        peer.conn.forward(fk);
        self.flush_peer(token);
    }

    fn flush_peer(&mut self, token: Token) {
        let Some(peer) = self.peers.get_mut(&token) else { return };
        if peer.conn.state() == ConnectionState::Starting {
            return; // flushed when the connect completes
        }
        let addr = peer.addr;
        if let Err(e) = peer.conn.output.flush_to(&mut peer.stream) {
            debug!(%addr, error = %e, "write failed");
            self.drop_peer(token);
        }
    }

    /// Existing connection to `dest`, or a freshly dialed one.
    fn connection_to(&mut self, dest: SocketAddr) -> Option<Token> {
        if let Some(token) = self.by_addr.get(&dest) {
            return Some(*token);
        }
        let conn = Connection::new(
            proto_flags(),
            Arc::clone(&self.types),
            Arc::clone(&self.instances),
            Arc::clone(&self.ids),
        );
        self.dial(dest, conn, 0)
    }

    fn dial(&mut self, addr: SocketAddr, mut conn: Connection, attempts: u32) -> Option<Token> {
        match TcpStream::connect(addr) {
            Ok(mut stream) => {
                let token = self.next_token();
                if let Err(e) = self.poll.registry().register(
                    &mut stream,
                    token,
                    Interest::READABLE | Interest::WRITABLE,
                ) {
                    error!(%addr, error = %e, "failed to register outbound connection");
                    return None;
                }
                conn.set_remote(Some(addr));
                conn.restart();
                debug!(%addr, attempts, "dialing");
                self.peers.insert(
                    token,
                    Peer { stream, conn, addr, outbound: true, attempts: attempts + 1 },
                );
                self.by_addr.insert(addr, token);
                Some(token)
            }
            Err(e) => {
                warn!(%addr, error = %e, "connect failed");
                self.retry_or_lose(addr, conn, attempts + 1);
                None
            }
        }
    }

    fn retry_or_lose(&mut self, addr: SocketAddr, mut conn: Connection, attempts: u32) {
        if attempts < self.config.max_connection_attempts {
            let delay = backoff(self.config.connection_timeout, attempts);
            debug!(%addr, attempts, ?delay, "scheduling reconnect");
            self.retries.push(Retry { addr, conn, attempts, due: Instant::now() + delay });
            return;
        }
        info!("remove {addr} (unreachable)");
        let mut recovered = Vec::new();
        conn.on_peer_loss(&mut recovered);
        dispatch(&self.router, recovered);
        self.emit_event(SocketEventKind::Removed, addr);
    }

    fn drop_peer(&mut self, token: Token) {
        let Some(mut peer) = self.peers.remove(&token) else { return };
        self.by_addr.remove(&peer.addr);
        let _ = self.poll.registry().deregister(&mut peer.stream);
        // a non-zero attempt count means the connect never completed;
        // retry with the connection state (saved kernels, pending output)
        // intact
        if peer.outbound && peer.attempts > 0 {
            self.retry_or_lose(peer.addr, peer.conn, peer.attempts);
            return;
        }
        info!("remove {} (peer lost)", peer.addr);
        let mut recovered = Vec::new();
        peer.conn.on_peer_loss(&mut recovered);
        dispatch(&self.router, recovered);
        self.emit_event(SocketEventKind::Removed, peer.addr);
    }

    fn scan_timeouts(&mut self) {
        let now = Instant::now();
        let timed_out: Vec<Token> = self
            .peers
            .iter()
            .filter(|(_, p)| {
                p.conn.starting_longer_than(self.config.connection_timeout, now)
                    || p.conn.idle_longer_than(self.config.idle_timeout, now)
            })
            .map(|(t, _)| *t)
            .collect();
        for token in timed_out {
            debug!("connection timed out");
            if let Some(peer) = self.peers.get_mut(&token) {
                let _ = peer.conn.on_event(crate::connection::ConnEvent::TimedOut);
            }
            self.drop_peer(token);
        }
        let due: Vec<usize> = self
            .retries
            .iter()
            .enumerate()
            .filter(|(_, r)| r.due <= now)
            .map(|(i, _)| i)
            .rev()
            .collect();
        for index in due {
            let retry = self.retries.swap_remove(index);
            self.dial(retry.addr, retry.conn, retry.attempts);
        }
    }

    fn emit_event(&self, kind: SocketEventKind, addr: SocketAddr) {
        if let Some(principal) = self.event_principal {
            self.router.send(Box::new(SocketEvent::new(kind, addr, principal)));
        }
    }

    fn shutdown(&mut self) {
        let mut sack = self.leftovers.lock();
        for (_, mut peer) in self.peers.drain() {
            let _ = peer.conn.output.flush_to(&mut peer.stream);
            peer.conn.clear(&mut sack);
        }
        for retry in self.retries.drain(..) {
            let mut conn = retry.conn;
            conn.clear(&mut sack);
        }
        self.by_addr.clear();
    }
}

fn dispatch(router: &RouterRef, received: Vec<Received>) {
    for item in received {
        match item {
            Received::Native(k) => router.send(k),
            Received::Foreign(fk) => router.forward(fk),
        }
    }
}

fn backoff(base: Duration, attempts: u32) -> Duration {
    let factor = 1u32 << attempts.min(4);
    let jitter = Duration::from_millis(u64::from(rand::random::<u16>() % 250));
    base / 4 * factor + jitter
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel::{Context, Kernel, KernelBase, KernelBuffer, KernelError, Router, Step, kernel_base};

    #[derive(Default)]
    struct Echo {
        base: KernelBase,
        tag: u32,
    }

    impl Kernel for Echo {
        kernel_base!(base);

        fn act(&mut self, _ctx: &mut Context<'_>) -> Step {
            Step::Return
        }

        fn write(&self, out: &mut KernelBuffer) -> Result<(), KernelError> {
            self.base().write(out);
            out.write_u32(self.tag);
            Ok(())
        }

        fn read(&mut self, buf: &mut KernelBuffer) -> Result<(), KernelError> {
            self.base_mut().read(buf)?;
            self.tag = buf.read_u32()?;
            Ok(())
        }
    }

    struct CaptureRouter {
        received: chan::Sender<(u32, ExitCode)>,
    }

    impl Router for CaptureRouter {
        fn send(&self, k: KernelPtr) {
            if let Some(echo) = k.as_any().downcast_ref::<Echo>() {
                let _ = self.received.send((echo.tag, k.base().result()));
            }
        }

        fn send_remote(&self, k: KernelPtr) {
            self.send(k);
        }

        fn forward(&self, _fk: ForeignKernel) {}
    }

    fn types() -> Arc<TypeRegistry> {
        let mut t = TypeRegistry::new();
        t.register::<Echo>(40).unwrap();
        Arc::new(t)
    }

    fn harness(
        config: SocketConfig,
    ) -> (Arc<SocketPipeline>, chan::Receiver<(u32, ExitCode)>) {
        let (tx, rx) = chan::unbounded();
        let router_ref = Arc::new(RouterRef::new());
        let router: Arc<dyn Router> = Arc::new(CaptureRouter { received: tx });
        router_ref.bind(Arc::downgrade(&router));
        std::mem::forget(router);
        let p = Arc::new(
            SocketPipeline::new(config, router_ref, types(), Arc::new(InstanceRegistry::new()))
                .unwrap(),
        );
        p.start().unwrap();
        (p, rx)
    }

    fn loopback() -> InterfaceAddress {
        "127.0.0.1/8".parse().unwrap()
    }

    #[test]
    fn kernel_crosses_between_two_pipelines() {
        let config_a = SocketConfig { port: 37031, ..Default::default() };
        let config_b = SocketConfig { port: 37032, ..Default::default() };
        let (a, _rx_a) = harness(config_a);
        let (b, rx_b) = harness(config_b);
        b.add_server(loopback());
        std::thread::sleep(Duration::from_millis(200));

        let mut k = Echo { tag: 7, ..Default::default() };
        k.base_mut().set_destination(Some("127.0.0.1:37032".parse().unwrap()));
        a.send(Box::new(k));

        let (tag, code) = rx_b.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(tag, 7);
        assert_eq!(code, ExitCode::Undefined);

        a.stop();
        b.stop();
        a.wait();
        b.wait();
    }

    #[test]
    fn unreachable_peer_recovers_kernel() {
        let config = SocketConfig {
            port: 37033,
            connection_timeout: Duration::from_millis(200),
            max_connection_attempts: 1,
            ..Default::default()
        };
        let (a, rx) = harness(config);

        let mut k = Echo { tag: 9, ..Default::default() };
        // nobody listens here
        k.base_mut().set_destination(Some("127.0.0.1:37039".parse().unwrap()));
        a.send(Box::new(k));

        let (tag, code) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(tag, 9);
        assert_eq!(code, ExitCode::EndpointNotConnected);
        a.stop();
        a.wait();
    }
}
