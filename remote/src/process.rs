// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Process pipeline: spawns application executables as child processes
//! connected over a pair of pipes and drives the kernel protocol on them.
//!
//! The child inherits its end of each pipe at a fixed descriptor and the
//! `ARBOR_*` environment variables naming them; the runtime on the child
//! side picks those up and builds the link back (see `child_link`).

use crate::connection::{Connection, ConnectionState, Received};
use crate::errors::RemoteError;
use ahash::AHashMap;
use command_fds::{CommandFdExt, FdMapping};
use crossbeam_channel as chan;
use kernel::{
    Application, ForeignKernel, IdRange, InstanceRegistry, Kernel, KernelPtr, Origin,
    ProtoFlags, RouterRef, TypeRegistry, application,
};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use nix::fcntl::OFlag;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use parking_lot::Mutex;
use pipeline::{KernelSack, Pipeline, PipelineError};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Child as OsChild, Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const WAKER: Token = Token(0);
const POLL_TICK: Duration = Duration::from_millis(500);

/// Descriptors the child finds its pipe ends at.
const CHILD_INPUT_FD: i32 = 3;
const CHILD_OUTPUT_FD: i32 = 4;

#[derive(Debug, Clone, Default)]
pub struct ProcessConfig {
    pub allow_root: bool,
}

fn proto_flags() -> ProtoFlags {
    ProtoFlags::PREPEND_SOURCE_AND_DESTINATION
        | ProtoFlags::PREPEND_APPLICATION
        | ProtoFlags::SAVE_UPSTREAM_KERNELS
        | ProtoFlags::SAVE_DOWNSTREAM_KERNELS
}

/// A spawned child with its daemon-side pipe ends, handed to the loop
/// thread for polling.
#[derive(Debug)]
struct SpawnedChild {
    app: Application,
    child: OsChild,
    read: OwnedFd,
    write: OwnedFd,
}

enum Cmd {
    Adopt(Box<SpawnedChild>),
    Send(KernelPtr),
    Forward(ForeignKernel),
    Terminate(u64),
    Stop,
}

pub struct ProcessPipeline {
    tx: chan::Sender<Cmd>,
    waker: Arc<Waker>,
    thread: Mutex<Option<JoinHandle<()>>>,
    parts: Mutex<Option<(Poll, chan::Receiver<Cmd>)>>,
    config: ProcessConfig,
    router: Arc<RouterRef>,
    types: Arc<TypeRegistry>,
    instances: Arc<InstanceRegistry>,
    hosted: Arc<Mutex<AHashMap<u64, Application>>>,
    leftovers: Arc<Mutex<KernelSack>>,
}

impl ProcessPipeline {
    pub fn new(
        config: ProcessConfig,
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
            hosted: Arc::new(Mutex::new(AHashMap::new())),
            leftovers: Arc::new(Mutex::new(KernelSack::new())),
        })
    }

    fn command(&self, cmd: Cmd) {
        if self.tx.send(cmd).is_err() {
            error!("process pipeline command channel closed");
            return;
        }
        let _ = self.waker.wake();
    }

    /// Spawn the application and adopt its pipes into the poll loop.
    /// Returns the application id.
    pub fn add(&self, app: Application) -> Result<u64, RemoteError> {
        let id = app.id();
        let spawned = spawn_child(app, &self.config)?;
        info!(application = id, pid = spawned.child.id(), "started application");
        self.hosted.lock().insert(id, spawned.app.clone());
        self.command(Cmd::Adopt(Box::new(spawned)));
        Ok(id)
    }

    /// Whether this node currently hosts the application.
    pub fn has_application(&self, id: u64) -> bool {
        self.hosted.lock().contains_key(&id)
    }

    /// Descriptor of a hosted application, e.g. for cross-node spawning.
    pub fn application(&self, id: u64) -> Option<Application> {
        self.hosted.lock().get(&id).cloned()
    }

    pub fn applications(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.hosted.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn forward(&self, fk: ForeignKernel) {
        self.command(Cmd::Forward(fk));
    }

    pub fn terminate(&self, application_id: u64) {
        self.command(Cmd::Terminate(application_id));
    }
}

impl Pipeline for ProcessPipeline {
    fn name(&self) -> &'static str {
        "process"
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
            hosted: Arc::clone(&self.hosted),
            leftovers: Arc::clone(&self.leftovers),
            ids: Arc::new(IdRange::default()),
            next_token: 1,
            children: AHashMap::new(),
            by_token: AHashMap::new(),
            stopping: false,
        };
        let handle = std::thread::Builder::new()
            .name("process".into())
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

fn spawn_child(app: Application, config: &ProcessConfig) -> Result<SpawnedChild, RemoteError> {
    let executable = app.executable().ok_or(RemoteError::MissingExecutable)?.to_owned();
    if !config.allow_root && app.uid() == 0 {
        return Err(RemoteError::RootForbidden);
    }
    // daemon -> child and child -> daemon pipes; both descriptions
    // non-blocking, which suits the pollers on either side
    let (child_read, daemon_write) =
        nix::unistd::pipe2(OFlag::O_NONBLOCK).map_err(std::io::Error::from)?;
    let (daemon_read, child_write) =
        nix::unistd::pipe2(OFlag::O_NONBLOCK).map_err(std::io::Error::from)?;

    let mut cmd = Command::new(&executable);
    cmd.args(&app.argv()[1..]);
    for entry in app.envp() {
        if let Some((key, value)) = entry.split_once('=') {
            cmd.env(key, value);
        }
    }
    cmd.env(application::ENV_INPUT_FD, CHILD_INPUT_FD.to_string());
    cmd.env(application::ENV_OUTPUT_FD, CHILD_OUTPUT_FD.to_string());
    cmd.env(application::ENV_APPLICATION_ID, app.id().to_string());
    if !app.working_directory().as_os_str().is_empty() {
        cmd.current_dir(app.working_directory());
    }
    if nix::unistd::geteuid().is_root() && app.uid() != 0 {
        cmd.uid(app.uid());
        cmd.gid(app.gid());
    }
    cmd.stdin(Stdio::null());
    cmd.fd_mappings(vec![
        FdMapping { parent_fd: child_read, child_fd: CHILD_INPUT_FD },
        FdMapping { parent_fd: child_write, child_fd: CHILD_OUTPUT_FD },
    ])
    .map_err(|_| RemoteError::FdMapping)?;
    let child = cmd.spawn()?;
    Ok(SpawnedChild { app, child, read: daemon_read, write: daemon_write })
}

struct HostedChild {
    app: Application,
    child: OsChild,
    read: OwnedFd,
    write: OwnedFd,
    read_token: Token,
    write_token: Token,
    conn: Connection,
}

struct Loop {
    poll: Poll,
    rx: chan::Receiver<Cmd>,
    config: ProcessConfig,
    router: Arc<RouterRef>,
    types: Arc<TypeRegistry>,
    instances: Arc<InstanceRegistry>,
    hosted: Arc<Mutex<AHashMap<u64, Application>>>,
    leftovers: Arc<Mutex<KernelSack>>,
    ids: Arc<IdRange>,
    next_token: usize,
    children: AHashMap<u64, HostedChild>,
    by_token: AHashMap<Token, u64>,
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
                    token => self.pipe_event(
                        token,
                        event.is_readable() || event.is_read_closed(),
                        event.is_writable(),
                    ),
                }
            }
            self.drain_commands();
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
                Cmd::Adopt(spawned) => self.adopt(*spawned),
                Cmd::Send(k) => self.send_kernel(k),
                Cmd::Forward(fk) => self.forward_foreign(fk),
                Cmd::Terminate(id) => self.terminate(id),
                Cmd::Stop => self.stopping = true,
            }
        }
    }

    fn adopt(&mut self, spawned: SpawnedChild) {
        let id = spawned.app.id();
        let read_token = self.next_token();
        let write_token = self.next_token();
        let read_fd = spawned.read.as_raw_fd();
        let write_fd = spawned.write.as_raw_fd();
        if let Err(e) = self.poll.registry().register(
            &mut SourceFd(&read_fd),
            read_token,
            Interest::READABLE,
        ) {
            error!(application = id, error = %e, "failed to register child pipe");
            return;
        }
        if let Err(e) = self.poll.registry().register(
            &mut SourceFd(&write_fd),
            write_token,
            Interest::WRITABLE,
        ) {
            error!(application = id, error = %e, "failed to register child pipe");
            return;
        }
        let mut conn = Connection::new(
            proto_flags(),
            Arc::clone(&self.types),
            Arc::clone(&self.instances),
            Arc::clone(&self.ids),
        );
        conn.set_state(ConnectionState::Started);
        self.by_token.insert(read_token, id);
        self.by_token.insert(write_token, id);
        self.children.insert(
            id,
            HostedChild {
                app: spawned.app,
                child: spawned.child,
                read: spawned.read,
                write: spawned.write,
                read_token,
                write_token,
                conn,
            },
        );
    }

    fn pipe_event(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(&id) = self.by_token.get(&token) else { return };
        let Some(child) = self.children.get_mut(&id) else { return };
        let mut lost = false;
        let mut received = Vec::new();
        if readable && token == child.read_token {
            match child.conn.input.fill_from(&mut FdIo(&child.read)) {
                Ok((n, eof)) => {
                    if n > 0 {
                        child.conn.receive(Origin::Process(id), &mut received);
                    }
                    if eof {
                        lost = true;
                    }
                }
                Err(e) => {
                    debug!(application = id, error = %e, "pipe read failed");
                    lost = true;
                }
            }
        }
        if writable && token == child.write_token && !lost {
            lost = flush_child(child).is_err();
        }
        dispatch(&self.router, received);
        if lost {
            self.child_lost(id);
        }
    }

    fn send_kernel(&mut self, k: KernelPtr) {
        let id = k.base().application_id();
        let Some(child) = self.children.get_mut(&id) else {
            error!(application = id, "no child process for kernel");
            return;
        };
        if let Err(e) = child.conn.send(k) {
            error!(application = id, error = %e, "failed to serialize kernel");
        }
        if flush_child(child).is_err() {
            self.child_lost(id);
        }
    }

    fn forward_foreign(&mut self, fk: ForeignKernel) {
        let id = fk.application_id();
        if !self.children.contains_key(&id) {
            // a kernel that carries the full descriptor spawns the
            // application on first contact
            let Some(app) = fk.header().application().cloned() else {
                warn!(application = id, "foreign kernel for unhosted application dropped");
                return;
            };
            match spawn_child(app, &self.config) {
                Ok(spawned) => {
                    info!(application = id, pid = spawned.child.id(), "started application");
                    self.hosted.lock().insert(id, spawned.app.clone());
                    self.adopt(spawned);
                }
                Err(e) => {
                    error!(application = id, error = %e, "failed to spawn application");
                    return;
                }
            }
        }
        let Some(child) = self.children.get_mut(&id) else { return };
        child.conn.forward(fk);
        if flush_child(child).is_err() {
            self.child_lost(id);
        }
    }

    fn terminate(&mut self, id: u64) {
        if let Some(child) = self.children.get_mut(&id) {
            info!(application = id, "terminating application");
            let _ = kill(Pid::from_raw(child.child.id() as i32), Signal::SIGTERM);
        }
    }

    /// Child exit or broken pipe: reap, then recover with peer-loss
    /// semantics.
    fn child_lost(&mut self, id: u64) {
        let Some(mut child) = self.children.remove(&id) else { return };
        self.by_token.remove(&child.read_token);
        self.by_token.remove(&child.write_token);
        let read_fd = child.read.as_raw_fd();
        let write_fd = child.write.as_raw_fd();
        let _ = self.poll.registry().deregister(&mut SourceFd(&read_fd));
        let _ = self.poll.registry().deregister(&mut SourceFd(&write_fd));
        let status = child.child.wait();
        info!(
            application = id,
            executable = child.app.executable().unwrap_or("?"),
            status = ?status.ok(),
            "application exited"
        );
        self.hosted.lock().remove(&id);
        let mut recovered = Vec::new();
        child.conn.on_peer_loss(&mut recovered);
        dispatch(&self.router, recovered);
    }

    fn shutdown(&mut self) {
        let ids: Vec<u64> = self.children.keys().copied().collect();
        let mut sack = self.leftovers.lock();
        for id in ids {
            if let Some(mut child) = self.children.remove(&id) {
                let _ = flush_child(&mut child);
                let _ = kill(Pid::from_raw(child.child.id() as i32), Signal::SIGTERM);
                let _ = child.child.wait();
                child.conn.clear(&mut sack);
            }
        }
        self.by_token.clear();
        self.hosted.lock().clear();
    }
}

/// Read/write adapter borrowing a pipe descriptor.
pub(crate) struct FdIo<'a>(pub &'a OwnedFd);

impl std::io::Read for FdIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        nix::unistd::read(self.0, buf).map_err(std::io::Error::from)
    }
}

impl std::io::Write for FdIo<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        nix::unistd::write(self.0, buf).map_err(std::io::Error::from)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn flush_child(child: &mut HostedChild) -> Result<(), std::io::Error> {
    child.conn.output.flush_to(&mut FdIo(&child.write)).map(|_| ())
}

fn dispatch(router: &RouterRef, received: Vec<Received>) {
    for item in received {
        match item {
            Received::Native(k) => router.send(k),
            Received::Foreign(fk) => router.forward(fk),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_applications_are_rejected_by_default() {
        let mut app = Application::new(vec!["/bin/true".into()]);
        app.set_credentials(0, 0);
        let err = spawn_child(app, &ProcessConfig::default()).unwrap_err();
        assert!(matches!(err, RemoteError::RootForbidden));
    }

    #[test]
    fn missing_executable_is_rejected() {
        let app = Application::new(Vec::new());
        let err = spawn_child(app, &ProcessConfig { allow_root: true }).unwrap_err();
        assert!(matches!(err, RemoteError::MissingExecutable));
    }

    #[test]
    fn spawn_wires_pipes_and_environment() {
        // `cat <&3 >&4` would need a shell; /bin/cat on fd 3 won't read our
        // protocol, so use /bin/true and only verify the process starts and
        // the daemon-side ends are usable.
        let mut app = Application::new(vec!["/bin/true".into()]);
        app.set_credentials(
            nix::unistd::getuid().as_raw(),
            nix::unistd::getgid().as_raw(),
        );
        let mut spawned = spawn_child(app, &ProcessConfig::default()).unwrap();
        let status = spawned.child.wait().unwrap();
        assert!(status.success());
        assert!(spawned.read.as_raw_fd() >= 0);
        assert!(spawned.write.as_raw_fd() >= 0);
    }
}
