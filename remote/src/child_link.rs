// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Application-side link to the parent daemon: a single connection over
//! the two pipe descriptors inherited at launch, driven by its own poller
//! thread.

use crate::connection::{Connection, ConnectionState, Received};
use crate::errors::RemoteError;
use crate::process::FdIo;
use crossbeam_channel as chan;
use kernel::{
    DAEMON_APPLICATION_ID, IdRange, InstanceRegistry, KernelPtr, Origin, ProtoFlags, RouterRef,
    TypeRegistry, application,
};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use pipeline::{KernelSack, Pipeline, PipelineError};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

const WAKER: Token = Token(0);
const INPUT: Token = Token(1);
const OUTPUT: Token = Token(2);
const POLL_TICK: Duration = Duration::from_millis(500);

fn proto_flags() -> ProtoFlags {
    ProtoFlags::PREPEND_SOURCE_AND_DESTINATION
        | ProtoFlags::PREPEND_APPLICATION
        | ProtoFlags::SAVE_UPSTREAM_KERNELS
        | ProtoFlags::SAVE_DOWNSTREAM_KERNELS
}

enum Cmd {
    Send(KernelPtr),
    Stop,
}

pub struct ChildLink {
    tx: chan::Sender<Cmd>,
    waker: Arc<Waker>,
    thread: Mutex<Option<JoinHandle<()>>>,
    parts: Mutex<Option<(Poll, chan::Receiver<Cmd>, OwnedFd, OwnedFd)>>,
    leftovers: Arc<Mutex<KernelSack>>,
    router: Arc<RouterRef>,
    types: Arc<TypeRegistry>,
    instances: Arc<InstanceRegistry>,
    ids: Arc<IdRange>,
}

impl ChildLink {
    /// Build the link from the `ARBOR_*` environment, or `None` when the
    /// process was not launched by a daemon.
    pub fn from_env(
        router: Arc<RouterRef>,
        types: Arc<TypeRegistry>,
        instances: Arc<InstanceRegistry>,
        ids: Arc<IdRange>,
    ) -> Option<Result<Self, RemoteError>> {
        let input: RawFd = parse_fd(application::ENV_INPUT_FD)?;
        let output: RawFd = parse_fd(application::ENV_OUTPUT_FD)?;
        // SAFETY: the daemon mapped these descriptors into this process for
        // our exclusive use; nothing else owns them.
        let input = unsafe { OwnedFd::from_raw_fd(input) };
        let output = unsafe { OwnedFd::from_raw_fd(output) };
        Some(Self::new(input, output, router, types, instances, ids))
    }

    pub fn new(
        input: OwnedFd,
        output: OwnedFd,
        router: Arc<RouterRef>,
        types: Arc<TypeRegistry>,
        instances: Arc<InstanceRegistry>,
        ids: Arc<IdRange>,
    ) -> Result<Self, RemoteError> {
        let poll = Poll::new().map_err(RemoteError::Io)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER).map_err(RemoteError::Io)?);
        let (tx, rx) = chan::unbounded();
        Ok(Self {
            tx,
            waker,
            thread: Mutex::new(None),
            parts: Mutex::new(Some((poll, rx, input, output))),
            leftovers: Arc::new(Mutex::new(KernelSack::new())),
            router,
            types,
            instances,
            ids,
        })
    }

    fn command(&self, cmd: Cmd) {
        if self.tx.send(cmd).is_err() {
            error!("child link command channel closed");
            return;
        }
        let _ = self.waker.wake();
    }
}

impl Pipeline for ChildLink {
    fn name(&self) -> &'static str {
        "link"
    }

    fn send(&self, k: KernelPtr) {
        self.command(Cmd::Send(k));
    }

    fn start(&self) -> Result<(), PipelineError> {
        let Some((poll, rx, input, output)) = self.parts.lock().take() else {
            return Err(PipelineError::NotRunning);
        };
        poll.registry().register(
            &mut SourceFd(&input.as_raw_fd()),
            INPUT,
            Interest::READABLE,
        )?;
        poll.registry().register(
            &mut SourceFd(&output.as_raw_fd()),
            OUTPUT,
            Interest::WRITABLE,
        )?;
        let mut conn = Connection::new(
            proto_flags(),
            Arc::clone(&self.types),
            Arc::clone(&self.instances),
            Arc::clone(&self.ids),
        );
        conn.set_state(ConnectionState::Started);
        let mut lp = Loop {
            poll,
            rx,
            input,
            output,
            conn,
            router: Arc::clone(&self.router),
            leftovers: Arc::clone(&self.leftovers),
            stopping: false,
        };
        let handle = std::thread::Builder::new()
            .name("link".into())
            .spawn(move || lp.run())
            .map_err(PipelineError::Spawn)?;
        *self.thread.lock() = Some(handle);
        info!("connected to parent daemon");
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

struct Loop {
    poll: Poll,
    rx: chan::Receiver<Cmd>,
    input: OwnedFd,
    output: OwnedFd,
    conn: Connection,
    router: Arc<RouterRef>,
    leftovers: Arc<Mutex<KernelSack>>,
    stopping: bool,
}

impl Loop {
    fn run(&mut self) {
        let mut events = Events::with_capacity(16);
        while !self.stopping {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TICK)) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "poller error");
                break;
            }
            let mut lost = false;
            let mut received = Vec::new();
            for event in events.iter() {
                match event.token() {
                    WAKER => {}
                    INPUT => match self.conn.input.fill_from(&mut FdIo(&self.input)) {
                        Ok((n, eof)) => {
                            if n > 0 {
                                self.conn.receive(
                                    Origin::Process(DAEMON_APPLICATION_ID),
                                    &mut received,
                                );
                            }
                            if eof {
                                lost = true;
                            }
                        }
                        Err(_) => lost = true,
                    },
                    OUTPUT => {
                        if self.conn.output.flush_to(&mut FdIo(&self.output)).is_err() {
                            lost = true;
                        }
                    }
                    _ => {}
                }
            }
            for item in received {
                match item {
                    Received::Native(k) => self.router.send(k),
                    Received::Foreign(_) => {
                        warn!("foreign kernel on the parent link dropped");
                    }
                }
            }
            self.drain_commands();
            if lost {
                warn!("parent daemon disconnected");
                let mut recovered = Vec::new();
                self.conn.on_peer_loss(&mut recovered);
                for item in recovered {
                    if let Received::Native(k) = item {
                        self.router.send(k);
                    }
                }
                break;
            }
        }
        self.conn.clear(&mut self.leftovers.lock());
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.rx.try_recv() {
            match cmd {
                Cmd::Send(k) => {
                    if let Err(e) = self.conn.send(k) {
                        error!(error = %e, "failed to serialize kernel");
                    }
                    if self.conn.output.flush_to(&mut FdIo(&self.output)).is_err() {
                        warn!("write to parent daemon failed");
                    }
                }
                Cmd::Stop => self.stopping = true,
            }
        }
    }
}

fn parse_fd(var: &str) -> Option<RawFd> {
    std::env::var(var).ok()?.parse().ok()
}
