// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Unix-socket pipeline: local IPC channel for the CLI tools. Clients send
//! one service kernel and await the response on the same connection.

use crate::connection::{Connection, ConnectionState, Received};
use ahash::AHashMap;
use crossbeam_channel as chan;
use kernel::{
    IdRange, InstanceRegistry, Kernel, KernelPtr, Origin, ProtoFlags, RouterRef, TypeRegistry,
};
use mio::net::{UnixListener, UnixStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use pipeline::{KernelSack, Pipeline, PipelineError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const WAKER: Token = Token(0);
const LISTENER: Token = Token(1);
const POLL_TICK: Duration = Duration::from_millis(500);

/// Default filesystem path of the daemon's CLI socket.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/arbord.sock";

enum Cmd {
    Reply(u64, KernelPtr),
    Stop,
}

pub struct UnixPipeline {
    tx: chan::Sender<Cmd>,
    waker: Arc<Waker>,
    thread: Mutex<Option<JoinHandle<()>>>,
    parts: Mutex<Option<(Poll, chan::Receiver<Cmd>)>>,
    path: PathBuf,
    router: Arc<RouterRef>,
    types: Arc<TypeRegistry>,
    instances: Arc<InstanceRegistry>,
}

impl UnixPipeline {
    pub fn new(
        path: &Path,
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
            path: path.to_path_buf(),
            router,
            types,
            instances,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn command(&self, cmd: Cmd) {
        if self.tx.send(cmd).is_err() {
            error!("unix pipeline command channel closed");
            return;
        }
        let _ = self.waker.wake();
    }

    /// Send a response kernel back to the client connection it came from.
    pub fn reply(&self, client: u64, k: KernelPtr) {
        self.command(Cmd::Reply(client, k));
    }
}

impl Pipeline for UnixPipeline {
    fn name(&self) -> &'static str {
        "unix"
    }

    fn send(&self, k: KernelPtr) {
        match k.base().origin() {
            Some(Origin::Unix(client)) => self.reply(client, k),
            _ => warn!(id = k.base().id(), "kernel without unix origin dropped"),
        }
    }

    fn start(&self) -> Result<(), PipelineError> {
        let Some((poll, rx)) = self.parts.lock().take() else {
            return Err(PipelineError::NotRunning);
        };
        let _ = std::fs::remove_file(&self.path);
        let mut listener = UnixListener::bind(&self.path)?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;
        info!(path = %self.path.display(), "listening for control connections");
        let mut lp = Loop {
            poll,
            rx,
            listener,
            path: self.path.clone(),
            router: Arc::clone(&self.router),
            types: Arc::clone(&self.types),
            instances: Arc::clone(&self.instances),
            ids: Arc::new(IdRange::default()),
            next_token: 2,
            clients: AHashMap::new(),
            stopping: false,
        };
        let handle = std::thread::Builder::new()
            .name("unix".into())
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

    fn clear(&self, _sack: &mut KernelSack) {
        // control connections hold no recoverable kernels
    }
}

struct Client {
    stream: UnixStream,
    conn: Connection,
}

struct Loop {
    poll: Poll,
    rx: chan::Receiver<Cmd>,
    listener: UnixListener,
    path: PathBuf,
    router: Arc<RouterRef>,
    types: Arc<TypeRegistry>,
    instances: Arc<InstanceRegistry>,
    ids: Arc<IdRange>,
    next_token: usize,
    clients: AHashMap<Token, Client>,
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
            for event in events.iter() {
                match event.token() {
                    WAKER => {}
                    LISTENER => self.accept_all(),
                    token => self.client_event(
                        token,
                        event.is_readable() || event.is_read_closed(),
                        event.is_writable(),
                    ),
                }
            }
            self.drain_commands();
        }
        let _ = std::fs::remove_file(&self.path);
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.rx.try_recv() {
            match cmd {
                Cmd::Reply(client, k) => self.reply(client, k),
                Cmd::Stop => self.stopping = true,
            }
        }
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, _)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        error!(error = %e, "failed to register control client");
                        continue;
                    }
                    let mut conn = Connection::new(
                        ProtoFlags::PREPEND_SOURCE_AND_DESTINATION
                            | ProtoFlags::PREPEND_APPLICATION,
                        Arc::clone(&self.types),
                        Arc::clone(&self.instances),
                        Arc::clone(&self.ids),
                    );
                    conn.set_state(ConnectionState::Started);
                    debug!(client = token.0, "control client connected");
                    self.clients.insert(token, Client { stream, conn });
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

    fn client_event(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(client) = self.clients.get_mut(&token) else { return };
        let mut gone = false;
        let mut received = Vec::new();
        if readable {
            match client.conn.input.fill_from(&mut client.stream) {
                Ok((n, eof)) => {
                    if n > 0 {
                        client.conn.receive(Origin::Unix(token.0 as u64), &mut received);
                    }
                    if eof {
                        gone = true;
                    }
                }
                Err(_) => gone = true,
            }
        }
        if writable && !gone && client.conn.output.flush_to(&mut client.stream).is_err() {
            gone = true;
        }
        for item in received {
            match item {
                Received::Native(k) => self.router.send(k),
                Received::Foreign(_) => warn!("foreign kernel on control socket dropped"),
            }
        }
        if gone {
            self.drop_client(token);
        }
    }

    fn reply(&mut self, client: u64, k: KernelPtr) {
        let token = Token(client as usize);
        let Some(entry) = self.clients.get_mut(&token) else {
            debug!(client, "control client left before the response");
            return;
        };
        if let Err(e) = entry.conn.send(k) {
            error!(error = %e, "failed to serialize response");
        }
        if entry.conn.output.flush_to(&mut entry.stream).is_err() {
            self.drop_client(token);
        }
    }

    fn drop_client(&mut self, token: Token) {
        if let Some(mut client) = self.clients.remove(&token) {
            let _ = self.poll.registry().deregister(&mut client.stream);
            debug!(client = token.0, "control client disconnected");
        }
    }
}
