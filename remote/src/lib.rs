// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Wire transports of the arbor scheduler: the per-peer connection
//! protocol with its save lists, the TCP socket pipeline, the child
//! process pipeline, the unix-socket pipeline serving the CLI, and the
//! application-side link back to the parent daemon.

pub mod child_link;
pub mod connection;
pub mod errors;
pub mod event;
pub mod process;
pub mod socket;
pub mod unix;

pub use child_link::ChildLink;
pub use connection::{ConnAction, ConnEvent, Connection, ConnectionState, Received};
pub use errors::RemoteError;
pub use event::{SocketEvent, SocketEventKind};
pub use process::{ProcessConfig, ProcessPipeline};
pub use socket::{SocketConfig, SocketPipeline};
pub use unix::UnixPipeline;
