// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! The error results used by this library.

use kernel::KernelError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("application has no executable")]
    MissingExecutable,

    #[error("refusing to run application as root (process.allow-root is off)")]
    RootForbidden,

    #[error("pipeline command channel is closed")]
    ChannelClosed,

    #[error("failed to map pipe descriptors into the child")]
    FdMapping,

    #[error("no application {0} on this node")]
    NoSuchApplication(u64),

    #[error("pipeline thread failed to spawn: {0}")]
    Spawn(std::io::Error),

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
