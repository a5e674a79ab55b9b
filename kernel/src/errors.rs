// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! The error results used by this library.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("unexpected end of buffer")]
    UnexpectedEof,

    #[error("malformed string on the wire")]
    BadString,

    #[error("bad socket address family {0}")]
    BadAddressFamily(u8),

    #[error("unsupported protocol version")]
    UnsupportedProtocolVersion,

    #[error("unknown kernel type {0}")]
    UnknownType(u16),

    #[error("kernel type {0} is already registered")]
    DuplicateType(u16),

    #[error("kernel type '{0}' is not registered")]
    UnregisteredType(&'static str),

    #[error("kernel has no id")]
    MissingId,

    #[error("bad exit code {0}")]
    BadExitCode(u16),

    #[error("bad transaction record kind {0}")]
    BadRecordKind(u8),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
