// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Exit code taxonomy shared by kernels, transports and the CLI.

use crate::errors::KernelError;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::fmt;

/// Completion status of a kernel. `Undefined` is the sentinel of a kernel
/// that is still moving upstream; every other value means the kernel moves
/// downstream, back to its principal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromPrimitive)]
#[repr(u16)]
pub enum ExitCode {
    Success = 0,
    #[default]
    Undefined = 1,
    Error = 2,
    EndpointNotConnected = 3,
    NoPrincipalFound = 4,
    NoUpstreamServersAvailable = 5,
    NoResources = 6,
}

impl ExitCode {
    pub fn is_success(self) -> bool {
        self == ExitCode::Success
    }

    pub fn is_undefined(self) -> bool {
        self == ExitCode::Undefined
    }

    /// Decode a wire value.
    pub fn from_wire(raw: u16) -> Result<Self, KernelError> {
        Self::from_u16(raw).ok_or(KernelError::BadExitCode(raw))
    }

    /// The process exit status a front-end reports for this code.
    pub fn process_exit_code(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::Undefined => 1,
            ExitCode::Error => 2,
            ExitCode::EndpointNotConnected => 3,
            ExitCode::NoPrincipalFound => 4,
            ExitCode::NoUpstreamServersAvailable => 5,
            ExitCode::NoResources => 6,
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExitCode::Success => "success",
            ExitCode::Undefined => "undefined",
            ExitCode::Error => "error",
            ExitCode::EndpointNotConnected => "endpoint-not-connected",
            ExitCode::NoPrincipalFound => "no-principal-found",
            ExitCode::NoUpstreamServersAvailable => "no-upstream-servers-available",
            ExitCode::NoResources => "no-resources",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        for raw in 0..=6u16 {
            let code = ExitCode::from_wire(raw).unwrap();
            assert_eq!(code as u16, raw);
        }
        assert!(ExitCode::from_wire(7).is_err());
    }

    #[test]
    fn process_exit_mapping() {
        assert_eq!(ExitCode::Success.process_exit_code(), 0);
        assert_eq!(ExitCode::Error.process_exit_code(), 2);
        assert_eq!(ExitCode::EndpointNotConnected.process_exit_code(), 3);
        assert_eq!(ExitCode::NoResources.process_exit_code(), 6);
    }
}
