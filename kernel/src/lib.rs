// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Kernel data model of the arbor scheduler: the kernel trait and its
//! header, the wire buffer with packet framing, the type and instance
//! registries, and the transaction log.
//!
//! A *kernel* is the unit of work. It moves *upstream* while its result is
//! still [`ExitCode::Undefined`] (toward a node that will execute it) and
//! *downstream* once a result is set (back to the kernel that spawned it,
//! its *principal*).

pub mod application;
pub mod buffer;
pub mod errors;
pub mod exit_code;
pub mod flags;
pub mod foreign;
pub mod header;
pub mod id_range;
pub mod ifaddr;
pub mod kernel;
pub mod registry;
pub mod router;
pub mod transaction;
pub mod weights;

pub use application::{Application, DAEMON_APPLICATION_ID, this_application_id};
pub use buffer::KernelBuffer;
pub use errors::KernelError;
pub use exit_code::ExitCode;
pub use flags::{HeaderFields, KernelFlags, ProtoFlags};
pub use foreign::ForeignKernel;
pub use header::{KernelHeader, Origin};
pub use id_range::IdRange;
pub use ifaddr::InterfaceAddress;
pub use kernel::{Context, Kernel, KernelBase, KernelPtr, KernelRef, Step};
pub use registry::{InstanceRegistry, TypeRegistry};
pub use router::{Router, RouterRef};
pub use transaction::{TransactionLog, TransactionStatus};
pub use weights::Weight;
