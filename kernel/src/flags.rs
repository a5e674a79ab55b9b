// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Flag sets of the kernel model and the connection protocol.

use bitflags::bitflags;

bitflags! {
    /// Per-kernel behavior flags.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct KernelFlags: u32 {
        const DELETED = 1 << 0;
        /// The kernel carries a serialized backup copy of its parent to the
        /// subordinate node. Works only while the parent has a single
        /// subordinate at a time.
        const CARRIES_PARENT = 1 << 1;
        /// The parent reference is an id, not an in-process handle.
        const PARENT_IS_ID = 1 << 2;
        /// The principal reference is an id, not an in-process handle.
        const PRINCIPAL_IS_ID = 1 << 3;
        /// Log the kernel to the transaction journal around `act`.
        const TRANSACTIONAL = 1 << 4;
        /// Route the kernel to the superior of the cluster node hierarchy.
        const SEND_TO_SUPERIOR_NODE = 1 << 5;
        /// Route the kernel to a subordinate of the cluster node hierarchy.
        const SEND_TO_SUBORDINATE_NODE = 1 << 6;
        /// Execute the kernel on a dedicated thread.
        const NEW_THREAD = 1 << 7;
    }
}

bitflags! {
    /// Presence bits of the serialized kernel header. Bit 7 is the protocol
    /// version: zero in this version, frames with it set are rejected.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct HeaderFields: u8 {
        const SOURCE = 1 << 0;
        const DESTINATION = 1 << 1;
        const APPLICATION = 1 << 2;
        const RESOURCE_TAG = 1 << 3;
        const VERSION = 1 << 7;
    }
}

bitflags! {
    /// Per-connection protocol behavior.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct ProtoFlags: u8 {
        const PREPEND_SOURCE_AND_DESTINATION = 1 << 0;
        const PREPEND_APPLICATION = 1 << 1;
        const SAVE_UPSTREAM_KERNELS = 1 << 2;
        const SAVE_DOWNSTREAM_KERNELS = 1 << 3;
    }
}
