// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Kernel header: routing addresses and the owning application, serialized
//! in front of every kernel body.

use crate::application::{self, Application};
use crate::buffer::KernelBuffer;
use crate::errors::KernelError;
use crate::flags::{HeaderFields, ProtoFlags};
use std::net::SocketAddr;

/// Which pipeline a kernel entered this process through. Transport
/// bookkeeping only; never serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Inbound TCP connection from the given peer.
    Socket(SocketAddr),
    /// Pipe of the child process hosting the given application.
    Process(u64),
    /// Unix-socket client, keyed by connection token.
    Unix(u64),
}

#[derive(Debug)]
pub struct KernelHeader {
    source: Option<SocketAddr>,
    destination: Option<SocketAddr>,
    application_id: u64,
    application: Option<Box<Application>>,
    resource_tag: Option<u64>,
    origin: Option<Origin>,
}

impl Default for KernelHeader {
    fn default() -> Self {
        Self {
            source: None,
            destination: None,
            application_id: application::this_application_id(),
            application: None,
            resource_tag: None,
            origin: None,
        }
    }
}

impl KernelHeader {
    pub fn source(&self) -> Option<SocketAddr> {
        self.source
    }

    pub fn set_source(&mut self, addr: Option<SocketAddr>) {
        self.source = addr;
    }

    pub fn destination(&self) -> Option<SocketAddr> {
        self.destination
    }

    pub fn set_destination(&mut self, addr: Option<SocketAddr>) {
        self.destination = addr;
    }

    pub fn application_id(&self) -> u64 {
        match &self.application {
            Some(app) => app.id(),
            None => self.application_id,
        }
    }

    pub fn set_application_id(&mut self, id: u64) {
        self.application = None;
        self.application_id = id;
    }

    /// The full descriptor, when this kernel carries one for cross-node
    /// spawning.
    pub fn application(&self) -> Option<&Application> {
        self.application.as_deref()
    }

    pub fn set_application(&mut self, app: Application) {
        self.application_id = app.id();
        self.application = Some(Box::new(app));
    }

    pub fn take_application(&mut self) -> Option<Application> {
        self.application.take().map(|app| *app)
    }

    pub fn is_native(&self) -> bool {
        self.application_id() == application::this_application_id()
    }

    pub fn is_foreign(&self) -> bool {
        !self.is_native()
    }

    /// Resource tag this kernel must be matched with, if any. Transported
    /// in the header so routing nodes can match it without parsing the
    /// body.
    pub fn resource_tag(&self) -> Option<u64> {
        self.resource_tag
    }

    pub fn set_resource_tag(&mut self, tag: Option<u64>) {
        self.resource_tag = tag;
    }

    pub fn origin(&self) -> Option<Origin> {
        self.origin
    }

    pub fn set_origin(&mut self, origin: Option<Origin>) {
        self.origin = origin;
    }

    /// Serialization order: field byte; application id or full descriptor;
    /// optional source and destination addresses.
    pub fn write(&self, out: &mut KernelBuffer, proto: ProtoFlags) {
        let mut fields = HeaderFields::default();
        let full_application =
            self.application.is_some() && proto.contains(ProtoFlags::PREPEND_APPLICATION);
        if full_application {
            fields |= HeaderFields::APPLICATION;
        }
        let addresses = proto.contains(ProtoFlags::PREPEND_SOURCE_AND_DESTINATION);
        if addresses && self.source.is_some() {
            fields |= HeaderFields::SOURCE;
        }
        if addresses && self.destination.is_some() {
            fields |= HeaderFields::DESTINATION;
        }
        if self.resource_tag.is_some() {
            fields |= HeaderFields::RESOURCE_TAG;
        }
        out.write_u8(fields.bits());
        match (&self.application, full_application) {
            (Some(app), true) => app.write(out),
            _ => out.write_u64(self.application_id()),
        }
        if fields.contains(HeaderFields::SOURCE) {
            out.write_socket_addr(self.source.as_ref());
        }
        if fields.contains(HeaderFields::DESTINATION) {
            out.write_socket_addr(self.destination.as_ref());
        }
        if let Some(tag) = self.resource_tag {
            out.write_u64(tag);
        }
    }

    pub fn read(buf: &mut KernelBuffer) -> Result<Self, KernelError> {
        let fields = HeaderFields::from_bits_retain(buf.read_u8()?);
        if fields.contains(HeaderFields::VERSION) {
            return Err(KernelError::UnsupportedProtocolVersion);
        }
        let mut header = Self::default();
        if fields.contains(HeaderFields::APPLICATION) {
            header.set_application(Application::read(buf)?);
        } else {
            header.set_application_id(buf.read_u64()?);
        }
        if fields.contains(HeaderFields::SOURCE) {
            header.source = buf.read_socket_addr()?;
        }
        if fields.contains(HeaderFields::DESTINATION) {
            header.destination = buf.read_socket_addr()?;
        }
        if fields.contains(HeaderFields::RESOURCE_TAG) {
            header.resource_tag = Some(buf.read_u64()?);
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn bare_id_round_trip() {
        let mut header = KernelHeader::default();
        header.set_application_id(0xCAFE);
        header.set_source(Some("10.0.0.1:33333".parse().unwrap()));
        header.set_destination(Some("10.0.0.2:33333".parse().unwrap()));
        header.set_resource_tag(Some(7));

        let mut buf = KernelBuffer::new();
        header.write(
            &mut buf,
            ProtoFlags::PREPEND_SOURCE_AND_DESTINATION | ProtoFlags::PREPEND_APPLICATION,
        );
        let restored = KernelHeader::read(&mut buf).unwrap();
        assert_eq!(restored.application_id(), 0xCAFE);
        assert_eq!(restored.source(), header.source());
        assert_eq!(restored.destination(), header.destination());
        assert_eq!(restored.resource_tag(), Some(7));
        assert!(restored.application().is_none());
    }

    #[test]
    fn addresses_omitted_without_proto_flag() {
        let mut header = KernelHeader::default();
        header.set_application_id(9);
        header.set_source(Some("10.0.0.1:1000".parse().unwrap()));

        let mut buf = KernelBuffer::new();
        header.write(&mut buf, ProtoFlags::empty());
        let restored = KernelHeader::read(&mut buf).unwrap();
        assert_eq!(restored.application_id(), 9);
        assert_eq!(restored.source(), None);
    }

    #[test]
    fn full_descriptor_round_trip() {
        let app = Application::new(vec!["/bin/true".into()]);
        let id = app.id();
        let mut header = KernelHeader::default();
        header.set_application(app);

        let mut buf = KernelBuffer::new();
        header.write(&mut buf, ProtoFlags::PREPEND_APPLICATION);
        let restored = KernelHeader::read(&mut buf).unwrap();
        assert_eq!(restored.application_id(), id);
        assert_eq!(restored.application().unwrap().argv(), ["/bin/true".to_string()]);
    }

    #[test]
    fn future_version_is_rejected() {
        let mut buf = KernelBuffer::new();
        buf.write_u8(HeaderFields::VERSION.bits());
        buf.write_u64(1);
        assert!(matches!(
            KernelHeader::read(&mut buf),
            Err(KernelError::UnsupportedProtocolVersion)
        ));
    }
}
