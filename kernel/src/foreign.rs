// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Opaque carrier for kernels forwarded by nodes that do not host the
//! destination application. The payload is never parsed, only copied back
//! onto the wire.

use crate::buffer::KernelBuffer;
use crate::errors::KernelError;
use crate::exit_code::ExitCode;
use crate::flags::ProtoFlags;
use crate::header::KernelHeader;

#[derive(Debug)]
pub struct ForeignKernel {
    header: KernelHeader,
    type_id: u16,
    payload: Vec<u8>,
}

impl ForeignKernel {
    pub fn new(header: KernelHeader, type_id: u16, payload: Vec<u8>) -> Self {
        Self { header, type_id, payload }
    }

    /// Repackage the unread remainder of a frame whose header was already
    /// parsed.
    pub fn from_frame(header: KernelHeader, frame: &mut KernelBuffer) -> Result<Self, KernelError> {
        let type_id = frame.read_u16()?;
        let payload = frame.read_bytes(frame.remaining())?;
        Ok(Self { header, type_id, payload })
    }

    pub fn header(&self) -> &KernelHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut KernelHeader {
        &mut self.header
    }

    pub fn application_id(&self) -> u64 {
        self.header.application_id()
    }

    pub fn type_id(&self) -> u16 {
        self.type_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    // Every kernel body starts with the base fields (result `u16`, id
    // `u64`), so those can be inspected and patched at fixed offsets
    // without parsing the payload.

    pub fn result(&self) -> ExitCode {
        self.payload
            .get(..2)
            .and_then(|b| ExitCode::from_wire(u16::from_le_bytes([b[0], b[1]])).ok())
            .unwrap_or(ExitCode::Undefined)
    }

    pub fn set_result(&mut self, code: ExitCode) {
        if let Some(b) = self.payload.get_mut(..2) {
            b.copy_from_slice(&(code as u16).to_le_bytes());
        }
    }

    pub fn id(&self) -> u64 {
        self.payload.get(2..10).map_or(0, |b| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(b);
            u64::from_le_bytes(raw)
        })
    }

    pub fn set_id(&mut self, id: u64) {
        if let Some(b) = self.payload.get_mut(2..10) {
            b.copy_from_slice(&id.to_le_bytes());
        }
    }

    pub fn moves_upstream(&self) -> bool {
        self.result().is_undefined()
    }

    pub fn moves_downstream(&self) -> bool {
        !self.moves_upstream()
    }

    /// Reinject into a transport buffer as a complete frame.
    pub fn write(&self, out: &mut KernelBuffer) {
        let mut frame = out.begin_frame();
        self.header.write(
            &mut frame,
            ProtoFlags::PREPEND_APPLICATION | ProtoFlags::PREPEND_SOURCE_AND_DESTINATION,
        );
        frame.write_u16(self.type_id);
        frame.write_bytes(&self.payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn payload_survives_reinjection_unparsed() {
        let mut header = KernelHeader::default();
        header.set_application_id(0xABCD);
        let body = vec![9, 8, 7, 6, 5];
        let foreign = ForeignKernel::new(header, 42, body.clone());

        let mut out = KernelBuffer::new();
        foreign.write(&mut out);

        let mut frame = out.take_frame().expect("one frame");
        let header = KernelHeader::read(&mut frame).unwrap();
        assert_eq!(header.application_id(), 0xABCD);
        let restored = ForeignKernel::from_frame(header, &mut frame).unwrap();
        assert_eq!(restored.type_id(), 42);
        assert_eq!(restored.payload(), &body[..]);
    }

    #[test]
    fn base_fields_peek_and_patch() {
        // payload shaped like a kernel body: result, id, carries-parent,
        // parent and principal ids
        let mut body = KernelBuffer::new();
        body.write_u16(ExitCode::Undefined as u16);
        body.write_u64(4096);
        body.write_bool(false);
        body.write_u64(0);
        body.write_u64(7);

        let mut foreign =
            ForeignKernel::new(KernelHeader::default(), 5, body.as_slice().to_vec());
        assert!(foreign.moves_upstream());
        assert_eq!(foreign.id(), 4096);

        foreign.set_result(ExitCode::EndpointNotConnected);
        foreign.set_id(5000);
        assert!(foreign.moves_downstream());
        assert_eq!(foreign.result(), ExitCode::EndpointNotConnected);
        assert_eq!(foreign.id(), 5000);
    }
}
