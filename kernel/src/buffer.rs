// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Byte buffer shared by all wire transports, with packet framing.
//!
//! A [`KernelBuffer`] is a contiguous byte vector with a read position;
//! writes append at the end. Frames are length-prefixed with a `u32`:
//! [`KernelBuffer::begin_frame`] reserves the prefix and back-patches it,
//! [`KernelBuffer::take_frame`] returns a complete frame body or `None`
//! without consuming anything, so a caller simply retries after more bytes
//! arrive.

use crate::errors::KernelError;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::{Deref, DerefMut};

/// Length of the frame size prefix.
pub const FRAME_PREFIX_LEN: usize = 4;

/// Consumed bytes are dropped once the read position passes this mark and
/// the unread window is smaller than the consumed prefix.
const COMPACT_THRESHOLD: usize = 4096;

const ADDRESS_FAMILY_NONE: u8 = 0;
const ADDRESS_FAMILY_V4: u8 = 4;
const ADDRESS_FAMILY_V6: u8 = 6;

#[derive(Debug, Default, Clone)]
pub struct KernelBuffer {
    data: Vec<u8>,
    position: usize,
}

impl KernelBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { data: Vec::with_capacity(capacity), position: 0 }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data, position: 0 }
    }

    /// Unread bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// The unread window.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.position..]
    }

    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.remaining());
        self.position += n;
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.position = 0;
    }

    /// Drop consumed bytes when the unread window is small relative to the
    /// consumed prefix.
    pub fn compact(&mut self) {
        if self.position >= COMPACT_THRESHOLD && self.remaining() <= self.position {
            self.data.drain(..self.position);
            self.position = 0;
        }
    }

    // -- primitive writes, little-endian ------------------------------------

    pub fn write_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(u8::from(v));
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// `u32` length followed by the bytes.
    pub fn write_str(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.data.extend_from_slice(s.as_bytes());
    }

    // -- primitive reads -----------------------------------------------------

    fn take(&mut self, n: usize) -> Result<&[u8], KernelError> {
        if self.remaining() < n {
            return Err(KernelError::UnexpectedEof);
        }
        let start = self.position;
        self.position += n;
        Ok(&self.data[start..start + n])
    }

    pub fn read_u8(&mut self) -> Result<u8, KernelError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, KernelError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, KernelError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, KernelError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn read_bool(&mut self) -> Result<bool, KernelError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, KernelError> {
        Ok(self.take(n)?.to_vec())
    }

    pub fn read_string(&mut self) -> Result<String, KernelError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| KernelError::BadString)
    }

    // -- socket addresses ----------------------------------------------------

    /// Family tag byte, address bytes, `u16` port. Tag 0 means absent.
    pub fn write_socket_addr(&mut self, addr: Option<&SocketAddr>) {
        match addr {
            None => self.write_u8(ADDRESS_FAMILY_NONE),
            Some(SocketAddr::V4(v4)) => {
                self.write_u8(ADDRESS_FAMILY_V4);
                self.write_bytes(&v4.ip().octets());
                self.write_u16(v4.port());
            }
            Some(SocketAddr::V6(v6)) => {
                self.write_u8(ADDRESS_FAMILY_V6);
                self.write_bytes(&v6.ip().octets());
                self.write_u16(v6.port());
            }
        }
    }

    pub fn read_socket_addr(&mut self) -> Result<Option<SocketAddr>, KernelError> {
        match self.read_u8()? {
            ADDRESS_FAMILY_NONE => Ok(None),
            ADDRESS_FAMILY_V4 => {
                let b = self.take(4)?;
                let ip = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
                let port = self.read_u16()?;
                Ok(Some(SocketAddr::new(IpAddr::V4(ip), port)))
            }
            ADDRESS_FAMILY_V6 => {
                let b = self.take(16)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(b);
                let port = self.read_u16()?;
                Ok(Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)))
            }
            family => Err(KernelError::BadAddressFamily(family)),
        }
    }

    // -- framing -------------------------------------------------------------

    /// Start a length-prefixed frame. The prefix is back-patched when the
    /// guard is dropped.
    pub fn begin_frame(&mut self) -> FrameGuard<'_> {
        let start = self.data.len();
        self.write_u32(0);
        FrameGuard { buffer: self, start }
    }

    /// Detach the next complete frame body, or `None` if the buffer holds a
    /// truncated frame. The read position moves only on success, and then
    /// always past the whole frame.
    pub fn take_frame(&mut self) -> Option<KernelBuffer> {
        if self.remaining() < FRAME_PREFIX_LEN {
            return None;
        }
        let p = self.position;
        let len =
            u32::from_le_bytes([self.data[p], self.data[p + 1], self.data[p + 2], self.data[p + 3]])
                as usize;
        if self.remaining() < FRAME_PREFIX_LEN + len {
            return None;
        }
        let body = self.data[p + FRAME_PREFIX_LEN..p + FRAME_PREFIX_LEN + len].to_vec();
        self.position += FRAME_PREFIX_LEN + len;
        Some(KernelBuffer::from_vec(body))
    }

    // -- stream IO -----------------------------------------------------------

    /// Append bytes from a (possibly non-blocking) reader. Returns the number
    /// of bytes read and whether end-of-stream was observed.
    pub fn fill_from<R: Read>(&mut self, reader: &mut R) -> io::Result<(usize, bool)> {
        let mut total = 0;
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => return Ok((total, true)),
                Ok(n) => {
                    self.data.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok((total, false)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Drain unread bytes into a (possibly non-blocking) writer. Returns the
    /// number of bytes written.
    pub fn flush_to<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut total = 0;
        while self.remaining() > 0 {
            match writer.write(&self.data[self.position..]) {
                Ok(0) => break,
                Ok(n) => {
                    self.position += n;
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        self.compact();
        Ok(total)
    }
}

/// Write guard of one frame; patches the length prefix on drop.
pub struct FrameGuard<'a> {
    buffer: &'a mut KernelBuffer,
    start: usize,
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        let len = (self.buffer.data.len() - self.start - FRAME_PREFIX_LEN) as u32;
        self.buffer.data[self.start..self.start + FRAME_PREFIX_LEN]
            .copy_from_slice(&len.to_le_bytes());
    }
}

impl Deref for FrameGuard<'_> {
    type Target = KernelBuffer;

    fn deref(&self) -> &Self::Target {
        self.buffer
    }
}

impl DerefMut for FrameGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::SocketAddr;

    #[test]
    fn primitives_round_trip() {
        let mut buf = KernelBuffer::new();
        buf.write_u8(7);
        buf.write_u16(0xBEEF);
        buf.write_u32(0xDEAD_BEEF);
        buf.write_u64(u64::MAX - 1);
        buf.write_bool(true);
        buf.write_str("ten green bottles");
        assert_eq!(buf.read_u8().unwrap(), 7);
        assert_eq!(buf.read_u16().unwrap(), 0xBEEF);
        assert_eq!(buf.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(buf.read_u64().unwrap(), u64::MAX - 1);
        assert!(buf.read_bool().unwrap());
        assert_eq!(buf.read_string().unwrap(), "ten green bottles");
        assert!(buf.read_u8().is_err());
    }

    #[test]
    fn socket_addr_round_trip() {
        let mut buf = KernelBuffer::new();
        let v4: SocketAddr = "10.0.0.2:33333".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:8080".parse().unwrap();
        buf.write_socket_addr(Some(&v4));
        buf.write_socket_addr(Some(&v6));
        buf.write_socket_addr(None);
        assert_eq!(buf.read_socket_addr().unwrap(), Some(v4));
        assert_eq!(buf.read_socket_addr().unwrap(), Some(v6));
        assert_eq!(buf.read_socket_addr().unwrap(), None);
    }

    #[test]
    fn frame_write_and_take() {
        let mut buf = KernelBuffer::new();
        {
            let mut frame = buf.begin_frame();
            frame.write_u32(42);
            frame.write_str("body");
        }
        let mut body = buf.take_frame().expect("one complete frame");
        assert_eq!(body.read_u32().unwrap(), 42);
        assert_eq!(body.read_string().unwrap(), "body");
        assert!(buf.take_frame().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn truncated_frame_leaves_position_intact() {
        let mut complete = KernelBuffer::new();
        {
            let mut frame = complete.begin_frame();
            frame.write_u64(0x0102_0304_0506_0708);
        }
        let bytes = complete.as_slice().to_vec();

        let mut buf = KernelBuffer::new();
        buf.write_bytes(&bytes[..bytes.len() - 3]);
        let before = buf.position();
        assert!(buf.take_frame().is_none());
        assert_eq!(buf.position(), before);

        // remainder arrives, the retry succeeds
        buf.write_bytes(&bytes[bytes.len() - 3..]);
        let mut body = buf.take_frame().expect("complete after refill");
        assert_eq!(body.read_u64().unwrap(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn nested_frames_patch_their_own_prefix() {
        let mut buf = KernelBuffer::new();
        {
            let mut frame = buf.begin_frame();
            frame.write_u8(1);
        }
        {
            let mut frame = buf.begin_frame();
            frame.write_bytes(&[0u8; 300]);
        }
        let first = buf.take_frame().unwrap();
        assert_eq!(first.remaining(), 1);
        let second = buf.take_frame().unwrap();
        assert_eq!(second.remaining(), 300);
    }

    #[test]
    fn compaction_drops_consumed_prefix() {
        let mut buf = KernelBuffer::new();
        buf.write_bytes(&vec![0xAB; 2 * COMPACT_THRESHOLD]);
        buf.advance(2 * COMPACT_THRESHOLD - 8);
        buf.compact();
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.remaining(), 8);
        assert_eq!(buf.as_slice(), &[0xAB; 8]);
    }

    #[test]
    fn flush_and_fill_between_buffers() {
        let mut out = KernelBuffer::new();
        {
            let mut frame = out.begin_frame();
            frame.write_str("over the wire");
        }
        let mut wire: Vec<u8> = Vec::new();
        out.flush_to(&mut wire).unwrap();
        assert!(out.is_empty());

        let mut input = KernelBuffer::new();
        let (n, eof) = input.fill_from(&mut wire.as_slice()).unwrap();
        assert_eq!(n, wire.len());
        assert!(eof);
        let mut body = input.take_frame().unwrap();
        assert_eq!(body.read_string().unwrap(), "over the wire");
    }
}
