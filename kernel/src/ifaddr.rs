// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Interface addresses: an IPv4 address together with its subnet prefix.
//! The subnet defines a totally ordered host range used for superior
//! election and for partitioning the kernel id space between nodes.

use crate::buffer::KernelBuffer;
use crate::errors::KernelError;
use ipnet::Ipv4Net;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterfaceAddress {
    address: Ipv4Addr,
    prefix_len: u8,
}

impl InterfaceAddress {
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Self {
        Self { address, prefix_len }
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    fn net(&self) -> Ipv4Net {
        // prefix length is validated on construction paths (<= 32)
        Ipv4Net::new(self.address, self.prefix_len).unwrap_or_else(|_| {
            Ipv4Net::new(self.address, 32).expect("/32 is always valid")
        })
    }

    pub fn network(&self) -> Ipv4Addr {
        self.net().network()
    }

    pub fn is_loopback(&self) -> bool {
        self.address.is_loopback()
    }

    /// Number of host positions in the subnet range.
    pub fn host_count(&self) -> u64 {
        match 32 - u32::from(self.prefix_len) {
            0 => 1,
            bits => (1u64 << bits).saturating_sub(2).max(1),
        }
    }

    /// 1-based position of the local address within its subnet host range.
    pub fn position(&self) -> u64 {
        self.position_of(self.address)
    }

    pub fn position_of(&self, addr: Ipv4Addr) -> u64 {
        u64::from(u32::from(addr).wrapping_sub(u32::from(self.network())))
    }

    /// Address at a 1-based position of the host range.
    pub fn address_at(&self, position: u64) -> Option<Ipv4Addr> {
        if position == 0 || position > self.host_count() {
            return None;
        }
        Some(Ipv4Addr::from(u32::from(self.network()) + position as u32))
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.net().contains(&addr)
    }

    pub fn write(&self, out: &mut KernelBuffer) {
        out.write_bytes(&self.address.octets());
        out.write_u8(self.prefix_len);
    }

    pub fn read(buf: &mut KernelBuffer) -> Result<Self, KernelError> {
        let octets = buf.read_bytes(4)?;
        let address = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
        let prefix_len = buf.read_u8()?;
        Ok(Self::new(address, prefix_len.min(32)))
    }
}

impl fmt::Display for InterfaceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for InterfaceAddress {
    type Err = ipnet::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let net: Ipv4Net = s.parse()?;
        Ok(Self::new(net.addr(), net.prefix_len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_arithmetic() {
        let ifaddr: InterfaceAddress = "10.0.0.2/16".parse().unwrap();
        assert_eq!(ifaddr.network(), Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(ifaddr.position(), 2);
        assert_eq!(ifaddr.address_at(1), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(ifaddr.address_at(258), Some(Ipv4Addr::new(10, 0, 1, 2)));
        assert_eq!(ifaddr.host_count(), 65534);
        assert_eq!(ifaddr.address_at(0), None);
    }

    #[test]
    fn wire_round_trip() {
        let ifaddr: InterfaceAddress = "192.168.3.7/24".parse().unwrap();
        let mut buf = KernelBuffer::new();
        ifaddr.write(&mut buf);
        assert_eq!(InterfaceAddress::read(&mut buf).unwrap(), ifaddr);
    }
}
