use std::net::{Ipv4Addr, Ipv6Addr};

use crate::tools::error::{Error, Result};

/// IP address field value.
///
/// A 128-bit slot holding either an IPv6 address or an IPv4 address in the
/// embedded convention: upper 64 bits zero, bytes 8..11 the four octets in
/// network order, bytes 12..15 all ones.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct IpAddr {
    bytes: [u8; 16],
}

impl IpAddr {
    /// Build from 16 bytes in network order (an IPv6 address, or an already
    /// embedded IPv4 address).
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        IpAddr { bytes }
    }

    /// Build an embedded IPv4 address from a 32-bit number in host order.
    pub fn from_v4_int(addr: u32) -> Self {
        let mut bytes = [0u8; 16];
        bytes[8..12].copy_from_slice(&addr.to_be_bytes());
        bytes[12..16].copy_from_slice(&[0xFF; 4]);
        IpAddr { bytes }
    }

    /// Build an embedded IPv4 address from 4 bytes in network order.
    pub fn from_v4_bytes(octets: [u8; 4]) -> Self {
        let mut bytes = [0u8; 16];
        bytes[8..12].copy_from_slice(&octets);
        bytes[12..16].copy_from_slice(&[0xFF; 4]);
        IpAddr { bytes }
    }

    /// True iff the slot holds an embedded IPv4 address: upper 64 bits zero
    /// and bytes 12..15 all ones.
    pub fn is_v4(&self) -> bool {
        self.bytes[0..8] == [0; 8] && self.bytes[12..16] == [0xFF; 4]
    }

    /// Negation of [`is_v4`](Self::is_v4).
    pub fn is_v6(&self) -> bool {
        !self.is_v4()
    }

    /// The embedded IPv4 address as a 32-bit number in host order.
    /// Meaningful only when [`is_v4`](Self::is_v4) holds.
    pub fn v4_int(&self) -> u32 {
        u32::from_be_bytes([self.bytes[8], self.bytes[9], self.bytes[10], self.bytes[11]])
    }

    /// The raw 16 bytes in network order.
    pub const fn bytes(&self) -> &[u8; 16] {
        &self.bytes
    }
}

impl From<Ipv4Addr> for IpAddr {
    fn from(addr: Ipv4Addr) -> Self {
        IpAddr::from_v4_bytes(addr.octets())
    }
}

impl From<Ipv6Addr> for IpAddr {
    fn from(addr: Ipv6Addr) -> Self {
        IpAddr::from_bytes(addr.octets())
    }
}

impl std::str::FromStr for IpAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(v4) = s.parse::<Ipv4Addr>() {
            return Ok(v4.into());
        }
        s.parse::<Ipv6Addr>()
            .map(Into::into)
            .map_err(|_| Error::spec(format!("bad IP address {:?}", s)))
    }
}

impl std::fmt::Display for IpAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_v4() {
            let [a, b, c, d] = [self.bytes[8], self.bytes[9], self.bytes[10], self.bytes[11]];
            write!(f, "{}", Ipv4Addr::new(a, b, c, d))
        } else {
            write!(f, "{}", Ipv6Addr::from(self.bytes))
        }
    }
}
