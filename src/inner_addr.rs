//! The inner address family abstraction.
//!
//! Packets carried through the tunnel are plain IPv4 or IPv6, and the routing
//! table, the control protocol and the ping cache all key on the address of
//! an inner packet regardless of its family. [`InnerAddr`] is that key: a
//! compact tagged value usable in maps and encodable on the wire.

use core::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{IpNet, PrefixLenError};

/// Wire tag for an IPv4 inner address.
pub const IAFA_AT_INET: u16 = 1;
/// Wire tag for an IPv6 inner address.
pub const IAFA_AT_INET6: u16 = 2;

/// An address of an inner (tunnelled) packet. Either family can show up on
/// the same interface, so equality and hashing cover the tag and the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InnerAddr {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl InnerAddr {
    /// The wire tag identifying the family of this address.
    pub fn afa_type(&self) -> u16 {
        match self {
            InnerAddr::V4(_) => IAFA_AT_INET,
            InnerAddr::V6(_) => IAFA_AT_INET6,
        }
    }

    /// Number of address bytes for the given wire tag, if the tag is known.
    pub fn addr_len_for(tag: u16) -> Option<usize> {
        match tag {
            IAFA_AT_INET => Some(4),
            IAFA_AT_INET6 => Some(16),
            _ => None,
        }
    }

    /// Number of address bytes of this address.
    pub fn addr_len(&self) -> usize {
        match self {
            InnerAddr::V4(_) => 4,
            InnerAddr::V6(_) => 16,
        }
    }

    /// Size of the type field plus address bytes on the wire.
    pub fn wire_len(&self) -> usize {
        2 + self.addr_len()
    }

    /// Decode an address from its wire tag and address bytes. The slice must
    /// hold at least the amount of bytes mandated by the tag.
    pub fn from_wire(tag: u16, bytes: &[u8]) -> Option<Self> {
        match tag {
            IAFA_AT_INET => {
                let raw: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
                Some(InnerAddr::V4(Ipv4Addr::from(raw)))
            }
            IAFA_AT_INET6 => {
                let raw: [u8; 16] = bytes.get(..16)?.try_into().ok()?;
                Some(InnerAddr::V6(Ipv6Addr::from(raw)))
            }
            _ => None,
        }
    }

    /// True only for the IPv4 limited broadcast address 255.255.255.255,
    /// which is delivered locally and never forwarded.
    pub fn is_direct_broadcast(&self) -> bool {
        matches!(self, InnerAddr::V4(ip) if *ip == Ipv4Addr::BROADCAST)
    }
}

impl From<Ipv4Addr> for InnerAddr {
    fn from(ip: Ipv4Addr) -> Self {
        InnerAddr::V4(ip)
    }
}

impl From<Ipv6Addr> for InnerAddr {
    fn from(ip: Ipv6Addr) -> Self {
        InnerAddr::V6(ip)
    }
}

impl From<IpAddr> for InnerAddr {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(ip) => InnerAddr::V4(ip),
            IpAddr::V6(ip) => InnerAddr::V6(ip),
        }
    }
}

impl From<InnerAddr> for IpAddr {
    fn from(addr: InnerAddr) -> Self {
        match addr {
            InnerAddr::V4(ip) => IpAddr::V4(ip),
            InnerAddr::V6(ip) => IpAddr::V6(ip),
        }
    }
}

impl From<[u8; 4]> for InnerAddr {
    fn from(raw: [u8; 4]) -> Self {
        InnerAddr::V4(Ipv4Addr::from(raw))
    }
}

impl From<[u8; 16]> for InnerAddr {
    fn from(raw: [u8; 16]) -> Self {
        InnerAddr::V6(Ipv6Addr::from(raw))
    }
}

impl fmt::Display for InnerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InnerAddr::V4(ip) => ip.fmt(f),
            InnerAddr::V6(ip) => ip.fmt(f),
        }
    }
}

/// An address assigned to the local interface, with the prefix length it was
/// configured with.
///
/// The prefix decides which ICMP message an undeliverable destination gets
/// back: host-unreachable for destinations the local subnet [`covers`],
/// net-unreachable for everything else.
///
/// [`covers`]: LocalAddr::covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalAddr {
    addr: InnerAddr,
    net: IpNet,
}

impl LocalAddr {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, PrefixLenError> {
        Ok(Self {
            addr: addr.into(),
            net: IpNet::new(addr, prefix_len)?,
        })
    }

    pub fn addr(&self) -> InnerAddr {
        self.addr
    }

    /// Whether `ip` falls into the subnet this address lives in. Addresses
    /// of the other family never do.
    pub fn covers(&self, ip: IpAddr) -> bool {
        self.net.contains(&ip)
    }

    /// The wire tag of the address family of this local address.
    pub fn afa_type(&self) -> u16 {
        self.addr.afa_type()
    }
}

impl fmt::Display for LocalAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.net.prefix_len())
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::{InnerAddr, LocalAddr, IAFA_AT_INET, IAFA_AT_INET6};

    #[test]
    fn wire_tags() {
        let v4 = InnerAddr::from(Ipv4Addr::new(10, 0, 0, 1));
        let v6 = InnerAddr::from(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1));
        assert_eq!(v4.afa_type(), IAFA_AT_INET);
        assert_eq!(v6.afa_type(), IAFA_AT_INET6);
        assert_eq!(v4.wire_len(), 6);
        assert_eq!(v6.wire_len(), 18);
    }

    #[test]
    fn wire_decoding() {
        assert_eq!(
            InnerAddr::from_wire(IAFA_AT_INET, &[192, 168, 7, 3]),
            Some(InnerAddr::from(Ipv4Addr::new(192, 168, 7, 3)))
        );

        let v6 = InnerAddr::from(Ipv6Addr::new(0xfd00, 1, 2, 3, 4, 5, 6, 7));
        let octets = Ipv6Addr::new(0xfd00, 1, 2, 3, 4, 5, 6, 7).octets();
        assert_eq!(InnerAddr::from_wire(IAFA_AT_INET6, &octets), Some(v6));

        // Unknown tag or short buffer decode to nothing.
        assert_eq!(InnerAddr::from_wire(3, &octets), None);
        assert_eq!(InnerAddr::from_wire(IAFA_AT_INET6, &octets[..8]), None);
    }

    #[test]
    fn direct_broadcast() {
        assert!(InnerAddr::from(Ipv4Addr::new(255, 255, 255, 255)).is_direct_broadcast());
        assert!(!InnerAddr::from(Ipv4Addr::new(10, 255, 255, 255)).is_direct_broadcast());
        assert!(
            !InnerAddr::from(Ipv6Addr::new(0xffff, 0xffff, 0xffff, 0xffff, 0, 0, 0, 0))
                .is_direct_broadcast()
        );
    }

    #[test]
    fn family_distinguishes_equal_bytes() {
        let v4 = InnerAddr::from(Ipv4Addr::new(0, 0, 0, 0));
        let v6 = InnerAddr::from(Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0));
        assert_ne!(v4, v6);
    }

    #[test]
    fn local_addr_coverage() {
        let local = LocalAddr::new(Ipv4Addr::new(10, 0, 1, 1).into(), 24).unwrap();
        assert!(local.covers(Ipv4Addr::new(10, 0, 1, 9).into()));
        assert!(!local.covers(Ipv4Addr::new(10, 0, 2, 9).into()));
        // The other family is never covered, whatever the bytes say.
        assert!(!local.covers(Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 1).into()));

        let local =
            LocalAddr::new(Ipv6Addr::new(0xfd00, 1, 2, 3, 0, 0, 0, 1).into(), 64).unwrap();
        assert!(local.covers(Ipv6Addr::new(0xfd00, 1, 2, 3, 9, 9, 9, 9).into()));
        assert!(!local.covers(Ipv6Addr::new(0xfd00, 1, 2, 4, 9, 9, 9, 9).into()));
        assert_eq!(local.to_string(), "fd00:1:2:3::1/64");
    }

    #[test]
    fn local_addr_rejects_bad_prefix() {
        assert!(LocalAddr::new(Ipv4Addr::new(10, 0, 1, 1).into(), 33).is_err());
        assert!(LocalAddr::new(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1).into(), 129).is_err());
    }
}
