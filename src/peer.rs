//! Shared handles for remote peers.
//!
//! A peer is referenced from the registry, from every routing-table entry
//! that lists it as a router, and from frames waiting in the sender queues.
//! The handle is therefore a cheap reference-counted value; the mutable
//! fields sit behind a per-peer reader-writer lock because the sender reads
//! the socket address while the main loop may rewrite it on re-resolution.

use core::fmt;
use std::{
    hash::{Hash, Hasher},
    net::SocketAddr,
    sync::{Arc, RwLock},
};

use tokio::time::Instant;

/// A remote peer, identified by the socket address its datagrams come from.
///
/// A peer without a socket address is the *local sentinel*: it stands for
/// "deliver through the TUN device" and never appears in the registry.
#[derive(Debug, Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

#[derive(Debug)]
struct PeerInner {
    state: RwLock<PeerState>,
}

#[derive(Debug)]
struct PeerState {
    saddr: Option<SocketAddr>,
    seen: Instant,
    /// Index of the config `R` entry this peer was created from, if any.
    cfg_ent: Option<usize>,
    /// Marked by the cleanup pass, removed from the registry afterwards.
    to_discard: bool,
}

impl Peer {
    /// Create a new peer for the given socket address.
    pub fn new(saddr: SocketAddr) -> Self {
        Self::build(Some(saddr), None)
    }

    /// Create a new peer for a socket address resolved from config entry
    /// `cfg_ent`.
    pub fn with_config_entry(saddr: SocketAddr, cfg_ent: usize) -> Self {
        Self::build(Some(saddr), Some(cfg_ent))
    }

    /// The local sentinel: local delivery through the TUN device.
    pub fn local() -> Self {
        Self::build(None, None)
    }

    fn build(saddr: Option<SocketAddr>, cfg_ent: Option<usize>) -> Self {
        Peer {
            inner: Arc::new(PeerInner {
                state: RwLock::new(PeerState {
                    saddr,
                    seen: Instant::now(),
                    cfg_ent,
                    to_discard: false,
                }),
            }),
        }
    }

    pub fn is_local(&self) -> bool {
        self.read().saddr.is_none()
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.read().saddr
    }

    /// Replace the socket address, e.g. after a hostname re-resolved to a
    /// different IP. The registry must be re-sorted afterwards.
    pub fn set_socket_addr(&self, saddr: SocketAddr) {
        self.write().saddr = Some(saddr);
    }

    /// Set the port to `port` if the current port is 0, i.e. the address came
    /// from a resolver that did not carry one.
    pub fn set_port_if_unset(&self, port: u16) {
        let mut state = self.write();
        if let Some(saddr) = &mut state.saddr {
            if saddr.port() == 0 {
                saddr.set_port(port);
            }
        }
    }

    pub fn seen(&self) -> Instant {
        self.read().seen
    }

    pub fn mark_seen(&self) {
        self.write().seen = Instant::now();
    }

    pub fn cfg_ent(&self) -> Option<usize> {
        self.read().cfg_ent
    }

    pub fn to_discard(&self) -> bool {
        self.read().to_discard
    }

    pub fn set_to_discard(&self) {
        self.write().to_discard = true;
    }

    /// Check if two handles point at a peer with an equal socket address,
    /// regardless of handle identity.
    pub fn same_addr(&self, other: &Peer) -> bool {
        self.read().saddr == other.read().saddr
    }

    /// Number of live handles to this peer. Used as a tiebreaker when two
    /// registry entries turn out to share a socket address.
    pub fn use_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// The ordering key of a peer: family, then address bytes, then port.
    pub fn sort_key(&self) -> PeerSortKey {
        match self.read().saddr {
            None => PeerSortKey {
                family: 0,
                addr: [0; 16],
                port: 0,
            },
            Some(SocketAddr::V4(sa)) => {
                let mut addr = [0; 16];
                addr[..4].copy_from_slice(&sa.ip().octets());
                PeerSortKey {
                    family: 1,
                    addr,
                    port: sa.port(),
                }
            }
            Some(SocketAddr::V6(sa)) => PeerSortKey {
                family: 2,
                addr: sa.ip().octets(),
                port: sa.port(),
            },
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, PeerState> {
        self.inner
            .state
            .read()
            .expect("peer state lock is never poisoned; writers don't panic")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, PeerState> {
        self.inner
            .state
            .write()
            .expect("peer state lock is never poisoned; writers don't panic")
    }
}

/// Comparison key over `(family, address bytes, port)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PeerSortKey {
    family: u8,
    addr: [u8; 16],
    port: u16,
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.inner).hash(state)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.read().saddr {
            None => f.write_str("local"),
            Some(SocketAddr::V4(sa)) => write!(f, "peer {}:{}", sa.ip(), sa.port()),
            Some(SocketAddr::V6(sa)) => write!(f, "peer [{}]:{}", sa.ip(), sa.port()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::Peer;

    fn sa(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn identity_vs_addr_equality() {
        let a = Peer::new(sa("10.0.0.1:45940"));
        let b = Peer::new(sa("10.0.0.1:45940"));
        assert_ne!(a, b);
        assert!(a.same_addr(&b));
        assert_eq!(a, a.clone());
    }

    #[test]
    fn local_sentinel() {
        let local = Peer::local();
        assert!(local.is_local());
        assert_eq!(local.socket_addr(), None);
        // Two sentinels compare equal by address, not by identity.
        assert!(local.same_addr(&Peer::local()));
        assert_ne!(local, Peer::local());
    }

    #[test]
    fn sort_key_order() {
        let v4_low = Peer::new(sa("10.0.0.1:45940"));
        let v4_high = Peer::new(sa("10.0.0.2:1"));
        let v4_port = Peer::new(sa("10.0.0.1:45941"));
        let v6 = Peer::new(sa("[fd00::1]:45940"));

        assert!(v4_low.sort_key() < v4_high.sort_key());
        assert!(v4_low.sort_key() < v4_port.sort_key());
        // Address outranks port.
        assert!(v4_port.sort_key() < v4_high.sort_key());
        // IPv4 sorts before IPv6.
        assert!(v4_high.sort_key() < v6.sort_key());
    }

    #[test]
    fn port_if_unset() {
        let p = Peer::new(sa("10.0.0.1:0"));
        p.set_port_if_unset(45940);
        assert_eq!(p.socket_addr(), Some(sa("10.0.0.1:45940")));
        p.set_port_if_unset(1);
        assert_eq!(p.socket_addr(), Some(sa("10.0.0.1:45940")));
    }
}
