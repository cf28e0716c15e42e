//! The remote peer registry and peer (re)connection helpers.
//!
//! The registry is an ordered set of the peers the daemon currently knows,
//! keyed by socket address. The main loop is its only writer: datagrams from
//! unknown addresses insert new peers, the cleanup pass discards timed out
//! ones and reconnects configured remotes whose entries went away.

use std::net::{IpAddr, SocketAddr};

use tokio::net::lookup_host;
use tracing::{info, warn};

use crate::{
    config::PreferredAf,
    hooks::Hooks,
    inner_addr::InnerAddr,
    peer::Peer,
};

/// Ordered set of known remote peers.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Vec<Peer>,
    hooks: Hooks,
}

impl PeerRegistry {
    pub fn new(hooks: Hooks) -> Self {
        Self {
            peers: Vec::new(),
            hooks,
        }
    }

    /// Find the peer for `saddr`, inserting a new one in place on a miss.
    ///
    /// Returns the peer and whether it was newly inserted. Insertion fires
    /// the peer-add hook.
    pub fn lookup_or_insert(&mut self, saddr: SocketAddr) -> (Peer, bool) {
        let probe = Peer::new(saddr);
        let key = probe.sort_key();
        match self.peers.binary_search_by_key(&key, Peer::sort_key) {
            Ok(idx) => (self.peers[idx].clone(), false),
            Err(idx) => {
                self.peers.insert(idx, probe.clone());
                self.hooks.peer(false, &probe);
                (probe, true)
            }
        }
    }

    /// Insert an already constructed peer, keeping the order. Fires the
    /// peer-add hook.
    pub fn insert(&mut self, peer: Peer) {
        let key = peer.sort_key();
        let idx = self
            .peers
            .binary_search_by_key(&key, Peer::sort_key)
            .unwrap_or_else(|idx| idx);
        self.hooks.peer(false, &peer);
        self.peers.insert(idx, peer);
    }

    /// A snapshot of all peers, used as flood target set.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    /// Drop every peer marked for discarding, firing the peer-del hook for
    /// each.
    pub fn remove_discarded(&mut self) {
        let hooks = self.hooks.clone();
        self.peers.retain(|peer| {
            if peer.to_discard() {
                hooks.peer(true, peer);
                false
            } else {
                true
            }
        });
    }

    /// Restore the order after peer socket addresses may have changed
    /// through re-resolution.
    pub fn resort(&mut self) {
        self.peers.sort_by_key(Peer::sort_key);
    }
}

/// Resolve a hostname or address literal into a socket address.
///
/// A port embedded in the name (`host:port`) wins; otherwise the port is
/// left 0 for the caller to fill in. When both families resolve, an address
/// matching `preferred` is picked first.
pub async fn resolve_hostname(
    name: &str,
    preferred: Option<PreferredAf>,
) -> Option<SocketAddr> {
    if let Ok(saddr) = name.parse::<SocketAddr>() {
        return Some(saddr);
    }
    if let Ok(ip) = name.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, 0));
    }

    let addrs: Vec<SocketAddr> = match lookup_host((name, 0)).await {
        Ok(addrs) => addrs.collect(),
        Err(e) => {
            warn!("can't resolve '{name}': {e}");
            return None;
        }
    };

    if let Some(preferred) = preferred {
        if let Some(saddr) = addrs.iter().find(|sa| preferred.matches(&sa.ip())) {
            return Some(*saddr);
        }
    }
    addrs.first().copied()
}

/// Resolve a list of host names into inner addresses, warning about the
/// unresolvable ones.
pub async fn resolve_inner_addrs(
    names: &[String],
    preferred: Option<PreferredAf>,
    desc: &str,
) -> std::collections::HashSet<InnerAddr> {
    let mut out = std::collections::HashSet::with_capacity(names.len());
    for name in names {
        match resolve_hostname(name, preferred).await {
            Some(saddr) => {
                out.insert(InnerAddr::from(saddr.ip()));
            }
            None => warn!("can't resolve {desc} '{name}'"),
        }
    }
    out
}

/// Resolve config remote `cent` and insert it into the registry.
pub async fn connect_to_server(
    registry: &mut PeerRegistry,
    name: &str,
    cent: usize,
    data_port: u16,
    preferred: Option<PreferredAf>,
) -> bool {
    let Some(saddr) = resolve_hostname(name, preferred).await else {
        return false;
    };
    let peer = Peer::with_config_entry(saddr, cent);
    peer.set_port_if_unset(data_port);
    info!("connected to server {peer}");
    registry.insert(peer);
    true
}

/// Try to refresh a timed out configured peer by re-resolving its hostname.
/// On success the peer counts as seen again.
pub async fn update_server_addr(
    peer: &Peer,
    remotes: &[String],
    data_port: u16,
    preferred: Option<PreferredAf>,
) -> bool {
    let Some(cent) = peer.cfg_ent() else {
        return false;
    };
    let Some(name) = remotes.get(cent) else {
        return false;
    };
    let Some(saddr) = resolve_hostname(name, preferred).await else {
        return false;
    };
    peer.mark_seen();
    peer.set_socket_addr(saddr);
    peer.set_port_if_unset(data_port);
    true
}
