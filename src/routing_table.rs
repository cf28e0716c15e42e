//! The learned routing table.
//!
//! Every destination maps to an ordered list of candidate routers. The list
//! is kept loosely ordered between cleanups: new routers are prepended, and
//! each cleanup pass drops aged entries and re-sorts so that the head is the
//! best candidate (fewest hops, then lowest latency, then most recently
//! seen).

use std::collections::HashMap;

use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::{inner_addr::InnerAddr, peer::Peer};

/// A single candidate next-hop for a destination.
#[derive(Debug, Clone)]
pub struct ViaRouter {
    pub peer: Peer,
    pub seen: Instant,
    /// Round trip time in milliseconds, attributed by the ping cache. 0
    /// until a measurement exists.
    pub latency: f64,
    pub hops: u8,
}

impl ViaRouter {
    fn new(peer: Peer, hops: u8) -> Self {
        Self {
            peer,
            seen: Instant::now(),
            latency: 0.0,
            hops,
        }
    }

    /// Matches a handle to the same peer, or a different handle carrying an
    /// equal socket address.
    fn matches(&self, peer: &Peer) -> bool {
        self.peer == *peer || self.peer.same_addr(peer)
    }
}

/// Hop count update rule.
///
/// A larger observation is rejected when the difference is 0xbe or 0xbf.
/// These two values are what a hop count which wrapped around the encoding
/// produces, and accepting them would inflate an otherwise stable route.
/// Interoperability depends on this exact rule.
fn update_hopcnt(old: u8, new: u8) -> u8 {
    if new > old && matches!(new - old, 0xbe | 0xbf) {
        old
    } else {
        new
    }
}

/// The list of known routers towards one destination.
#[derive(Debug, Default)]
pub struct RouteEntry {
    routers: Vec<ViaRouter>,
    /// Set when a previously empty entry gained its first router; cleared by
    /// the cleanup pass after the route got announced.
    fresh_add: bool,
}

impl RouteEntry {
    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
    }

    /// The current primary router, i.e. the head of the list.
    pub fn primary(&self) -> Option<&ViaRouter> {
        self.routers.first()
    }

    pub fn routers(&self) -> impl Iterator<Item = &ViaRouter> {
        self.routers.iter()
    }

    pub fn fresh_add(&self) -> bool {
        self.fresh_add
    }

    pub fn clear_fresh_add(&mut self) {
        self.fresh_add = false;
    }

    /// Add or refresh a router.
    ///
    /// Returns true if the router was not present yet; in that case it is
    /// prepended and acts as primary until the next cleanup re-sorts the
    /// list. An already known router only has its `seen` refreshed and the
    /// hop count update rule applied.
    pub fn add_router(&mut self, peer: &Peer, hops: u8) -> bool {
        if self.routers.is_empty() {
            self.fresh_add = true;
        }
        match self.routers.iter_mut().find(|r| r.matches(peer)) {
            Some(router) => {
                router.seen = Instant::now();
                router.hops = update_hopcnt(router.hops, hops);
                false
            }
            None => {
                self.routers.insert(0, ViaRouter::new(peer.clone(), hops));
                true
            }
        }
    }

    /// Refresh a known router with an observed hop count and latency. Does
    /// nothing if the router is absent.
    pub fn update_router(&mut self, peer: &Peer, hops: u8, latency: f64) {
        if let Some(router) = self.routers.iter_mut().find(|r| r.matches(peer)) {
            router.seen = Instant::now();
            router.hops = update_hopcnt(router.hops, hops);
            router.latency = latency;
        }
    }

    /// Remove every router matching `peer`. Returns whether any was removed.
    pub fn del_router(&mut self, peer: &Peer) -> bool {
        let before = self.routers.len();
        self.routers.retain(|r| !r.matches(peer));
        before != self.routers.len()
    }

    /// Pop the head of the list.
    pub fn del_primary_router(&mut self) {
        if !self.routers.is_empty() {
            self.routers.remove(0);
        }
    }

    /// Drop every router from the list.
    pub fn clear(&mut self) {
        self.routers.clear();
    }

    /// Drop all routers last seen `max_age` or longer ago, then re-sort so
    /// the head is the best candidate. `on_drop` is invoked for every
    /// dropped router.
    pub fn cleanup<F: FnMut(&Peer)>(&mut self, max_age: Duration, mut on_drop: F) {
        self.routers.retain(|r| {
            if r.seen.elapsed() < max_age {
                true
            } else {
                on_drop(&r.peer);
                false
            }
        });

        // Best router in front: low hops, low latency, recently seen.
        self.routers.sort_by(|a, b| {
            a.hops
                .cmp(&b.hops)
                .then(a.latency.total_cmp(&b.latency))
                .then(b.seen.cmp(&a.seen))
        });
    }

    /// Swap the two best routers with probability one half when they are
    /// "near": equal hop count and a latency difference within
    /// `max_near_rtt` milliseconds. Spreads load over equivalent paths.
    pub fn swap_near_routers(&mut self, max_near_rtt: f64) {
        if self.routers.len() < 2 {
            return;
        }
        let (a, b) = (&self.routers[0], &self.routers[1]);
        if a.hops == b.hops && (a.latency - b.latency).abs() <= max_near_rtt && rand::random() {
            self.routers.swap(0, 1);
        }
    }
}

/// Map of destination to its [`RouteEntry`].
#[derive(Debug, Default)]
pub struct RoutingTable {
    entries: HashMap<InnerAddr, RouteEntry>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh a router for `dst`, creating the entry if needed.
    pub fn add_router(&mut self, dst: InnerAddr, peer: &Peer, hops: u8) -> bool {
        self.entries.entry(dst).or_default().add_router(peer, hops)
    }

    /// The entry for `dst`, if it exists and holds at least one router.
    /// Empty entries are invisible here; they only live until the next
    /// cleanup.
    pub fn route_mut(&mut self, dst: &InnerAddr) -> Option<&mut RouteEntry> {
        self.entries.get_mut(dst).filter(|e| !e.is_empty())
    }

    pub fn route(&self, dst: &InnerAddr) -> Option<&RouteEntry> {
        self.entries.get(dst).filter(|e| !e.is_empty())
    }

    /// Remove `peer` as a router from every entry, calling `on_del` for each
    /// destination it was removed from.
    pub fn del_router_everywhere<F: FnMut(&InnerAddr)>(&mut self, peer: &Peer, mut on_del: F) {
        for (dst, entry) in self.entries.iter_mut() {
            if entry.del_router(peer) {
                on_del(dst);
            }
        }
    }

    /// Run `f` over every entry, dropping those for which it returns false.
    pub fn retain<F: FnMut(&InnerAddr, &mut RouteEntry) -> bool>(&mut self, mut f: F) {
        self.entries.retain(|dst, entry| {
            let keep = f(dst, entry);
            if !keep {
                debug!(dest = %dst, "dropping empty routing table entry");
            }
            keep
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = (&InnerAddr, &RouteEntry)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use tokio::time::{advance, Duration};

    use super::{update_hopcnt, RouteEntry, RoutingTable};
    use crate::{inner_addr::InnerAddr, peer::Peer};

    fn peer(s: &str) -> Peer {
        Peer::new(s.parse::<SocketAddr>().unwrap())
    }

    fn dst(s: &str) -> InnerAddr {
        InnerAddr::from(s.parse::<Ipv4Addr>().unwrap())
    }

    #[test]
    fn hopcnt_update_rule() {
        // Any decrease or equality is accepted.
        assert_eq!(update_hopcnt(10, 3), 3);
        assert_eq!(update_hopcnt(10, 10), 10);
        assert_eq!(update_hopcnt(0xff, 0), 0);
        // Increases are accepted too...
        assert_eq!(update_hopcnt(3, 10), 10);
        assert_eq!(update_hopcnt(0, 0xbd), 0xbd);
        // ...except for the two wrap-around deltas.
        assert_eq!(update_hopcnt(0, 0xbe), 0);
        assert_eq!(update_hopcnt(0, 0xbf), 0);
        assert_eq!(update_hopcnt(1, 0xbf), 1);
        assert_eq!(update_hopcnt(2, 0xc0), 2);
        assert_eq!(update_hopcnt(0, 0xc0), 0xc0);
    }

    #[test]
    fn add_router_return_value() {
        let mut entry = RouteEntry::default();
        let p = peer("10.1.0.1:45940");
        let q = peer("10.1.0.2:45940");

        assert!(entry.add_router(&p, 2));
        assert!(entry.fresh_add());
        // Same router again refreshes instead of inserting.
        assert!(!entry.add_router(&p, 3));
        // A different handle with an equal address is the same router.
        assert!(!entry.add_router(&peer("10.1.0.1:45940"), 2));
        assert!(entry.add_router(&q, 4));
        // New routers are prepended.
        assert_eq!(entry.primary().unwrap().peer, q);
    }

    #[test]
    fn del_absent_router_is_noop() {
        let mut entry = RouteEntry::default();
        let p = peer("10.1.0.1:45940");
        let q = peer("10.1.0.2:45940");
        entry.add_router(&p, 1);

        assert!(!entry.del_router(&q));
        assert_eq!(entry.routers().count(), 1);
        assert!(entry.del_router(&p));
        assert!(entry.is_empty());
    }

    #[test]
    fn update_absent_router_is_noop() {
        let mut entry = RouteEntry::default();
        let p = peer("10.1.0.1:45940");
        entry.update_router(&p, 1, 3.5);
        assert!(entry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_orders_and_ages() {
        let mut entry = RouteEntry::default();
        let far = peer("10.1.0.1:45940");
        let near = peer("10.1.0.2:45940");
        let slow = peer("10.1.0.3:45940");
        let stale = peer("10.1.0.4:45940");

        entry.add_router(&stale, 1);
        advance(Duration::from_secs(700)).await;
        entry.add_router(&far, 7);
        entry.add_router(&near, 2);
        entry.add_router(&slow, 2);
        entry.update_router(&near, 2, 3.0);
        entry.update_router(&slow, 2, 9.0);

        // 2 * remote_timeout of 300s.
        let mut dropped = Vec::new();
        entry.cleanup(Duration::from_secs(600), |p| dropped.push(p.clone()));

        assert_eq!(dropped, vec![stale]);
        let order: Vec<_> = entry.routers().map(|r| r.peer.clone()).collect();
        assert_eq!(order, vec![near, slow, far]);
        // Sorted ascending by (hops, latency, -seen).
        let mut prev: Option<(u8, f64)> = None;
        for r in entry.routers() {
            if let Some((h, l)) = prev {
                assert!((h, l) <= (r.hops, r.latency));
            }
            prev = Some((r.hops, r.latency));
        }
    }

    #[test]
    fn near_router_swap_gating() {
        let mut entry = RouteEntry::default();
        let p = peer("10.1.0.1:45940");
        let q = peer("10.1.0.2:45940");
        entry.add_router(&q, 3);
        entry.add_router(&p, 2);
        entry.update_router(&p, 2, 1.0);
        entry.update_router(&q, 3, 1.5);

        // Unequal hop counts never swap, no matter the coin.
        for _ in 0..64 {
            entry.swap_near_routers(5.0);
            assert_eq!(entry.primary().unwrap().peer, p);
        }

        // Equal hops but latencies too far apart never swap either.
        entry.update_router(&q, 2, 50.0);
        for _ in 0..64 {
            entry.swap_near_routers(5.0);
            assert_eq!(entry.primary().unwrap().peer, p);
        }

        // Near routers may swap, and both stay in the entry.
        entry.update_router(&q, 2, 2.0);
        for _ in 0..64 {
            entry.swap_near_routers(5.0);
            assert_eq!(entry.routers().count(), 2);
            let head = entry.primary().unwrap().peer.clone();
            assert!(head == p || head == q);
        }
    }

    #[test]
    fn table_del_router_everywhere() {
        let mut table = RoutingTable::new();
        let p = peer("10.1.0.1:45940");
        let q = peer("10.1.0.2:45940");

        table.add_router(dst("10.0.0.1"), &p, 1);
        table.add_router(dst("10.0.0.2"), &p, 2);
        table.add_router(dst("10.0.0.2"), &q, 3);
        table.add_router(dst("10.0.0.3"), &q, 1);

        let mut touched = Vec::new();
        table.del_router_everywhere(&p, |d| touched.push(*d));
        touched.sort();
        assert_eq!(touched, vec![dst("10.0.0.1"), dst("10.0.0.2")]);

        // 10.0.0.1 is now empty and no longer reachable through route().
        assert!(table.route(&dst("10.0.0.1")).is_none());
        assert_eq!(
            table.route(&dst("10.0.0.2")).unwrap().primary().unwrap().peer,
            q
        );
    }
}
