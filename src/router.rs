//! The router core and its main loop.
//!
//! [`Core`] bundles the daemon state: configuration snapshot, peer registry,
//! routing table, local address sets, ping cache and the handle to the
//! egress worker. All mutations happen on the main loop task; the PRN
//! handlers and the periodic cleanup live here, the packet pipeline in
//! [`crate::data`] completes the picture.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use rand::Rng;
use tokio::{
    net::UdpSocket,
    select,
    sync::{mpsc, Notify},
    time::{sleep, Duration, Instant},
};
use tokio_tun::Tun;
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    hooks::Hooks,
    inner_addr::{InnerAddr, LocalAddr},
    peer::Peer,
    peer_manager::{self, PeerRegistry},
    ping_cache::PingCache,
    prn::{
        self, Record, CMD_CONNMGMT, CMD_PROBE, CMD_ROUTEMOD, PRIO_PROBE_REQ, PRIO_PROBE_REQ_ECHO,
        PRIO_PROBE_RESP, PRIO_ROUTE_DELETE,
    },
    routing_table::RoutingTable,
    sender::{PrnSendData, Sender},
};

/// Read buffer size for the TUN device and the UDP sockets; must exceed any
/// datagram the outer transport can deliver.
const BUF_SIZE: usize = 0xffff;

/// The daemon state shared by the ingress pipeline, the PRN handlers and the
/// cleanup pass. Owned by the main loop task; sub-systems borrow it.
pub(crate) struct Core {
    pub(crate) cfg: Arc<Config>,
    pub(crate) registry: PeerRegistry,
    pub(crate) routes: RoutingTable,
    pub(crate) locals: Vec<LocalAddr>,
    pub(crate) exported_locals: HashSet<InnerAddr>,
    pub(crate) blocked_broadcasts: HashSet<InnerAddr>,
    pub(crate) local_peer: Peer,
    pub(crate) ping_cache: PingCache,
    pub(crate) sender: Sender,
    pub(crate) hooks: Hooks,
}

impl Core {
    pub(crate) fn new(
        cfg: Arc<Config>,
        locals: Vec<LocalAddr>,
        exported_locals: HashSet<InnerAddr>,
        blocked_broadcasts: HashSet<InnerAddr>,
        sender: Sender,
        hooks: Hooks,
    ) -> Self {
        Core {
            registry: PeerRegistry::new(hooks.clone()),
            routes: RoutingTable::new(),
            locals,
            exported_locals,
            blocked_broadcasts,
            local_peer: Peer::local(),
            ping_cache: PingCache::new(),
            cfg,
            sender,
            hooks,
        }
    }

    /// Dispatch the records of a PRN frame. Returns false when the frame
    /// header is not ours.
    pub(crate) fn handle_prn_frame(&mut self, srca: &Peer, buffer: &[u8]) -> bool {
        if !prn::valid_frame(buffer) {
            return false;
        }
        let records = prn::parse_records(&buffer[prn::HEADER_WIRE_SIZE..]);
        if records.is_empty() {
            warn!("got empty / incomplete PRN packet from {srca}");
            return true;
        }
        for record in records {
            match record.cmd {
                CMD_ROUTEMOD => self.prn_routemod(srca, record),
                CMD_CONNMGMT => self.prn_connmgmt(srca, record),
                CMD_PROBE => self.prn_probe(srca, record),
                other => warn!("got unknown PRN command ({other:#04x}) from {srca}"),
            }
        }
        true
    }

    /// ROUTEMOD: route announcement (prio + 1 = hop count) or, with prio
    /// 0xff, a route withdrawal.
    fn prn_routemod(&mut self, srca: &Peer, record: Record) {
        let dst = record.route;
        if record.prio != PRIO_ROUTE_DELETE {
            if !self.is_local_addr(&dst, true) && self.routes.add_router(dst, srca, record.prio + 1)
            {
                info!(
                    "add route to {dst} via {srca} with {} hops (notified)",
                    record.prio + 1
                );
            }
            return;
        }

        let mut remaining_hops = None;
        if let Some(route) = self.routes.route_mut(&dst) {
            if route.del_router(srca) {
                info!("delete route to {dst} via {srca} (notified)");
            }
            remaining_hops = route.primary().map(|p| p.hops);
        }

        // The correction echo: when we still know a way (or the deleted
        // route points at ourselves), shout it so good news can catch up
        // with the bad news racing through the mesh.
        let prio = if self.is_local_addr(&dst, false) {
            0
        } else if let Some(hops) = remaining_hops {
            hops
        } else {
            return;
        };
        self.send_prn_msg(
            Record {
                cmd: CMD_ROUTEMOD,
                prio,
                route: dst,
            },
            Some(srca.clone()),
        );
    }

    /// CONNMGMT: peers announce themselves when opening and broadcast a
    /// close before going away.
    fn prn_connmgmt(&mut self, srca: &Peer, record: Record) {
        let dst = record.route;
        if record.prio == prn::PRIO_CONNMGMT_OPEN {
            if !self.is_local_addr(&dst, true) && self.routes.add_router(dst, srca, 1) {
                info!("add route to {dst} via {srca} with 1 hops (notified)");
            }
            return;
        }

        let who = srca.to_string();
        self.routes
            .del_router_everywhere(srca, |d| info!("delete route to {d} via {who} (notified)"));
        if let Some(route) = self.routes.route_mut(&dst) {
            route.clear();
            info!("delete route to {dst} via {who} (notified)");
        }
    }

    /// PROBE: "do you have a route to X?" The response side mirrors a
    /// ROUTEMOD delete, but keeps the route.
    fn prn_probe(&mut self, srca: &Peer, record: Record) {
        match record.prio {
            PRIO_PROBE_RESP => {
                // A dead end was reached; forget this path, but unlike a
                // ROUTEMOD delete, send no correction echo.
                if let Some(route) = self.routes.route_mut(&record.route) {
                    if route.del_router(srca) {
                        info!("delete route to {} via {srca} (notified)", record.route);
                    }
                }
            }
            PRIO_PROBE_REQ => self.handle_probe_req(srca, record, false),
            PRIO_PROBE_REQ_ECHO => self.handle_probe_req(srca, record, true),
            other => warn!("got unknown PRN probe prio ({other:#04x}) from {srca}"),
        }
    }

    fn handle_probe_req(&mut self, srca: &Peer, record: Record, echo_expected: bool) {
        // A route we can answer with: not through the requester, and not at
        // the end of the hop count range.
        let mut answer_hops = None;
        if self.is_local_addr(&record.route, false) {
            answer_hops = Some(0);
        } else if let Some(route) = self.routes.route_mut(&record.route) {
            let primary = route
                .primary()
                .expect("route_mut only yields non-empty entries");
            let via_requester = primary.peer == *srca || primary.peer.same_addr(srca);
            if primary.hops != 0xff && !via_requester {
                answer_hops = Some(primary.hops);
            }
        }

        let record = if let Some(prio) = answer_hops {
            Record {
                cmd: CMD_ROUTEMOD,
                prio,
                route: record.route,
            }
        } else if !echo_expected {
            return;
        } else {
            Record {
                cmd: CMD_PROBE,
                prio: PRIO_PROBE_RESP,
                route: record.route,
            }
        };
        self.sender.enqueue_prn(PrnSendData {
            record,
            dests: vec![srca.clone()],
            confirmed: Some(srca.clone()),
        });
    }

    /// Queue a PRN record towards all peers, with split horizon: a route
    /// announcement is not flooded back through its own next hop.
    pub(crate) fn send_prn_msg(&mut self, record: Record, confirmed: Option<Peer>) {
        let mut dests = self.registry.snapshot();

        if record.prio != 0xff && record.cmd == CMD_ROUTEMOD {
            if let Some(route) = self.routes.route(&record.route) {
                if let Some(primary) = route.primary() {
                    let primary = primary.peer.clone();
                    dests.retain(|p| *p != primary && !p.same_addr(&primary));
                }
            }
        }

        self.sender.enqueue_prn(PrnSendData {
            record,
            dests,
            confirmed,
        });
    }

    /// Queue a probe for `dest`: current routers are asked with
    /// echo-expected prio, everyone else with the plain request prio.
    pub(crate) fn send_probe_req(&mut self, dest: InnerAddr) {
        let mut non_routers = self.registry.snapshot();

        if let Some(route) = self.routes.route(&dest) {
            let routers: Vec<Peer> = route.routers().map(|r| r.peer.clone()).collect();
            non_routers.retain(|p| !routers.iter().any(|r| r == p || r.same_addr(p)));
            self.sender.enqueue_prn(PrnSendData {
                record: Record {
                    cmd: CMD_PROBE,
                    prio: PRIO_PROBE_REQ_ECHO,
                    route: dest,
                },
                dests: routers,
                confirmed: None,
            });
        }

        if !non_routers.is_empty() {
            self.sender.enqueue_prn(PrnSendData {
                record: Record {
                    cmd: CMD_PROBE,
                    prio: PRIO_PROBE_REQ,
                    route: dest,
                },
                dests: non_routers,
                confirmed: None,
            });
        }
    }

    /// Broadcast a CONNMGMT message carrying the primary local address.
    pub(crate) fn send_connmgmt_msg(&mut self, prio: u8) {
        let Some(local) = self.locals.first() else {
            warn!("no local addresses configured, skipping connection announcement");
            return;
        };
        let route = local.addr();
        self.send_prn_msg(
            Record {
                cmd: CMD_CONNMGMT,
                prio,
                route,
            },
            None,
        );
    }

    /// Install routes to our own addresses through the local sentinel, so
    /// local destinations resolve through the normal table.
    pub(crate) fn install_local_routes(&mut self) {
        let local_peer = self.local_peer.clone();
        for local in self.locals.clone() {
            self.routes.add_router(local.addr(), &local_peer, 0);
        }
    }

    /// The periodic bookkeeping pass: age out peers (with a re-resolution
    /// chance for configured ones), drop duplicates, age and announce
    /// routes, probe stale primaries and reconnect missing remotes.
    pub(crate) async fn cleanup(&mut self) {
        let timeout = self.cfg.remote_timeout;

        let mut found_remotes = vec![false; self.cfg.remotes.len()];
        let peers = self.registry.snapshot();
        for (idx, peer) in peers.iter().enumerate() {
            if let Some(cent) = peer.cfg_ent() {
                if let Some(slot) = found_remotes.get_mut(cent) {
                    *slot = true;
                }
            }

            let keep = peer.seen().elapsed() < timeout
                || peer_manager::update_server_addr(
                    peer,
                    &self.cfg.remotes,
                    self.cfg.data_port,
                    self.cfg.preferred_af,
                )
                .await;

            if keep {
                // Two registry entries with one socket address: keep the
                // configured one, else the more referenced one.
                for other in &peers[idx + 1..] {
                    if other.to_discard() || !peer.same_addr(other) {
                        continue;
                    }
                    let victim = if (peer.cfg_ent().is_none() && other.cfg_ent().is_some())
                        || peer.use_count() < other.use_count()
                    {
                        peer
                    } else {
                        other
                    };
                    victim.set_to_discard();
                }
                if !peer.to_discard() {
                    continue;
                }
            }

            let who = peer.to_string();
            self.routes
                .del_router_everywhere(peer, |d| info!("delete route to {d} via {who} (outdated)"));
            peer.set_to_discard();
        }

        // Routes next, after the peer-driven del_router calls above.
        let mut announcements = Vec::new();
        let mut probes = Vec::new();
        self.routes.retain(|dst, entry| {
            let dest = *dst;
            entry.cleanup(timeout * 2, |router| {
                info!("delete route to {dest} via {router} (outdated)")
            });

            let empty = entry.is_empty();
            if empty || entry.fresh_add() {
                entry.clear_fresh_add();
                let (prio, confirmed) = match entry.primary() {
                    None => (PRIO_ROUTE_DELETE, None),
                    Some(primary) => (primary.hops, Some(primary.peer.clone())),
                };
                announcements.push((
                    Record {
                        cmd: CMD_ROUTEMOD,
                        prio,
                        route: dest,
                    },
                    confirmed,
                    empty,
                ));
            } else if entry
                .primary()
                .expect("non-empty entry has a primary")
                .seen
                .elapsed()
                > timeout
            {
                // Probe before delete: the primary aged past the timeout,
                // but gets a second chance until 2 * timeout.
                probes.push(dest);
            }

            !empty
        });

        for (record, confirmed, deleted) in announcements {
            let dest = record.route;
            self.send_prn_msg(record, confirmed);
            self.hooks.route(deleted, &dest);
        }
        for dest in probes {
            self.send_probe_req(dest);
        }

        // Discard peers last, so the route cleanup above had a chance to
        // notify them.
        self.registry.remove_discarded();

        for (cent, found) in found_remotes.iter().enumerate() {
            if !found {
                peer_manager::connect_to_server(
                    &mut self.registry,
                    &self.cfg.remotes[cent],
                    cent,
                    self.cfg.data_port,
                    self.cfg.preferred_af,
                )
                .await;
            }
        }

        // Re-resolution may have rewritten socket addresses.
        self.registry.resort();
    }

    /// Print peers and routes to stdout, triggered by SIGUSR1.
    pub(crate) fn print_routing_table(&self) {
        println!("-- connected peers:");
        println!("Peer\t\tSeen\t\tConfig Entry");
        for peer in self.registry.iter() {
            let cfgent = peer
                .cfg_ent()
                .and_then(|i| self.cfg.remotes.get(i).cloned())
                .unwrap_or_default();
            println!("{peer}\t{}s ago\t{cfgent}", peer.seen().elapsed().as_secs());
        }
        println!("-- routing table:");
        println!("Destination\tGateway\t\tSeen\t\tLatency\tHops");
        for (dst, entry) in self.routes.iter() {
            for router in entry.routers() {
                println!(
                    "{dst}\t{}\t{}s ago\t{:4.2}\t{}",
                    router.peer,
                    router.seen.elapsed().as_secs(),
                    router.latency,
                    router.hops
                );
            }
        }
    }
}

/// Commands the embedding process can send into the main loop.
#[derive(Debug)]
pub(crate) enum RouterCommand {
    DumpRoutes,
}

/// Cooperative shutdown: an atomic flag plus a notification.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    down: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn shutdown(&self) {
        self.down.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.down.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_shutdown() {
                return;
            }
            notified.await;
        }
    }
}

/// The main loop: event demultiplex over the TUN device and the UDP
/// sockets, with periodic cleanup and graceful shutdown.
pub(crate) struct Router {
    core: Core,
    udp4: Arc<UdpSocket>,
    udp6: Arc<UdpSocket>,
    tun: Arc<Tun>,
    cmd_rx: mpsc::UnboundedReceiver<RouterCommand>,
    shutdown: Arc<ShutdownSignal>,
}

impl Router {
    pub(crate) fn new(
        core: Core,
        udp4: Arc<UdpSocket>,
        udp6: Arc<UdpSocket>,
        tun: Arc<Tun>,
        cmd_rx: mpsc::UnboundedReceiver<RouterCommand>,
        shutdown: Arc<ShutdownSignal>,
    ) -> Self {
        Self {
            core,
            udp4,
            udp6,
            tun,
            cmd_rx,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        // Tell the mesh we are here, and route our own addresses locally.
        self.core.send_connmgmt_msg(prn::PRIO_CONNMGMT_OPEN);
        self.core.install_local_routes();

        let mut tun_buf = vec![0u8; BUF_SIZE];
        let mut udp4_buf = vec![0u8; BUF_SIZE];
        let mut udp6_buf = vec![0u8; BUF_SIZE];
        let timeout = self.core.cfg.remote_timeout;
        let mut last_cleanup = Instant::now();
        let mut cmd_closed = false;

        while !self.shutdown.is_shutdown() {
            select! {
                _ = self.shutdown.wait() => break,
                cmd = self.cmd_rx.recv(), if !cmd_closed => match cmd {
                    Some(RouterCommand::DumpRoutes) => self.core.print_routing_table(),
                    None => cmd_closed = true,
                },
                res = self.tun.recv(&mut tun_buf) => match res {
                    Ok(n) if n > 0 => {
                        let local = self.core.local_peer.clone();
                        self.core.handle_frame(&local, &mut tun_buf[..n]);
                    }
                    Ok(_) => {}
                    Err(e) => error!("failed to read from tun device: {e}"),
                },
                res = self.udp4.recv_from(&mut udp4_buf) => {
                    Self::handle_udp(&mut self.core, res, &mut udp4_buf);
                }
                res = self.udp6.recv_from(&mut udp6_buf) => {
                    Self::handle_udp(&mut self.core, res, &mut udp6_buf);
                }
                // Bounded idle time, so cleanup runs on a quiet mesh too.
                _ = sleep(idle_timeout(timeout)) => {}
            }

            if last_cleanup.elapsed() >= timeout / 4 {
                self.core.cleanup().await;
                last_cleanup = Instant::now();
            }
        }

        info!("disconnecting from peers");
        self.core.send_connmgmt_msg(prn::PRIO_CONNMGMT_CLOSE);
        // Dropping the core closes the egress queues; the sender drains
        // them (including the close broadcast) and exits.
    }

    fn handle_udp(
        core: &mut Core,
        res: std::io::Result<(usize, std::net::SocketAddr)>,
        buf: &mut [u8],
    ) {
        match res {
            Ok((0, _)) => {}
            Ok((n, saddr)) => {
                let (peer, inserted) = core.registry.lookup_or_insert(saddr);
                if inserted {
                    debug!("new peer {peer}");
                }
                core.handle_frame(&peer, &mut buf[..n]);
            }
            Err(e) => error!("udp recv failed: {e}"),
        }
    }
}

/// A random wait between 0.75 and 1.5 times the remote timeout.
fn idle_timeout(remote_timeout: Duration) -> Duration {
    let max_ms = (remote_timeout.as_millis() as u64).saturating_mul(3) / 2;
    let jitter = if max_ms >= 2 {
        rand::thread_rng().gen_range(0..max_ms / 2)
    } else {
        0
    };
    Duration::from_millis(max_ms - jitter)
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, net::SocketAddr, sync::Arc};

    use bytes::BytesMut;
    use tokio::time::{advance, Duration};

    use super::Core;
    use crate::{
        config::Config,
        data::{internet_checksum, recompute_ipv4_checksum},
        hooks::Hooks,
        inner_addr::{InnerAddr, LocalAddr},
        peer::Peer,
        prn::{
            self, Record, CMD_CONNMGMT, CMD_PROBE, CMD_ROUTEMOD, PRIO_CONNMGMT_CLOSE,
            PRIO_PROBE_REQ, PRIO_PROBE_REQ_ECHO, PRIO_PROBE_RESP, PRIO_ROUTE_DELETE,
        },
        sender::{Sender, SenderQueues},
    };

    fn v4(s: &str) -> InnerAddr {
        InnerAddr::from(s.parse::<std::net::Ipv4Addr>().unwrap())
    }

    /// A core with 10.0.0.100/24 as local address and an empty registry.
    fn test_core() -> (Core, SenderQueues) {
        let cfg = Config::parse("Izprd0\nA10.0.0.100/24\n").unwrap();
        let locals = vec![LocalAddr::new("10.0.0.100".parse().unwrap(), 24).unwrap()];
        let (sender, queues) = Sender::new();
        let core = Core::new(
            Arc::new(cfg),
            locals,
            HashSet::new(),
            HashSet::new(),
            sender,
            Hooks::default(),
        );
        (core, queues)
    }

    fn add_peer(core: &mut Core, saddr: &str) -> Peer {
        let (peer, _) = core
            .registry
            .lookup_or_insert(saddr.parse::<SocketAddr>().unwrap());
        peer
    }

    fn ipv4_packet(src: &str, dst: &str, ttl: u8, proto: u8, id: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; 20];
        buf[0] = 0x45;
        let total = (20 + payload.len()) as u16;
        buf[2..4].copy_from_slice(&total.to_be_bytes());
        buf[4..6].copy_from_slice(&id.to_be_bytes());
        buf[8] = ttl;
        buf[9] = proto;
        buf[12..16].copy_from_slice(&src.parse::<std::net::Ipv4Addr>().unwrap().octets());
        buf[16..20].copy_from_slice(&dst.parse::<std::net::Ipv4Addr>().unwrap().octets());
        recompute_ipv4_checksum(&mut buf);
        buf.extend_from_slice(payload);
        buf
    }

    fn icmp_echo(echo_type: u8, id: u16, seq: u16) -> Vec<u8> {
        let mut icmp = vec![echo_type, 0, 0, 0, 0, 0, 0, 0];
        icmp[4..6].copy_from_slice(&id.to_be_bytes());
        icmp[6..8].copy_from_slice(&seq.to_be_bytes());
        let sum = internet_checksum(&icmp);
        icmp[2..4].copy_from_slice(&sum.to_be_bytes());
        icmp
    }

    fn prn_frame(records: &[Record]) -> BytesMut {
        let mut frame = prn::new_datagram();
        for rec in records {
            rec.write_bytes(&mut frame);
        }
        frame
    }

    #[tokio::test]
    async fn ttl_exceeded_mid_transit() {
        let (mut core, mut queues) = test_core();
        let p = add_peer(&mut core, "192.0.2.1:45940");

        let mut packet = ipv4_packet("10.0.0.1", "10.0.0.9", 1, 17, 42, &[0xde, 0xad]);
        core.handle_frame(&p.clone(), &mut packet);

        // The packet itself was dropped, only the ICMP reply leaves.
        let frame = queues.data_rx.try_recv().expect("one icmp message queued");
        assert!(queues.data_rx.try_recv().is_err());
        assert_eq!(frame.dests, vec![p]);

        let buf = &frame.buffer;
        assert_eq!(buf[0] >> 4, 4);
        assert_eq!(buf[9], 1, "protocol is icmp");
        assert_eq!(&buf[12..16], &[10, 0, 0, 100], "sourced from our local");
        assert_eq!(&buf[16..20], &[10, 0, 0, 1], "sent back to the origin");
        assert_eq!(buf[20], 11, "time exceeded");
        assert_eq!(buf[21], 0, "ttl in transit");
        // The embedded original header has its checksum recomputed.
        let embedded = &buf[28..48];
        assert_eq!(&embedded[12..16], &[10, 0, 0, 1]);
        assert_eq!(&embedded[16..20], &[10, 0, 0, 9]);
        assert_eq!(internet_checksum(embedded), 0);

        // No route was learned for the dropped packet.
        assert!(core.routes.route(&v4("10.0.0.1")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn echo_learns_route_and_reply_attributes_rtt() {
        let (mut core, mut queues) = test_core();
        let p = add_peer(&mut core, "192.0.2.1:45940");
        let q = add_peer(&mut core, "192.0.2.2:45940");

        // An echo request from a remote host towards us learns the route.
        let mut packet = ipv4_packet("10.0.0.2", "10.0.0.100", 64, 1, 7, &icmp_echo(8, 7, 1));
        core.handle_frame(&p.clone(), &mut packet);

        let entry = core.routes.route(&v4("10.0.0.2")).expect("route learned");
        let router = entry.primary().unwrap();
        assert_eq!(router.peer, p);
        assert_eq!(router.hops, 255 - 64);
        // Delivered locally: empty destination list.
        let frame = queues.data_rx.try_recv().unwrap();
        assert!(frame.dests.is_empty());

        // Now ping outwards: the request leaves through the primary (P)...
        let mut packet = ipv4_packet("10.0.0.100", "10.0.0.2", 64, 1, 8, &icmp_echo(8, 9, 1));
        let local = core.local_peer.clone();
        core.handle_frame(&local, &mut packet);
        let frame = queues.data_rx.try_recv().unwrap();
        assert_eq!(frame.dests, vec![p.clone()]);

        advance(Duration::from_millis(12)).await;

        // ...and the reply comes back through Q, which gets the latency
        // attributed.
        let mut packet = ipv4_packet("10.0.0.2", "10.0.0.100", 63, 1, 9, &icmp_echo(0, 9, 1));
        core.handle_frame(&q.clone(), &mut packet);

        let entry = core.routes.route(&v4("10.0.0.2")).unwrap();
        let via_q = entry
            .routers()
            .find(|r| r.peer == q)
            .expect("reply carrier learned as router");
        assert_eq!(via_q.hops, 255 - 63 + 1);
        assert!((via_q.latency - 12.0).abs() < 0.5);
        // P's entry is untouched by the reply.
        let via_p = entry.routers().find(|r| r.peer == p).unwrap();
        assert_eq!(via_p.latency, 0.0);
    }

    #[tokio::test]
    async fn looped_packet_is_dropped() {
        let (mut core, mut queues) = test_core();
        let p = add_peer(&mut core, "192.0.2.1:45940");

        // Our own address as source, arriving from a peer.
        let mut packet = ipv4_packet("10.0.0.100", "10.0.0.9", 64, 17, 1, &[]);
        core.handle_frame(&p.clone(), &mut packet);

        assert!(queues.data_rx.try_recv().is_err());
        assert!(queues.prn_rx.try_recv().is_err());
        assert_eq!(core.routes.iter().count(), 0);
    }

    #[tokio::test]
    async fn routemod_delete_sends_correction_echo() {
        let (mut core, mut queues) = test_core();
        let p = add_peer(&mut core, "192.0.2.1:45940");
        let q = add_peer(&mut core, "192.0.2.2:45940");
        let r = add_peer(&mut core, "192.0.2.3:45940");

        // Two routes to 10.0.0.3: primary via P (2 hops), then Q (3 hops).
        core.routes.add_router(v4("10.0.0.3"), &q, 3);
        core.routes.add_router(v4("10.0.0.3"), &p, 2);
        assert_eq!(
            core.routes.route(&v4("10.0.0.3")).unwrap().primary().unwrap().peer,
            p
        );

        let frame = prn_frame(&[Record {
            cmd: CMD_ROUTEMOD,
            prio: PRIO_ROUTE_DELETE,
            route: v4("10.0.0.3"),
        }]);
        assert!(core.handle_prn_frame(&p, &frame));

        // The secondary took over...
        let entry = core.routes.route(&v4("10.0.0.3")).unwrap();
        assert_eq!(entry.primary().unwrap().peer, q);
        assert_eq!(entry.routers().count(), 1);

        // ...and the correction echo goes to everyone but the new next hop.
        let msg = queues.prn_rx.try_recv().expect("correction echo queued");
        assert_eq!(
            msg.record,
            Record {
                cmd: CMD_ROUTEMOD,
                prio: 3,
                route: v4("10.0.0.3"),
            }
        );
        assert!(msg.dests.contains(&p));
        assert!(msg.dests.contains(&r));
        assert!(!msg.dests.contains(&q));
        assert_eq!(msg.confirmed, Some(p));
    }

    #[tokio::test]
    async fn connmgmt_close_drops_peer_routes() {
        let (mut core, _queues) = test_core();
        let p = add_peer(&mut core, "192.0.2.1:45940");
        let q = add_peer(&mut core, "192.0.2.2:45940");

        core.routes.add_router(v4("10.0.1.1"), &p, 1);
        core.routes.add_router(v4("10.0.1.2"), &q, 3);
        core.routes.add_router(v4("10.0.1.2"), &p, 2);
        // The entry keyed by the closing peer's inner address.
        core.routes.add_router(v4("10.0.9.9"), &q, 4);

        let frame = prn_frame(&[Record {
            cmd: CMD_CONNMGMT,
            prio: PRIO_CONNMGMT_CLOSE,
            route: v4("10.0.9.9"),
        }]);
        assert!(core.handle_prn_frame(&p, &frame));

        assert!(core.routes.route(&v4("10.0.1.1")).is_none());
        let entry = core.routes.route(&v4("10.0.1.2")).expect("q's route stays");
        assert_eq!(entry.primary().unwrap().peer, q);
        // The entry keyed by the close payload is emptied as well.
        assert!(core.routes.route(&v4("10.0.9.9")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_before_delete() {
        let (mut core, mut queues) = test_core();
        let p = add_peer(&mut core, "192.0.2.1:45940");
        let r = add_peer(&mut core, "192.0.2.3:45940");

        core.routes.add_router(v4("10.0.0.4"), &p, 2);

        // First cleanup announces the fresh route; drain it.
        core.cleanup().await;
        let announce = queues.prn_rx.try_recv().unwrap();
        assert_eq!(announce.record.cmd, CMD_ROUTEMOD);
        assert_eq!(announce.record.prio, 2);

        // The primary ages past the timeout, the peers stay alive.
        advance(Duration::from_secs(301)).await;
        p.mark_seen();
        r.mark_seen();
        core.cleanup().await;

        // Not deleted yet, probed instead.
        assert!(core.routes.route(&v4("10.0.0.4")).is_some());
        let to_routers = queues.prn_rx.try_recv().expect("probe to routers");
        assert_eq!(to_routers.record.cmd, CMD_PROBE);
        assert_eq!(to_routers.record.prio, PRIO_PROBE_REQ_ECHO);
        assert_eq!(to_routers.dests, vec![p.clone()]);
        let to_others = queues.prn_rx.try_recv().expect("probe to non-routers");
        assert_eq!(to_others.record.prio, PRIO_PROBE_REQ);
        assert_eq!(to_others.dests, vec![r.clone()]);
        assert!(queues.prn_rx.try_recv().is_err());

        // No response within another timeout: dropped and retracted.
        advance(Duration::from_secs(300)).await;
        p.mark_seen();
        r.mark_seen();
        core.cleanup().await;

        assert!(core.routes.route(&v4("10.0.0.4")).is_none());
        let retract = queues.prn_rx.try_recv().expect("route retraction");
        assert_eq!(
            retract.record,
            Record {
                cmd: CMD_ROUTEMOD,
                prio: PRIO_ROUTE_DELETE,
                route: v4("10.0.0.4"),
            }
        );
    }

    #[tokio::test]
    async fn probe_req_answered_from_table() {
        let (mut core, mut queues) = test_core();
        let p = add_peer(&mut core, "192.0.2.1:45940");
        let q = add_peer(&mut core, "192.0.2.2:45940");

        core.routes.add_router(v4("10.0.0.5"), &q, 4);

        // P asks: do you have a route to 10.0.0.5?
        let frame = prn_frame(&[Record {
            cmd: CMD_PROBE,
            prio: PRIO_PROBE_REQ,
            route: v4("10.0.0.5"),
        }]);
        assert!(core.handle_prn_frame(&p, &frame));

        let msg = queues.prn_rx.try_recv().expect("probe answer");
        assert_eq!(
            msg.record,
            Record {
                cmd: CMD_ROUTEMOD,
                prio: 4,
                route: v4("10.0.0.5"),
            }
        );
        assert_eq!(msg.dests, vec![p.clone()]);

        // Q asks about the same route, but it runs through Q itself: a
        // plain request gets no answer at all.
        let frame = prn_frame(&[Record {
            cmd: CMD_PROBE,
            prio: PRIO_PROBE_REQ,
            route: v4("10.0.0.5"),
        }]);
        assert!(core.handle_prn_frame(&q, &frame));
        assert!(queues.prn_rx.try_recv().is_err());

        // With echo expected, the same situation yields a dead-end reply.
        let frame = prn_frame(&[Record {
            cmd: CMD_PROBE,
            prio: PRIO_PROBE_REQ_ECHO,
            route: v4("10.0.0.5"),
        }]);
        assert!(core.handle_prn_frame(&q, &frame));
        let msg = queues.prn_rx.try_recv().expect("dead end reply");
        assert_eq!(msg.record.cmd, CMD_PROBE);
        assert_eq!(msg.record.prio, PRIO_PROBE_RESP);
        assert_eq!(msg.dests, vec![q]);
    }

    #[tokio::test]
    async fn unknown_destination_floods_with_split_horizon() {
        let (mut core, mut queues) = test_core();
        let p = add_peer(&mut core, "192.0.2.1:45940");
        let q = add_peer(&mut core, "192.0.2.2:45940");

        let mut packet = ipv4_packet("10.0.0.7", "10.0.0.8", 64, 17, 5, &[1, 2, 3]);
        core.handle_frame(&p.clone(), &mut packet);

        let frame = queues.data_rx.try_recv().unwrap();
        // Flooded to everyone except the origin.
        assert_eq!(frame.dests, vec![q]);
        // The source route was still learned.
        assert_eq!(
            core.routes.route(&v4("10.0.0.7")).unwrap().primary().unwrap().peer,
            p
        );
    }

    #[tokio::test]
    async fn unreachable_destination_generates_icmp() {
        let (mut core, mut queues) = test_core();
        // Single peer: flooding minus the origin leaves nobody.
        let p = add_peer(&mut core, "192.0.2.1:45940");

        // Destination inside our local subnet: host unreachable.
        let mut packet = ipv4_packet("10.0.0.7", "10.0.0.9", 64, 17, 5, &[]);
        core.handle_frame(&p.clone(), &mut packet);
        let frame = queues.data_rx.try_recv().expect("icmp unreachable");
        assert_eq!(frame.buffer[20], 3);
        assert_eq!(frame.buffer[21], 1, "host unreachable");

        // Destination outside of it: net unreachable.
        let mut packet = ipv4_packet("10.0.0.7", "172.16.3.4", 64, 17, 6, &[]);
        core.handle_frame(&p.clone(), &mut packet);
        let frame = queues.data_rx.try_recv().expect("icmp unreachable");
        assert_eq!(frame.buffer[20], 3);
        assert_eq!(frame.buffer[21], 0, "net unreachable");
    }

    #[tokio::test]
    async fn icmp_error_taints_embedded_destination() {
        let (mut core, mut queues) = test_core();
        let p = add_peer(&mut core, "192.0.2.1:45940");
        let q = add_peer(&mut core, "192.0.2.2:45940");

        // Route to the original destination via P and Q, and a direct route
        // for the error's destination so it resolves to a single target.
        core.routes.add_router(v4("10.0.0.30"), &q, 3);
        core.routes.add_router(v4("10.0.0.30"), &p, 2);
        core.routes.add_router(v4("10.0.0.1"), &q, 1);

        // P reports: time exceeded for a packet 10.0.0.1 -> 10.0.0.30.
        let embedded = ipv4_packet("10.0.0.1", "10.0.0.30", 1, 17, 9, &[]);
        let mut icmp = vec![11, 0, 0, 0, 0, 0, 0, 0];
        icmp.extend_from_slice(&embedded);
        let sum = internet_checksum(&icmp);
        icmp[2..4].copy_from_slice(&sum.to_be_bytes());
        let mut packet = ipv4_packet("10.0.0.20", "10.0.0.1", 64, 1, 10, &icmp);

        core.handle_frame(&p.clone(), &mut packet);

        // P is no longer a router for the embedded destination.
        let entry = core.routes.route(&v4("10.0.0.30")).unwrap();
        assert_eq!(entry.routers().count(), 1);
        assert_eq!(entry.primary().unwrap().peer, q);
        // A route remained, so the error itself was swallowed.
        assert!(queues.data_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn blocked_broadcast_is_not_flooded() {
        let (mut core, mut queues) = test_core();
        core.blocked_broadcasts.insert(v4("10.0.0.255"));
        let p = add_peer(&mut core, "192.0.2.1:45940");
        let _q = add_peer(&mut core, "192.0.2.2:45940");

        let mut packet = ipv4_packet("10.0.0.7", "10.0.0.255", 64, 17, 5, &[]);
        core.handle_frame(&p.clone(), &mut packet);

        // Not flooded; the unreachable handling still answers the sender.
        let frame = queues.data_rx.try_recv().expect("icmp unreachable");
        assert_eq!(frame.dests, vec![p]);
        assert_eq!(frame.buffer[20], 3);
        assert!(queues.data_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn direct_broadcast_is_delivered_locally() {
        let (mut core, mut queues) = test_core();
        let p = add_peer(&mut core, "192.0.2.1:45940");
        let _q = add_peer(&mut core, "192.0.2.2:45940");

        let mut packet = ipv4_packet("10.0.0.7", "255.255.255.255", 64, 17, 5, &[]);
        core.handle_frame(&p.clone(), &mut packet);

        let frame = queues.data_rx.try_recv().unwrap();
        assert!(frame.dests.is_empty(), "delivered through the tun device");
    }
}
