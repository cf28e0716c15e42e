//! The ingress packet pipeline.
//!
//! Every datagram, read from the TUN device or received from a peer, runs
//! through [`Core::handle_frame`]: PRN frames are split off by their leading
//! zero byte, IP packets are verified, TTL-checked, used for route learning
//! and finally resolved to a set of egress targets. ICMP gets special
//! treatment twice: error messages taint the route towards the original
//! destination, and echo exchanges feed the ping cache.
//!
//! Header fields are read at their fixed offsets; only ICMP error messages
//! are *built* with etherparse, which takes care of the checksums.

use etherparse::{
    icmpv4, icmpv6, Icmpv4Header, Icmpv4Type, Icmpv6Header, Icmpv6Type, IpNumber, Ipv4Header,
    Ipv6FlowLabel, Ipv6Header,
};
use tracing::{error, info, trace, warn};

use crate::{
    inner_addr::{InnerAddr, IAFA_AT_INET, IAFA_AT_INET6},
    peer::Peer,
    ping_cache::EchoFingerprint,
    router::Core,
    sender::SendData,
};

/// The initial TTL of packets originated here, and the reference point for
/// hop count estimates.
pub const MAX_TTL: u8 = 255;

/// Size of an IPv4 header without options.
const IPV4_HEADER_SIZE: usize = 20;
/// Size of the fixed IPv6 header.
const IPV6_HEADER_SIZE: usize = 40;
/// Size of an ICMP / ICMPv6 header.
const ICMP_HEADER_SIZE: usize = 8;

/// RFC 1071 internet checksum over `data`, ready to be stored. Verification:
/// the checksum over a block with a valid stored checksum is 0.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Recompute the header checksum of an IPv4 packet in place. Anything that
/// is not a plausible IPv4 packet is left untouched.
pub fn recompute_ipv4_checksum(buf: &mut [u8]) {
    if buf.len() < IPV4_HEADER_SIZE || buf[0] >> 4 != 4 {
        return;
    }
    let ihl = usize::from(buf[0] & 0x0f) * 4;
    if ihl < IPV4_HEADER_SIZE || buf.len() < ihl {
        return;
    }
    buf[10] = 0;
    buf[11] = 0;
    let sum = internet_checksum(&buf[..ihl]);
    buf[10..12].copy_from_slice(&sum.to_be_bytes());
}

/// Per-IP-version handler record. The pipeline picks one by the version
/// nibble instead of dispatching dynamically.
struct IpVersionOps {
    header_len: usize,
    verify: fn(&Core, &Peer, &[u8]) -> Option<usize>,
    route: fn(&mut Core, &Peer, &mut [u8]),
}

fn ip_version_ops(version: u8) -> Option<&'static IpVersionOps> {
    static V4: IpVersionOps = IpVersionOps {
        header_len: IPV4_HEADER_SIZE,
        verify: verify_ipv4_packet,
        route: route_ipv4_packet,
    };
    static V6: IpVersionOps = IpVersionOps {
        header_len: IPV6_HEADER_SIZE,
        verify: verify_ipv6_packet,
        route: route_ipv6_packet,
    };
    match version {
        4 => Some(&V4),
        6 => Some(&V6),
        _ => None,
    }
}

/// The ICMP message kinds generated by the pipeline.
#[derive(Debug, Clone, Copy)]
enum IcmpKind {
    TtlExceeded,
    Unreach,
    UnreachNet,
}

impl Core {
    /// Entry point for every received datagram or TUN read. `srca` is the
    /// matched registry peer, or the local sentinel for TUN reads.
    pub(crate) fn handle_frame(&mut self, srca: &Peer, buffer: &mut [u8]) {
        srca.mark_seen();
        if buffer.len() < 2 {
            error!("received runt packet ({} bytes) from {srca}", buffer.len());
            return;
        }

        let version = buffer[0] >> 4;
        if version == 0 {
            if !self.handle_prn_frame(srca, buffer) {
                error!("got invalid PRN packet from {srca}");
            }
            return;
        }

        let Some(ops) = ip_version_ops(version) else {
            error!("received packet with unknown payload type (ip_ver = {version}) from {srca}");
            return;
        };
        if ops.header_len > buffer.len() {
            error!(
                "received invalid ip packet (too small, size = {}) from {srca}",
                buffer.len()
            );
            return;
        }
        if let Some(effective_len) = (ops.verify)(self, srca, buffer) {
            (ops.route)(self, srca, &mut buffer[..effective_len]);
        }
    }

    /// Is `addr` terminated here? Exported locals count unless
    /// `with_exported` is false.
    pub(crate) fn is_local_addr(&self, addr: &InnerAddr, with_exported: bool) -> bool {
        self.locals.iter().any(|l| l.addr() == *addr)
            || (with_exported && self.exported_locals.contains(addr))
    }

    /// The first local address of the given wire family.
    pub(crate) fn local_addr_of_family(&self, afa_type: u16) -> Option<&crate::inner_addr::LocalAddr> {
        self.locals.iter().find(|l| l.afa_type() == afa_type)
    }

    /// Learn the source route, then resolve the egress target set for a
    /// packet towards `dst`.
    ///
    /// `ttl` is the TTL after any decrement; `destination_is_local` marks a
    /// packet arriving from outside for one of our own addresses.
    fn resolve_route(
        &mut self,
        source_peer: &Peer,
        src: InnerAddr,
        dst: InnerAddr,
        ttl: u8,
        destination_is_local: bool,
    ) -> Vec<Peer> {
        let hops = if self.is_local_addr(&src, false) {
            0
        } else {
            MAX_TTL - ttl
        };
        if self.routes.add_router(src, source_peer, hops) {
            info!("add route to {src} via {source_peer}");
        }

        if destination_is_local || (!source_peer.is_local() && dst.is_direct_broadcast()) {
            return vec![self.local_peer.clone()];
        }

        if let Some(route) = self.routes.route_mut(&dst) {
            // A route pointing back where the packet came from is useless
            // and gets pruned on the spot.
            let mut got_invalid_route = route.del_router(source_peer);
            let primary_is_source = route
                .primary()
                .map(|p| p.peer == *source_peer || p.peer.same_addr(source_peer))
                .unwrap_or(false);
            if primary_is_source {
                route.del_primary_router();
                got_invalid_route = true;
            }
            if got_invalid_route {
                info!("delete route to {dst} via {source_peer} (invalid)");
            }
            if !route.is_empty() {
                if self.cfg.max_near_rtt != 0 {
                    route.swap_near_routers(f64::from(self.cfg.max_near_rtt));
                }
                return vec![route
                    .primary()
                    .expect("route entry was just checked to be non-empty")
                    .peer
                    .clone()];
            }
        }

        // Suppress the broadcast fallback (and its log spam) for
        // destinations the operator blocked.
        if self.blocked_broadcasts.contains(&dst) {
            return Vec::new();
        }

        info!("no known route to {dst}");
        let mut targets = self.registry.snapshot();
        targets.retain(|p| *p != *source_peer && !p.same_addr(source_peer));
        if targets.is_empty() {
            info!("drop packet (no destination) from {source_peer}");
        }
        targets
    }

    /// React to an unresolvable destination: tell the source, and demote any
    /// routing entry that claimed to know better.
    fn handle_unreachable(&mut self, dst: InnerAddr, buffer: &[u8], srca: &Peer, afa_type: u16) {
        if let Some(local) = self.local_addr_of_family(afa_type) {
            let kind = if local.covers(dst.into()) {
                IcmpKind::Unreach
            } else {
                IcmpKind::UnreachNet
            };
            match afa_type {
                IAFA_AT_INET => self.send_icmp4(kind, buffer, srca),
                _ => self.send_icmp6(kind, buffer, srca),
            }
        }

        // Drop the routing table entry, if there is any, to stop loops.
        if let Some(route) = self.routes.route_mut(&dst) {
            if let Some(primary) = route.primary() {
                info!("delete route to {dst} via {} (invalid)", primary.peer);
            }
            route.del_primary_router();
        }
    }

    /// Build and queue an ICMPv4 message towards the origin of `orig`.
    fn send_icmp4(&mut self, kind: IcmpKind, orig: &[u8], srca: &Peer) {
        let icmp_type = match kind {
            IcmpKind::TtlExceeded => {
                Icmpv4Type::TimeExceeded(icmpv4::TimeExceededCode::TtlExceededInTransit)
            }
            IcmpKind::Unreach => {
                Icmpv4Type::DestinationUnreachable(icmpv4::DestUnreachableHeader::Host)
            }
            IcmpKind::UnreachNet => {
                Icmpv4Type::DestinationUnreachable(icmpv4::DestUnreachableHeader::Network)
            }
        };

        let src = match self.local_addr_of_family(IAFA_AT_INET).map(|l| l.addr()) {
            Some(InnerAddr::V4(ip)) => ip.octets(),
            _ => [0; 4],
        };
        let dst: [u8; 4] = orig[12..16].try_into().expect("slice is 4 bytes long");

        // Payload: the original header with its checksum made whole again,
        // plus the first 8 bytes after it.
        let ihl = usize::from(orig[0] & 0x0f) * 4;
        let mut payload = orig[..IPV4_HEADER_SIZE.min(orig.len())].to_vec();
        recompute_ipv4_checksum(&mut payload);
        if let Some(rest) = orig.get(ihl..) {
            payload.extend_from_slice(&rest[..rest.len().min(8)]);
        }

        let icmp = Icmpv4Header::with_checksum(icmp_type, &payload);
        let mut ip = match Ipv4Header::new(
            (icmp.header_len() + payload.len()) as u16,
            MAX_TTL,
            IpNumber::ICMP,
            src,
            dst,
        ) {
            Ok(ip) => ip,
            Err(e) => {
                error!("failed to construct icmp message: {e}");
                return;
            }
        };
        ip.identification = rand::random();
        ip.header_checksum = ip.calc_header_checksum();

        let mut buffer = Vec::with_capacity(IPV4_HEADER_SIZE + icmp.header_len() + payload.len());
        buffer.extend_from_slice(&ip.to_bytes());
        buffer.extend_from_slice(&icmp.to_bytes());
        buffer.extend_from_slice(&payload);

        self.sender.enqueue_data(SendData {
            buffer,
            dests: vec![srca.clone()],
            df: false,
            tos: 0,
        });
    }

    /// Build and queue an ICMPv6 message towards the origin of `orig`.
    fn send_icmp6(&mut self, kind: IcmpKind, orig: &[u8], srca: &Peer) {
        let icmp_type = match kind {
            IcmpKind::TtlExceeded => {
                Icmpv6Type::TimeExceeded(icmpv6::TimeExceededCode::HopLimitExceeded)
            }
            IcmpKind::Unreach => {
                Icmpv6Type::DestinationUnreachable(icmpv6::DestUnreachableCode::NoRoute)
            }
            IcmpKind::UnreachNet => {
                Icmpv6Type::DestinationUnreachable(icmpv6::DestUnreachableCode::Address)
            }
        };

        let src = match self.local_addr_of_family(IAFA_AT_INET6).map(|l| l.addr()) {
            Some(InnerAddr::V6(ip)) => ip.octets(),
            _ => [0; 16],
        };
        let dst: [u8; 16] = orig[8..24].try_into().expect("slice is 16 bytes long");

        let mut payload = orig[..IPV6_HEADER_SIZE.min(orig.len())].to_vec();
        if let Some(rest) = orig.get(IPV6_HEADER_SIZE..) {
            payload.extend_from_slice(&rest[..rest.len().min(8)]);
        }

        let icmp = match Icmpv6Header::with_checksum(icmp_type, src, dst, &payload) {
            Ok(icmp) => icmp,
            Err(e) => {
                error!("failed to construct icmp6 message: {e}");
                return;
            }
        };
        let ip = Ipv6Header {
            traffic_class: 0,
            flow_label: Ipv6FlowLabel::ZERO,
            payload_length: (icmp.header_len() + payload.len()) as u16,
            next_header: IpNumber::IPV6_ICMP,
            hop_limit: MAX_TTL,
            source: src,
            destination: dst,
        };

        let mut buffer = Vec::with_capacity(IPV6_HEADER_SIZE + icmp.header_len() + payload.len());
        buffer.extend_from_slice(&ip.to_bytes());
        buffer.extend_from_slice(&icmp.to_bytes());
        buffer.extend_from_slice(&payload);

        // IPv6 never fragments in the network.
        self.sender.enqueue_data(SendData {
            buffer,
            dests: vec![srca.clone()],
            df: true,
            tos: 0,
        });
    }
}

/// Verify an IPv4 packet, returning its effective length.
///
/// Packets from the host get their header checksum verified; peers are
/// trusted not to recompute it in transit. A read longer than the packet is
/// tolerated and truncated, a shorter one is an error. Non-local packets
/// carrying one of our own addresses as source looped back and are dropped.
fn verify_ipv4_packet(core: &Core, srca: &Peer, buffer: &[u8]) -> Option<usize> {
    let nread = buffer.len();
    let ihl = usize::from(buffer[0] & 0x0f) * 4;
    let srca_is_local = srca.is_local();

    if ihl < IPV4_HEADER_SIZE || ihl > nread {
        error!("invalid ipv4 packet (bad header length {ihl}) from {srca}");
        return None;
    }
    if srca_is_local {
        let dsum = internet_checksum(&buffer[..ihl]);
        if dsum != 0 {
            error!("invalid ipv4 packet (wrong checksum, d = {dsum}) from local");
            return None;
        }
    }

    let ip_len = usize::from(u16::from_be_bytes([buffer[2], buffer[3]]));
    let packet_id = u16::from_be_bytes([buffer[4], buffer[5]]);
    let src = InnerAddr::from(<[u8; 4]>::try_from(&buffer[12..16]).expect("4 byte slice"));

    if ip_len < ihl || nread < ip_len {
        error!("can't read whole ipv4 packet (too small, size = {nread} of {ip_len}) from {srca}");
        None
    } else if !srca_is_local && core.is_local_addr(&src, true) {
        warn!("drop packet {packet_id} (looped with local as source)");
        None
    } else {
        if nread != ip_len {
            warn!("ipv4 packet size differ (size read {nread} / expected {ip_len}) from {srca}");
        }
        Some(ip_len)
    }
}

/// Verify an IPv6 packet, returning its effective length. Same contract as
/// [`verify_ipv4_packet`], minus the checksum (IPv6 has none).
fn verify_ipv6_packet(core: &Core, srca: &Peer, buffer: &[u8]) -> Option<usize> {
    let nread = buffer.len();
    let total_len = usize::from(u16::from_be_bytes([buffer[4], buffer[5]])) + IPV6_HEADER_SIZE;
    let src = InnerAddr::from(<[u8; 16]>::try_from(&buffer[8..24]).expect("16 byte slice"));

    if nread < total_len {
        error!(
            "can't read whole ipv6 packet (too small, size = {nread} of {total_len}) from {srca}"
        );
        None
    } else if !srca.is_local() && core.is_local_addr(&src, true) {
        warn!("drop ipv6 packet (looped with local as source)");
        None
    } else {
        if nread != total_len {
            warn!("ipv6 packet size differ (size read {nread} / expected {total_len}) from {srca}");
        }
        Some(total_len)
    }
}

/// Route an IPv4 packet: TTL handling, route learning, target resolution,
/// ICMP side effects, egress.
fn route_ipv4_packet(core: &mut Core, srca: &Peer, buffer: &mut [u8]) {
    let buflen = buffer.len();
    let ihl = usize::from(buffer[0] & 0x0f) * 4;
    let packet_id = u16::from_be_bytes([buffer[4], buffer[5]]);
    let is_icmp = buffer[9] == 1;

    if is_icmp && ihl + ICMP_HEADER_SIZE > buflen {
        info!("drop packet {packet_id} (too small icmp packet; size = {buflen}) from {srca}");
        return;
    }

    // Echo style messages never count as errors: an echo can establish a
    // route without interfering with application protocols. `taints_route`
    // marks the error types which invalidate the route to the embedded
    // original destination.
    let mut taints_route = false;
    let is_icmp_errmsg = is_icmp
        && match buffer[ihl] {
            // echo reply/request, router advert/select, timestamp both ways
            0 | 8 | 9 | 10 | 13 | 14 => false,
            // time exceeded in transit
            11 => {
                if buffer[ihl + 1] == 0 {
                    taints_route = true;
                }
                true
            }
            // destination unreachable: net or host
            3 => {
                if matches!(buffer[ihl + 1], 0 | 1) {
                    taints_route = true;
                }
                true
            }
            _ => true,
        };

    let src = InnerAddr::from(<[u8; 4]>::try_from(&buffer[12..16]).expect("4 byte slice"));
    let dst_ip: [u8; 4] = buffer[16..20].try_into().expect("4 byte slice");
    let dst = InnerAddr::from(dst_ip);

    // Multicast is not forwarded.
    if dst_ip[0] >> 4 == 14 {
        return;
    }

    let source_is_local = srca.is_local();
    let iam_ep = source_is_local || core.is_local_addr(&dst, true);
    let ttl = buffer[8];

    if ttl == 0 || (!iam_ep && ttl == 1) {
        info!("drop packet {packet_id} (too low ttl = {ttl}) from {srca}");
        if !is_icmp_errmsg {
            core.send_icmp4(IcmpKind::TtlExceeded, buffer, srca);
        }
        return;
    }

    if !iam_ep {
        buffer[8] -= 1;
    }
    let ttl = buffer[8];

    // The checksum is left zeroed in transit; it is recomputed when the
    // packet finally leaves towards the host.
    buffer[10] = 0;
    buffer[11] = 0;

    let targets = core.resolve_route(srca, src, dst, ttl, !source_is_local && iam_ep);

    if targets.is_empty() {
        if !is_icmp_errmsg {
            core.handle_unreachable(dst, buffer, srca, IAFA_AT_INET);
        }
        return;
    }

    if is_icmp {
        if is_icmp_errmsg {
            let embedded = ihl + ICMP_HEADER_SIZE;
            if taints_route && targets.len() == 1 && embedded + IPV4_HEADER_SIZE <= buflen {
                // The embedded original header names the destination whose
                // route went sour.
                let orig_dst = InnerAddr::from(
                    <[u8; 4]>::try_from(&buffer[embedded + 16..embedded + 20])
                        .expect("4 byte slice"),
                );
                if let Some(route) = core.routes.route_mut(&orig_dst) {
                    if route.del_router(srca) {
                        info!("delete route to {orig_dst} via {srca} (unreachable)");
                    }
                    if !route.is_empty() {
                        // Another path exists; swallow the error.
                        return;
                    }
                }
            }
        } else if targets.len() == 1 {
            let fp = EchoFingerprint {
                src,
                dst,
                id: u16::from_be_bytes([buffer[ihl + 4], buffer[ihl + 5]]),
                seq: u16::from_be_bytes([buffer[ihl + 6], buffer[ihl + 7]]),
            };
            match buffer[ihl] {
                // echo request: remember where it left through
                8 => core.ping_cache.init(fp, targets[0].clone()),
                // echo reply: attribute the round trip
                0 => {
                    if let Some(m) = core.ping_cache.match_reply(&fp, srca, ttl) {
                        if let Some(route) = core.routes.route_mut(&fp.src) {
                            trace!(
                                "echo rtt {:.2}ms for {} via {}",
                                m.rtt_ms,
                                fp.src,
                                m.router
                            );
                            route.update_router(&m.router, m.hops, m.rtt_ms);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    let df = buffer[6] & 0x40 != 0;
    let tos = buffer[1];
    core.sender.enqueue_data(SendData {
        buffer: buffer.to_vec(),
        dests: targets,
        df,
        tos,
    });
}

/// Route an IPv6 packet. Mirrors [`route_ipv4_packet`]; extension headers
/// are not parsed, so ICMPv6 recognition relies on the fixed header's next
/// header field.
fn route_ipv6_packet(core: &mut Core, srca: &Peer, buffer: &mut [u8]) {
    let buflen = buffer.len();
    let is_icmp = buffer[6] == 0x3a;

    if is_icmp && IPV6_HEADER_SIZE + ICMP_HEADER_SIZE > buflen {
        info!("drop packet (too small icmp6 packet; size = {buflen}) from {srca}");
        return;
    }

    let is_icmp_errmsg = is_icmp && buffer[IPV6_HEADER_SIZE] & 0x80 == 0;
    // destination unreachable or time exceeded
    let taints_route = is_icmp_errmsg && matches!(buffer[IPV6_HEADER_SIZE], 1 | 3);

    let src = InnerAddr::from(<[u8; 16]>::try_from(&buffer[8..24]).expect("16 byte slice"));
    let dst_ip: [u8; 16] = buffer[24..40].try_into().expect("16 byte slice");
    let dst = InnerAddr::from(dst_ip);

    if dst_ip[0] == 0xff {
        return;
    }

    let source_is_local = srca.is_local();
    let iam_ep = source_is_local || core.is_local_addr(&dst, true);
    let hops = buffer[7];

    if hops == 0 || (!iam_ep && hops == 1) {
        info!("drop packet (too low hop limit = {hops}) from {srca}");
        if !is_icmp_errmsg {
            core.send_icmp6(IcmpKind::TtlExceeded, buffer, srca);
        }
        return;
    }

    if !iam_ep {
        buffer[7] -= 1;
    }
    let hops = buffer[7];

    let targets = core.resolve_route(srca, src, dst, hops, !source_is_local && iam_ep);

    if targets.is_empty() {
        if !is_icmp_errmsg {
            core.handle_unreachable(dst, buffer, srca, IAFA_AT_INET6);
        }
        return;
    }

    if is_icmp {
        if is_icmp_errmsg {
            let embedded = IPV6_HEADER_SIZE + ICMP_HEADER_SIZE;
            if taints_route && targets.len() == 1 && embedded + IPV6_HEADER_SIZE <= buflen {
                let orig_dst = InnerAddr::from(
                    <[u8; 16]>::try_from(&buffer[embedded + 24..embedded + 40])
                        .expect("16 byte slice"),
                );
                if let Some(route) = core.routes.route_mut(&orig_dst) {
                    if route.del_router(srca) {
                        info!("delete route to {orig_dst} via {srca} (unreachable)");
                    }
                    if !route.is_empty() {
                        return;
                    }
                }
            }
        } else if targets.len() == 1 {
            let fp = EchoFingerprint {
                src,
                dst,
                id: u16::from_be_bytes([buffer[44], buffer[45]]),
                seq: u16::from_be_bytes([buffer[46], buffer[47]]),
            };
            match buffer[IPV6_HEADER_SIZE] {
                // echo request / echo reply
                0x80 => core.ping_cache.init(fp, targets[0].clone()),
                0x81 => {
                    if let Some(m) = core.ping_cache.match_reply(&fp, srca, hops) {
                        if let Some(route) = core.routes.route_mut(&fp.src) {
                            route.update_router(&m.router, m.hops, m.rtt_ms);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    // The traffic class hides in the top 8 bits after the version nibble.
    let tos = (buffer[0] & 0x0f) << 4 | buffer[1] >> 4;
    core.sender.enqueue_data(SendData {
        buffer: buffer.to_vec(),
        dests: targets,
        df: true,
        tos,
    });
}
