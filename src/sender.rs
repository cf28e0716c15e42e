//! The egress worker.
//!
//! All outbound traffic funnels through a single background task: data
//! frames towards peers or the TUN device, and PRN records which are batched
//! per destination into as few datagrams as possible. The worker owns the
//! outer-header socket options (don't-fragment, TOS/traffic class) and only
//! touches them when a frame needs different values than the last one.

use std::{
    collections::{HashMap, HashSet},
    os::fd::AsRawFd,
    sync::Arc,
};

use bytes::BytesMut;
use socket2::{SockAddr, SockRef};
use tokio::{net::UdpSocket, select, sync::mpsc};
use tokio_tun::Tun;
use tracing::{debug, error, trace};

use crate::{data::recompute_ipv4_checksum, peer::Peer, prn};

/// A data frame waiting for egress.
#[derive(Debug)]
pub struct SendData {
    /// The raw inner packet.
    pub buffer: Vec<u8>,
    /// Destination peers. An empty list after sanitization means local
    /// delivery through the TUN device.
    pub dests: Vec<Peer>,
    /// Outer don't-fragment bit, copied from the inner IPv4 header or forced
    /// for IPv6.
    pub df: bool,
    /// Outer TOS / traffic class, copied from the inner header.
    pub tos: u8,
}

/// A PRN record waiting for egress.
#[derive(Debug)]
pub struct PrnSendData {
    pub record: prn::Record,
    pub dests: Vec<Peer>,
    /// When set, the next datagram towards this peer confirms forward
    /// progress to the OS neighbour cache (MSG_CONFIRM).
    pub confirmed: Option<Peer>,
}

/// Producer half of the egress queues.
#[derive(Debug, Clone)]
pub struct Sender {
    data_tx: mpsc::UnboundedSender<SendData>,
    prn_tx: mpsc::UnboundedSender<PrnSendData>,
}

/// Consumer half, turned into the worker task by [`SenderWorker::run`].
pub struct SenderQueues {
    pub(crate) data_rx: mpsc::UnboundedReceiver<SendData>,
    pub(crate) prn_rx: mpsc::UnboundedReceiver<PrnSendData>,
}

impl Sender {
    pub fn new() -> (Self, SenderQueues) {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (prn_tx, prn_rx) = mpsc::unbounded_channel();
        (
            Sender { data_tx, prn_tx },
            SenderQueues { data_rx, prn_rx },
        )
    }

    /// Queue a data frame. A frame headed for the local sentinel has its
    /// destination list cleared, which the worker reads as a TUN write; the
    /// sentinel never shares a frame with remote destinations.
    pub fn enqueue_data(&self, mut dat: SendData) {
        if dat.dests.is_empty() {
            return;
        }
        if dat.dests[0].is_local() {
            dat.dests.clear();
        }
        let _ = self.data_tx.send(dat);
    }

    /// Queue a PRN record. Local sentinels are stripped from the
    /// destination list; a record without remaining destinations is dropped.
    pub fn enqueue_prn(&self, mut dat: PrnSendData) {
        dat.dests.retain(|p| !p.is_local());
        if dat.dests.is_empty() {
            return;
        }
        let _ = self.prn_tx.send(dat);
    }
}

/// The egress worker state.
pub struct SenderWorker {
    queues: SenderQueues,
    udp4: Arc<UdpSocket>,
    udp6: Arc<UdpSocket>,
    tun: Option<Arc<Tun>>,
    /// Cached outer don't-fragment state of the IPv4 socket.
    df: bool,
    /// Cached outer TOS / traffic class of both sockets.
    tos: u8,
    /// Peers whose next datagram is sent with MSG_CONFIRM.
    confirmed: HashSet<Peer>,
}

impl SenderWorker {
    pub fn new(
        queues: SenderQueues,
        udp4: Arc<UdpSocket>,
        udp6: Arc<UdpSocket>,
        tun: Option<Arc<Tun>>,
    ) -> Self {
        Self {
            queues,
            udp4,
            udp6,
            tun,
            df: false,
            tos: 0,
            confirmed: HashSet::new(),
        }
    }

    /// Drain the queues until every producer is gone, then return. Send
    /// failures are logged and the affected frame is dropped; the worker
    /// never aborts on them.
    pub async fn run(mut self) {
        self.set_df(false);
        self.set_tos(0);

        let mut data_closed = false;
        let mut prn_closed = false;
        let mut tasks = Vec::new();
        let mut prn_msgs = Vec::new();

        loop {
            select! {
                item = self.queues.data_rx.recv(), if !data_closed => match item {
                    Some(dat) => tasks.push(dat),
                    None => data_closed = true,
                },
                item = self.queues.prn_rx.recv(), if !prn_closed => match item {
                    Some(dat) => prn_msgs.push(dat),
                    None => prn_closed = true,
                },
            }
            // Take whatever else is already queued in one go.
            while let Ok(dat) = self.queues.data_rx.try_recv() {
                tasks.push(dat);
            }
            while let Ok(dat) = self.queues.prn_rx.try_recv() {
                prn_msgs.push(dat);
            }

            for dat in tasks.drain(..) {
                self.send_data(dat).await;
            }
            if !prn_msgs.is_empty() {
                self.send_prn_batch(&mut prn_msgs);
            }

            if data_closed && prn_closed {
                debug!("sender queues closed, egress worker exiting");
                return;
            }
        }
    }

    async fn send_data(&mut self, dat: SendData) {
        if dat.dests.is_empty() {
            // Local delivery. The inner IPv4 checksum was zeroed on ingress
            // and is only made whole again when the packet leaves towards
            // the host.
            let mut buffer = dat.buffer;
            recompute_ipv4_checksum(&mut buffer);
            match &self.tun {
                Some(tun) => {
                    if let Err(e) = tun.send(&buffer).await {
                        error!("failed to write packet to tun device: {e}");
                    }
                }
                None => error!("local delivery without a tun device, dropping packet"),
            }
            return;
        }

        if self.tos != dat.tos {
            self.set_tos(dat.tos);
        }
        if self.df != dat.df {
            self.set_df(dat.df);
        }

        for dest in &dat.dests {
            self.sendto_peer(dest, &dat.buffer);
        }
    }

    fn send_prn_batch(&mut self, prn_msgs: &mut Vec<PrnSendData>) {
        // PRN frames travel without DF and with default TOS.
        if self.df {
            self.set_df(false);
        }
        if self.tos != 0 {
            self.set_tos(0);
        }

        if let [dat] = &prn_msgs[..] {
            // Single record, skip the grouping pass.
            let mut buf = prn::new_datagram();
            dat.record.write_bytes(&mut buf);
            if let Some(confirmed) = &dat.confirmed {
                self.confirmed.insert(confirmed.clone());
            }
            for dest in &dat.dests {
                self.sendto_peer(dest, &buf);
            }
            prn_msgs.clear();
            return;
        }

        let mut per_dest: HashMap<Peer, Vec<BytesMut>> = HashMap::new();
        for dat in prn_msgs.drain(..) {
            if let Some(confirmed) = &dat.confirmed {
                self.confirmed.insert(confirmed.clone());
            }
            for dest in dat.dests {
                prn::append_record(per_dest.entry(dest).or_default(), &dat.record);
            }
        }

        for (dest, datagrams) in per_dest {
            for dgram in datagrams {
                self.sendto_peer(&dest, &dgram);
            }
        }
    }

    /// Fire one datagram at a peer, best effort. The socket is non-blocking;
    /// a full send buffer drops the datagram like any other error.
    fn sendto_peer(&mut self, peer: &Peer, buf: &[u8]) {
        let confirm = self.confirmed.remove(peer);
        let flags = if confirm { libc::MSG_CONFIRM } else { 0 };

        let Some(saddr) = peer.socket_addr() else {
            error!("destination peer is local, dropping {} bytes", buf.len());
            return;
        };
        let sock = if saddr.is_ipv4() {
            &self.udp4
        } else {
            &self.udp6
        };

        if let Err(e) =
            SockRef::from(sock.as_ref()).send_to_with_flags(buf, &SockAddr::from(saddr), flags)
        {
            error!("sendto {peer} failed: {e}");
        } else {
            trace!(len = buf.len(), confirm, "sent datagram to {peer}");
        }
    }

    /// Toggle the don't-fragment bit of outgoing IPv4 datagrams through path
    /// MTU discovery. IPv6 never fragments in the network.
    fn set_df(&mut self, df: bool) {
        let val: libc::c_int = if df {
            libc::IP_PMTUDISC_WANT
        } else {
            libc::IP_PMTUDISC_DONT
        };
        let res = unsafe {
            libc::setsockopt(
                self.udp4.as_raw_fd(),
                libc::IPPROTO_IP,
                libc::IP_MTU_DISCOVER,
                &val as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if res < 0 {
            error!(
                "setsockopt(IP_MTU_DISCOVER) failed: {}",
                std::io::Error::last_os_error()
            );
        } else {
            self.df = df;
        }
    }

    fn set_tos(&mut self, tos: u8) {
        self.tos = tos;
        if let Err(e) = SockRef::from(self.udp4.as_ref()).set_tos(tos as u32) {
            error!("setsockopt(IP_TOS) failed: {e}");
        }
        if let Err(e) = SockRef::from(self.udp6.as_ref()).set_tclass_v6(tos as u32) {
            error!("setsockopt(IPV6_TCLASS) failed: {e}");
        }
    }
}
