//! zprd is a userspace peer to peer IP tunnelling daemon.
//!
//! Each node owns a virtual L3 interface and UDP sockets towards its peers.
//! Packets read from the interface are forwarded to peers and vice versa
//! according to a routing table learned from traffic and from the in-band
//! peer routing notification protocol (PRN), which propagates route
//! additions, withdrawals and probes through the mesh.

use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::{net::UdpSocket, sync::mpsc, task::JoinHandle};
use tracing::{error, info};

pub use config::{Config, ConfigError};

use inner_addr::LocalAddr;
use router::{Core, Router, RouterCommand, ShutdownSignal};
use sender::{Sender, SenderWorker};

pub mod config;
mod data;
mod hooks;
mod inner_addr;
mod peer;
mod peer_manager;
mod ping_cache;
mod prn;
mod router;
mod routing_table;
mod sender;
mod tun;

/// A running zprd node.
///
/// Construction sets up the TUN device, binds the UDP sockets, connects the
/// configured remotes and spawns the router loop and the egress worker.
pub struct Node {
    cmd_tx: mpsc::UnboundedSender<RouterCommand>,
    shutdown: Arc<ShutdownSignal>,
    router_handle: JoinHandle<()>,
    sender_handle: JoinHandle<()>,
}

impl Node {
    /// Set up a new `Node` with the provided [`Config`].
    pub async fn new(config: Config) -> Result<Self, Box<dyn std::error::Error>> {
        let cfg = Arc::new(config);

        let tun = tun::setup(&cfg.iface, &cfg.addrs).await?;
        hooks::run_setup_hooks(&cfg.setup_hooks, &cfg.iface).await?;

        let mut locals = Vec::with_capacity(cfg.addrs.len());
        for addr in &cfg.addrs {
            locals.push(LocalAddr::new(addr.addr, addr.prefix_len)?);
        }
        let exported_locals = peer_manager::resolve_inner_addrs(
            &cfg.exported_addrs,
            cfg.preferred_af,
            "exported local",
        )
        .await;
        let blocked_broadcasts = peer_manager::resolve_inner_addrs(
            &cfg.blocked_broadcasts,
            cfg.preferred_af,
            "blocked broadcast destination",
        )
        .await;

        let udp4 = Arc::new(bind_udp(cfg.data_port, false)?);
        let udp6 = Arc::new(bind_udp(cfg.data_port, true)?);

        let (sender, queues) = Sender::new();
        let sender_handle = tokio::spawn(
            SenderWorker::new(queues, udp4.clone(), udp6.clone(), Some(tun.clone())).run(),
        );

        let hooks = hooks::Hooks::new(cfg.route_hooks.clone());
        let mut core = Core::new(
            cfg.clone(),
            locals,
            exported_locals,
            blocked_broadcasts,
            sender,
            hooks,
        );

        let mut connected = 0;
        for (cent, name) in cfg.remotes.iter().enumerate() {
            if peer_manager::connect_to_server(
                &mut core.registry,
                name,
                cent,
                cfg.data_port,
                cfg.preferred_af,
            )
            .await
            {
                connected += 1;
            }
        }
        if connected == 0 && !cfg.remotes.is_empty() {
            return Err(io::Error::other("can't connect to any server").into());
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(ShutdownSignal::default());
        let router = Router::new(core, udp4, udp6, tun, cmd_rx, shutdown.clone());
        let router_handle = tokio::spawn(router.run());
        info!("started router");

        Ok(Node {
            cmd_tx,
            shutdown,
            router_handle,
            sender_handle,
        })
    }

    /// Ask the router to print its peer and routing tables to stdout.
    pub fn dump_routes(&self) {
        let _ = self.cmd_tx.send(RouterCommand::DumpRoutes);
    }

    /// Gracefully shut the node down: the router broadcasts a connection
    /// close to all peers and the egress worker drains its queues before
    /// both exit.
    pub async fn shutdown(self) {
        self.shutdown.shutdown();
        if let Err(e) = self.router_handle.await {
            error!("router task failed: {e}");
        }
        if let Err(e) = self.sender_handle.await {
            error!("sender task failed: {e}");
        }
    }
}

/// Bind a UDP socket on the catchall address of one family. The IPv6 socket
/// is restricted to its own family so both can share the port.
fn bind_udp(port: u16, v6: bool) -> io::Result<UdpSocket> {
    let domain = if v6 { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let addr: SocketAddr = if v6 {
        socket.set_only_v6(true)?;
        (Ipv6Addr::UNSPECIFIED, port).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, port).into()
    };
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}
