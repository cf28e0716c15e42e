//! TUN device setup (Linux).
//!
//! The tunnel interface is created with an MTU that leaves room for the
//! outer IPv4 + UDP encapsulation. Configured addresses are assigned over
//! netlink; the kernel installs the matching interface routes on its own.

use std::{io, sync::Arc};

use futures::TryStreamExt;
use tokio_tun::{Tun, TunBuilder};
use tracing::info;

use crate::config::AddrStmt;

/// 1500 minus the outer IPv4 + UDP headers.
const LINK_MTU: i32 = 1472;

/// Bring up the tunnel interface `name` with the configured addresses
/// assigned. Any failure here is a startup error; nothing is retried.
pub async fn setup(
    name: &str,
    addrs: &[AddrStmt],
) -> Result<Arc<Tun>, Box<dyn std::error::Error>> {
    let tun = TunBuilder::new()
        .name(name)
        .mtu(LINK_MTU)
        .up()
        .try_build_mq(1)
        .map_err(|e| {
            format!("tun device '{name}' refused to come up (name taken, or not enough privileges?): {e}")
        })?
        .pop()
        .expect("a tun interface built with one queue yields one handle");

    // One short-lived netlink session, only to put the addresses on the
    // fresh interface.
    let (conn, handle, _) = rtnetlink::new_connection()?;
    let netlink_conn = tokio::spawn(conn);

    let link = handle
        .link()
        .get()
        .match_name(name.to_string())
        .execute()
        .try_next()
        .await?
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("interface '{name}' vanished right after creation"),
            )
        })?;

    for addr in addrs {
        handle
            .address()
            .add(link.header.index, addr.addr, addr.prefix_len)
            .execute()
            .await
            .map_err(|e| {
                format!(
                    "assigning {}/{} to '{name}' failed: {e}",
                    addr.addr, addr.prefix_len
                )
            })?;
    }

    netlink_conn.abort();

    info!("tunnel interface '{name}' is up");

    Ok(Arc::new(tun))
}
