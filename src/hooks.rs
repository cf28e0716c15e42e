//! Shell hook invocation.
//!
//! Route hooks (`h` config entries) let the operator react to topology
//! changes: they are invoked with ` route {add|del} "<addr>"` when a routing
//! table entry is announced or retracted, and with ` peer {add|del}
//! "<sockaddr>"` when a peer enters or leaves the registry. Setup hooks (`H`
//! entries) run once at startup with ` dev <iface>` appended.

use std::{io, sync::Arc};

use tokio::process::Command;
use tracing::{error, info};

use crate::{inner_addr::InnerAddr, peer::Peer};

/// Runner for the configured route hooks.
#[derive(Debug, Clone, Default)]
pub struct Hooks {
    cmds: Arc<Vec<String>>,
}

impl Hooks {
    pub fn new(cmds: Vec<String>) -> Self {
        Self {
            cmds: Arc::new(cmds),
        }
    }

    /// Announce a route addition or deletion.
    pub fn route(&self, deleted: bool, dest: &InnerAddr) {
        if self.cmds.is_empty() {
            return;
        }
        let verb = if deleted { "del" } else { "add" };
        self.run(format!(" route {verb} \"{dest}\""));
    }

    /// Announce a peer addition or deletion.
    pub fn peer(&self, deleted: bool, peer: &Peer) {
        if self.cmds.is_empty() {
            return;
        }
        let Some(saddr) = peer.socket_addr() else {
            return;
        };
        let verb = if deleted { "del" } else { "add" };
        self.run(format!(" peer {verb} \"{saddr}\""));
    }

    fn run(&self, args: String) {
        for cmd in self.cmds.iter() {
            let cmdline = format!("{cmd}{args}");
            tokio::spawn(async move {
                match Command::new("sh").arg("-c").arg(&cmdline).status().await {
                    Ok(status) if status.success() => {}
                    Ok(status) => error!("route hook failed: {cmdline}; {status}"),
                    Err(e) => error!("route hook failed to spawn: {cmdline}; {e}"),
                }
            });
        }
    }
}

/// Run the startup hooks with ` dev <iface>` appended, in order. A failing
/// hook is a startup error.
pub async fn run_setup_hooks(hooks: &[String], iface: &str) -> io::Result<()> {
    for hook in hooks {
        let cmdline = format!("{hook} dev {iface}");
        info!("running setup hook: {cmdline}");
        let status = Command::new("sh").arg("-c").arg(&cmdline).status().await?;
        if !status.success() {
            return Err(io::Error::other(format!(
                "setup hook failed: {cmdline}; {status}"
            )));
        }
    }
    Ok(())
}
