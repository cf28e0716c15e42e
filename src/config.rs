//! The daemon configuration snapshot.
//!
//! The config file is line oriented: the first character of a line is the
//! statement tag, the remainder its value. Lines starting with `#` and empty
//! lines are skipped.
//!
//! | Tag | Meaning |
//! |-----|---------|
//! | `A` | local interface address `IP[/CIDR]` (repeatable) |
//! | `B` | blocked broadcast destination |
//! | `H` | shell hook run at startup, ` dev <iface>` appended |
//! | `h` | route hook, invoked on route/peer add and del |
//! | `I` | local interface name (required) |
//! | `L` | exported local address |
//! | `P` | UDP port |
//! | `R` | peer hostname (repeatable) |
//! | `T` | remote timeout in seconds |
//! | `U` | drop privileges to this user |
//! | `n` | max near-RTT in ms for router swapping, 0 disables |
//! | `^` | preferred outer address family |

use core::fmt;
use std::{io, net::IpAddr, path::Path, time::Duration};

use tracing::{error, warn};

/// UDP port used when no `P` statement is present.
pub const DEFAULT_DATA_PORT: u16 = 45940;
/// Remote timeout used when no `T` statement is present.
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(300);
/// Near-RTT bound in milliseconds used when no `n` statement is present.
pub const DEFAULT_MAX_NEAR_RTT: u32 = 5;

/// Preferred outer address family for hostname resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreferredAf {
    Inet,
    Inet6,
}

impl PreferredAf {
    /// Parse an `^` statement value. Unknown names log a warning and yield
    /// no preference.
    fn parse(value: &str) -> Option<Self> {
        match value.to_uppercase().as_str() {
            "INET" | "IPV4" => Some(PreferredAf::Inet),
            "INET6" | "IPV6" => Some(PreferredAf::Inet6),
            other => {
                warn!("unsupported address family preference: {other}");
                None
            }
        }
    }

    /// Whether the given address belongs to this family.
    pub fn matches(&self, addr: &IpAddr) -> bool {
        match self {
            PreferredAf::Inet => addr.is_ipv4(),
            PreferredAf::Inet6 => addr.is_ipv6(),
        }
    }
}

/// A local interface address statement, `IP[/CIDR]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrStmt {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

/// Immutable configuration snapshot consumed by the router core.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the TUN interface.
    pub iface: String,
    /// Addresses assigned to the interface.
    pub addrs: Vec<AddrStmt>,
    /// Destinations for which broadcast flooding is suppressed.
    pub blocked_broadcasts: Vec<String>,
    /// Shell hooks run once at startup after the interface is up.
    pub setup_hooks: Vec<String>,
    /// Shell hooks run on route and peer changes.
    pub route_hooks: Vec<String>,
    /// Addresses treated as locally terminated although not assigned.
    pub exported_addrs: Vec<String>,
    /// UDP port for both data and PRN traffic.
    pub data_port: u16,
    /// Configured peer hostnames.
    pub remotes: Vec<String>,
    /// Base timeout steering peer and route aging.
    pub remote_timeout: Duration,
    /// Drop privileges to this user after startup.
    pub run_as_user: Option<String>,
    /// Latency window in ms within which equal-hop routers are swapped;
    /// 0 disables swapping.
    pub max_near_rtt: u32,
    /// Preferred outer address family for resolving hostnames.
    pub preferred_af: Option<PreferredAf>,
}

/// Errors produced while loading the configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The file could not be read.
    Io(io::Error),
    /// No `I` statement was present.
    MissingInterface,
    /// A statement value did not parse.
    BadValue { tag: char, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "failed to read config file: {e}"),
            Self::MissingInterface => f.write_str("no interface specified"),
            Self::BadValue { tag, value } => {
                write!(f, "bad value for config statement '{tag}': \"{value}\"")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl Config {
    /// Read and parse the config file at `path`.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::parse(&raw)
    }

    /// Parse config file contents.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let mut iface = None;
        let mut addrs = Vec::new();
        let mut blocked_broadcasts = Vec::new();
        let mut setup_hooks = Vec::new();
        let mut route_hooks = Vec::new();
        let mut exported_addrs = Vec::new();
        let mut data_port = DEFAULT_DATA_PORT;
        let mut remotes = Vec::new();
        let mut remote_timeout = DEFAULT_REMOTE_TIMEOUT;
        let mut run_as_user = None;
        let mut max_near_rtt = DEFAULT_MAX_NEAR_RTT;
        let mut preferred_af = None;

        for line in raw.lines() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            let mut chars = line.chars();
            let tag = match chars.next() {
                None => continue,
                Some('#') => continue,
                Some(tag) => tag,
            };
            let value = chars.as_str();
            let bad_value = || ConfigError::BadValue {
                tag,
                value: value.to_string(),
            };

            match tag {
                'A' => addrs.push(parse_addr_stmt(value).ok_or_else(bad_value)?),
                'B' => blocked_broadcasts.push(value.to_string()),
                'H' => setup_hooks.push(value.to_string()),
                'h' => route_hooks.push(value.to_string()),
                'I' => iface = Some(value.to_string()),
                'L' => exported_addrs.push(value.to_string()),
                'P' => data_port = value.parse().map_err(|_| bad_value())?,
                'R' => remotes.push(value.to_string()),
                'T' => {
                    remote_timeout =
                        Duration::from_secs(value.parse().map_err(|_| bad_value())?)
                }
                'U' => run_as_user = Some(value.to_string()),
                'n' => max_near_rtt = value.parse().map_err(|_| bad_value())?,
                '^' => preferred_af = PreferredAf::parse(value),
                _ => error!("unknown stmt in config file: '{line}'"),
            }
        }

        Ok(Config {
            iface: iface.ok_or(ConfigError::MissingInterface)?,
            addrs,
            blocked_broadcasts,
            setup_hooks,
            route_hooks,
            exported_addrs,
            data_port,
            remotes,
            remote_timeout,
            run_as_user,
            max_near_rtt,
            preferred_af,
        })
    }
}

/// Parse an `A` statement: an address with an optional prefix length. The
/// prefix defaults to the full address width.
fn parse_addr_stmt(value: &str) -> Option<AddrStmt> {
    let (addr, prefix) = match value.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (value, None),
    };
    let addr: IpAddr = addr.parse().ok()?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    let prefix_len = match prefix {
        Some(p) => p.parse().ok().filter(|p| *p <= max)?,
        None => max,
    };
    Some(AddrStmt { addr, prefix_len })
}
