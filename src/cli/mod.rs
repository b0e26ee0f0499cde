//! CLI entrypoint for synping.
//!
//! Parses arguments, picks the local interface address, resolves the remote
//! host, opens the raw sockets, and runs a session until Ctrl-C or the probe
//! count is reached. Requires CAP_NET_RAW (sudo) on Linux.

pub mod output;

use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::session::{Session, SessionConfig, SessionError};
use crate::timing::SessionSummary;
use crate::ListenError;

pub use output::{format_result, format_summary};

// ─────────────────────────────────────────────────────────────────────────────
// CLI definition
// ─────────────────────────────────────────────────────────────────────────────

/// synping: measure TCP handshake latency with raw SYN probes.
#[derive(Parser, Debug)]
#[command(name = "synping", version, about)]
#[command(
    long_about = "synping sends one raw TCP SYN per interval to a remote host and times the \
    SYN-ACK or RST that comes back. The handshake is never completed. Each probe goes to the \
    next destination port. Requires CAP_NET_RAW (sudo) on Linux."
)]
pub struct Cli {
    /// Remote host name or IPv4 address
    pub host: String,

    /// Network interface whose IPv4 address is used as the source
    /// (first non-loopback interface with an IPv4 address if omitted)
    #[arg(short = 'I', long, env = "SYNPING_INTERFACE")]
    pub interface: Option<String>,

    /// Destination port of the first probe
    #[arg(short, long, default_value_t = 80)]
    pub port: u16,

    /// Probe interval in milliseconds
    #[arg(short, long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
    pub interval: u64,

    /// Per-probe timeout in milliseconds (0 reports loss only on exit)
    #[arg(short, long, default_value_t = 3000)]
    pub timeout: u64,

    /// Stop after this many probes
    #[arg(short, long)]
    pub count: Option<u64>,

    /// Output format
    #[arg(long, default_value = "pretty", value_enum)]
    pub output: OutputFmt,
}

/// Output format argument.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFmt {
    Pretty,
    Json,
}

impl Cli {
    /// Session parameters for the resolved addresses.
    pub fn session_config(&self, local: Ipv4Addr, remote: Ipv4Addr) -> SessionConfig {
        SessionConfig {
            first_port: self.port,
            interval: Duration::from_millis(self.interval),
            timeout: (self.timeout > 0).then(|| Duration::from_millis(self.timeout)),
            count: self.count,
            ..SessionConfig::new(local, remote)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Address selection
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no usable interface found (need a non-loopback interface with an IPv4 address; set --interface)")]
    NoInterface,

    #[error("interface '{0}' not found")]
    InterfaceNotFound(String),

    #[error("interface '{0}' has no IPv4 address")]
    NoIpv4Address(String),

    #[error("IPv6 is not supported: {0}")]
    Ipv6Unsupported(String),

    #[error("cannot resolve '{host}': {reason}")]
    Resolve { host: String, reason: String },

    #[error("cannot enumerate interfaces: {0}")]
    Interfaces(String),
}

/// One address assigned to a local interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddr {
    pub name: String,
    pub addr: Option<IpAddr>,
    pub loopback: bool,
}

/// Enumerate local interface addresses.
#[cfg(unix)]
pub fn list_interfaces() -> Result<Vec<InterfaceAddr>, ConfigError> {
    use nix::ifaddrs::getifaddrs;
    use nix::net::if_::InterfaceFlags;
    use std::net::{SocketAddrV4, SocketAddrV6};

    let addrs = getifaddrs().map_err(|e| ConfigError::Interfaces(e.to_string()))?;
    Ok(addrs
        .map(|ifa| {
            let addr = ifa.address.as_ref().and_then(|a| {
                if let Some(sin) = a.as_sockaddr_in() {
                    Some(IpAddr::V4(*SocketAddrV4::from(*sin).ip()))
                } else {
                    a.as_sockaddr_in6()
                        .map(|sin6| IpAddr::V6(*SocketAddrV6::from(*sin6).ip()))
                }
            });
            InterfaceAddr {
                name: ifa.interface_name,
                addr,
                loopback: ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK),
            }
        })
        .collect())
}

#[cfg(not(unix))]
pub fn list_interfaces() -> Result<Vec<InterfaceAddr>, ConfigError> {
    Err(ConfigError::Interfaces(
        "interface enumeration requires a Unix platform".to_string(),
    ))
}

/// Pick the local source address.
///
/// With `requested`, the first IPv4 address on that interface. Otherwise the
/// first IPv4 address on a non-loopback interface, in enumeration order.
pub fn choose_interface(
    interfaces: &[InterfaceAddr],
    requested: Option<&str>,
) -> Result<(String, Ipv4Addr), ConfigError> {
    let first_v4 = |ifa: &InterfaceAddr| match ifa.addr {
        Some(IpAddr::V4(ip)) => Some((ifa.name.clone(), ip)),
        _ => None,
    };

    match requested {
        Some(name) => {
            let mut named = interfaces.iter().filter(|i| i.name == name).peekable();
            if named.peek().is_none() {
                return Err(ConfigError::InterfaceNotFound(name.to_string()));
            }
            named
                .find_map(first_v4)
                .ok_or_else(|| ConfigError::NoIpv4Address(name.to_string()))
        }
        None => interfaces
            .iter()
            .filter(|i| !i.loopback && i.name != "lo")
            .find_map(first_v4)
            .ok_or(ConfigError::NoInterface),
    }
}

/// Resolve a hostname or IP string to an `Ipv4Addr`.
///
/// IPv6 literals fail fast; a name with only IPv6 records fails too.
pub fn resolve_remote(host: &str) -> Result<Ipv4Addr, ConfigError> {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => return Ok(ip),
        Ok(IpAddr::V6(_)) => return Err(ConfigError::Ipv6Unsupported(host.to_string())),
        Err(_) => {}
    }

    let addrs: Vec<IpAddr> = (host, 0)
        .to_socket_addrs()
        .map_err(|e| ConfigError::Resolve {
            host: host.to_string(),
            reason: e.to_string(),
        })?
        .map(|a| a.ip())
        .collect();

    if let Some(ip) = addrs.iter().find_map(|a| match a {
        IpAddr::V4(ip) => Some(*ip),
        IpAddr::V6(_) => None,
    }) {
        return Ok(ip);
    }
    if addrs.is_empty() {
        Err(ConfigError::Resolve {
            host: host.to_string(),
            reason: "no addresses found".to_string(),
        })
    } else {
        Err(ConfigError::Ipv6Unsupported(format!("{host} has only IPv6 addresses")))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Ping command
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Listen(#[from] ListenError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("raw sockets require Linux")]
    Unsupported,
}

/// Run a probing session, printing every result and then the summary to
/// stdout.
///
/// Returns the summary once the session stops. Setup errors (address
/// selection, opening the listening socket) are returned before any probe
/// is sent.
pub async fn run_ping(cli: &Cli) -> Result<SessionSummary, RunError> {
    let interfaces = list_interfaces()?;
    let (iface, local) = choose_interface(&interfaces, cli.interface.as_deref())?;
    let remote = resolve_remote(&cli.host)?;
    let config = cli.session_config(local, remote);

    tracing::info!(interface = %iface, %local, %remote, "resolved addresses");

    #[cfg(not(target_os = "linux"))]
    {
        let _ = config;
        return Err(RunError::Unsupported);
    }

    #[cfg(target_os = "linux")]
    {
        use crate::probe::transport::{RawListenSocket, RawTransport};

        let source = RawListenSocket::bind(local)?;
        let fmt = cli.output;
        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "cannot listen for Ctrl-C, running until count");
                std::future::pending::<()>().await;
            }
        };

        let summary = Session::new(config)
            .run(Box::new(RawTransport::new()), source, shutdown, |result| {
                println!("{}", format_result(result, fmt));
            })
            .await?;
        println!("{}", format_summary(&summary, remote, fmt));
        Ok(summary)
    }
}
