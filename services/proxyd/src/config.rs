//! Proxy configuration (env-driven).

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ezproxy_wire::Network;

/// Runtime configuration for the proxy daemon.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the primary listeners bind.
    pub listen_addr: SocketAddr,

    /// Upstream server address traffic is proxied to.
    pub server_addr: SocketAddr,

    /// Which primary listeners to start.
    pub networks: Vec<Network>,

    /// Optional bind address for the UDP-over-TCP bridge listener.
    pub udp_over_tcp_addr: Option<SocketAddr>,

    /// Default decision window offered to filtering operators.
    pub filter_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr: SocketAddr = std::env::var("EZPROXY_LISTEN_ADDR")
            .context("Missing listen address. Set EZPROXY_LISTEN_ADDR (host:port).")?
            .parse()
            .context("EZPROXY_LISTEN_ADDR must be a socket address (host:port).")?;

        let server_addr: SocketAddr = std::env::var("EZPROXY_SERVER_ADDR")
            .context("Missing server address. Set EZPROXY_SERVER_ADDR (host:port).")?
            .parse()
            .context("EZPROXY_SERVER_ADDR must be a socket address (host:port).")?;

        let networks = parse_networks(
            &std::env::var("EZPROXY_NETWORKS").unwrap_or_else(|_| "tcp".to_string()),
        )?;

        let udp_over_tcp_addr = std::env::var("EZPROXY_UDP_OVER_TCP_ADDR")
            .ok()
            .map(|v| {
                v.parse()
                    .context("EZPROXY_UDP_OVER_TCP_ADDR must be a socket address (host:port).")
            })
            .transpose()?;

        let filter_timeout_ms: u64 = std::env::var("EZPROXY_FILTER_TIMEOUT_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("EZPROXY_FILTER_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(2000);
        let filter_timeout = Duration::from_millis(filter_timeout_ms.max(50));

        let log_level = std::env::var("EZPROXY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            server_addr,
            networks,
            udp_over_tcp_addr,
            filter_timeout,
            log_level,
        })
    }
}

/// Parse a comma-separated network list, e.g. `"tcp,udp"`.
fn parse_networks(value: &str) -> Result<Vec<Network>> {
    let mut networks = Vec::new();
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let network: Network = part
            .parse()
            .ok()
            .with_context(|| format!("EZPROXY_NETWORKS entry '{part}' must be 'tcp' or 'udp'."))?;
        if networks.contains(&network) {
            bail!("EZPROXY_NETWORKS lists '{network}' twice.");
        }
        networks.push(network);
    }
    if networks.is_empty() {
        bail!("EZPROXY_NETWORKS must list at least one of 'tcp', 'udp'.");
    }
    Ok(networks)
}
