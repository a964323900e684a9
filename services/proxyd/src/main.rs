//! EzProxy daemon.
//!
//! This binary:
//! - Loads env-driven configuration
//! - Starts a proxy fleet with the configured TCP/UDP listeners
//! - Optionally registers the UDP-over-TCP bridge through the mpx registry
//! - Runs until a shutdown signal or a fleet-fatal failure

use std::sync::Arc;

use anyhow::{anyhow, Result};
use ezproxy_proxyd::config::Config;
use ezproxy_proxyd::{
    version_string, MpxProto, ProxyError, ProxyListener, ProxySpawner, TcpListener, UdpListener,
    UdpOverTcpListener, PROXY_VERSION, UDP_OVER_TCP_MPX,
};
use ezproxy_wire::Network;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to EZPROXY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        version = PROXY_VERSION,
        version_str = %version_string(PROXY_VERSION),
        "Starting ezproxy"
    );
    info!(
        listen_addr = %config.listen_addr,
        server_addr = %config.server_addr,
        networks = ?config.networks,
        udp_over_tcp_addr = ?config.udp_over_tcp_addr,
        filter_timeout_ms = config.filter_timeout.as_millis() as u64,
        "Configuration loaded"
    );

    let mut listeners: Vec<Arc<dyn ProxyListener>> = Vec::new();
    for network in &config.networks {
        match network {
            Network::Tcp => listeners.push(Arc::new(TcpListener)),
            Network::Udp => listeners.push(Arc::new(UdpListener)),
        }
    }

    let spawner = ProxySpawner::new(config.server_addr, config.listen_addr, listeners)?;
    spawner.set_error_sink(Box::new(|err, pc| match pc {
        Some(pc) => error!(id = pc.id(), network = %pc.network(), error = %err, "Proxy error"),
        None => error!(error = %err, "Spawner error"),
    }));

    if let Some(addr) = config.udp_over_tcp_addr {
        spawner.register_mpx_listener(
            UDP_OVER_TCP_MPX,
            MpxProto::Tcp,
            addr,
            Arc::new(UdpOverTcpListener),
        )?;
    }

    let scope = spawner.scope();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, closing fleet");
            spawner.close().await?;
            Ok(())
        }
        _ = scope.cancelled() => {
            match scope.cause() {
                Some(cause) if ProxyError::cause_is_graceful(&cause) => {
                    info!(cause = %cause, "Fleet closed");
                    Ok(())
                }
                Some(cause) => {
                    error!(cause = %cause, "Fleet failed");
                    Err(anyhow!("fleet failed: {cause}"))
                }
                None => {
                    info!("Fleet cancelled");
                    Ok(())
                }
            }
        }
    }
}
