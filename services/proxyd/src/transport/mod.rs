//! Per-session transports.
//!
//! A transport owns the two legs of one proxied flow. After
//! [`Transport::init`] wires the event sink, its I/O tasks read from both
//! sides and emit a [`PacketEvent`] per read until the session's cancel
//! scope is done; the owning container decides whether each event is
//! forwarded. `send_to_client` / `send_to_server` perform one direct
//! write on the matching leg.

mod tcp;
mod udp;
mod udp_over_tcp;

pub use tcp::{TcpListener, TcpProxy};
pub use udp::{UdpListener, UdpProxy};
pub use udp_over_tcp::{UdpOverTcpListener, UdpOverTcpProxy, UDP_OVER_TCP_MPX};

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use ezproxy_scope::CancelScope;
use ezproxy_wire::Network;
use tokio::sync::mpsc;

use crate::error::Result;

/// Read buffer size for every transport leg.
pub(crate) const READ_BUF_SIZE: usize = 4096;

/// One read from either leg of a session.
#[derive(Debug, Clone)]
pub struct PacketEvent {
    /// True when the bytes travel client → server.
    pub serverbound: bool,
    pub source: SocketAddr,
    pub dest: SocketAddr,
    pub data: Vec<u8>,
}

/// A session transport. Implementations stay inert until `init`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Wire the event sink and launch the I/O tasks. Called exactly once,
    /// by the container that owns this transport; a second call fails.
    ///
    /// The tasks run until `scope` is done. EOF-like endings cancel the
    /// scope with [`crate::error::ProxyError::ProxyRetry`]; hard I/O
    /// failures cancel it with the wrapped cause.
    fn init(&self, events: mpsc::Sender<PacketEvent>, scope: CancelScope) -> Result<()>;

    /// Write `data` to the client leg.
    async fn send_to_client(&self, data: &[u8]) -> io::Result<()>;

    /// Write `data` to the server leg.
    async fn send_to_server(&self, data: &[u8]) -> io::Result<()>;

    /// Address of the connected client.
    fn client_addr(&self) -> SocketAddr;

    /// Which network this session runs on.
    fn network(&self) -> Network;
}
