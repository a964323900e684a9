//! UDP-over-TCP transport: a TCP client leg bridged to a UDP server leg.
//!
//! The client speaks TCP to us; whatever it sends is forwarded as UDP
//! datagrams to the server, and the server's datagrams are written back
//! down the TCP stream. The listener is registered through the multiplex
//! registry under [`UDP_OVER_TCP_MPX`].

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ezproxy_scope::CancelScope;
use ezproxy_wire::Network;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{PacketEvent, Transport, READ_BUF_SIZE};
use crate::error::{ProxyError, Result};
use crate::spawner::{ConnectionAdder, ProxyListener};

/// Registry name the UDP-over-TCP listener resolves its bind address by.
pub const UDP_OVER_TCP_MPX: &str = "udp-over-tcp";

const PARK_INTERVAL: Duration = Duration::from_secs(1);

/// One bridged flow: TCP on the client side, UDP on the server side.
pub struct UdpOverTcpProxy {
    client_addr: SocketAddr,
    server_addr: SocketAddr,
    tcp_read: Mutex<Option<OwnedReadHalf>>,
    tcp_write: tokio::sync::Mutex<OwnedWriteHalf>,
    udp: Arc<UdpSocket>,
}

impl UdpOverTcpProxy {
    /// `udp` must already be connected to `server_addr`.
    pub fn new(client: TcpStream, udp: Arc<UdpSocket>, server_addr: SocketAddr) -> io::Result<Self> {
        let client_addr = client.peer_addr()?;
        let (tcp_read, tcp_write) = client.into_split();
        Ok(Self {
            client_addr,
            server_addr,
            tcp_read: Mutex::new(Some(tcp_read)),
            tcp_write: tokio::sync::Mutex::new(tcp_write),
            udp,
        })
    }
}

/// TCP leg: client bytes become serverbound events.
async fn listen_client(
    mut leg: OwnedReadHalf,
    client: SocketAddr,
    server: SocketAddr,
    events: mpsc::Sender<PacketEvent>,
    scope: CancelScope,
) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let read = tokio::select! {
            _ = scope.cancelled() => return,
            read = leg.read(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                debug!(%client, "tcp client closed");
                scope.cancel_with(ProxyError::ProxyRetry);
                return;
            }
            Ok(n) => {
                let event = PacketEvent {
                    serverbound: true,
                    source: client,
                    dest: server,
                    data: buf[..n].to_vec(),
                };
                let sent = tokio::select! {
                    _ = scope.cancelled() => return,
                    sent = events.send(event) => sent,
                };
                if sent.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(%client, error = %e, "closing session on tcp read failure");
                scope.cancel_with(ProxyError::io("read from tcp client", e));
                return;
            }
        }
    }
}

/// UDP leg: datagrams from the server become clientbound events; any
/// other source is ignored.
async fn listen_server(
    udp: Arc<UdpSocket>,
    client: SocketAddr,
    server: SocketAddr,
    events: mpsc::Sender<PacketEvent>,
    scope: CancelScope,
) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let recv = tokio::select! {
            _ = scope.cancelled() => return,
            recv = udp.recv_from(&mut buf) => recv,
        };
        let (n, from) = match recv {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, "closing session on udp read failure");
                scope.cancel_with(ProxyError::io("read from udp server leg", e));
                return;
            }
        };
        if from != server {
            debug!(%from, "ignoring datagram from unknown sender");
            continue;
        }
        let event = PacketEvent {
            serverbound: false,
            source: server,
            dest: client,
            data: buf[..n].to_vec(),
        };
        let sent = tokio::select! {
            _ = scope.cancelled() => return,
            sent = events.send(event) => sent,
        };
        if sent.is_err() {
            return;
        }
    }
}

#[async_trait]
impl Transport for UdpOverTcpProxy {
    fn init(&self, events: mpsc::Sender<PacketEvent>, scope: CancelScope) -> Result<()> {
        let Some(tcp_read) = self.tcp_read.lock().unwrap().take() else {
            return Err(ProxyError::AlreadyInitialized);
        };
        tokio::spawn(listen_client(
            tcp_read,
            self.client_addr,
            self.server_addr,
            events.clone(),
            scope.clone(),
        ));
        tokio::spawn(listen_server(
            Arc::clone(&self.udp),
            self.client_addr,
            self.server_addr,
            events,
            scope,
        ));
        Ok(())
    }

    async fn send_to_client(&self, data: &[u8]) -> io::Result<()> {
        self.tcp_write.lock().await.write_all(data).await
    }

    async fn send_to_server(&self, data: &[u8]) -> io::Result<()> {
        self.udp.send(data).await.map(|_| ())
    }

    fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// The operator-visible side of the bridge is the TCP one.
    fn network(&self) -> Network {
        Network::Tcp
    }
}

/// Bind an unspecified local address in the same family as `peer`.
async fn udp_socket_towards(peer: SocketAddr) -> io::Result<UdpSocket> {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    let local = if peer.is_ipv4() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(peer).await?;
    Ok(socket)
}

/// TCP accept loop bridging to the UDP server, one flow at a time.
pub struct UdpOverTcpListener;

#[async_trait]
impl ProxyListener for UdpOverTcpListener {
    async fn run(&self, scope: CancelScope, adder: Arc<dyn ConnectionAdder>) {
        let bind_addr = match adder.mpx_addr(UDP_OVER_TCP_MPX) {
            Ok(addr) => addr,
            Err(e) => {
                warn!(error = %e, "udp-over-tcp listener has no registered address");
                scope.cancel_with(e);
                return;
            }
        };
        let listener = match TokioTcpListener::bind(bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                warn!(%bind_addr, error = %e, "failed to bind udp-over-tcp listener");
                scope.cancel_with(ProxyError::io("bind udp-over-tcp listener", e));
                return;
            }
        };
        info!(%bind_addr, "udp-over-tcp listener started");
        let server_addr = adder.server_addr();
        let mut active: Option<u32> = None;
        loop {
            if let Some(id) = active {
                let alive = adder
                    .get_proxy(id)
                    .map(|pc| pc.is_alive())
                    .unwrap_or(false);
                if alive {
                    tokio::select! {
                        _ = scope.cancelled() => return,
                        _ = sleep(PARK_INTERVAL) => {}
                    }
                    continue;
                }
                active = None;
            }
            let accepted = tokio::select! {
                _ = scope.cancelled() => return,
                accepted = listener.accept() => accepted,
            };
            let (client, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(error = %e, "failed to accept tcp connection");
                    scope.cancel_with(ProxyError::io("accept udp-over-tcp connection", e));
                    return;
                }
            };
            let udp = match udp_socket_towards(server_addr).await {
                Ok(s) => Arc::new(s),
                Err(e) => {
                    warn!(%server_addr, error = %e, "failed to open udp leg to server");
                    scope.cancel_with(ProxyError::io("connect udp leg to server", e));
                    return;
                }
            };
            let proxy = match UdpOverTcpProxy::new(client, udp, server_addr) {
                Ok(p) => p,
                Err(e) => {
                    warn!(%peer_addr, error = %e, "failed to resolve session addresses");
                    continue;
                }
            };
            match adder.add_connection(Arc::new(proxy)) {
                Ok(pc) => {
                    debug!(client_addr = %peer_addr, id = pc.id(), "added udp-over-tcp session");
                    active = Some(pc.id());
                }
                Err(e) => {
                    debug!(client_addr = %peer_addr, error = %e, "failed to register session");
                }
            }
        }
    }
}
