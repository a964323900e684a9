//! UDP transport: one bound socket carries both sides of a flow.
//!
//! The listener owns the socket and hands it to the session it spawns;
//! reads are attributed by source address. UDP has no handshake, so the
//! listener has already consumed the client's first datagram by the time
//! the session exists; it is replayed as the first serverbound event.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ezproxy_scope::CancelScope;
use ezproxy_wire::Network;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{PacketEvent, Transport, READ_BUF_SIZE};
use crate::error::{ProxyError, Result};
use crate::spawner::{ConnectionAdder, ProxyListener};

/// How long the listener parks between liveness checks while its single
/// flow is active.
const PARK_INTERVAL: Duration = Duration::from_secs(1);

/// A UDP flow between one client address and the server.
pub struct UdpProxy {
    client_addr: SocketAddr,
    server_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    /// The datagram that created this session; taken by `init`, which
    /// doubles as the once-only guard.
    first: Mutex<Option<Vec<u8>>>,
}

impl UdpProxy {
    pub fn new(
        client_addr: SocketAddr,
        server_addr: SocketAddr,
        socket: Arc<UdpSocket>,
        first_datagram: Vec<u8>,
    ) -> Self {
        Self {
            client_addr,
            server_addr,
            socket,
            first: Mutex::new(Some(first_datagram)),
        }
    }
}

async fn listen(
    socket: Arc<UdpSocket>,
    client: SocketAddr,
    server: SocketAddr,
    first: Vec<u8>,
    events: mpsc::Sender<PacketEvent>,
    scope: CancelScope,
) {
    // Replay the datagram the listener consumed while accepting the flow.
    let replay = PacketEvent {
        serverbound: true,
        source: client,
        dest: server,
        data: first,
    };
    let sent = tokio::select! {
        _ = scope.cancelled() => return,
        sent = events.send(replay) => sent,
    };
    if sent.is_err() {
        return;
    }

    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let recv = tokio::select! {
            _ = scope.cancelled() => return,
            recv = socket.recv_from(&mut buf) => recv,
        };
        let (n, from) = match recv {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, "closing session on udp read failure");
                scope.cancel_with(ProxyError::io("read from udp socket", e));
                return;
            }
        };
        let event = if from == client {
            PacketEvent {
                serverbound: true,
                source: client,
                dest: server,
                data: buf[..n].to_vec(),
            }
        } else if from == server {
            PacketEvent {
                serverbound: false,
                source: server,
                dest: client,
                data: buf[..n].to_vec(),
            }
        } else {
            debug!(%from, "ignoring datagram from unknown sender");
            continue;
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
impl Transport for UdpProxy {
    fn init(&self, events: mpsc::Sender<PacketEvent>, scope: CancelScope) -> Result<()> {
        let Some(first) = self.first.lock().unwrap().take() else {
            return Err(ProxyError::AlreadyInitialized);
        };
        tokio::spawn(listen(
            Arc::clone(&self.socket),
            self.client_addr,
            self.server_addr,
            first,
            events,
            scope,
        ));
        Ok(())
    }

    async fn send_to_client(&self, data: &[u8]) -> io::Result<()> {
        self.socket.send_to(data, self.client_addr).await.map(|_| ())
    }

    async fn send_to_server(&self, data: &[u8]) -> io::Result<()> {
        self.socket.send_to(data, self.server_addr).await.map(|_| ())
    }

    fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    fn network(&self) -> Network {
        Network::Udp
    }
}

/// UDP accept loop. One flow at a time: while the session it spawned is
/// alive the listener parks, because the session is reading the shared
/// socket; datagrams from the server address never open a flow.
pub struct UdpListener;

#[async_trait]
impl ProxyListener for UdpListener {
    async fn run(&self, scope: CancelScope, adder: Arc<dyn ConnectionAdder>) {
        let bind_addr = adder.listen_addr();
        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(s) => Arc::new(s),
            Err(e) => {
                warn!(%bind_addr, error = %e, "failed to bind udp listener");
                scope.cancel_with(ProxyError::io("bind udp listener", e));
                return;
            }
        };
        info!(%bind_addr, "udp listener started");
        let server_addr = adder.server_addr();
        let mut buf = vec![0u8; READ_BUF_SIZE];
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
            let recv = tokio::select! {
                _ = scope.cancelled() => return,
                recv = socket.recv_from(&mut buf) => recv,
            };
            let (n, from) = match recv {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(error = %e, "failed to read from udp listener");
                    sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            if from == server_addr {
                debug!(%from, "ignoring datagram from server on listen socket");
                continue;
            }
            let proxy = UdpProxy::new(from, server_addr, Arc::clone(&socket), buf[..n].to_vec());
            match adder.add_connection(Arc::new(proxy)) {
                Ok(pc) => {
                    debug!(client_addr = %from, id = pc.id(), "added udp session");
                    active = Some(pc.id());
                }
                Err(e) => {
                    debug!(client_addr = %from, error = %e, "failed to register udp session");
                }
            }
        }
    }
}
