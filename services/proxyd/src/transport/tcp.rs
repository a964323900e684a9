//! TCP transport: one client connection bridged to one server connection.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ezproxy_scope::CancelScope;
use ezproxy_wire::Network;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{PacketEvent, Transport, READ_BUF_SIZE};
use crate::error::{ProxyError, Result};
use crate::spawner::{ConnectionAdder, ProxyListener};

struct ReadHalves {
    client: OwnedReadHalf,
    server: OwnedReadHalf,
}

/// A full-duplex TCP session: two symmetric read loops, one per leg.
pub struct TcpProxy {
    client_addr: SocketAddr,
    server_addr: SocketAddr,
    reads: Mutex<Option<ReadHalves>>,
    client_write: tokio::sync::Mutex<OwnedWriteHalf>,
    server_write: tokio::sync::Mutex<OwnedWriteHalf>,
}

impl TcpProxy {
    pub fn new(client: TcpStream, server: TcpStream) -> io::Result<Self> {
        let client_addr = client.peer_addr()?;
        let server_addr = server.peer_addr()?;
        let (client_read, client_write) = client.into_split();
        let (server_read, server_write) = server.into_split();
        Ok(Self {
            client_addr,
            server_addr,
            reads: Mutex::new(Some(ReadHalves {
                client: client_read,
                server: server_read,
            })),
            client_write: tokio::sync::Mutex::new(client_write),
            server_write: tokio::sync::Mutex::new(server_write),
        })
    }
}

/// Read one leg until the scope is done, emitting an event per read.
///
/// EOF invites a listener restart (`ProxyRetry`); any other read failure
/// is session-fatal with the wrapped cause.
async fn read_loop(
    mut leg: OwnedReadHalf,
    serverbound: bool,
    source: SocketAddr,
    dest: SocketAddr,
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
                debug!(%source, "tcp connection closed");
                scope.cancel_with(ProxyError::ProxyRetry);
                return;
            }
            Ok(n) => {
                let event = PacketEvent {
                    serverbound,
                    source,
                    dest,
                    data: buf[..n].to_vec(),
                };
                // The dispatcher applies backpressure; bail out if it is gone.
                let sent = tokio::select! {
                    _ = scope.cancelled() => return,
                    sent = events.send(event) => sent,
                };
                if sent.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(%source, error = %e, "closing session on read failure");
                scope.cancel_with(ProxyError::io("read from tcp peer", e));
                return;
            }
        }
    }
}

#[async_trait]
impl Transport for TcpProxy {
    fn init(&self, events: mpsc::Sender<PacketEvent>, scope: CancelScope) -> Result<()> {
        let Some(halves) = self.reads.lock().unwrap().take() else {
            return Err(ProxyError::AlreadyInitialized);
        };
        tokio::spawn(read_loop(
            halves.client,
            true,
            self.client_addr,
            self.server_addr,
            events.clone(),
            scope.clone(),
        ));
        tokio::spawn(read_loop(
            halves.server,
            false,
            self.server_addr,
            self.client_addr,
            events,
            scope,
        ));
        Ok(())
    }

    async fn send_to_client(&self, data: &[u8]) -> io::Result<()> {
        self.client_write.lock().await.write_all(data).await
    }

    async fn send_to_server(&self, data: &[u8]) -> io::Result<()> {
        self.server_write.lock().await.write_all(data).await
    }

    fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    fn network(&self) -> Network {
        Network::Tcp
    }
}

/// Accept loop: each accepted client gets its own upstream connection and
/// a fresh [`TcpProxy`] registered with the spawner.
pub struct TcpListener;

#[async_trait]
impl ProxyListener for TcpListener {
    async fn run(&self, scope: CancelScope, adder: Arc<dyn ConnectionAdder>) {
        let bind_addr = adder.listen_addr();
        let listener = match TokioTcpListener::bind(bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                warn!(%bind_addr, error = %e, "failed to bind tcp listener");
                scope.cancel_with(ProxyError::io("bind tcp listener", e));
                return;
            }
        };
        info!(%bind_addr, "tcp listener started");
        loop {
            let accepted = tokio::select! {
                _ = scope.cancelled() => return,
                accepted = listener.accept() => accepted,
            };
            let (client, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(error = %e, "failed to accept tcp connection");
                    scope.cancel_with(ProxyError::io("accept tcp connection", e));
                    return;
                }
            };
            let server_addr = adder.server_addr();
            let server = match TcpStream::connect(server_addr).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(%server_addr, error = %e, "failed to connect to upstream");
                    scope.cancel_with(ProxyError::io("connect to upstream", e));
                    return;
                }
            };
            let proxy = match TcpProxy::new(client, server) {
                Ok(p) => p,
                Err(e) => {
                    warn!(%peer_addr, error = %e, "failed to resolve session addresses");
                    continue;
                }
            };
            debug!(client_addr = %peer_addr, %server_addr, "adding tcp session");
            if let Err(e) = adder.add_connection(Arc::new(proxy)) {
                warn!(%peer_addr, error = %e, "failed to register tcp session");
            }
        }
    }
}
