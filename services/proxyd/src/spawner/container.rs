//! Per-session container: lifecycle, stats, and the dispatch loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use ezproxy_scope::CancelScope;
use ezproxy_wire::{CapFlags, Network};
use tokio::sync::mpsc;
use tracing::debug;

use super::SpawnerCore;
use crate::error::{ProxyError, Result};
use crate::transport::{PacketEvent, Transport};

/// Owns one proxy session.
///
/// The container wraps a [`Transport`], runs the dispatch loop that feeds
/// every read through the spawner's send decision, and tracks delivery
/// stats. It holds only a weak handle to the spawner, so a lingering
/// session can never keep a cancelled fleet alive.
pub struct ProxyContainer {
    id: u32,
    server_addr: SocketAddr,
    core: Weak<SpawnerCore>,
    transport: Arc<dyn Transport>,
    scope: CancelScope,
    bytes_sent: AtomicU64,
    last_contact: Mutex<Instant>,
}

impl ProxyContainer {
    /// Build the container, start its dispatcher, and initialize the
    /// transport. On transport failure the session scope is cancelled and
    /// the error is returned; the caller's id allocation stays consumed.
    pub(crate) fn spawn(
        core: &SpawnerCore,
        transport: Arc<dyn Transport>,
        id: u32,
    ) -> Result<Arc<Self>> {
        let scope = core.scope.child();
        let (events_tx, events_rx) = mpsc::channel(1);
        let container = Arc::new(Self {
            id,
            server_addr: core.server_addr,
            core: core.weak_self.clone(),
            transport: Arc::clone(&transport),
            scope: scope.clone(),
            bytes_sent: AtomicU64::new(0),
            last_contact: Mutex::new(Instant::now()),
        });
        core.tracker.spawn(Arc::clone(&container).dispatch(events_rx));
        debug!(id, client_addr = %transport.client_addr(), "initializing transport");
        if let Err(e) = transport.init(events_tx, scope.clone()) {
            let err = ProxyError::InitFailed(e.to_string());
            scope.cancel_with(ProxyError::InitFailed(e.to_string()));
            return Err(err);
        }
        Ok(container)
    }

    /// Forward transport reads until the session scope is done.
    ///
    /// Each event goes through the spawner's send decision; allowed
    /// packets are written to the matching leg. Write failures are
    /// surfaced and the loop keeps running; whether they end the session
    /// is the transport's call.
    async fn dispatch(self: Arc<Self>, mut events: mpsc::Receiver<PacketEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.scope.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };
            let mut flags = CapFlags::empty();
            if event.serverbound {
                flags |= CapFlags::TO_SERVER;
            }
            let Some(core) = self.core.upgrade() else {
                return;
            };
            if !core.handle_send(&event.data, flags, &*self).await {
                debug!(
                    id = self.id,
                    source = %event.source,
                    dest = %event.dest,
                    serverbound = event.serverbound,
                    "packet dropped by send decision"
                );
                continue;
            }
            let written = if event.serverbound {
                self.transport.send_to_server(&event.data).await
            } else {
                self.transport.send_to_client(&event.data).await
            };
            match written {
                Ok(()) => self.record_delivery(event.data.len()),
                Err(e) => {
                    let err = ProxyError::io("forward packet", e);
                    debug!(id = self.id, error = %err, "failed to forward packet");
                    core.handle_error(&err, Some(&*self));
                }
            }
        }
    }

    /// Inject bytes toward the client. Goes through the send decision
    /// with the injected flag set, so it is observed but never dropped.
    pub async fn send_to_client(&self, data: &[u8]) -> Result<()> {
        let Some(core) = self.core.upgrade() else {
            return Err(ProxyError::SpawnerGone("spawner dropped".into()));
        };
        if !core.handle_send(data, CapFlags::INJECTED, self).await {
            debug!(id = self.id, "injected packet withheld by send decision");
            return Ok(());
        }
        match self.transport.send_to_client(data).await {
            Ok(()) => {
                self.record_delivery(data.len());
                Ok(())
            }
            Err(e) => {
                let err = ProxyError::io("send to client", e);
                core.handle_error(&err, Some(self));
                Err(err)
            }
        }
    }

    /// Inject bytes toward the server. Same rules as `send_to_client`.
    pub async fn send_to_server(&self, data: &[u8]) -> Result<()> {
        let Some(core) = self.core.upgrade() else {
            return Err(ProxyError::SpawnerGone("spawner dropped".into()));
        };
        if !core
            .handle_send(data, CapFlags::TO_SERVER | CapFlags::INJECTED, self)
            .await
        {
            debug!(id = self.id, "injected packet withheld by send decision");
            return Ok(());
        }
        match self.transport.send_to_server(data).await {
            Ok(()) => {
                self.record_delivery(data.len());
                Ok(())
            }
            Err(e) => {
                let err = ProxyError::io("send to server", e);
                core.handle_error(&err, Some(self));
                Err(err)
            }
        }
    }

    fn record_delivery(&self, len: usize) {
        self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
        *self.last_contact.lock().unwrap() = Instant::now();
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn network(&self) -> Network {
        self.transport.network()
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.transport.client_addr()
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Bytes successfully delivered to either peer. Dropped packets and
    /// failed writes are not counted.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Time since the last successful delivery.
    pub fn last_contact_ago(&self) -> Duration {
        self.last_contact.lock().unwrap().elapsed()
    }

    pub fn is_alive(&self) -> bool {
        !self.scope.is_done()
    }

    /// Cancel the session with a cause. The dispatcher and the
    /// transport's I/O tasks stop with the scope.
    pub fn cancel<E>(&self, cause: E)
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.scope.cancel_with(cause);
    }

    pub fn scope(&self) -> &CancelScope {
        &self.scope
    }
}

impl std::fmt::Debug for ProxyContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyContainer")
            .field("id", &self.id)
            .field("network", &self.network())
            .field("client_addr", &self.client_addr())
            .field("alive", &self.is_alive())
            .finish()
    }
}
