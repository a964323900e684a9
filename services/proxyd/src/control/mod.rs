//! Operator control sessions.
//!
//! A control session is a long-lived bidirectional message stream. At
//! attach time it negotiates a capability set against the credentials the
//! embedding surface resolved; the grants are immutable afterwards.
//!
//! With `filter` the session holds the spawner's filter slot and decides
//! drop/allow for every packet; without it the session takes a packet
//! subscription and forwards records as they come. Either
//! way the operator drives the fleet with `Inject` / `Close` / `Filter`
//! requests, answered with status envelopes.

mod filter;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ezproxy_scope::CancelScope;
use ezproxy_wire::{
    ClientMsg, ClientMsgType, Envelope, Network, PacketRecord, INJECT_TO_CLIENT, INJECT_TO_SERVER,
    PKT_NUM_NONE, STATUS_BAD_REQUEST, STATUS_FORBIDDEN, STATUS_NOT_FOUND, STATUS_GONE, TARGET_ALL,
};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::spawner::{FanoutRecord, ProxyContainer, ProxySpawner};

use filter::SessionFilter;

/// Default time an operator gets to decide one packet.
pub const DEFAULT_FILTER_TIMEOUT: Duration = Duration::from_secs(2);

/// Capability bitset granted to a control session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions(pub u32);

impl Permissions {
    /// Watch packets flow through the fleet.
    pub const OBSERVE: Permissions = Permissions(1 << 0);
    /// Inject packets into sessions.
    pub const INJECT: Permissions = Permissions(1 << 1);
    /// Close sessions.
    pub const CLOSE: Permissions = Permissions(1 << 2);
    /// Hold the filter slot and vote on packets.
    pub const FILTER: Permissions = Permissions(1 << 3);

    pub const ALL: Permissions = Permissions(0b1111);

    pub fn contains(self, other: Permissions) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Permissions {
    type Output = Permissions;

    fn bitor(self, rhs: Permissions) -> Permissions {
        Permissions(self.0 | rhs.0)
    }
}

/// What happens to a packet when the operator does not answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Allow,
    Drop,
}

/// Capabilities requested at attach time.
#[derive(Debug, Clone)]
pub struct AttachOptions {
    pub inject: bool,
    pub close: bool,
    /// `Some(default)` puts the session in filter mode with that default
    /// action; `None` makes it observe-only.
    pub filter: Option<FilterAction>,
    /// Restrict the stream to one network; `None` streams everything.
    pub network_filter: Option<Network>,
    pub filter_timeout: Duration,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            inject: false,
            close: false,
            filter: None,
            network_filter: None,
            filter_timeout: DEFAULT_FILTER_TIMEOUT,
        }
    }
}

/// Attach-time failures, reported before the stream is established.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("missing permission for '{0}'")]
    MissingPermission(&'static str),

    #[error("filter callback already installed")]
    FilterBusy,

    #[error("spawner no longer alive")]
    SpawnerGone,
}

/// The two halves of the operator's message stream, provided by the
/// embedding surface.
pub struct ControlStream {
    /// Core → operator envelopes.
    pub outbound: mpsc::Sender<Envelope>,
    /// Operator → core messages, raw JSON.
    pub inbound: mpsc::Receiver<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FilterVerdict {
    Wait,
    Allow,
    Drop,
}

/// State shared by the session's tasks and its filter callback.
pub(crate) struct SessionShared {
    pub(crate) spawner: ProxySpawner,
    pub(crate) scope: CancelScope,
    pub(crate) outbound: mpsc::Sender<Envelope>,
    pub(crate) can_inject: bool,
    pub(crate) can_close: bool,
    pub(crate) can_filter: bool,
    pub(crate) default_action: FilterAction,
    pub(crate) network_filter: Option<Network>,
    pub(crate) filter_timeout: Duration,
    /// Sequence → verdict for packets sent to this stream.
    pub(crate) filter_map: Mutex<HashMap<i64, FilterVerdict>>,
    pub(crate) next_seq: AtomicI64,
    /// Signalled whenever a verdict lands in `filter_map`.
    pub(crate) notify: Notify,
}

impl SessionShared {
    pub(crate) fn matches_network(&self, network: Network) -> bool {
        self.network_filter.map(|f| f == network).unwrap_or(true)
    }

    pub(crate) fn default_allows(&self) -> bool {
        self.default_action == FilterAction::Allow
    }

    pub(crate) async fn send_error(&self, status: i32, message: &str) {
        debug!(status, error = message, "sending error envelope");
        if self.outbound.send(Envelope::error(status, message)).await.is_err() {
            debug!("operator stream gone, error envelope lost");
        }
    }

    async fn handle_client_msg(&self, raw: &[u8]) {
        let msg: ClientMsg = match serde_json::from_slice(raw) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "bad JSON from operator");
                self.send_error(STATUS_BAD_REQUEST, "bad JSON data").await;
                return;
            }
        };
        match msg.r#type {
            ClientMsgType::Inject => self.handle_inject(msg).await,
            ClientMsgType::Close => self.handle_close(msg).await,
            ClientMsgType::Filter => self.handle_filter(msg).await,
        }
    }

    async fn handle_inject(&self, msg: ClientMsg) {
        if !self.can_inject {
            self.send_error(STATUS_FORBIDDEN, "missing permissions to inject")
                .await;
            return;
        }
        let to_client = msg.extra & INJECT_TO_CLIENT != 0;
        let to_server = msg.extra & INJECT_TO_SERVER != 0;
        if !to_client && !to_server {
            self.send_error(
                STATUS_BAD_REQUEST,
                "toClient and/or toServer must be set in 'Extra'",
            )
            .await;
            return;
        }
        if msg.target == TARGET_ALL {
            debug!(to_client, to_server, "broadcasting injected packet");
            if to_server {
                let _ = self.spawner.send_to_all_servers(&msg.data).await;
            }
            if to_client {
                let _ = self.spawner.send_to_all_clients(&msg.data).await;
            }
            return;
        }
        let Some(container) = self.target_proxy(msg.target) else {
            self.send_error(STATUS_NOT_FOUND, "proxy not found").await;
            return;
        };
        debug!(id = container.id(), to_client, to_server, "injecting packet");
        if to_server {
            let _ = container.send_to_server(&msg.data).await;
        }
        if to_client {
            let _ = container.send_to_client(&msg.data).await;
        }
    }

    async fn handle_close(&self, msg: ClientMsg) {
        if !self.can_close {
            self.send_error(STATUS_FORBIDDEN, "missing permissions to close")
                .await;
            return;
        }
        if msg.target == TARGET_ALL {
            debug!("closing all proxies");
            for container in self.spawner.get_all_proxies() {
                container.cancel(ProxyError::ProxyClosed);
            }
            return;
        }
        let Some(container) = self.target_proxy(msg.target) else {
            self.send_error(STATUS_NOT_FOUND, "proxy not found").await;
            return;
        };
        debug!(id = container.id(), "closing proxy");
        container.cancel(ProxyError::ProxyClosed);
    }

    async fn handle_filter(&self, msg: ClientMsg) {
        if !self.can_filter {
            self.send_error(STATUS_FORBIDDEN, "missing permissions to filter")
                .await;
            return;
        }
        enum Outcome {
            NotFound,
            AlreadyHandled,
            Recorded,
        }
        let outcome = {
            let mut map = self.filter_map.lock().unwrap();
            match map.get(&msg.target).copied() {
                None => Outcome::NotFound,
                Some(FilterVerdict::Wait) => {
                    let verdict = if msg.extra & ezproxy_wire::FILTER_ALLOW != 0 {
                        FilterVerdict::Allow
                    } else {
                        FilterVerdict::Drop
                    };
                    map.insert(msg.target, verdict);
                    Outcome::Recorded
                }
                Some(_) => Outcome::AlreadyHandled,
            }
        };
        match outcome {
            Outcome::NotFound => self.send_error(STATUS_NOT_FOUND, "packet not found").await,
            Outcome::AlreadyHandled => {
                self.send_error(STATUS_GONE, "packet already handled").await
            }
            Outcome::Recorded => {
                debug!(seq = msg.target, "filter decision recorded");
                self.notify.notify_waiters();
            }
        }
    }

    fn target_proxy(&self, target: i64) -> Option<Arc<ProxyContainer>> {
        let id = u32::try_from(target).ok()?;
        self.spawner.get_proxy(id).ok()
    }
}

/// Build the wire record for one fan-out record.
pub(crate) fn packet_record(pkt_num: i64, record: &FanoutRecord) -> PacketRecord {
    PacketRecord {
        pkt_num,
        proxy_id: record.proxy_id,
        network: record.network,
        source: record.source.to_string(),
        dest: record.dest.to_string(),
        data: record.data.to_vec(),
        flags: record.flags,
    }
}

/// Forward subscription records to an observe-only operator.
async fn forward_records(shared: Arc<SessionShared>, mut records: mpsc::Receiver<FanoutRecord>) {
    loop {
        let record = tokio::select! {
            _ = shared.scope.cancelled() => return,
            record = records.recv() => match record {
                Some(record) => record,
                None => return,
            },
        };
        if !shared.matches_network(record.network) {
            continue;
        }
        let envelope = Envelope::packet(packet_record(PKT_NUM_NONE, &record));
        if shared.outbound.send(envelope).await.is_err() {
            debug!("operator stream gone, ending forwarder");
            shared.scope.cancel();
            return;
        }
    }
}

/// Consume operator requests until the stream or the session ends.
async fn read_loop(shared: Arc<SessionShared>, mut inbound: mpsc::Receiver<Vec<u8>>) {
    loop {
        let raw = tokio::select! {
            _ = shared.scope.cancelled() => return,
            raw = inbound.recv() => match raw {
                Some(raw) => raw,
                None => {
                    debug!("operator stream closed");
                    shared.scope.cancel();
                    return;
                }
            },
        };
        shared.handle_client_msg(&raw).await;
    }
}

/// A live operator session. Dropping the handle does not end the session;
/// use [`ControlSession::close`] or cancel the scope.
pub struct ControlSession {
    shared: Arc<SessionShared>,
}

impl ControlSession {
    /// Attach an operator stream to a fleet.
    ///
    /// `granted` is the capability set the embedding surface resolved
    /// from the operator's credentials; requesting anything beyond it
    /// fails synchronously. With `filter` requested the session takes the
    /// fleet's filter slot, and fails with [`AttachError::FilterBusy`] if
    /// another live session holds it.
    pub fn attach(
        spawner: &ProxySpawner,
        granted: Permissions,
        opts: AttachOptions,
        stream: ControlStream,
    ) -> Result<ControlSession, AttachError> {
        if !spawner.is_alive() {
            return Err(AttachError::SpawnerGone);
        }
        if !granted.contains(Permissions::OBSERVE) {
            return Err(AttachError::MissingPermission("observe"));
        }
        if opts.inject && !granted.contains(Permissions::INJECT) {
            return Err(AttachError::MissingPermission("inject"));
        }
        if opts.close && !granted.contains(Permissions::CLOSE) {
            return Err(AttachError::MissingPermission("close"));
        }
        if opts.filter.is_some() && !granted.contains(Permissions::FILTER) {
            return Err(AttachError::MissingPermission("filter"));
        }

        let scope = spawner.scope().child();
        let shared = Arc::new(SessionShared {
            spawner: spawner.clone(),
            scope: scope.clone(),
            outbound: stream.outbound,
            can_inject: opts.inject,
            can_close: opts.close,
            can_filter: opts.filter.is_some(),
            default_action: opts.filter.unwrap_or(FilterAction::Allow),
            network_filter: opts.network_filter,
            filter_timeout: opts.filter_timeout,
            filter_map: Mutex::new(HashMap::new()),
            next_seq: AtomicI64::new(0),
            notify: Notify::new(),
        });

        if shared.can_filter {
            let installed = spawner.try_install_filter(
                Arc::new(SessionFilter::new(Arc::clone(&shared))),
                &scope,
            );
            match installed {
                Ok(()) => debug!("control session holds the filter slot"),
                Err(ProxyError::FilterInstalled) => return Err(AttachError::FilterBusy),
                Err(e) => {
                    warn!(error = %e, "failed to install filter callback");
                    return Err(AttachError::SpawnerGone);
                }
            }
        } else {
            let (records, _sub_scope) = spawner.subscribe(&scope);
            tokio::spawn(forward_records(Arc::clone(&shared), records));
        }
        tokio::spawn(read_loop(Arc::clone(&shared), stream.inbound));
        debug!(
            inject = shared.can_inject,
            close = shared.can_close,
            filter = shared.can_filter,
            "control session attached"
        );
        Ok(ControlSession { shared })
    }

    /// The session's scope. Cancelling it detaches the subscription and
    /// releases the filter slot.
    pub fn scope(&self) -> CancelScope {
        self.shared.scope.clone()
    }

    pub fn is_alive(&self) -> bool {
        !self.shared.scope.is_done()
    }

    /// End the session.
    pub fn close(&self) {
        self.shared.scope.cancel();
    }

    /// Sequence number the next filtered packet will get.
    pub fn next_pkt_seq(&self) -> i64 {
        self.shared.next_seq.load(Ordering::Relaxed)
    }
}
