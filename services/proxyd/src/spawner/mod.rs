//! The proxy fleet: session registry, listener supervision, and the
//! packet send decision.
//!
//! One [`ProxySpawner`] owns everything a fleet needs:
//! - the session registry with monotonic, never-reused ids
//! - the send decision every forwarded or injected packet passes through
//! - the single-holder filter slot voting drop/allow per packet
//! - lossy fan-out to any number of packet subscriptions
//! - one supervisor task per listener, with a bounded retry budget
//! - a pruner evicting dead sessions and expired subscriptions

mod container;
mod mpx;

pub use container::ProxyContainer;
pub use mpx::{MpxProto, MpxRegistry};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use ezproxy_scope::CancelScope;
use ezproxy_wire::{CapFlags, Network};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{ProxyError, Result};
use crate::transport::Transport;

/// Restarts a listener gets after `ProxyRetry` before the fleet gives up.
pub const MAX_LISTENER_RETRIES: u32 = 3;

/// Queue depth of one packet subscription. A subscriber that falls this
/// far behind starts losing records.
pub const SUBSCRIPTION_QUEUE: usize = 32;

const PRUNE_INTERVAL: Duration = Duration::from_secs(1);
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// One packet as seen by the filter callback and every subscription.
#[derive(Debug, Clone)]
pub struct FanoutRecord {
    pub flags: CapFlags,
    pub source: SocketAddr,
    pub dest: SocketAddr,
    pub data: Arc<[u8]>,
    pub proxy_id: u32,
    pub network: Network,
}

/// The exclusive drop/allow vote, held through the spawner's filter slot.
///
/// Invoked for every packet, injected ones included; a `false` vote only
/// takes effect on packets that are not injected.
#[async_trait]
pub trait PacketFilter: Send + Sync + 'static {
    async fn allow(&self, pkt: &FanoutRecord) -> bool;
}

/// Observer for surfaced errors. `None` means the error happened in the
/// spawner itself rather than in a session.
pub type ErrorSink =
    Box<dyn Fn(&(dyn std::error::Error + Send + Sync + 'static), Option<&ProxyContainer>) + Send + Sync>;

/// What a listener is allowed to see of the fleet.
pub trait ConnectionAdder: Send + Sync {
    /// Look up a live (or not yet pruned) session.
    fn get_proxy(&self, id: u32) -> Result<Arc<ProxyContainer>>;

    /// Register a freshly connected transport, returning its container.
    fn add_connection(&self, transport: Arc<dyn Transport>) -> Result<Arc<ProxyContainer>>;

    /// The primary address listeners bind.
    fn listen_addr(&self) -> SocketAddr;

    /// The upstream server address.
    fn server_addr(&self) -> SocketAddr;

    /// Bind address registered in the multiplex registry under `name`.
    fn mpx_addr(&self, name: &str) -> Result<SocketAddr>;
}

/// An accept loop. `run` must cancel `scope` before returning: with
/// `ProxyRetry` to request a restart, `ProxyClosed` for a normal end, or
/// the fatal cause otherwise. Returning with a live scope is a bug and
/// cancels the whole fleet.
#[async_trait]
pub trait ProxyListener: Send + Sync + 'static {
    async fn run(&self, scope: CancelScope, adder: Arc<dyn ConnectionAdder>);
}

struct InstalledFilter {
    filter: Arc<dyn PacketFilter>,
    scope: CancelScope,
}

struct Subscription {
    tx: mpsc::Sender<FanoutRecord>,
    scope: CancelScope,
}

/// Shared fleet state. Containers hold this weakly; the [`ProxySpawner`]
/// handle owns it.
pub(crate) struct SpawnerCore {
    pub(crate) scope: CancelScope,
    pub(crate) server_addr: SocketAddr,
    pub(crate) weak_self: Weak<SpawnerCore>,
    pub(crate) tracker: TaskTracker,
    listen_addr: SocketAddr,
    sessions: Mutex<HashMap<u32, Arc<ProxyContainer>>>,
    next_id: AtomicU32,
    total_bytes: AtomicU64,
    /// Guards install/replace only; `filter_slot` is read lock-free.
    filter_install: Mutex<()>,
    filter_slot: ArcSwapOption<InstalledFilter>,
    subscriptions: Mutex<Vec<Subscription>>,
    error_sink: Mutex<Option<ErrorSink>>,
    mpx: MpxRegistry,
}

impl SpawnerCore {
    /// The join point for every packet, forwarded or injected.
    ///
    /// Returns whether the caller should go through with the write.
    /// Counts the bytes as observed either way, consults the filter
    /// callback if one is live, and fans the record out to subscribers
    /// with a non-blocking offer.
    pub(crate) async fn handle_send(
        &self,
        data: &[u8],
        flags: CapFlags,
        pc: &ProxyContainer,
    ) -> bool {
        let (source, dest) = if flags.is_serverbound() {
            (pc.client_addr(), self.server_addr)
        } else {
            (self.server_addr, pc.client_addr())
        };
        let record = FanoutRecord {
            flags,
            source,
            dest,
            data: Arc::from(data),
            proxy_id: pc.id(),
            network: pc.network(),
        };

        self.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);

        // Snapshot the slot; the callback runs without any lock held.
        if let Some(installed) = self.filter_slot.load_full() {
            if installed.scope.is_done() {
                self.release_filter_if_done();
            } else if !installed.filter.allow(&record).await && !flags.is_injected() {
                return false;
            }
        }

        let subscriptions = self.subscriptions.lock().unwrap();
        for sub in subscriptions.iter() {
            if sub.scope.is_done() {
                continue;
            }
            match sub.tx.try_send(record.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(proxy_id = pc.id(), "subscriber queue full, record lost");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        true
    }

    /// Surface an error to the log and the optional sink.
    pub(crate) fn handle_error(
        &self,
        err: &(dyn std::error::Error + Send + Sync + 'static),
        pc: Option<&ProxyContainer>,
    ) {
        match pc {
            Some(pc) => error!(id = pc.id(), network = %pc.network(), error = %err, "proxy error"),
            None => error!(error = %err, "spawner error"),
        }
        if let Some(sink) = self.error_sink.lock().unwrap().as_ref() {
            sink(err, pc);
        }
    }

    fn release_filter_if_done(&self) {
        let _guard = self.filter_install.lock().unwrap();
        if let Some(installed) = self.filter_slot.load_full() {
            if installed.scope.is_done() {
                debug!("filter scope expired, releasing slot");
                self.filter_slot.store(None);
            }
        }
    }

    /// One pruner pass. Idempotent.
    fn prune(&self) {
        {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.retain(|id, pc| {
                if pc.is_alive() {
                    true
                } else {
                    debug!(id, "removing dead session");
                    false
                }
            });
        }
        let mut subscriptions = self.subscriptions.lock().unwrap();
        subscriptions.retain(|sub| {
            if sub.scope.is_done() {
                debug!("removing expired subscription");
                false
            } else {
                true
            }
        });
    }
}

impl ConnectionAdder for SpawnerCore {
    fn get_proxy(&self, id: u32) -> Result<Arc<ProxyContainer>> {
        self.sessions
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(ProxyError::ProxyNotFound(id))
    }

    fn add_connection(&self, transport: Arc<dyn Transport>) -> Result<Arc<ProxyContainer>> {
        if self.scope.is_done() {
            let cause = self
                .scope
                .cause()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "cancelled".to_string());
            error!(%cause, "add_connection on a dead spawner");
            return Err(ProxyError::SpawnerGone(cause));
        }
        // Ids are consumed even when construction fails below.
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(id, "adding new session");
        match ProxyContainer::spawn(self, transport, id) {
            Ok(container) => {
                self.sessions
                    .lock()
                    .unwrap()
                    .insert(id, Arc::clone(&container));
                Ok(container)
            }
            Err(e) => {
                debug!(id, error = %e, "failed to build session container");
                self.handle_error(&e, None);
                Err(e)
            }
        }
    }

    fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    fn mpx_addr(&self, name: &str) -> Result<SocketAddr> {
        self.mpx.addr(name)
    }
}

/// Run one listener under the fleet, restarting on `ProxyRetry` up to
/// [`MAX_LISTENER_RETRIES`] times.
async fn supervise(core: Arc<SpawnerCore>, listener: Arc<dyn ProxyListener>) {
    let mut retries = 0u32;
    loop {
        if core.scope.is_done() {
            return;
        }
        let scope = core.scope.child();
        debug!("starting listener");
        listener
            .run(scope.clone(), Arc::clone(&core) as Arc<dyn ConnectionAdder>)
            .await;

        if !scope.is_done() {
            core.handle_error(&ProxyError::ListenerStalled, None);
            core.scope.cancel_with(ProxyError::ListenerStalled);
            return;
        }
        if core.scope.is_done() {
            // Fleet-driven shutdown reached the listener through its scope.
            return;
        }
        match scope.cause() {
            Some(cause) if ProxyError::cause_is_retry(&cause) => {
                if retries >= MAX_LISTENER_RETRIES {
                    error!(retries, "listener exhausted its retry budget");
                    core.handle_error(&ProxyError::ProxyMaxRetries, None);
                    core.scope.cancel_with(ProxyError::ProxyMaxRetries);
                    return;
                }
                retries += 1;
                info!(retries, "restarting listener");
            }
            Some(cause) if ProxyError::cause_is_graceful(&cause) => {
                info!("listener closed");
                return;
            }
            Some(cause) => {
                error!(error = %cause, "listener failed, closing spawner");
                core.scope.cancel_cause(Arc::clone(&cause));
                core.handle_error(&*cause, None);
                return;
            }
            None => {
                info!("listener cancelled");
                return;
            }
        }
    }
}

async fn prune_loop(core: Arc<SpawnerCore>) {
    let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
    loop {
        tokio::select! {
            _ = core.scope.cancelled() => return,
            _ = ticker.tick() => core.prune(),
        }
    }
}

/// Handle to a proxy fleet. Cheap to clone; the fleet lives until
/// [`ProxySpawner::close`] or a fleet-fatal failure cancels its scope.
#[derive(Clone)]
pub struct ProxySpawner {
    core: Arc<SpawnerCore>,
}

impl ProxySpawner {
    /// Start a fleet proxying `listen_addr` → `server_addr` with the
    /// given listeners. At least one listener is required, and the two
    /// addresses must differ.
    pub fn new(
        server_addr: SocketAddr,
        listen_addr: SocketAddr,
        listeners: Vec<Arc<dyn ProxyListener>>,
    ) -> Result<Self> {
        if listeners.is_empty() {
            return Err(ProxyError::NoListeners);
        }
        if server_addr == listen_addr {
            return Err(ProxyError::AddrConflict);
        }
        let core = Arc::new_cyclic(|weak_self| SpawnerCore {
            scope: CancelScope::new(),
            server_addr,
            listen_addr,
            weak_self: weak_self.clone(),
            tracker: TaskTracker::new(),
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(0),
            total_bytes: AtomicU64::new(0),
            filter_install: Mutex::new(()),
            filter_slot: ArcSwapOption::empty(),
            subscriptions: Mutex::new(Vec::new()),
            error_sink: Mutex::new(None),
            mpx: MpxRegistry::new(),
        });
        for listener in listeners {
            core.tracker.spawn(supervise(Arc::clone(&core), listener));
        }
        core.tracker.spawn(prune_loop(Arc::clone(&core)));
        debug!(%server_addr, %listen_addr, "spawner started");
        Ok(Self { core })
    }

    /// Register a named listener through the multiplex registry and start
    /// supervising it.
    pub fn register_mpx_listener(
        &self,
        name: &str,
        proto: MpxProto,
        addr: SocketAddr,
        listener: Arc<dyn ProxyListener>,
    ) -> Result<()> {
        if self.core.scope.is_done() {
            return Err(ProxyError::SpawnerGone("spawner closed".to_string()));
        }
        self.core.mpx.register(name, proto, addr)?;
        info!(mpx = name, %proto, %addr, "registered mpx listener");
        self.core
            .tracker
            .spawn(supervise(Arc::clone(&self.core), listener));
        Ok(())
    }

    /// Bind address registered under `name`.
    pub fn mpx_addr(&self, name: &str) -> Result<SocketAddr> {
        self.core.mpx.addr(name)
    }

    /// Every registered mpx entry.
    pub fn mpx_addrs(&self) -> Vec<(String, MpxProto, SocketAddr)> {
        self.core.mpx.addrs()
    }

    pub fn get_proxy(&self, id: u32) -> Result<Arc<ProxyContainer>> {
        self.core.get_proxy(id)
    }

    /// All sessions not yet pruned.
    pub fn get_all_proxies(&self) -> Vec<Arc<ProxyContainer>> {
        self.core.sessions.lock().unwrap().values().cloned().collect()
    }

    /// Register a transport directly. Listeners normally do this through
    /// their [`ConnectionAdder`].
    pub fn add_connection(&self, transport: Arc<dyn Transport>) -> Result<Arc<ProxyContainer>> {
        self.core.add_connection(transport)
    }

    /// Close one session gracefully.
    pub fn close_proxy(&self, id: u32) -> Result<()> {
        let container = self.core.get_proxy(id)?;
        debug!(id, "closing proxy");
        container.cancel(ProxyError::ProxyClosed);
        Ok(())
    }

    /// Cancel every subscription and the fleet scope, then wait a grace
    /// period for the fleet's tasks to drain.
    pub async fn close(&self) -> Result<()> {
        debug!("closing spawner");
        {
            let subscriptions = self.core.subscriptions.lock().unwrap();
            for sub in subscriptions.iter() {
                sub.scope.cancel();
            }
        }
        self.core.scope.cancel_with(ProxyError::SpawnerClosed);
        self.core.tracker.close();
        if timeout(CLOSE_GRACE, self.core.tracker.wait()).await.is_err() {
            warn!("timed out waiting for proxy tasks to stop");
            return Err(ProxyError::CloseTimeout);
        }
        Ok(())
    }

    /// Install the filter callback. Fails while another holder's scope is
    /// still live; an expired holder is replaced.
    pub fn try_install_filter(
        &self,
        filter: Arc<dyn PacketFilter>,
        parent: &CancelScope,
    ) -> Result<()> {
        let _guard = self.core.filter_install.lock().unwrap();
        if let Some(installed) = self.core.filter_slot.load_full() {
            if !installed.scope.is_done() {
                return Err(ProxyError::FilterInstalled);
            }
            debug!("replacing expired filter callback");
        } else {
            debug!("installing filter callback");
        }
        self.core.filter_slot.store(Some(Arc::new(InstalledFilter {
            filter,
            scope: parent.child(),
        })));
        Ok(())
    }

    /// Open a packet subscription bounded by `parent`. Records are
    /// offered without blocking; a full queue loses records rather than
    /// stalling dispatch. The returned scope detaches the subscription.
    pub fn subscribe(
        &self,
        parent: &CancelScope,
    ) -> (mpsc::Receiver<FanoutRecord>, CancelScope) {
        let scope = parent.child();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE);
        self.core.subscriptions.lock().unwrap().push(Subscription {
            tx,
            scope: scope.clone(),
        });
        debug!("added packet subscription");
        (rx, scope)
    }

    /// Install the error sink, replacing any previous one.
    pub fn set_error_sink(&self, sink: ErrorSink) {
        *self.core.error_sink.lock().unwrap() = Some(sink);
    }

    /// Inject `data` toward every live session's client. Keeps going on
    /// failure and returns the first error.
    pub async fn send_to_all_clients(&self, data: &[u8]) -> Result<()> {
        let mut first_err = None;
        for container in self.get_all_proxies() {
            if !container.is_alive() {
                continue;
            }
            if let Err(e) = container.send_to_client(data).await {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Inject `data` toward every live session's server. Keeps going on
    /// failure and returns the first error.
    pub async fn send_to_all_servers(&self, data: &[u8]) -> Result<()> {
        let mut first_err = None;
        for container in self.get_all_proxies() {
            if !container.is_alive() {
                continue;
            }
            if let Err(e) = container.send_to_server(data).await {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.core.scope.is_done()
    }

    /// Bytes observed by the send decision, dropped packets included.
    pub fn total_bytes(&self) -> u64 {
        self.core.total_bytes.load(Ordering::Relaxed)
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.core.server_addr
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.core.listen_addr
    }

    /// The fleet scope. Cancelling it tears down every session.
    pub fn scope(&self) -> CancelScope {
        self.core.scope.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PacketEvent;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::time::sleep;

    fn client_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 4000))
    }

    fn server_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 5000))
    }

    fn listen_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 6000))
    }

    /// Waits for its scope; never accepts anything.
    struct IdleListener;

    #[async_trait]
    impl ProxyListener for IdleListener {
        async fn run(&self, scope: CancelScope, _adder: Arc<dyn ConnectionAdder>) {
            scope.cancelled().await;
        }
    }

    /// Cancels with `ProxyRetry` on every run.
    struct RetryListener {
        runs: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ProxyListener for RetryListener {
        async fn run(&self, scope: CancelScope, _adder: Arc<dyn ConnectionAdder>) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            scope.cancel_with(ProxyError::ProxyRetry);
        }
    }

    /// Closes gracefully on first run.
    struct QuittingListener;

    #[async_trait]
    impl ProxyListener for QuittingListener {
        async fn run(&self, scope: CancelScope, _adder: Arc<dyn ConnectionAdder>) {
            scope.cancel_with(ProxyError::ProxyClosed);
        }
    }

    /// Returns without touching its scope, which is a listener bug.
    struct StallingListener;

    #[async_trait]
    impl ProxyListener for StallingListener {
        async fn run(&self, _scope: CancelScope, _adder: Arc<dyn ConnectionAdder>) {}
    }

    /// In-memory transport: records writes, exposes the event sender.
    struct MockTransport {
        client: SocketAddr,
        writes: Mutex<Vec<(bool, Vec<u8>)>>,
        events: Mutex<Option<mpsc::Sender<PacketEvent>>>,
        fail_init: bool,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                client: client_addr(),
                writes: Mutex::new(Vec::new()),
                events: Mutex::new(None),
                fail_init: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                client: client_addr(),
                writes: Mutex::new(Vec::new()),
                events: Mutex::new(None),
                fail_init: true,
            })
        }

        fn event_sender(&self) -> mpsc::Sender<PacketEvent> {
            self.events.lock().unwrap().clone().expect("init not called")
        }

        fn writes(&self) -> Vec<(bool, Vec<u8>)> {
            self.writes.lock().unwrap().clone()
        }

        async fn push(&self, serverbound: bool, data: &[u8]) {
            let (source, dest) = if serverbound {
                (client_addr(), server_addr())
            } else {
                (server_addr(), client_addr())
            };
            self.event_sender()
                .send(PacketEvent {
                    serverbound,
                    source,
                    dest,
                    data: data.to_vec(),
                })
                .await
                .expect("dispatcher gone");
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn init(&self, events: mpsc::Sender<PacketEvent>, _scope: CancelScope) -> Result<()> {
            if self.fail_init {
                return Err(ProxyError::AlreadyInitialized);
            }
            *self.events.lock().unwrap() = Some(events);
            Ok(())
        }

        async fn send_to_client(&self, data: &[u8]) -> std::io::Result<()> {
            self.writes.lock().unwrap().push((false, data.to_vec()));
            Ok(())
        }

        async fn send_to_server(&self, data: &[u8]) -> std::io::Result<()> {
            self.writes.lock().unwrap().push((true, data.to_vec()));
            Ok(())
        }

        fn client_addr(&self) -> SocketAddr {
            self.client
        }

        fn network(&self) -> Network {
            Network::Tcp
        }
    }

    struct AlwaysDrop;

    #[async_trait]
    impl PacketFilter for AlwaysDrop {
        async fn allow(&self, _pkt: &FanoutRecord) -> bool {
            false
        }
    }

    /// Drops everything while counting invocations.
    struct CountingDrop {
        calls: AtomicU32,
    }

    #[async_trait]
    impl PacketFilter for CountingDrop {
        async fn allow(&self, _pkt: &FanoutRecord) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    fn test_spawner() -> ProxySpawner {
        ProxySpawner::new(
            server_addr(),
            listen_addr(),
            vec![Arc::new(IdleListener) as Arc<dyn ProxyListener>],
        )
        .unwrap()
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn ids_are_monotonic_and_lookup_works() {
        let spawner = test_spawner();
        for expect in 0..5u32 {
            let pc = spawner.add_connection(MockTransport::new()).unwrap();
            assert_eq!(pc.id(), expect);
        }
        for id in 0..5u32 {
            assert_eq!(spawner.get_proxy(id).unwrap().id(), id);
        }
        assert!(matches!(
            spawner.get_proxy(99),
            Err(ProxyError::ProxyNotFound(99))
        ));
        spawner.close().await.unwrap();
    }

    #[tokio::test]
    async fn failed_container_still_consumes_id() {
        let spawner = test_spawner();
        assert!(spawner.add_connection(MockTransport::failing()).is_err());
        let pc = spawner.add_connection(MockTransport::new()).unwrap();
        assert_eq!(pc.id(), 1);
        spawner.close().await.unwrap();
    }

    #[tokio::test]
    async fn add_connection_fails_after_close() {
        let spawner = test_spawner();
        spawner.close().await.unwrap();
        assert!(matches!(
            spawner.add_connection(MockTransport::new()),
            Err(ProxyError::SpawnerGone(_))
        ));
    }

    #[tokio::test]
    async fn dispatch_forwards_and_counts() {
        let spawner = test_spawner();
        let mock = MockTransport::new();
        let pc = spawner.add_connection(Arc::clone(&mock) as Arc<dyn Transport>).unwrap();

        mock.push(true, b"ping").await;
        mock.push(false, b"pong!").await;
        eventually(|| mock.writes().len() == 2).await;

        assert_eq!(mock.writes(), vec![(true, b"ping".to_vec()), (false, b"pong!".to_vec())]);
        assert_eq!(pc.bytes_sent(), 9);
        assert_eq!(spawner.total_bytes(), 9);
        spawner.close().await.unwrap();
    }

    #[tokio::test]
    async fn filter_slot_is_exclusive_until_released() {
        let spawner = test_spawner();
        let holder = CancelScope::new();
        spawner
            .try_install_filter(Arc::new(AlwaysDrop), &holder)
            .unwrap();
        assert!(matches!(
            spawner.try_install_filter(Arc::new(AlwaysDrop), &CancelScope::new()),
            Err(ProxyError::FilterInstalled)
        ));

        holder.cancel();
        spawner
            .try_install_filter(Arc::new(AlwaysDrop), &CancelScope::new())
            .unwrap();
        spawner.close().await.unwrap();
    }

    #[tokio::test]
    async fn drop_vote_blocks_peer_traffic() {
        let spawner = test_spawner();
        let mock = MockTransport::new();
        let pc = spawner.add_connection(Arc::clone(&mock) as Arc<dyn Transport>).unwrap();

        let holder = CancelScope::new();
        spawner
            .try_install_filter(Arc::new(AlwaysDrop), &holder)
            .unwrap();

        mock.push(true, b"blocked").await;
        // Give the dispatcher a chance to mishandle it.
        sleep(Duration::from_millis(50)).await;
        assert!(mock.writes().is_empty());
        assert_eq!(pc.bytes_sent(), 0);
        // Dropped bytes still count as observed throughput.
        assert_eq!(spawner.total_bytes(), 7);
        spawner.close().await.unwrap();
    }

    #[tokio::test]
    async fn injected_packets_bypass_drop() {
        let spawner = test_spawner();
        let mock = MockTransport::new();
        let pc = spawner.add_connection(Arc::clone(&mock) as Arc<dyn Transport>).unwrap();

        let filter = Arc::new(CountingDrop {
            calls: AtomicU32::new(0),
        });
        spawner
            .try_install_filter(Arc::clone(&filter) as Arc<dyn PacketFilter>, &CancelScope::new())
            .unwrap();

        pc.send_to_server(b"\x01").await.unwrap();
        assert_eq!(mock.writes(), vec![(true, vec![1u8])]);
        assert_eq!(pc.bytes_sent(), 1);
        // The filter still saw the packet, its vote just had no effect.
        assert_eq!(filter.calls.load(Ordering::SeqCst), 1);
        spawner.close().await.unwrap();
    }

    #[tokio::test]
    async fn subscriptions_observe_in_order() {
        let spawner = test_spawner();
        let mock = MockTransport::new();
        spawner.add_connection(Arc::clone(&mock) as Arc<dyn Transport>).unwrap();

        let parent = CancelScope::new();
        let (mut rx_a, _scope_a) = spawner.subscribe(&parent);
        let (mut rx_b, _scope_b) = spawner.subscribe(&parent);

        mock.push(true, b"p1").await;
        mock.push(true, b"p2").await;
        mock.push(true, b"p3").await;

        for rx in [&mut rx_a, &mut rx_b] {
            for expect in [b"p1", b"p2", b"p3"] {
                let record = timeout(Duration::from_secs(1), rx.recv())
                    .await
                    .expect("record in time")
                    .expect("channel open");
                assert_eq!(&*record.data, expect.as_slice());
                assert_eq!(record.source, client_addr());
                assert_eq!(record.dest, server_addr());
                assert!(record.flags.is_serverbound());
            }
        }
        spawner.close().await.unwrap();
    }

    #[tokio::test]
    async fn full_subscription_loses_records_without_stalling() {
        let spawner = test_spawner();
        let mock = MockTransport::new();
        spawner.add_connection(Arc::clone(&mock) as Arc<dyn Transport>).unwrap();

        let parent = CancelScope::new();
        let (mut rx, _scope) = spawner.subscribe(&parent);

        let total = SUBSCRIPTION_QUEUE + 8;
        for _ in 0..total {
            mock.push(true, b"x").await;
        }
        eventually(|| mock.writes().len() == total).await;

        // Forwarding never stalled; the subscriber lost the overflow.
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIPTION_QUEUE);
        spawner.close().await.unwrap();
    }

    #[tokio::test]
    async fn pruner_evicts_dead_sessions_and_subscriptions() {
        let spawner = test_spawner();
        let pc = spawner.add_connection(MockTransport::new()).unwrap();
        let sub_parent = CancelScope::new();
        let (_rx, sub_scope) = spawner.subscribe(&sub_parent);

        spawner.close_proxy(pc.id()).unwrap();
        sub_scope.cancel();
        assert!(!pc.is_alive());

        spawner.core.prune();
        assert!(matches!(
            spawner.get_proxy(pc.id()),
            Err(ProxyError::ProxyNotFound(_))
        ));
        assert!(spawner.core.subscriptions.lock().unwrap().is_empty());

        // Pruned ids are never reused.
        let next = spawner.add_connection(MockTransport::new()).unwrap();
        assert_eq!(next.id(), 1);
        spawner.close().await.unwrap();
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_closes_the_fleet() {
        let runs = Arc::new(AtomicU32::new(0));
        let spawner = ProxySpawner::new(
            server_addr(),
            listen_addr(),
            vec![Arc::new(RetryListener { runs: Arc::clone(&runs) }) as Arc<dyn ProxyListener>],
        )
        .unwrap();

        timeout(Duration::from_secs(1), spawner.scope().cancelled())
            .await
            .expect("spawner should cancel itself");
        // Initial run plus the full retry budget.
        assert_eq!(runs.load(Ordering::SeqCst), MAX_LISTENER_RETRIES + 1);
        assert!(spawner.scope().cause_matches::<ProxyError, _>(|e| {
            matches!(e, ProxyError::ProxyMaxRetries)
        }));
    }

    #[tokio::test]
    async fn listener_close_is_not_fleet_fatal() {
        let spawner = ProxySpawner::new(
            server_addr(),
            listen_addr(),
            vec![Arc::new(QuittingListener) as Arc<dyn ProxyListener>],
        )
        .unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(spawner.is_alive());
        spawner.close().await.unwrap();
    }

    #[tokio::test]
    async fn stalling_listener_closes_the_fleet() {
        let spawner = ProxySpawner::new(
            server_addr(),
            listen_addr(),
            vec![Arc::new(StallingListener) as Arc<dyn ProxyListener>],
        )
        .unwrap();
        timeout(Duration::from_secs(1), spawner.scope().cancelled())
            .await
            .expect("spawner should cancel itself");
        assert!(spawner.scope().cause_matches::<ProxyError, _>(|e| {
            matches!(e, ProxyError::ListenerStalled)
        }));
    }

    #[tokio::test]
    async fn constructor_validation() {
        assert!(matches!(
            ProxySpawner::new(server_addr(), listen_addr(), vec![]),
            Err(ProxyError::NoListeners)
        ));
        assert!(matches!(
            ProxySpawner::new(
                server_addr(),
                server_addr(),
                vec![Arc::new(IdleListener) as Arc<dyn ProxyListener>],
            ),
            Err(ProxyError::AddrConflict)
        ));
    }

    #[tokio::test]
    async fn error_sink_sees_surfaced_errors() {
        let spawner = test_spawner();
        let seen = Arc::new(AtomicU32::new(0));
        let seen_clone = Arc::clone(&seen);
        spawner.set_error_sink(Box::new(move |_err, _pc| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(spawner.add_connection(MockTransport::failing()).is_err());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        spawner.close().await.unwrap();
    }
}
