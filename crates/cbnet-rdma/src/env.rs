//! The environment: device, event channel, dispatcher thread, workers and
//! the server registry.
//!
//! An [`Environment`] is constructed explicitly and owned by the caller;
//! every public operation goes through it. Dropping it (or calling
//! [`Environment::destroy`]) stops the dispatcher and releases every
//! transport resource it created.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cbnet_config::{Config, ConfigManager};
use cbnet_logging::{install_sink, uninstall_sink, LogControl, LogLevel, SinkLayer};
use cbnet_types::{Address, DescriptorAllocator, NetworkDescriptor, Role, WorkerId};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::buf::{BufferSpec, ConnBuffers};
use crate::config::EnvConfig;
use crate::connection::{ConnCounters, ConnRef, ConnState, Connection};
use crate::device::OwnedDevice;
use crate::error::{RdmaError, Result};
use crate::fabric::{CmId, Fabric, OwnedChannel, OwnedCmId};
use crate::hooks::{AcceptCallback, Hooks, UserContext};
use crate::listener::Server;
use crate::worker::{MapKind, Worker};

/// Result of a `close`. Closing an entity that is already gone is not an
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// A server was unregistered and its listening identity destroyed.
    Closed,
    /// Connection teardown started; it completes asynchronously.
    Closing,
    AlreadyClosed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnvMetrics {
    pub server_count: usize,
    pub worker_count: usize,
    pub qp_count: u64,
}

/// What a connection-manager identity belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    Connection(NetworkDescriptor),
    Listener(NetworkDescriptor),
}

pub(crate) struct Shared {
    pub(crate) fabric: Arc<dyn Fabric>,
    pub(crate) config: ConfigManager<EnvConfig>,
    pub(crate) hooks: Hooks,
    pub(crate) log: Arc<LogControl>,
    pub(crate) allocator: DescriptorAllocator,
    pub(crate) routes: DashMap<CmId, Route>,
    shutting_down: AtomicBool,
    servers: Mutex<Vec<Arc<Server>>>,
    pub(crate) workers: Vec<Arc<Worker>>,
    pub(crate) channel: OwnedChannel,
    device: Arc<OwnedDevice>,
}

impl Shared {
    pub(crate) fn worker(&self, id: WorkerId) -> Option<&Arc<Worker>> {
        self.workers.get(id.index())
    }

    pub(crate) fn find_server(&self, nd: NetworkDescriptor) -> Option<Arc<Server>> {
        self.servers.lock().iter().find(|s| s.nd() == nd).cloned()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(RdmaError::ShuttingDown);
        }
        Ok(())
    }

    fn lookup(&self, nd: NetworkDescriptor) -> Option<Arc<Connection>> {
        if !nd.role().is_connection() {
            return None;
        }
        self.worker(nd.worker())?.lookup(nd)
    }
}

pub struct Environment {
    pub(crate) shared: Arc<Shared>,
    dispatcher: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment").finish_non_exhaustive()
    }
}

impl Environment {
    pub fn init(fabric: Arc<dyn Fabric>, config: EnvConfig, hooks: Hooks) -> Result<Self> {
        Self::init_with_manager(fabric, ConfigManager::new(config), hooks)
    }

    /// Bring the environment up. On failure everything acquired so far is
    /// released before returning. The log sink is published globally only
    /// once every fallible step has succeeded.
    pub fn init_with_manager(
        fabric: Arc<dyn Fabric>,
        config: ConfigManager<EnvConfig>,
        hooks: Hooks,
    ) -> Result<Self> {
        let snapshot = config.snapshot();
        snapshot.validate()?;
        let ip = snapshot.local_ipv4()?;

        let log = Arc::new(LogControl::new(snapshot.log_level, hooks.log_handler()));
        let device = Arc::new(OwnedDevice::open_for_ip(Arc::clone(&fabric), ip)?);
        let channel = OwnedChannel::create(Arc::clone(&fabric))?;
        let workers = (0..snapshot.worker_num)
            .map(|i| {
                Worker::init(
                    WorkerId(i as u16),
                    Arc::clone(&fabric),
                    Arc::clone(&device),
                    snapshot.cq_depth,
                )
                .map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;

        let shared = Arc::new(Shared {
            fabric,
            config,
            hooks,
            log,
            allocator: DescriptorAllocator::new(snapshot.worker_num),
            routes: DashMap::new(),
            shutting_down: AtomicBool::new(false),
            servers: Mutex::new(Vec::new()),
            workers,
            channel,
            device,
        });

        let dispatcher = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("cbnet-cm".into())
                .spawn(move || shared.run())
                .map_err(|e| RdmaError::transport("spawn dispatcher", e.to_string()))?
        };

        if shared.log.has_handler() {
            if let Err(e) = install_sink(Arc::clone(&shared.log)) {
                debug!(error = %e, "log sink not installed globally, host owns the subscriber");
            }
        }
        info!(
            local_ip = %ip,
            device = %shared.device.name(),
            workers = snapshot.worker_num,
            "environment initialized"
        );
        Ok(Self {
            shared,
            dispatcher: Some(dispatcher),
        })
    }

    /// Stop the dispatcher and release every resource. Connections still
    /// registered are dropped without callbacks.
    pub fn destroy(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(dispatcher) = self.dispatcher.take() else {
            return;
        };
        self.shared.shutting_down.store(true, Ordering::Release);
        self.shared.channel.destroy();
        if dispatcher.join().is_err() {
            error!("dispatcher thread panicked");
        }
        let servers = std::mem::take(&mut *self.shared.servers.lock());
        drop(servers);
        self.shared.routes.clear();
        let mut dropped = 0;
        for worker in &self.shared.workers {
            dropped += worker.drain().len();
        }
        info!(dropped_connections = dropped, "environment destroyed");
        uninstall_sink(&self.shared.log);
    }

    /// Start listening on `ip:port`. Accepted connections register
    /// `defaults` receive buffers and are reported through `accept_cb` once
    /// established.
    pub fn listen(
        &self,
        ip: &str,
        port: u16,
        defaults: BufferSpec,
        accept_cb: Option<AcceptCallback>,
        context: Option<UserContext>,
    ) -> Result<NetworkDescriptor> {
        self.shared.ensure_running()?;
        defaults.validate()?;
        let addr = Address::parse_ip(ip, port)?;
        let nd = self.shared.allocator.allocate(Role::Server);
        let worker = self
            .shared
            .worker(nd.worker())
            .cloned()
            .ok_or(RdmaError::NoSuchWorker(nd.worker()))?;

        let server = Arc::new(Server::open(
            nd,
            addr,
            defaults,
            accept_cb,
            context,
            Arc::clone(&self.shared.fabric),
            self.shared.channel.handle(),
            worker,
        )?);
        let listen_id = server.listen_id();
        self.shared.routes.insert(listen_id, Route::Listener(nd));
        self.shared.servers.lock().push(Arc::clone(&server));

        let backlog = self.shared.config.get().listen_backlog;
        if let Err(e) = server.start(backlog) {
            self.shared.servers.lock().retain(|s| s.nd() != nd);
            self.shared.routes.remove(&listen_id);
            return Err(e);
        }
        Ok(nd)
    }

    /// Open a connection to `ip:port`, blocking until it is established,
    /// fails, or `deadline` passes. A zero deadline uses the configured
    /// connect timeout; one too large to represent never expires.
    pub fn connect(
        &self,
        ip: &str,
        port: u16,
        spec: BufferSpec,
        deadline: Duration,
        context: Option<UserContext>,
    ) -> Result<NetworkDescriptor> {
        self.shared.ensure_running()?;
        spec.validate()?;
        let addr = Address::parse_ip(ip, port)?;
        let (conn_timeout, resolve_timeout) = {
            let config = self.shared.config.get();
            (config.conn_timeout(), config.resolve_timeout())
        };
        let wait = if deadline.is_zero() {
            conn_timeout
        } else {
            deadline
        };
        let start = Instant::now();

        let fabric = &self.shared.fabric;
        let nd = self.shared.allocator.allocate(Role::Active);
        let worker = self
            .shared
            .worker(nd.worker())
            .cloned()
            .ok_or(RdmaError::NoSuchWorker(nd.worker()))?;
        let buffers = ConnBuffers::register(fabric, worker.pd(), spec)?;
        let cm_id = OwnedCmId::create(Arc::clone(fabric), self.shared.channel.handle())?;
        let id = cm_id.id();
        let conn = Connection::new(
            nd,
            cm_id,
            Arc::clone(&worker),
            None,
            buffers,
            Some(addr),
            context,
        );

        self.shared.routes.insert(id, Route::Connection(nd));
        worker.add(Arc::clone(&conn), MapKind::Live);
        if let Err(e) = fabric.resolve_addr(id, addr, resolve_timeout) {
            worker.remove(nd, MapKind::Live);
            self.shared.routes.remove(&id);
            return Err(e);
        }
        debug!(%nd, %addr, "connect started");

        let slice = worker
            .is_poller_thread()
            .then_some(Duration::from_millis(1));
        match conn.wait_connected(start.checked_add(wait), slice) {
            ConnState::Connected => {
                info!(%nd, %addr, "connected");
                Ok(nd)
            }
            ConnState::Connecting => {
                self.shared.close_connection(&conn);
                Err(RdmaError::ConnectTimeout {
                    nd,
                    waited_ms: start.elapsed().as_millis() as u64,
                })
            }
            state => {
                self.shared.close_connection(&conn);
                Err(RdmaError::ConnectFailed { nd, state })
            }
        }
    }

    /// Close a server or a connection. Idempotent.
    pub fn close(&self, nd: NetworkDescriptor) -> CloseOutcome {
        if nd.role().is_server() {
            return self.close_server(nd);
        }
        let conn = self
            .shared
            .worker(nd.worker())
            .and_then(|w| w.lookup_any(nd));
        match conn {
            Some(conn) => self.shared.close_connection(&conn),
            None => CloseOutcome::AlreadyClosed,
        }
    }

    /// `close` for a raw 64-bit descriptor.
    pub fn close_raw(&self, raw: u64) -> Result<CloseOutcome> {
        Ok(self.close(NetworkDescriptor::decode(raw)?))
    }

    /// Unregister a server and destroy its listening identity. Connections
    /// it accepted are left alone.
    fn close_server(&self, nd: NetworkDescriptor) -> CloseOutcome {
        let server = {
            let mut servers = self.shared.servers.lock();
            let pos = servers.iter().position(|s| s.nd() == nd);
            pos.map(|i| servers.remove(i))
        };
        let Some(server) = server else {
            return CloseOutcome::AlreadyClosed;
        };
        self.shared.routes.remove(&server.listen_id());
        CloseOutcome::Closed
    }

    /// Resolve a descriptor to a counted connection reference. Only live
    /// connections resolve; `None` means the connection is gone or closing.
    pub fn resolve(&self, nd: NetworkDescriptor) -> Option<ConnRef> {
        self.shared.lookup(nd).map(ConnRef::new)
    }

    pub fn set_user_context(&self, nd: NetworkDescriptor, ctx: Option<UserContext>) -> bool {
        match self.shared.lookup(nd) {
            Some(conn) => {
                conn.set_user_context(ctx);
                true
            }
            None => false,
        }
    }

    pub fn connection_counters(&self, nd: NetworkDescriptor) -> Option<ConnCounters> {
        self.shared.lookup(nd).map(|conn| conn.counters())
    }

    /// Counter feed for the completion poller. Returns `false` once the
    /// connection is no longer live.
    pub fn update_counters(&self, nd: NetworkDescriptor, f: impl FnOnce(&mut ConnCounters)) -> bool {
        match self.shared.lookup(nd) {
            Some(conn) => {
                conn.update_counters(f);
                true
            }
            None => false,
        }
    }

    /// Deliver the error hook for `nd`. Returns `false` for an unknown
    /// descriptor.
    pub fn report_error(&self, nd: NetworkDescriptor) -> bool {
        let conn = self
            .shared
            .worker(nd.worker())
            .and_then(|w| w.lookup_any(nd));
        match conn {
            Some(conn) => {
                self.shared.hooks.error(nd, conn.user_context());
                true
            }
            None => false,
        }
    }

    /// Record the calling thread as the completion poller of `worker`.
    pub fn bind_poller(&self, worker: WorkerId) -> Result<()> {
        self.shared
            .worker(worker)
            .ok_or(RdmaError::NoSuchWorker(worker))?
            .bind_poller();
        Ok(())
    }

    /// Finalize every connection whose close started more than `threshold`
    /// ago. Returns how many were finalized.
    pub fn reap_stalled(&self, threshold: Duration) -> usize {
        self.shared.reap(threshold)
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.shared.log.set_level(level);
    }

    pub fn log_level(&self) -> LogLevel {
        self.shared.log.level()
    }

    /// A layer forwarding records to the configured log sink, for hosts
    /// that own the global subscriber.
    pub fn log_layer(&self) -> SinkLayer {
        SinkLayer::new(Arc::clone(&self.shared.log))
    }

    pub fn metrics(&self) -> EnvMetrics {
        EnvMetrics {
            server_count: self.shared.servers.lock().len(),
            worker_count: self.shared.workers.len(),
            qp_count: self.shared.workers.iter().map(|w| w.qp_count()).sum(),
        }
    }

    pub fn config(&self) -> EnvConfig {
        self.shared.config.snapshot()
    }

    /// Apply the hot-updatable fields of `fresh`.
    pub fn apply_config(&self, fresh: &EnvConfig) -> Result<()> {
        let mut next = self.shared.config.snapshot();
        next.hot_update(fresh);
        self.shared.config.update(next)?;
        self.sync_log_level();
        Ok(())
    }

    /// Re-read the backing config file. Returns `false` when there is none.
    pub fn reload_config(&self) -> Result<bool> {
        let reloaded = self.shared.config.reload()?;
        if reloaded {
            self.sync_log_level();
        }
        Ok(reloaded)
    }

    fn sync_log_level(&self) {
        let level = self.shared.config.get().log_level;
        self.shared.log.set_level(level);
    }

    pub fn worker(&self, id: WorkerId) -> Option<&Arc<Worker>> {
        self.shared.worker(id)
    }

    pub fn server(&self, nd: NetworkDescriptor) -> Option<Arc<Server>> {
        self.shared.find_server(nd)
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::MemoryClass;
    use crate::fabric::loopback::{LoopbackFabric, LoopbackStats, WorkKind};
    use crate::fabric::CmEventKind;
    use crate::hooks::accept_callback;
    use std::net::Ipv4Addr;
    use tracing_subscriber::layer::SubscriberExt;

    type Seen = Arc<Mutex<Vec<NetworkDescriptor>>>;

    struct Recorder {
        disconnected: Seen,
        closed: Seen,
        errors: Seen,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                disconnected: Arc::default(),
                closed: Arc::default(),
                errors: Arc::default(),
            }
        }

        fn hooks(&self) -> Hooks {
            let disconnected = Arc::clone(&self.disconnected);
            let closed = Arc::clone(&self.closed);
            let errors = Arc::clone(&self.errors);
            Hooks::new()
                .on_disconnected(move |nd, _| disconnected.lock().push(nd))
                .on_closed(move |nd, _| closed.lock().push(nd))
                .on_error(move |nd, _| errors.lock().push(nd))
        }

        fn count(seen: &Seen, nd: NetworkDescriptor) -> usize {
            seen.lock().iter().filter(|x| **x == nd).count()
        }
    }

    fn spec() -> BufferSpec {
        BufferSpec::new(64, 4, MemoryClass::Normal)
    }

    fn start(hooks: Hooks) -> (Arc<LoopbackFabric>, Environment) {
        let loopback = LoopbackFabric::with_host(Ipv4Addr::LOCALHOST, "lo0");
        let env = Environment::init(loopback.clone(), EnvConfig::default(), hooks).unwrap();
        (loopback, env)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Listen and connect to self; returns (server, active, passive).
    fn pair(env: &Environment, port: u16) -> (NetworkDescriptor, NetworkDescriptor, NetworkDescriptor) {
        let server = env.listen("127.0.0.1", port, spec(), None, None).unwrap();
        let active = env
            .connect("127.0.0.1", port, spec(), Duration::from_secs(5), None)
            .unwrap();
        let passive = env.server(server).unwrap().accepted()[0];
        (server, active, passive)
    }

    #[test]
    fn test_self_connect_and_close() {
        let recorder = Recorder::new();
        let (loopback, env) = start(recorder.hooks());
        let (server, active, passive) = pair(&env, 7100);
        assert_eq!(active.role(), Role::Active);
        assert_eq!(passive.role(), Role::Passive);
        assert_eq!(passive.worker(), server.worker());

        let conn = env.resolve(active).unwrap();
        assert_eq!(conn.state(), ConnState::Connected);
        assert_eq!(conn.peer(), Some(Address::from_octets(127, 0, 0, 1, 7100)));
        let peer = env.resolve(passive).unwrap();
        assert_eq!(peer.state(), ConnState::Connected);
        assert_eq!(env.metrics().qp_count, 2);

        // Control receive posted before the handshake, control send after.
        let qp = conn.qp().unwrap();
        let kinds: Vec<_> = loopback.work_log(qp).iter().map(|w| w.kind).collect();
        assert_eq!(kinds, vec![WorkKind::Recv, WorkKind::Send]);
        drop(conn);
        drop(peer);

        assert_eq!(env.close(active), CloseOutcome::Closing);
        wait_until(|| Recorder::count(&recorder.closed, active) == 1);
        wait_until(|| Recorder::count(&recorder.disconnected, passive) == 1);
        assert_eq!(env.close(passive), CloseOutcome::Closing);
        wait_until(|| Recorder::count(&recorder.closed, passive) == 1);

        assert_eq!(Recorder::count(&recorder.disconnected, active), 1);
        assert_eq!(env.server(server).unwrap().accepted_count(), 0);
        wait_until(|| env.metrics().qp_count == 0);
        assert_eq!(env.close(active), CloseOutcome::AlreadyClosed);

        env.destroy();
        assert_eq!(loopback.stats(), LoopbackStats::default());
    }

    #[test]
    fn test_listen_rejects_small_buffers() {
        let (_loopback, env) = start(Hooks::new());
        let err = env
            .listen("127.0.0.1", 7101, BufferSpec::new(63, 4, MemoryClass::Normal), None, None)
            .unwrap_err();
        assert!(matches!(err, RdmaError::BlockSizeTooSmall { size: 63, .. }));
        let err = env
            .listen("127.0.0.1", 7101, BufferSpec::new(64, 3, MemoryClass::Normal), None, None)
            .unwrap_err();
        assert!(matches!(err, RdmaError::BlockCountTooSmall { count: 3, .. }));
        assert_eq!(env.metrics().server_count, 0);
    }

    #[test]
    fn test_listen_rejects_bad_ip_and_busy_port() {
        let (loopback, env) = start(Hooks::new());
        let err = env.listen("300.1.1.1", 7102, spec(), None, None).unwrap_err();
        assert!(matches!(err, RdmaError::InvalidAddress(_)));

        let ids = loopback.stats().ids;
        env.listen("127.0.0.1", 7102, spec(), None, None).unwrap();
        assert!(env.listen("127.0.0.1", 7102, spec(), None, None).is_err());
        assert_eq!(env.metrics().server_count, 1);
        assert_eq!(loopback.stats().ids, ids + 1);
    }

    #[test]
    fn test_connect_timeout_against_silent_host() {
        let recorder = Recorder::new();
        let (loopback, env) = start(recorder.hooks());
        loopback.set_silent(Ipv4Addr::new(10, 0, 0, 9));
        let started = Instant::now();
        let err = env
            .connect("10.0.0.9", 7103, spec(), Duration::from_millis(50), None)
            .unwrap_err();
        let elapsed = started.elapsed();
        let (nd, waited_ms) = match err {
            RdmaError::ConnectTimeout { nd, waited_ms } => (nd, waited_ms),
            other => panic!("expected timeout, got {other}"),
        };
        assert!(waited_ms >= 50);
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(1050));

        let worker = env.worker(nd.worker()).unwrap();
        assert!(worker.contains(nd).is_none());
        assert_eq!(Recorder::count(&recorder.disconnected, nd), 1);
        assert_eq!(Recorder::count(&recorder.closed, nd), 1);
        assert_eq!(loopback.stats().mrs, 0);
    }

    #[test]
    fn test_connect_refused_without_listener() {
        let recorder = Recorder::new();
        let (loopback, env) = start(recorder.hooks());
        let err = env
            .connect("127.0.0.1", 7104, spec(), Duration::from_secs(5), None)
            .unwrap_err();
        let (nd, state) = match err {
            RdmaError::ConnectFailed { nd, state } => (nd, state),
            other => panic!("expected refusal, got {other}"),
        };
        assert_eq!(state, ConnState::Disconnected);
        assert_eq!(Recorder::count(&recorder.closed, nd), 1);
        assert_eq!(env.worker(nd.worker()).unwrap().live_count(), 0);
        wait_until(|| Recorder::count(&recorder.disconnected, nd) == 1);
        wait_until(|| loopback.stats().qps == 0);
        assert_eq!(Recorder::count(&recorder.disconnected, nd), 1);
    }

    #[test]
    fn test_connect_unknown_host_fails() {
        let (_loopback, env) = start(Hooks::new());
        let err = env
            .connect("10.7.7.7", 7105, spec(), Duration::from_secs(5), None)
            .unwrap_err();
        assert!(matches!(err, RdmaError::ConnectFailed { .. }));
    }

    #[test]
    fn test_close_races_disconnect_events() {
        let recorder = Recorder::new();
        let (loopback, env) = start(recorder.hooks());
        let (_server, active, _passive) = pair(&env, 7106);
        let id = env.resolve(active).unwrap().cm_id();

        std::thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..3 {
                    env.close(active);
                }
            });
            for _ in 0..3 {
                loopback.inject(id, CmEventKind::Disconnected);
            }
        });

        wait_until(|| Recorder::count(&recorder.closed, active) == 1);
        assert_eq!(Recorder::count(&recorder.disconnected, active), 1);
        assert!(env.resolve(active).is_none());
    }

    #[test]
    fn test_connection_never_in_both_maps() {
        let (_loopback, env) = start(Hooks::new());
        let (_server, active, _passive) = pair(&env, 7107);
        let worker = Arc::clone(env.worker(active.worker()).unwrap());
        std::thread::scope(|s| {
            let closer = s.spawn(|| env.close(active));
            for _ in 0..1000 {
                let maps = worker.maps();
                let live = maps.live.contains_key(&active);
                let closing = maps.closing.contains_key(&active);
                assert!(!(live && closing));
            }
            assert_eq!(closer.join().unwrap(), CloseOutcome::Closing);
        });
        assert!(!matches!(worker.contains(active), Some(MapKind::Live)));
    }

    #[test]
    fn test_held_reference_outlives_finalize() {
        let recorder = Recorder::new();
        let (loopback, env) = start(recorder.hooks());
        let (_server, active, _passive) = pair(&env, 7108);
        let held = env.resolve(active).unwrap();
        env.close(active);
        wait_until(|| Recorder::count(&recorder.closed, active) == 1);

        assert_eq!(held.state(), ConnState::Closed);
        assert!(env.resolve(active).is_none());
        assert_eq!(held.buffers().data_blocks().len(), 4);
        wait_until(|| held.ref_count() == 1);
        let qps = loopback.stats().qps;
        drop(held);
        assert_eq!(loopback.stats().qps, qps - 1);
    }

    #[test]
    fn test_accept_callback_sets_context() {
        let (_loopback, env) = start(Hooks::new());
        let cb = accept_callback(|_nd, ctx| {
            let base = ctx.and_then(|c| c.downcast_ref::<u32>().copied()).unwrap_or(0);
            Some(Arc::new(base + 1) as UserContext)
        });
        let server = env
            .listen("127.0.0.1", 7109, spec(), Some(cb), Some(Arc::new(41u32) as UserContext))
            .unwrap();
        env.connect("127.0.0.1", 7109, spec(), Duration::ZERO, None)
            .unwrap();
        let passive = env.server(server).unwrap().accepted()[0];
        let ctx = env.resolve(passive).unwrap().user_context().unwrap();
        assert_eq!(ctx.downcast_ref::<u32>(), Some(&42));
    }

    #[test]
    fn test_failed_accept_rejects_and_releases() {
        let (loopback, env) = start(Hooks::new());
        let server = env.listen("127.0.0.1", 7110, spec(), None, None).unwrap();
        loopback.fail_accept(true);
        let err = env
            .connect("127.0.0.1", 7110, spec(), Duration::from_secs(5), None)
            .unwrap_err();
        assert!(matches!(err, RdmaError::ConnectFailed { .. }));
        assert_eq!(env.server(server).unwrap().accepted_count(), 0);
        wait_until(|| loopback.stats().qps == 0 && loopback.stats().mrs == 0);

        loopback.fail_accept(false);
        env.connect("127.0.0.1", 7110, spec(), Duration::from_secs(5), None)
            .unwrap();
        assert_eq!(env.server(server).unwrap().accepted_count(), 1);
    }

    #[test]
    fn test_failed_qp_creation_fails_connect() {
        let recorder = Recorder::new();
        let (loopback, env) = start(recorder.hooks());
        env.listen("127.0.0.1", 7111, spec(), None, None).unwrap();
        loopback.fail_create_qp(true);
        let err = env
            .connect("127.0.0.1", 7111, spec(), Duration::from_secs(5), None)
            .unwrap_err();
        let nd = match err {
            RdmaError::ConnectFailed { nd, .. } => nd,
            other => panic!("expected failure, got {other}"),
        };
        wait_until(|| Recorder::count(&recorder.disconnected, nd) == 1);
    }

    /// The listener rejects after the active side has registered its
    /// buffers and created its queue pair; everything is released and the
    /// listener keeps accepting.
    fn assert_accept_failure_recovers(
        loopback: &LoopbackFabric,
        env: &Environment,
        server: NetworkDescriptor,
        port: u16,
    ) {
        let err = env
            .connect("127.0.0.1", port, spec(), Duration::from_secs(5), None)
            .unwrap_err();
        assert!(matches!(err, RdmaError::ConnectFailed { .. }), "{err}");
        assert_eq!(env.server(server).unwrap().accepted_count(), 0);
        wait_until(|| loopback.stats().qps == 0 && loopback.stats().mrs == 0);
        assert_eq!(env.metrics().qp_count, 0);
    }

    #[test]
    fn test_accept_registration_failure_rejects() {
        let (loopback, env) = start(Hooks::new());
        let server = env.listen("127.0.0.1", 7122, spec(), None, None).unwrap();
        let active_regions = spec().block_count as usize + 2;
        loopback.fail_reg_mr_after(active_regions);
        assert_accept_failure_recovers(&loopback, &env, server, 7122);

        loopback.clear_reg_mr_fault();
        env.connect("127.0.0.1", 7122, spec(), Duration::from_secs(5), None)
            .unwrap();
        assert_eq!(env.server(server).unwrap().accepted_count(), 1);
    }

    #[test]
    fn test_accept_qp_creation_failure_rejects() {
        let (loopback, env) = start(Hooks::new());
        let server = env.listen("127.0.0.1", 7123, spec(), None, None).unwrap();
        loopback.fail_create_qp_after(1);
        assert_accept_failure_recovers(&loopback, &env, server, 7123);

        loopback.fail_create_qp(false);
        env.connect("127.0.0.1", 7123, spec(), Duration::from_secs(5), None)
            .unwrap();
        assert_eq!(env.server(server).unwrap().accepted_count(), 1);
    }

    #[test]
    fn test_connect_with_unbounded_deadline() {
        let (_loopback, env) = start(Hooks::new());
        env.listen("127.0.0.1", 7124, spec(), None, None).unwrap();
        let nd = env
            .connect("127.0.0.1", 7124, spec(), Duration::MAX, None)
            .unwrap();
        assert_eq!(env.resolve(nd).unwrap().state(), ConnState::Connected);

        let err = env
            .connect("127.0.0.1", 7125, spec(), Duration::MAX, None)
            .unwrap_err();
        let nd = match err {
            RdmaError::ConnectFailed { nd, .. } => nd,
            other => panic!("expected refusal, got {other}"),
        };
        assert!(env.worker(nd.worker()).unwrap().contains(nd).is_none());
    }

    #[test]
    fn test_update_counters_closure_may_reenter() {
        let (_loopback, env) = start(Hooks::new());
        let (_server, active, _passive) = pair(&env, 7126);
        env.update_counters(active, |c| c.posted_sends = 7);
        assert!(env.update_counters(active, |c| {
            let seen = env.connection_counters(active).unwrap();
            c.acked_sends = seen.posted_sends;
        }));
        assert_eq!(env.connection_counters(active).unwrap().acked_sends, 7);
    }

    #[test]
    fn test_counters_context_and_errors() {
        let recorder = Recorder::new();
        let (_loopback, env) = start(recorder.hooks());
        let (_server, active, _passive) = pair(&env, 7112);

        assert!(env.update_counters(active, |c| {
            c.posted_sends = 5;
            c.local_send_window = 16;
        }));
        let counters = env.connection_counters(active).unwrap();
        assert_eq!(counters.posted_sends, 5);
        assert_eq!(counters.local_send_window, 16);

        assert!(env.set_user_context(active, Some(Arc::new("ctx") as UserContext)));
        let ctx = env.resolve(active).unwrap().user_context().unwrap();
        assert_eq!(ctx.downcast_ref::<&str>(), Some(&"ctx"));

        assert!(env.report_error(active));
        assert_eq!(Recorder::count(&recorder.errors, active), 1);

        env.close(active);
        wait_until(|| Recorder::count(&recorder.closed, active) == 1);
        assert!(env.connection_counters(active).is_none());
        assert!(!env.update_counters(active, |c| c.received += 1));
        assert!(!env.set_user_context(active, None));
        assert!(!env.report_error(active));
    }

    #[test]
    fn test_close_server() {
        let (loopback, env) = start(Hooks::new());
        let ids = loopback.stats().ids;
        let server = env.listen("0.0.0.0", 7113, spec(), None, None).unwrap();
        assert_eq!(env.metrics().server_count, 1);
        assert_eq!(env.close(server), CloseOutcome::Closed);
        assert_eq!(env.close(server), CloseOutcome::AlreadyClosed);
        assert_eq!(env.metrics().server_count, 0);
        assert_eq!(loopback.stats().ids, ids);
        let err = env
            .connect("127.0.0.1", 7113, spec(), Duration::from_secs(5), None)
            .unwrap_err();
        assert!(matches!(err, RdmaError::ConnectFailed { .. }));
    }

    #[test]
    fn test_accepted_connection_survives_server_close() {
        let (_loopback, env) = start(Hooks::new());
        let (server, active, passive) = pair(&env, 7114);
        env.close(server);
        assert_eq!(env.resolve(passive).unwrap().state(), ConnState::Connected);
        assert_eq!(env.resolve(active).unwrap().state(), ConnState::Connected);
        assert!(env.resolve(passive).unwrap().server().is_none());
    }

    #[test]
    fn test_close_raw_and_unknown_descriptors() {
        let (_loopback, env) = start(Hooks::new());
        assert!(matches!(env.close_raw(0), Err(RdmaError::InvalidDescriptor(_))));
        let nd = NetworkDescriptor::new(Role::Active, WorkerId(0), cbnet_types::Sequence(999));
        assert_eq!(env.close_raw(nd.encode()).unwrap(), CloseOutcome::AlreadyClosed);
        let far = NetworkDescriptor::new(Role::Active, WorkerId(42), cbnet_types::Sequence(1));
        assert_eq!(env.close(far), CloseOutcome::AlreadyClosed);
        assert!(env.resolve(far).is_none());
    }

    #[test]
    fn test_bind_poller_and_sliced_connect() {
        let (_loopback, env) = start(Hooks::new());
        assert!(matches!(
            env.bind_poller(WorkerId(9)),
            Err(RdmaError::NoSuchWorker(WorkerId(9)))
        ));
        env.bind_poller(WorkerId(0)).unwrap();
        assert!(env.worker(WorkerId(0)).unwrap().is_poller_thread());
        pair(&env, 7115);
    }

    #[test]
    fn test_reap_stalled_finalizes_disconnected() {
        let recorder = Recorder::new();
        let (_loopback, env) = start(recorder.hooks());
        let (_server, active, passive) = pair(&env, 7116);
        env.close(active);
        wait_until(|| Recorder::count(&recorder.closed, active) == 1);
        wait_until(|| Recorder::count(&recorder.disconnected, passive) == 1);

        assert_eq!(env.reap_stalled(Duration::from_secs(3600)), 0);
        assert_eq!(env.reap_stalled(Duration::ZERO), 1);
        assert_eq!(Recorder::count(&recorder.closed, passive), 1);
        assert_eq!(Recorder::count(&recorder.disconnected, passive), 1);
        assert!(env.resolve(passive).is_none());
        assert_eq!(env.close(passive), CloseOutcome::AlreadyClosed);
    }

    #[test]
    fn test_init_rolls_back_on_unknown_ip() {
        let loopback = LoopbackFabric::with_host(Ipv4Addr::LOCALHOST, "lo0");
        let config = EnvConfig {
            local_ip: "10.1.1.1".into(),
            ..Default::default()
        };
        let err = Environment::init(loopback.clone(), config, Hooks::new()).unwrap_err();
        assert!(matches!(err, RdmaError::Device(_)));
        assert_eq!(loopback.stats(), LoopbackStats::default());
    }

    #[test]
    fn test_init_rolls_back_on_worker_failure() {
        let loopback = LoopbackFabric::with_host(Ipv4Addr::LOCALHOST, "lo0");
        loopback.fail_alloc_pd_after(1);
        let config = EnvConfig {
            worker_num: 3,
            ..Default::default()
        };
        assert!(Environment::init(loopback.clone(), config, Hooks::new()).is_err());
        assert_eq!(loopback.stats(), LoopbackStats::default());
    }

    #[test]
    fn test_init_rejects_invalid_config() {
        let loopback = LoopbackFabric::with_host(Ipv4Addr::LOCALHOST, "lo0");
        let config = EnvConfig {
            worker_num: 0,
            ..Default::default()
        };
        let err = Environment::init(loopback.clone(), config, Hooks::new()).unwrap_err();
        assert!(matches!(err, RdmaError::Config(_)));
    }

    #[test]
    fn test_round_robin_over_workers() {
        let loopback = LoopbackFabric::with_host(Ipv4Addr::LOCALHOST, "lo0");
        let config = EnvConfig {
            worker_num: 2,
            ..Default::default()
        };
        let env = Environment::init(loopback.clone(), config, Hooks::new()).unwrap();
        env.listen("127.0.0.1", 7117, spec(), None, None).unwrap();
        let a = env
            .connect("127.0.0.1", 7117, spec(), Duration::from_secs(5), None)
            .unwrap();
        let b = env
            .connect("127.0.0.1", 7117, spec(), Duration::from_secs(5), None)
            .unwrap();
        assert_ne!(a.worker(), b.worker());
        assert_eq!(env.metrics().worker_count, 2);
    }

    #[test]
    fn test_destroy_with_open_connections() {
        let (loopback, env) = start(Hooks::new());
        pair(&env, 7118);
        env.destroy();
        assert_eq!(loopback.stats(), LoopbackStats::default());
    }

    #[test]
    fn test_operations_after_shutdown_fail() {
        let (_loopback, mut env) = start(Hooks::new());
        env.shutdown();
        assert!(matches!(
            env.listen("127.0.0.1", 7119, spec(), None, None),
            Err(RdmaError::ShuttingDown)
        ));
    }

    #[test]
    fn test_apply_config_hot_fields_only() {
        let (_loopback, env) = start(Hooks::new());
        let fresh = EnvConfig {
            worker_num: 4,
            log_level: LogLevel::Warn,
            conn_timeout_ms: 20,
            ..Default::default()
        };
        env.apply_config(&fresh).unwrap();
        assert_eq!(env.config().worker_num, 1);
        assert_eq!(env.config().conn_timeout_ms, 20);
        assert_eq!(env.log_level(), LogLevel::Warn);
        assert!(!env.reload_config().unwrap());
    }

    #[test]
    fn test_log_layer_forwards_to_sink() {
        let lines: Arc<Mutex<Vec<(LogLevel, String)>>> = Arc::default();
        let sink = Arc::clone(&lines);
        let hooks = Hooks::new().log_sink(move |level, msg| sink.lock().push((level, msg.into())));
        let (_loopback, env) = start(hooks);
        let subscriber = tracing_subscriber::registry().with(env.log_layer());

        tracing::subscriber::with_default(subscriber, || {
            env.listen("127.0.0.1", 7120, spec(), None, None).unwrap();
        });
        assert!(lines
            .lock()
            .iter()
            .any(|(level, msg)| *level == LogLevel::Info && msg.contains("listening")));

        env.set_log_level(LogLevel::Error);
        assert_eq!(env.log_level(), LogLevel::Error);
        let before = lines.lock().len();
        let subscriber = tracing_subscriber::registry().with(env.log_layer());
        tracing::subscriber::with_default(subscriber, || {
            env.listen("127.0.0.1", 7121, spec(), None, None).unwrap();
        });
        assert!(lines.lock()[before..]
            .iter()
            .all(|(level, _)| *level == LogLevel::Error));
    }
}
