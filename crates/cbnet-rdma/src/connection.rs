//! The connection state machine.
//!
//! ```text
//! CONNECTING -> CONNECTED -> CLOSING -> DISCONNECTED -> CLOSED
//!      \____________\____________________^
//! ```
//!
//! State only moves forward. DISCONNECTED is reachable from any earlier
//! state; CLOSED is set when the connection is finalized, after it has left
//! both worker maps. The memory itself is released when the last `Arc` is
//! dropped.
//!
//! Every transition that also touches the worker's registries takes the
//! worker lock before the connection lock.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use cbnet_types::{Address, NetworkDescriptor, WorkerId};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::buf::ConnBuffers;
use crate::fabric::{CmId, OwnedCmId, QpHandle};
use crate::hooks::UserContext;
use crate::listener::Server;
use crate::worker::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConnState {
    Connecting,
    Connected,
    Closing,
    Disconnected,
    Closed,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnState::Connecting => "CONNECTING",
            ConnState::Connected => "CONNECTED",
            ConnState::Closing => "CLOSING",
            ConnState::Disconnected => "DISCONNECTED",
            ConnState::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// Data-path counters maintained by the completion poller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnCounters {
    pub posted_sends: u64,
    pub acked_sends: u64,
    pub completed_sends: u64,
    pub received: u64,
    pub acked_receives: u64,
    pub local_send_window: u64,
    pub local_recv_window: u64,
    pub peer_acked: u64,
    pub peer_send_window: u64,
}

/// Result of a disconnect-class transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DisconnectStep {
    /// The disconnected hook must fire.
    pub(crate) first: bool,
    /// The caller must finalize the connection.
    pub(crate) retire: bool,
}

struct ConnInner {
    state: ConnState,
    qp: Option<QpHandle>,
    user_context: Option<UserContext>,
    counters: ConnCounters,
    app_closed: bool,
    close_start: Option<Instant>,
    in_closing_map: bool,
    finalized: bool,
}

pub struct Connection {
    nd: NetworkDescriptor,
    peer: Option<Address>,
    inner: Mutex<ConnInner>,
    wake: Condvar,
    server: Option<Weak<Server>>,
    buffers: ConnBuffers,
    cm_id: OwnedCmId,
    worker: Arc<Worker>,
}

impl Connection {
    pub(crate) fn new(
        nd: NetworkDescriptor,
        cm_id: OwnedCmId,
        worker: Arc<Worker>,
        server: Option<Weak<Server>>,
        buffers: ConnBuffers,
        peer: Option<Address>,
        user_context: Option<UserContext>,
    ) -> Arc<Self> {
        Arc::new(Self {
            nd,
            peer,
            inner: Mutex::new(ConnInner {
                state: ConnState::Connecting,
                qp: None,
                user_context,
                counters: ConnCounters::default(),
                app_closed: false,
                close_start: None,
                in_closing_map: false,
                finalized: false,
            }),
            wake: Condvar::new(),
            server,
            buffers,
            cm_id,
            worker,
        })
    }

    pub fn nd(&self) -> NetworkDescriptor {
        self.nd
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker.id()
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub fn cm_id(&self) -> CmId {
        self.cm_id.id()
    }

    /// Remote endpoint, known for actively opened connections.
    pub fn peer(&self) -> Option<Address> {
        self.peer
    }

    pub fn buffers(&self) -> &ConnBuffers {
        &self.buffers
    }

    /// The accepting server, for passive connections whose server is still
    /// registered.
    pub fn server(&self) -> Option<Arc<Server>> {
        self.server.as_ref().and_then(Weak::upgrade)
    }

    pub fn state(&self) -> ConnState {
        self.inner.lock().state
    }

    pub fn qp(&self) -> Option<QpHandle> {
        self.inner.lock().qp
    }

    pub fn counters(&self) -> ConnCounters {
        self.inner.lock().counters
    }

    /// Apply `f` to a copy of the counters and store the result. The lock is
    /// not held while `f` runs, so `f` may call back into the connection.
    /// The completion poller is the only expected writer.
    pub fn update_counters(&self, f: impl FnOnce(&mut ConnCounters)) {
        let mut counters = self.counters();
        f(&mut counters);
        self.inner.lock().counters = counters;
    }

    pub fn user_context(&self) -> Option<UserContext> {
        self.inner.lock().user_context.clone()
    }

    pub fn set_user_context(&self, ctx: Option<UserContext>) {
        self.inner.lock().user_context = ctx;
    }

    pub fn is_app_closed(&self) -> bool {
        self.inner.lock().app_closed
    }

    pub fn close_start(&self) -> Option<Instant> {
        self.inner.lock().close_start
    }

    pub(crate) fn attach_qp(&self, qp: QpHandle) {
        self.inner.lock().qp = Some(qp);
        self.worker.qp_created();
    }

    /// CONNECTING -> CONNECTED, releasing blocked `connect` callers.
    /// Returns `false` if the connection already moved on.
    pub(crate) fn establish(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != ConnState::Connecting || inner.app_closed {
            return false;
        }
        inner.state = ConnState::Connected;
        self.wake.notify_all();
        true
    }

    /// Block until the connection leaves CONNECTING, is app-closed, or
    /// `deadline` passes; `None` waits without a deadline. With `slice`,
    /// wake at least that often.
    pub(crate) fn wait_connected(
        &self,
        deadline: Option<Instant>,
        slice: Option<Duration>,
    ) -> ConnState {
        let mut inner = self.inner.lock();
        while inner.state == ConnState::Connecting && !inner.app_closed {
            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                break;
            }
            let sliced = slice.and_then(|s| now.checked_add(s));
            let until = match (sliced, deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            match until {
                Some(until) => {
                    self.wake.wait_until(&mut inner, until);
                }
                None => self.wake.wait(&mut inner),
            }
        }
        inner.state
    }

    /// Still CONNECTING and not app-closed.
    pub(crate) fn awaiting_establish(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == ConnState::Connecting && !inner.app_closed
    }

    /// First half of an application close. Returns `false` when the
    /// connection was already app-closed.
    pub(crate) fn begin_close(&self) -> bool {
        let mut maps = self.worker.maps();
        let mut inner = self.inner.lock();
        if inner.app_closed {
            return false;
        }
        inner.app_closed = true;
        self.wake.notify_all();
        if inner.state < ConnState::Closing {
            inner.state = ConnState::Closing;
        }
        if inner.close_start.is_none() {
            inner.close_start = Some(Instant::now());
            maps.close_list.push_back(self.nd);
        }
        true
    }

    /// Move from the live map to the closing map. Returns `true` if the
    /// caller must finalize.
    pub(crate) fn park(self: &Arc<Self>) -> bool {
        let mut maps = self.worker.maps();
        let mut inner = self.inner.lock();
        if inner.finalized {
            return false;
        }
        if !inner.in_closing_map {
            maps.live.remove(&self.nd);
            maps.closing.insert(self.nd, Arc::clone(self));
            inner.in_closing_map = true;
        }
        let retire = inner.state == ConnState::Disconnected && !inner.finalized;
        if retire {
            inner.finalized = true;
        }
        retire
    }

    /// Disconnect-class transition.
    pub(crate) fn mark_disconnected(&self) -> DisconnectStep {
        let mut maps = self.worker.maps();
        let mut inner = self.inner.lock();
        let first = inner.state <= ConnState::Closing;
        if inner.close_start.is_none() {
            inner.close_start = Some(Instant::now());
            maps.close_list.push_back(self.nd);
        }
        if inner.state < ConnState::Disconnected {
            inner.state = ConnState::Disconnected;
        }
        self.wake.notify_all();
        let retire = inner.app_closed
            && inner.in_closing_map
            && inner.state == ConnState::Disconnected
            && !inner.finalized;
        if retire {
            inner.finalized = true;
        }
        DisconnectStep { first, retire }
    }

    /// Claim a stalled connection for finalization. Returns whether the
    /// disconnected hook is still owed, or `None` if someone else already
    /// finalized it.
    pub(crate) fn force_retire(&self) -> Option<bool> {
        let _maps = self.worker.maps();
        let mut inner = self.inner.lock();
        if inner.finalized {
            return None;
        }
        let first = inner.state <= ConnState::Closing;
        if inner.state < ConnState::Disconnected {
            inner.state = ConnState::Disconnected;
        }
        inner.finalized = true;
        self.wake.notify_all();
        Some(first)
    }

    /// Remove from every worker registry and enter CLOSED.
    pub(crate) fn mark_closed(&self) {
        let mut maps = self.worker.maps();
        let mut inner = self.inner.lock();
        maps.forget(&self.nd);
        inner.state = ConnState::Closed;
        inner.finalized = true;
        self.wake.notify_all();
    }

    /// Set the state without touching the registries. Caller holds the
    /// worker lock.
    pub(crate) fn force_state(&self, state: ConnState) {
        let mut inner = self.inner.lock();
        inner.state = state;
        inner.finalized = true;
        self.wake.notify_all();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("nd", &self.nd)
            .field("cm_id", &self.cm_id.id())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(qp) = self.inner.get_mut().qp.take() {
            self.cm_id.fabric().destroy_qp(qp);
            self.worker.qp_destroyed();
        }
        tracing::debug!(nd = %self.nd, "connection released");
    }
}

/// A counted reference to a connection obtained from a descriptor.
///
/// While held, the connection's memory and buffers stay valid even if it is
/// closed and finalized concurrently. Dropping it releases the reference.
#[derive(Clone)]
pub struct ConnRef(Arc<Connection>);

impl ConnRef {
    pub(crate) fn new(conn: Arc<Connection>) -> Self {
        Self(conn)
    }

    /// Number of outstanding references, registries included.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl Deref for ConnRef {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.0
    }
}

impl fmt::Debug for ConnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
