//! The connection-manager event loop.
//!
//! One thread reads the environment's event channel, acknowledges each
//! event, then drives the owning connection's state machine. All handshake
//! progress and every transport-initiated teardown happens here; application
//! threads only start handshakes and closes.

use std::sync::Arc;

use cbnet_types::{NetworkDescriptor, Role};
use tracing::{debug, error, info, warn};

use crate::buf::ConnBuffers;
use crate::connection::{ConnState, Connection};
use crate::env::{CloseOutcome, Route, Shared};
use crate::error::Result;
use crate::fabric::{CmEvent, CmId, EventClass, OwnedCmId};
use crate::listener::Server;
use crate::worker::MapKind;

impl Shared {
    pub(crate) fn run(self: Arc<Self>) {
        debug!("dispatcher started");
        while let Some(event) = self.fabric.get_event(self.channel.handle()) {
            self.fabric.ack_event(&event);
            self.dispatch(event);
        }
        debug!("event channel closed, dispatcher exiting");
    }

    fn dispatch(&self, event: CmEvent) {
        debug!(kind = %event.kind, id = %event.id, "cm event");
        match event.kind.classify() {
            EventClass::AddrResolved => self.with_connection(event, Self::on_addr_resolved),
            EventClass::RouteResolved => self.with_connection(event, Self::on_route_resolved),
            EventClass::Established => self.with_connection(event, Self::on_established),
            EventClass::Disconnect => self.with_connection(event, Self::disconnect_path),
            EventClass::ConnectRequest => self.on_connect_request(event),
            EventClass::Ignore => {}
            EventClass::Unsupported => {
                error!(kind = %event.kind, id = %event.id, "unsupported connection-manager event");
                std::process::abort();
            }
        }
    }

    fn with_connection(&self, event: CmEvent, handler: fn(&Self, &Arc<Connection>)) {
        match self.route_connection(event.id) {
            Some(conn) => handler(self, &conn),
            None => debug!(kind = %event.kind, id = %event.id, "event for unrouted identity dropped"),
        }
    }

    fn route_connection(&self, id: CmId) -> Option<Arc<Connection>> {
        let route = self.routes.get(&id).map(|r| *r.value())?;
        match route {
            Route::Connection(nd) => self.worker(nd.worker())?.lookup_any(nd),
            Route::Listener(_) => None,
        }
    }

    fn route_server(&self, id: CmId) -> Option<Arc<Server>> {
        let route = self.routes.get(&id).map(|r| *r.value())?;
        match route {
            Route::Listener(nd) => self.find_server(nd),
            Route::Connection(_) => None,
        }
    }

    fn on_addr_resolved(&self, conn: &Arc<Connection>) {
        if conn.state() != ConnState::Connecting {
            debug!(nd = %conn.nd(), state = %conn.state(), "address resolved after close");
            return;
        }
        let timeout = self.config.get().resolve_timeout();
        if let Err(e) = self.fabric.resolve_route(conn.cm_id(), timeout) {
            warn!(nd = %conn.nd(), error = %e, "route resolution failed to start");
            self.disconnect_path(conn);
        }
    }

    fn on_route_resolved(&self, conn: &Arc<Connection>) {
        if conn.state() != ConnState::Connecting {
            debug!(nd = %conn.nd(), state = %conn.state(), "route resolved after close");
            return;
        }
        let started = self
            .prepare_qp(conn)
            .and_then(|()| self.fabric.connect(conn.cm_id()));
        if let Err(e) = started {
            warn!(nd = %conn.nd(), error = %e, "connect handshake failed to start");
            self.disconnect_path(conn);
        }
    }

    /// Create the queue pair and post the control receive.
    fn prepare_qp(&self, conn: &Connection) -> Result<()> {
        let worker = conn.worker();
        let caps = self.config.get().qp_caps();
        let qp = self
            .fabric
            .create_qp(conn.cm_id(), worker.pd(), worker.cq(), &caps)?;
        conn.attach_qp(qp);
        self.fabric.post_recv(qp, conn.buffers().recv_meta().sge())
    }

    fn on_established(&self, conn: &Arc<Connection>) {
        if !conn.awaiting_establish() {
            debug!(nd = %conn.nd(), state = %conn.state(), "established after close");
            return;
        }
        let Some(qp) = conn.qp() else {
            warn!(nd = %conn.nd(), "established without a queue pair");
            self.disconnect_path(conn);
            return;
        };
        if let Err(e) = self.fabric.post_send(qp, conn.buffers().send_meta().sge()) {
            warn!(nd = %conn.nd(), error = %e, "control send failed");
            self.disconnect_path(conn);
            return;
        }
        if !conn.establish() {
            debug!(nd = %conn.nd(), state = %conn.state(), "established after close");
            return;
        }
        if conn.nd().role() == Role::Passive {
            if let Some(server) = conn.server() {
                let ctx = server.on_accepted(conn.nd());
                if ctx.is_some() {
                    conn.set_user_context(ctx);
                }
            }
        }
        info!(nd = %conn.nd(), worker = %conn.worker_id(), "connection established");
    }

    fn on_connect_request(&self, event: CmEvent) {
        let child = OwnedCmId::adopt(Arc::clone(&self.fabric), event.id);
        let server = event.listen_id.and_then(|id| self.route_server(id));
        let Some(server) = server else {
            warn!(id = %event.id, "connect request for unknown listener rejected");
            self.reject(child.id());
            return;
        };
        match self.accept(&server, child) {
            Ok(nd) => info!(server = %server.nd(), %nd, "accepted connection"),
            Err(e) => warn!(server = %server.nd(), error = %e, "accept failed, request rejected"),
        }
    }

    /// Build the passive connection for `child` and complete the handshake.
    /// The connection is linked into the registries only once the transport
    /// accepted it; on any failure the request is rejected and everything
    /// created for it is released.
    fn accept(&self, server: &Arc<Server>, child: OwnedCmId) -> Result<NetworkDescriptor> {
        let worker = Arc::clone(server.worker());
        let nd = self.allocator.allocate_on(Role::Passive, worker.id());
        let buffers = match ConnBuffers::register(&self.fabric, worker.pd(), *server.defaults()) {
            Ok(buffers) => buffers,
            Err(e) => {
                self.reject(child.id());
                return Err(e);
            }
        };
        let conn = Connection::new(
            nd,
            child,
            Arc::clone(&worker),
            Some(Arc::downgrade(server)),
            buffers,
            None,
            None,
        );
        let accepted = self
            .prepare_qp(&conn)
            .and_then(|()| self.fabric.accept(conn.cm_id()));
        if let Err(e) = accepted {
            self.reject(conn.cm_id());
            return Err(e);
        }
        self.routes.insert(conn.cm_id(), Route::Connection(nd));
        server.link(nd);
        worker.add(conn, MapKind::Live);
        Ok(nd)
    }

    fn reject(&self, id: CmId) {
        if let Err(e) = self.fabric.reject(id) {
            debug!(%id, error = %e, "reject failed");
        }
    }

    /// Disconnect-class handling, shared by transport events, failed
    /// handshakes and closes the transport refused.
    pub(crate) fn disconnect_path(&self, conn: &Arc<Connection>) {
        let step = conn.mark_disconnected();
        if step.first {
            debug!(nd = %conn.nd(), "connection disconnected");
            self.hooks.disconnected(conn.nd(), conn.user_context());
        }
        if step.retire {
            self.finalize(conn);
        }
    }

    /// Application half of a close. The transport disconnect completes
    /// asynchronously unless the transport refuses it.
    pub(crate) fn close_connection(&self, conn: &Arc<Connection>) -> CloseOutcome {
        if !conn.begin_close() {
            return CloseOutcome::AlreadyClosed;
        }
        info!(nd = %conn.nd(), state = %conn.state(), "closing connection");
        if let Err(e) = self.fabric.disconnect(conn.cm_id()) {
            debug!(nd = %conn.nd(), error = %e, "transport disconnect refused, tearing down locally");
            self.disconnect_path(conn);
        }
        if conn.park() {
            self.finalize(conn);
        }
        CloseOutcome::Closing
    }

    /// Take a connection out of every registry and report it closed.
    pub(crate) fn finalize(&self, conn: &Arc<Connection>) {
        conn.mark_closed();
        self.routes.remove(&conn.cm_id());
        if let Some(server) = conn.server() {
            server.unlink(conn.nd());
        }
        self.hooks.closed(conn.nd(), conn.user_context());
        info!(nd = %conn.nd(), "connection finalized");
    }

    /// Finalize connections whose teardown started at least `threshold` ago.
    pub(crate) fn reap(&self, threshold: std::time::Duration) -> usize {
        let now = std::time::Instant::now();
        let mut reaped = 0;
        for worker in &self.workers {
            for conn in worker.stalled(threshold, now) {
                let Some(first) = conn.force_retire() else {
                    continue;
                };
                warn!(nd = %conn.nd(), "reaping stalled close");
                if first {
                    self.hooks.disconnected(conn.nd(), conn.user_context());
                }
                self.finalize(&conn);
                reaped += 1;
            }
        }
        reaped
    }
}
