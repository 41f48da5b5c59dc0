//! Listening servers.

use std::fmt;
use std::sync::Arc;

use cbnet_types::{Address, NetworkDescriptor};
use parking_lot::Mutex;

use crate::buf::BufferSpec;
use crate::error::Result;
use crate::fabric::{ChannelHandle, CmId, Fabric, OwnedCmId};
use crate::hooks::{AcceptCallback, UserContext};
use crate::worker::Worker;

/// A bound listening identity plus the defaults applied to connections it
/// accepts. Accepted connections live on the server's worker.
pub struct Server {
    nd: NetworkDescriptor,
    addr: Address,
    defaults: BufferSpec,
    accept_cb: Option<AcceptCallback>,
    context: Option<UserContext>,
    accepted: Mutex<Vec<NetworkDescriptor>>,
    listen_id: OwnedCmId,
    worker: Arc<Worker>,
}

impl Server {
    /// Create the listening identity and bind it to `addr`. Listening starts
    /// with [`Server::start`].
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn open(
        nd: NetworkDescriptor,
        addr: Address,
        defaults: BufferSpec,
        accept_cb: Option<AcceptCallback>,
        context: Option<UserContext>,
        fabric: Arc<dyn Fabric>,
        channel: ChannelHandle,
        worker: Arc<Worker>,
    ) -> Result<Self> {
        let listen_id = OwnedCmId::create(fabric, channel)?;
        listen_id.fabric().bind_addr(listen_id.id(), addr)?;
        Ok(Self {
            nd,
            addr,
            defaults,
            accept_cb,
            context,
            accepted: Mutex::new(Vec::new()),
            listen_id,
            worker,
        })
    }

    pub(crate) fn start(&self, backlog: u32) -> Result<()> {
        self.listen_id.fabric().listen(self.listen_id.id(), backlog)?;
        tracing::info!(nd = %self.nd, addr = %self.addr, backlog, "listening");
        Ok(())
    }

    pub fn nd(&self) -> NetworkDescriptor {
        self.nd
    }

    pub fn addr(&self) -> Address {
        self.addr
    }

    pub fn defaults(&self) -> &BufferSpec {
        &self.defaults
    }

    pub fn listen_id(&self) -> CmId {
        self.listen_id.id()
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub fn context(&self) -> Option<UserContext> {
        self.context.clone()
    }

    pub(crate) fn link(&self, nd: NetworkDescriptor) {
        self.accepted.lock().push(nd);
    }

    pub(crate) fn unlink(&self, nd: NetworkDescriptor) {
        self.accepted.lock().retain(|x| *x != nd);
    }

    /// Descriptors of accepted connections not yet finalized.
    pub fn accepted(&self) -> Vec<NetworkDescriptor> {
        self.accepted.lock().clone()
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted.lock().len()
    }

    /// Run the accept callback for a connection that just became usable.
    /// Returns the context to attach to it.
    pub(crate) fn on_accepted(&self, nd: NetworkDescriptor) -> Option<UserContext> {
        match &self.accept_cb {
            Some(cb) => cb(nd, self.context.clone()),
            None => None,
        }
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("nd", &self.nd)
            .field("addr", &self.addr)
            .field("defaults", &self.defaults)
            .field("accepted", &self.accepted_count())
            .finish()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        tracing::info!(nd = %self.nd, addr = %self.addr, "server closed");
    }
}
