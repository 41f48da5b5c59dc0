//! Workers: shared transport resources and the connection registries.
//!
//! A worker owns one protection domain and one completion queue shared by
//! every connection bound to it. It tracks its connections in two maps:
//! `live` for connections the application may still use and `closing` for
//! app-closed connections waiting for teardown. Both maps and the close list
//! sit behind one lock so a connection moves between them in a single
//! critical section; whenever a connection's own lock is needed too, the
//! worker lock is taken first.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use cbnet_types::{NetworkDescriptor, WorkerId};
use parking_lot::{Mutex, MutexGuard};

use crate::connection::{ConnState, Connection};
use crate::device::OwnedDevice;
use crate::error::Result;
use crate::fabric::{CqHandle, Fabric, PdHandle};

/// Which registry a connection is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    Live,
    Closing,
}

#[derive(Default)]
pub(crate) struct WorkerMaps {
    pub(crate) live: HashMap<NetworkDescriptor, Arc<Connection>>,
    pub(crate) closing: HashMap<NetworkDescriptor, Arc<Connection>>,
    /// Connections with a recorded `close_start`, oldest first.
    pub(crate) close_list: VecDeque<NetworkDescriptor>,
}

impl WorkerMaps {
    fn map_mut(&mut self, kind: MapKind) -> &mut HashMap<NetworkDescriptor, Arc<Connection>> {
        match kind {
            MapKind::Live => &mut self.live,
            MapKind::Closing => &mut self.closing,
        }
    }

    fn find(&self, nd: &NetworkDescriptor) -> Option<&Arc<Connection>> {
        self.live.get(nd).or_else(|| self.closing.get(nd))
    }

    pub(crate) fn forget(&mut self, nd: &NetworkDescriptor) {
        self.live.remove(nd);
        self.closing.remove(nd);
        self.close_list.retain(|x| x != nd);
    }
}

pub struct Worker {
    id: WorkerId,
    fabric: Arc<dyn Fabric>,
    pd: PdHandle,
    cq: CqHandle,
    maps: Mutex<WorkerMaps>,
    qp_count: AtomicU64,
    poller: Mutex<Option<ThreadId>>,
    device: Arc<OwnedDevice>,
}

impl Worker {
    /// Allocate the PD and CQ. Nothing is left allocated on failure.
    pub fn init(
        id: WorkerId,
        fabric: Arc<dyn Fabric>,
        device: Arc<OwnedDevice>,
        cq_depth: u32,
    ) -> Result<Self> {
        let pd = fabric.alloc_pd(device.handle())?;
        let cq = match fabric.create_cq(device.handle(), cq_depth) {
            Ok(cq) => cq,
            Err(e) => {
                fabric.dealloc_pd(pd);
                return Err(e);
            }
        };
        tracing::debug!(worker = %id, %pd, %cq, "worker initialized");
        Ok(Self {
            id,
            fabric,
            pd,
            cq,
            maps: Mutex::new(WorkerMaps::default()),
            qp_count: AtomicU64::new(0),
            poller: Mutex::new(None),
            device,
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn pd(&self) -> PdHandle {
        self.pd
    }

    pub fn cq(&self) -> CqHandle {
        self.cq
    }

    pub fn fabric(&self) -> &Arc<dyn Fabric> {
        &self.fabric
    }

    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    /// Queue pairs currently alive on this worker.
    pub fn qp_count(&self) -> u64 {
        self.qp_count.load(Ordering::Relaxed)
    }

    pub(crate) fn qp_created(&self) {
        self.qp_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn qp_destroyed(&self) {
        self.qp_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn maps(&self) -> MutexGuard<'_, WorkerMaps> {
        self.maps.lock()
    }

    pub fn add(&self, conn: Arc<Connection>, into: MapKind) {
        let nd = conn.nd();
        self.maps().map_mut(into).insert(nd, conn);
    }

    pub fn remove(&self, nd: NetworkDescriptor, from: MapKind) -> Option<Arc<Connection>> {
        self.maps().map_mut(from).remove(&nd)
    }

    /// Look `nd` up in the live map. The returned `Arc` is taken under the
    /// map lock, so the connection cannot be freed while it is held.
    pub fn lookup(&self, nd: NetworkDescriptor) -> Option<Arc<Connection>> {
        self.maps().live.get(&nd).cloned()
    }

    /// Like `lookup`, also searching the closing map.
    pub fn lookup_any(&self, nd: NetworkDescriptor) -> Option<Arc<Connection>> {
        self.maps().find(&nd).cloned()
    }

    pub fn contains(&self, nd: NetworkDescriptor) -> Option<MapKind> {
        let maps = self.maps();
        if maps.live.contains_key(&nd) {
            Some(MapKind::Live)
        } else if maps.closing.contains_key(&nd) {
            Some(MapKind::Closing)
        } else {
            None
        }
    }

    pub fn live_count(&self) -> usize {
        self.maps().live.len()
    }

    pub fn closing_count(&self) -> usize {
        self.maps().closing.len()
    }

    /// Connections on the close list whose teardown started more than
    /// `threshold` before `now`.
    pub fn stalled(&self, threshold: Duration, now: Instant) -> Vec<Arc<Connection>> {
        let maps = self.maps();
        maps.close_list
            .iter()
            .filter_map(|nd| maps.find(nd))
            .filter(|conn| {
                conn.close_start()
                    .is_some_and(|start| now.saturating_duration_since(start) >= threshold)
            })
            .cloned()
            .collect()
    }

    /// Record the calling thread as the one driving this worker's CQ.
    pub fn bind_poller(&self) {
        *self.poller.lock() = Some(std::thread::current().id());
    }

    pub fn is_poller_thread(&self) -> bool {
        *self.poller.lock() == Some(std::thread::current().id())
    }

    /// Empty both maps, marking every connection closed. Used at teardown.
    pub(crate) fn drain(&self) -> Vec<Arc<Connection>> {
        let mut maps = self.maps();
        maps.close_list.clear();
        let live = std::mem::take(&mut maps.live);
        let closing = std::mem::take(&mut maps.closing);
        let drained: Vec<_> = live.into_values().chain(closing.into_values()).collect();
        for conn in &drained {
            conn.force_state(ConnState::Closed);
        }
        drained
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("pd", &self.pd)
            .field("cq", &self.cq)
            .field("qp_count", &self.qp_count())
            .finish()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.fabric.destroy_cq(self.cq);
        self.fabric.dealloc_pd(self.pd);
        tracing::debug!(worker = %self.id, "worker destroyed");
    }
}
