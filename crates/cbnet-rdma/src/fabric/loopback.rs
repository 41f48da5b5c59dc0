//! In-process transport.
//!
//! Every identity, queue pair and memory region lives in one table guarded
//! by a single lock; events are queued on per-channel queues so that
//! `get_event` can block without holding the table lock. Peers are linked
//! directly: `connect` enqueues a connect request on the listener's channel
//! and `accept` completes both sides at once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use cbnet_types::Address;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use super::{
    ChannelHandle, CmEvent, CmEventKind, CmId, CqHandle, DeviceHandle, Fabric, MemoryRegion,
    PdHandle, QpCaps, QpHandle, Sge,
};
use crate::error::{RdmaError, Result};

/// Live object counts, for leak checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopbackStats {
    pub devices: usize,
    pub channels: usize,
    pub ids: usize,
    pub qps: usize,
    pub mrs: usize,
    pub pds: usize,
    pub cqs: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    Send,
    Recv,
}

/// One posted work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkRequest {
    pub kind: WorkKind,
    pub sge: Sge,
}

#[derive(Default)]
struct ChannelQueue {
    events: VecDeque<CmEvent>,
    closed: bool,
}

#[derive(Default)]
struct Channel {
    queue: Mutex<ChannelQueue>,
    ready: Condvar,
}

impl Channel {
    fn push(&self, event: CmEvent) {
        let mut queue = self.queue.lock();
        if queue.closed {
            return;
        }
        queue.events.push_back(event);
        self.ready.notify_one();
    }

    fn close(&self) {
        self.queue.lock().closed = true;
        self.ready.notify_all();
    }
}

#[derive(Default)]
struct IdEntry {
    channel: u64,
    local: Option<Address>,
    remote: Option<Address>,
    peer: Option<u64>,
    qp: Option<u64>,
    listening: bool,
    connected: bool,
}

struct QpEntry {
    pd: u64,
    work: Vec<WorkRequest>,
}

struct MrEntry {
    pd: u64,
    addr: u64,
    len: usize,
}

#[derive(Default)]
struct Faults {
    reg_mr_budget: Option<usize>,
    alloc_pd_budget: Option<usize>,
    create_qp_budget: Option<usize>,
    accept: bool,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    next_key: u32,
    devices: Vec<String>,
    hosts: HashMap<u32, String>,
    silent: HashSet<u32>,
    open_devices: HashSet<u64>,
    channels: HashMap<u64, Arc<Channel>>,
    ids: HashMap<u64, IdEntry>,
    listeners: HashMap<Address, u64>,
    pds: HashSet<u64>,
    cqs: HashSet<u64>,
    qps: HashMap<u64, QpEntry>,
    mrs: HashMap<u32, MrEntry>,
    faults: Faults,
}

impl State {
    fn next(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn id(&self, id: CmId) -> Result<&IdEntry> {
        self.ids
            .get(&id.get())
            .ok_or_else(|| RdmaError::transport("cm_id", format!("unknown identity {id}")))
    }

    fn id_mut(&mut self, id: CmId) -> Result<&mut IdEntry> {
        self.ids
            .get_mut(&id.get())
            .ok_or_else(|| RdmaError::transport("cm_id", format!("unknown identity {id}")))
    }

    /// Queue `kind` on the channel of identity `id`, if both still exist.
    fn notify(&self, id: u64, kind: CmEventKind) {
        self.notify_with(id, kind, None);
    }

    fn notify_with(&self, id: u64, kind: CmEventKind, listen_id: Option<u64>) {
        let Some(entry) = self.ids.get(&id) else {
            return;
        };
        if let Some(channel) = self.channels.get(&entry.channel) {
            channel.push(CmEvent {
                kind,
                id: CmId(id),
                listen_id: listen_id.map(CmId),
            });
        }
    }

    fn is_known_host(&self, ip: u32) -> bool {
        self.hosts.contains_key(&ip)
    }

    fn check_sge(&self, qp: QpHandle, sge: &Sge) -> Result<()> {
        let entry = self
            .qps
            .get(&qp.get())
            .ok_or_else(|| RdmaError::transport("post", format!("unknown qp {qp}")))?;
        let mr = self
            .mrs
            .get(&sge.lkey)
            .ok_or_else(|| RdmaError::transport("post", format!("unknown lkey {}", sge.lkey)))?;
        let end = sge.addr + sge.len as u64;
        if mr.pd != entry.pd || sge.addr < mr.addr || end > mr.addr + mr.len as u64 {
            return Err(RdmaError::transport(
                "post",
                format!("sge {:#x}+{} outside lkey {}", sge.addr, sge.len, sge.lkey),
            ));
        }
        Ok(())
    }
}

/// In-process [`Fabric`] with fault injection.
#[derive(Default)]
pub struct LoopbackFabric {
    state: Mutex<State>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fabric with a single host `ip` served by device `device`.
    pub fn with_host(ip: Ipv4Addr, device: &str) -> Arc<Self> {
        let fabric = Arc::new(Self::new());
        fabric.add_host(ip, device);
        fabric
    }

    /// Make `ip` reachable and owned by `device`, registering the device if
    /// it is new.
    pub fn add_host(&self, ip: Ipv4Addr, device: &str) {
        let mut state = self.state.lock();
        if !state.devices.iter().any(|d| d == device) {
            state.devices.push(device.to_string());
        }
        state.hosts.insert(u32::from(ip), device.to_string());
    }

    /// Address resolution towards `ip` never completes.
    pub fn set_silent(&self, ip: Ipv4Addr) {
        self.state.lock().silent.insert(u32::from(ip));
    }

    /// Let the next `n` registrations succeed, then fail every later one.
    pub fn fail_reg_mr_after(&self, n: usize) {
        self.state.lock().faults.reg_mr_budget = Some(n);
    }

    pub fn clear_reg_mr_fault(&self) {
        self.state.lock().faults.reg_mr_budget = None;
    }

    /// Let the next `n` protection-domain allocations succeed, then fail.
    pub fn fail_alloc_pd_after(&self, n: usize) {
        self.state.lock().faults.alloc_pd_budget = Some(n);
    }

    pub fn fail_create_qp(&self, fail: bool) {
        self.state.lock().faults.create_qp_budget = fail.then_some(0);
    }

    /// Let the next `n` queue-pair creations succeed, then fail every later
    /// one until `fail_create_qp(false)`.
    pub fn fail_create_qp_after(&self, n: usize) {
        self.state.lock().faults.create_qp_budget = Some(n);
    }

    pub fn fail_accept(&self, fail: bool) {
        self.state.lock().faults.accept = fail;
    }

    /// Deliver an arbitrary event for `id` on its channel.
    pub fn inject(&self, id: CmId, kind: CmEventKind) {
        self.state.lock().notify(id.get(), kind);
    }

    pub fn stats(&self) -> LoopbackStats {
        let state = self.state.lock();
        LoopbackStats {
            devices: state.open_devices.len(),
            channels: state.channels.len(),
            ids: state.ids.len(),
            qps: state.qps.len(),
            mrs: state.mrs.len(),
            pds: state.pds.len(),
            cqs: state.cqs.len(),
        }
    }

    /// Queue pair attached to `id`.
    pub fn qp_of(&self, id: CmId) -> Option<QpHandle> {
        let state = self.state.lock();
        state.ids.get(&id.get()).and_then(|e| e.qp).map(QpHandle)
    }

    /// Work requests posted on `qp`, oldest first.
    pub fn work_log(&self, qp: QpHandle) -> Vec<WorkRequest> {
        let state = self.state.lock();
        state
            .qps
            .get(&qp.get())
            .map(|e| e.work.clone())
            .unwrap_or_default()
    }

    pub fn is_connected(&self, id: CmId) -> bool {
        let state = self.state.lock();
        state.ids.get(&id.get()).is_some_and(|e| e.connected)
    }
}

impl Fabric for LoopbackFabric {
    fn list_devices(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().devices.clone())
    }

    fn device_for_ip(&self, ip: Ipv4Addr) -> Result<String> {
        self.state
            .lock()
            .hosts
            .get(&u32::from(ip))
            .cloned()
            .ok_or_else(|| RdmaError::Device(format!("no device owns {ip}")))
    }

    fn open_device(&self, name: &str) -> Result<DeviceHandle> {
        let mut state = self.state.lock();
        if !state.devices.iter().any(|d| d == name) {
            return Err(RdmaError::Device(format!("no such device {name}")));
        }
        let handle = state.next();
        state.open_devices.insert(handle);
        Ok(DeviceHandle(handle))
    }

    fn close_device(&self, device: DeviceHandle) {
        self.state.lock().open_devices.remove(&device.get());
    }

    fn create_event_channel(&self) -> Result<ChannelHandle> {
        let mut state = self.state.lock();
        let handle = state.next();
        state.channels.insert(handle, Arc::new(Channel::default()));
        Ok(ChannelHandle(handle))
    }

    fn get_event(&self, channel: ChannelHandle) -> Option<CmEvent> {
        let channel = self.state.lock().channels.get(&channel.get()).cloned()?;
        let mut queue = channel.queue.lock();
        loop {
            if queue.closed {
                return None;
            }
            if let Some(event) = queue.events.pop_front() {
                return Some(event);
            }
            channel.ready.wait(&mut queue);
        }
    }

    fn ack_event(&self, _event: &CmEvent) {}

    fn destroy_event_channel(&self, channel: ChannelHandle) {
        if let Some(channel) = self.state.lock().channels.remove(&channel.get()) {
            channel.close();
        }
    }

    fn alloc_pd(&self, device: DeviceHandle) -> Result<PdHandle> {
        let mut state = self.state.lock();
        if !state.open_devices.contains(&device.get()) {
            return Err(RdmaError::transport("alloc_pd", "device not open"));
        }
        if let Some(budget) = state.faults.alloc_pd_budget.as_mut() {
            if *budget == 0 {
                return Err(RdmaError::transport("alloc_pd", "injected failure"));
            }
            *budget -= 1;
        }
        let handle = state.next();
        state.pds.insert(handle);
        Ok(PdHandle(handle))
    }

    fn dealloc_pd(&self, pd: PdHandle) {
        self.state.lock().pds.remove(&pd.get());
    }

    fn create_cq(&self, device: DeviceHandle, depth: u32) -> Result<CqHandle> {
        let mut state = self.state.lock();
        if !state.open_devices.contains(&device.get()) {
            return Err(RdmaError::transport("create_cq", "device not open"));
        }
        if depth == 0 {
            return Err(RdmaError::transport("create_cq", "zero depth"));
        }
        let handle = state.next();
        state.cqs.insert(handle);
        Ok(CqHandle(handle))
    }

    fn destroy_cq(&self, cq: CqHandle) {
        self.state.lock().cqs.remove(&cq.get());
    }

    fn reg_mr(&self, pd: PdHandle, addr: u64, len: usize) -> Result<MemoryRegion> {
        let mut state = self.state.lock();
        if !state.pds.contains(&pd.get()) {
            return Err(RdmaError::Registration {
                len,
                reason: format!("unknown pd {pd}"),
            });
        }
        if len == 0 || addr == 0 {
            return Err(RdmaError::Registration {
                len,
                reason: "empty range".into(),
            });
        }
        if let Some(budget) = state.faults.reg_mr_budget.as_mut() {
            if *budget == 0 {
                return Err(RdmaError::Registration {
                    len,
                    reason: "injected failure".into(),
                });
            }
            *budget -= 1;
        }
        state.next_key += 1;
        let key = state.next_key;
        state.mrs.insert(
            key,
            MrEntry {
                pd: pd.get(),
                addr,
                len,
            },
        );
        Ok(MemoryRegion {
            addr,
            len,
            lkey: key,
            rkey: key,
        })
    }

    fn dereg_mr(&self, mr: &MemoryRegion) {
        self.state.lock().mrs.remove(&mr.lkey);
    }

    fn create_id(&self, channel: ChannelHandle) -> Result<CmId> {
        let mut state = self.state.lock();
        if !state.channels.contains_key(&channel.get()) {
            return Err(RdmaError::transport("create_id", "unknown event channel"));
        }
        let handle = state.next();
        state.ids.insert(
            handle,
            IdEntry {
                channel: channel.get(),
                ..Default::default()
            },
        );
        Ok(CmId(handle))
    }

    fn destroy_id(&self, id: CmId) {
        let mut state = self.state.lock();
        let Some(entry) = state.ids.remove(&id.get()) else {
            return;
        };
        if entry.listening {
            if let Some(local) = entry.local {
                state.listeners.remove(&local);
            }
        }
        if let Some(peer) = entry.peer {
            let was_connected = entry.connected;
            if let Some(peer_entry) = state.ids.get_mut(&peer) {
                peer_entry.peer = None;
                peer_entry.connected = false;
            }
            let kind = if was_connected {
                CmEventKind::Disconnected
            } else {
                CmEventKind::Rejected
            };
            state.notify(peer, kind);
        }
    }

    fn bind_addr(&self, id: CmId, addr: Address) -> Result<()> {
        let mut state = self.state.lock();
        if !addr.is_unspecified() && !state.is_known_host(addr.ip) {
            return Err(RdmaError::transport(
                "bind_addr",
                format!("{addr} is not a local address"),
            ));
        }
        state.id_mut(id)?.local = Some(addr);
        Ok(())
    }

    fn listen(&self, id: CmId, _backlog: u32) -> Result<()> {
        let mut state = self.state.lock();
        let local = state
            .id(id)?
            .local
            .ok_or_else(|| RdmaError::transport("listen", "identity not bound"))?;
        if state.listeners.contains_key(&local) {
            return Err(RdmaError::transport("listen", format!("{local} in use")));
        }
        state.listeners.insert(local, id.get());
        state.id_mut(id)?.listening = true;
        Ok(())
    }

    fn resolve_addr(&self, id: CmId, dst: Address, _timeout: Duration) -> Result<()> {
        let mut state = self.state.lock();
        state.id_mut(id)?.remote = Some(dst);
        if state.silent.contains(&dst.ip) {
            return Ok(());
        }
        let kind = if state.is_known_host(dst.ip) {
            CmEventKind::AddrResolved
        } else {
            CmEventKind::AddrError
        };
        state.notify(id.get(), kind);
        Ok(())
    }

    fn resolve_route(&self, id: CmId, _timeout: Duration) -> Result<()> {
        let state = self.state.lock();
        if state.id(id)?.remote.is_none() {
            return Err(RdmaError::transport("resolve_route", "address not resolved"));
        }
        state.notify(id.get(), CmEventKind::RouteResolved);
        Ok(())
    }

    fn create_qp(&self, id: CmId, pd: PdHandle, cq: CqHandle, caps: &QpCaps) -> Result<QpHandle> {
        let mut state = self.state.lock();
        if let Some(budget) = state.faults.create_qp_budget.as_mut() {
            if *budget == 0 {
                return Err(RdmaError::transport("create_qp", "injected failure"));
            }
            *budget -= 1;
        }
        if !state.pds.contains(&pd.get()) || !state.cqs.contains(&cq.get()) {
            return Err(RdmaError::transport("create_qp", "unknown pd or cq"));
        }
        if caps.max_send_wr == 0 || caps.max_recv_wr == 0 {
            return Err(RdmaError::transport("create_qp", "zero work-queue depth"));
        }
        if state.id(id)?.qp.is_some() {
            return Err(RdmaError::transport("create_qp", "identity already has a qp"));
        }
        let handle = state.next();
        state.qps.insert(
            handle,
            QpEntry {
                pd: pd.get(),
                work: Vec::new(),
            },
        );
        state.id_mut(id)?.qp = Some(handle);
        Ok(QpHandle(handle))
    }

    fn destroy_qp(&self, qp: QpHandle) {
        let mut state = self.state.lock();
        state.qps.remove(&qp.get());
        for entry in state.ids.values_mut() {
            if entry.qp == Some(qp.get()) {
                entry.qp = None;
            }
        }
    }

    fn connect(&self, id: CmId) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state.id(id)?;
        let remote = entry
            .remote
            .ok_or_else(|| RdmaError::transport("connect", "route not resolved"))?;
        if entry.qp.is_none() {
            return Err(RdmaError::transport("connect", "no qp"));
        }
        let listener = state
            .listeners
            .get(&remote)
            .or_else(|| state.listeners.get(&remote.wildcard()))
            .copied();
        let Some(listen_id) = listener else {
            state.notify(id.get(), CmEventKind::Rejected);
            return Ok(());
        };
        let listen_channel = state.id(CmId(listen_id))?.channel;
        let child = state.next();
        state.ids.insert(
            child,
            IdEntry {
                channel: listen_channel,
                local: Some(remote),
                peer: Some(id.get()),
                ..Default::default()
            },
        );
        state.id_mut(id)?.peer = Some(child);
        state.notify_with(child, CmEventKind::ConnectRequest, Some(listen_id));
        Ok(())
    }

    fn accept(&self, id: CmId) -> Result<()> {
        let mut state = self.state.lock();
        if state.faults.accept {
            return Err(RdmaError::transport("accept", "injected failure"));
        }
        let entry = state.id(id)?;
        if entry.qp.is_none() {
            return Err(RdmaError::transport("accept", "no qp"));
        }
        let peer = entry
            .peer
            .ok_or_else(|| RdmaError::transport("accept", "peer went away"))?;
        state.id_mut(id)?.connected = true;
        if let Some(peer_entry) = state.ids.get_mut(&peer) {
            peer_entry.connected = true;
        }
        state.notify(id.get(), CmEventKind::Established);
        state.notify(peer, CmEventKind::Established);
        Ok(())
    }

    fn reject(&self, id: CmId) -> Result<()> {
        let mut state = self.state.lock();
        let peer = state.id_mut(id)?.peer.take();
        if let Some(peer) = peer {
            if let Some(peer_entry) = state.ids.get_mut(&peer) {
                peer_entry.peer = None;
            }
            state.notify(peer, CmEventKind::Rejected);
        }
        Ok(())
    }

    fn disconnect(&self, id: CmId) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state.id_mut(id)?;
        if !entry.connected {
            return Err(RdmaError::transport("disconnect", "not connected"));
        }
        entry.connected = false;
        let peer = entry.peer.take();
        state.notify(id.get(), CmEventKind::Disconnected);
        if let Some(peer) = peer {
            if let Some(peer_entry) = state.ids.get_mut(&peer) {
                peer_entry.connected = false;
                peer_entry.peer = None;
            }
            state.notify(peer, CmEventKind::Disconnected);
        }
        Ok(())
    }

    fn post_recv(&self, qp: QpHandle, sge: Sge) -> Result<()> {
        let mut state = self.state.lock();
        state.check_sge(qp, &sge)?;
        if let Some(entry) = state.qps.get_mut(&qp.get()) {
            entry.work.push(WorkRequest {
                kind: WorkKind::Recv,
                sge,
            });
        }
        Ok(())
    }

    fn post_send(&self, qp: QpHandle, sge: Sge) -> Result<()> {
        let mut state = self.state.lock();
        state.check_sge(qp, &sge)?;
        if let Some(entry) = state.qps.get_mut(&qp.get()) {
            entry.work.push(WorkRequest {
                kind: WorkKind::Send,
                sge,
            });
        }
        Ok(())
    }
}
