//! Transport seam.
//!
//! [`Fabric`] is the connection-manager plus verbs surface the core drives.
//! Every transport object is named by an opaque handle; the trait mirrors the
//! shape of the rdma_cm/ibverbs C API so a hardware backend maps one call to
//! one primitive. [`loopback::LoopbackFabric`] is a complete in-process
//! implementation.

pub mod loopback;

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cbnet_types::{strong_type, Address};

use crate::error::Result;

strong_type!(
    /// Opened device context.
    DeviceHandle,
    u64
);
strong_type!(
    /// Connection-manager event channel.
    ChannelHandle,
    u64
);
strong_type!(
    /// Connection-manager identity (`rdma_cm_id`).
    CmId,
    u64
);
strong_type!(PdHandle, u64);
strong_type!(CqHandle, u64);
strong_type!(QpHandle, u64);

/// A registered memory range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub addr: u64,
    pub len: usize,
    pub lkey: u32,
    pub rkey: u32,
}

/// Scatter-gather entry of a work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub len: u32,
    pub lkey: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
}

/// Connection-manager event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmEventKind {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    ConnectResponse,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    DeviceRemoval,
    MulticastJoin,
    MulticastError,
    AddrChange,
    TimewaitExit,
    Unknown(u32),
}

impl fmt::Display for CmEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CmEventKind::Unknown(code) => write!(f, "UNKNOWN({code})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// How the dispatcher treats an event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    AddrResolved,
    RouteResolved,
    Established,
    ConnectRequest,
    Disconnect,
    Ignore,
    Unsupported,
}

impl CmEventKind {
    /// The closed dispatch table. Anything `Unsupported` is fatal.
    pub fn classify(self) -> EventClass {
        match self {
            CmEventKind::AddrResolved => EventClass::AddrResolved,
            CmEventKind::RouteResolved => EventClass::RouteResolved,
            CmEventKind::Established => EventClass::Established,
            CmEventKind::ConnectRequest => EventClass::ConnectRequest,
            CmEventKind::AddrError
            | CmEventKind::RouteError
            | CmEventKind::Rejected
            | CmEventKind::Unreachable
            | CmEventKind::ConnectError
            | CmEventKind::Disconnected => EventClass::Disconnect,
            CmEventKind::TimewaitExit => EventClass::Ignore,
            CmEventKind::ConnectResponse
            | CmEventKind::DeviceRemoval
            | CmEventKind::MulticastJoin
            | CmEventKind::MulticastError
            | CmEventKind::AddrChange
            | CmEventKind::Unknown(_) => EventClass::Unsupported,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmEvent {
    pub kind: CmEventKind,
    /// Identity the event concerns. For `ConnectRequest` this is the newly
    /// created identity of the inbound connection.
    pub id: CmId,
    /// Listening identity, set for `ConnectRequest` only.
    pub listen_id: Option<CmId>,
}

/// Connection-manager and verbs primitives.
///
/// Blocking is confined to [`Fabric::get_event`]; every other call returns
/// promptly and reports progress through events on the identity's channel.
pub trait Fabric: Send + Sync + 'static {
    fn list_devices(&self) -> Result<Vec<String>>;
    /// Name of the device that owns `ip`.
    fn device_for_ip(&self, ip: Ipv4Addr) -> Result<String>;
    fn open_device(&self, name: &str) -> Result<DeviceHandle>;
    fn close_device(&self, device: DeviceHandle);

    fn create_event_channel(&self) -> Result<ChannelHandle>;
    /// Block until the next event. Returns `None` once the channel is
    /// destroyed.
    fn get_event(&self, channel: ChannelHandle) -> Option<CmEvent>;
    fn ack_event(&self, event: &CmEvent);
    fn destroy_event_channel(&self, channel: ChannelHandle);

    fn alloc_pd(&self, device: DeviceHandle) -> Result<PdHandle>;
    fn dealloc_pd(&self, pd: PdHandle);
    fn create_cq(&self, device: DeviceHandle, depth: u32) -> Result<CqHandle>;
    fn destroy_cq(&self, cq: CqHandle);
    fn reg_mr(&self, pd: PdHandle, addr: u64, len: usize) -> Result<MemoryRegion>;
    fn dereg_mr(&self, mr: &MemoryRegion);

    fn create_id(&self, channel: ChannelHandle) -> Result<CmId>;
    fn destroy_id(&self, id: CmId);
    fn bind_addr(&self, id: CmId, addr: Address) -> Result<()>;
    fn listen(&self, id: CmId, backlog: u32) -> Result<()>;
    fn resolve_addr(&self, id: CmId, dst: Address, timeout: Duration) -> Result<()>;
    fn resolve_route(&self, id: CmId, timeout: Duration) -> Result<()>;
    fn create_qp(&self, id: CmId, pd: PdHandle, cq: CqHandle, caps: &QpCaps) -> Result<QpHandle>;
    fn destroy_qp(&self, qp: QpHandle);
    fn connect(&self, id: CmId) -> Result<()>;
    fn accept(&self, id: CmId) -> Result<()>;
    fn reject(&self, id: CmId) -> Result<()>;
    fn disconnect(&self, id: CmId) -> Result<()>;

    fn post_recv(&self, qp: QpHandle, sge: Sge) -> Result<()>;
    fn post_send(&self, qp: QpHandle, sge: Sge) -> Result<()>;
}

/// Event channel destroyed on drop. `destroy` may run earlier to wake a
/// thread blocked in `get_event`.
pub struct OwnedChannel {
    fabric: Arc<dyn Fabric>,
    handle: ChannelHandle,
    destroyed: AtomicBool,
}

impl OwnedChannel {
    pub fn create(fabric: Arc<dyn Fabric>) -> Result<Self> {
        let handle = fabric.create_event_channel()?;
        Ok(Self {
            fabric,
            handle,
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn handle(&self) -> ChannelHandle {
        self.handle
    }

    pub fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            self.fabric.destroy_event_channel(self.handle);
        }
    }
}

impl Drop for OwnedChannel {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Connection-manager identity destroyed on drop.
pub struct OwnedCmId {
    fabric: Arc<dyn Fabric>,
    id: CmId,
}

impl OwnedCmId {
    pub fn create(fabric: Arc<dyn Fabric>, channel: ChannelHandle) -> Result<Self> {
        let id = fabric.create_id(channel)?;
        Ok(Self { fabric, id })
    }

    /// Take ownership of an identity the transport created, such as the one
    /// carried by a connect request.
    pub fn adopt(fabric: Arc<dyn Fabric>, id: CmId) -> Self {
        Self { fabric, id }
    }

    pub fn id(&self) -> CmId {
        self.id
    }

    pub fn fabric(&self) -> &Arc<dyn Fabric> {
        &self.fabric
    }
}

impl fmt::Debug for OwnedCmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnedCmId({})", self.id)
    }
}

impl Drop for OwnedCmId {
    fn drop(&mut self) {
        self.fabric.destroy_id(self.id);
    }
}
