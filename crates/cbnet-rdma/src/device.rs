//! RDMA device selection.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::error::{RdmaError, Result};
use crate::fabric::{DeviceHandle, Fabric};

/// An opened device context, closed on drop.
pub struct OwnedDevice {
    fabric: Arc<dyn Fabric>,
    handle: DeviceHandle,
    name: String,
}

impl OwnedDevice {
    /// Open the device that serves `ip`.
    ///
    /// The device list is scanned for the first entry whose name starts with
    /// the name the transport reports for `ip`.
    pub fn open_for_ip(fabric: Arc<dyn Fabric>, ip: Ipv4Addr) -> Result<Self> {
        let wanted = fabric.device_for_ip(ip)?;
        let devices = fabric.list_devices()?;
        if devices.is_empty() {
            return Err(RdmaError::Device("no RDMA devices present".into()));
        }
        let name = devices
            .into_iter()
            .find(|d| d.starts_with(&wanted))
            .ok_or_else(|| RdmaError::Device(format!("device {wanted} for {ip} not listed")))?;
        let handle = fabric.open_device(&name)?;
        tracing::info!(device = %name, %ip, "opened RDMA device");
        Ok(Self {
            fabric,
            handle,
            name,
        })
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for OwnedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedDevice")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .finish()
    }
}

impl Drop for OwnedDevice {
    fn drop(&mut self) {
        tracing::debug!(device = %self.name, "closing RDMA device");
        self.fabric.close_device(self.handle);
    }
}
