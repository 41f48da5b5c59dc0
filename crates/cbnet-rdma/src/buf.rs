//! Registered buffers owned by a connection.

use std::fmt;
use std::sync::Arc;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

use crate::control::{BlockAdvert, ControlError, RegisterRecvBuffers};
use crate::error::{RdmaError, Result};
use crate::fabric::{Fabric, MemoryRegion, PdHandle, Sge};

/// Smallest receive block accepted by `listen`/`connect`.
pub const MIN_BLOCK_SIZE: u32 = 64;
/// Smallest receive block count accepted by `listen`/`connect`.
pub const MIN_BLOCK_COUNT: u32 = 4;
/// Floor for the control (meta) buffers.
pub const MIN_META_SIZE: usize = 64;

/// Where a buffer's memory comes from.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    IntoPrimitive,
    TryFromPrimitive,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
#[serde(rename_all = "lowercase")]
pub enum MemoryClass {
    #[default]
    Normal = 0,
    /// Device-selectable memory; backed by host memory here.
    Device = 1,
}

/// Receive buffer geometry for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSpec {
    pub block_size: u32,
    pub block_count: u32,
    #[serde(default)]
    pub memory_class: MemoryClass,
}

impl BufferSpec {
    pub fn new(block_size: u32, block_count: u32, memory_class: MemoryClass) -> Self {
        Self {
            block_size,
            block_count,
            memory_class,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size < MIN_BLOCK_SIZE {
            return Err(RdmaError::BlockSizeTooSmall {
                size: self.block_size,
                min: MIN_BLOCK_SIZE,
            });
        }
        if self.block_count < MIN_BLOCK_COUNT {
            return Err(RdmaError::BlockCountTooSmall {
                count: self.block_count,
                min: MIN_BLOCK_COUNT,
            });
        }
        Ok(())
    }

    /// Size of each meta buffer: large enough for the staged
    /// `RegisterRecvBuffers` command.
    pub fn meta_size(&self) -> usize {
        RegisterRecvBuffers::encoded_len_for(self.block_count as usize).max(MIN_META_SIZE)
    }
}

/// Host memory registered with the transport; deregistered on drop.
pub struct MemoryBlock {
    fabric: Arc<dyn Fabric>,
    mr: MemoryRegion,
    class: MemoryClass,
    data: Box<[u8]>,
}

impl MemoryBlock {
    pub fn register(
        fabric: &Arc<dyn Fabric>,
        pd: PdHandle,
        len: usize,
        class: MemoryClass,
    ) -> Result<Self> {
        let data = vec![0u8; len].into_boxed_slice();
        let mr = fabric.reg_mr(pd, data.as_ptr() as u64, len)?;
        Ok(Self {
            fabric: Arc::clone(fabric),
            mr,
            class,
            data,
        })
    }

    pub fn region(&self) -> &MemoryRegion {
        &self.mr
    }

    pub fn class(&self) -> MemoryClass {
        self.class
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Whole-buffer scatter-gather entry.
    pub fn sge(&self) -> Sge {
        Sge {
            addr: self.mr.addr,
            len: self.data.len() as u32,
            lkey: self.mr.lkey,
        }
    }

    pub fn advert(&self) -> BlockAdvert {
        BlockAdvert {
            addr: self.mr.addr,
            len: self.data.len() as u32,
            rkey: self.mr.rkey,
        }
    }
}

impl fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("addr", &format_args!("{:#x}", self.mr.addr))
            .field("len", &self.data.len())
            .field("lkey", &self.mr.lkey)
            .field("class", &self.class)
            .finish()
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        self.fabric.dereg_mr(&self.mr);
    }
}

/// The registered buffer set of one connection.
#[derive(Debug)]
pub struct ConnBuffers {
    spec: BufferSpec,
    data: Vec<MemoryBlock>,
    send_meta: MemoryBlock,
    recv_meta: MemoryBlock,
}

impl ConnBuffers {
    /// Register in protocol order: receive data blocks, send meta, stage the
    /// `RegisterRecvBuffers` command into send meta, receive meta. A failure
    /// at any step releases whatever was registered before it.
    pub fn register(fabric: &Arc<dyn Fabric>, pd: PdHandle, spec: BufferSpec) -> Result<Self> {
        spec.validate()?;
        let data = (0..spec.block_count)
            .map(|_| MemoryBlock::register(fabric, pd, spec.block_size as usize, spec.memory_class))
            .collect::<Result<Vec<_>>>()?;

        let meta_size = spec.meta_size();
        let mut send_meta = MemoryBlock::register(fabric, pd, meta_size, MemoryClass::Normal)?;

        let command = RegisterRecvBuffers {
            block_size: spec.block_size,
            blocks: data.iter().map(MemoryBlock::advert).collect(),
        };
        let mut dst = send_meta.as_mut_slice();
        command.encode(&mut dst);

        let recv_meta = MemoryBlock::register(fabric, pd, meta_size, MemoryClass::Normal)?;

        Ok(Self {
            spec,
            data,
            send_meta,
            recv_meta,
        })
    }

    pub fn spec(&self) -> &BufferSpec {
        &self.spec
    }

    pub fn data_blocks(&self) -> &[MemoryBlock] {
        &self.data
    }

    pub fn send_meta(&self) -> &MemoryBlock {
        &self.send_meta
    }

    pub fn recv_meta(&self) -> &MemoryBlock {
        &self.recv_meta
    }

    /// Decode the command staged in the send meta buffer.
    pub fn staged_command(&self) -> std::result::Result<RegisterRecvBuffers, ControlError> {
        RegisterRecvBuffers::decode(self.send_meta.as_slice())
    }
}
