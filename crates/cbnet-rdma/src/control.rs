//! Control commands exchanged through the meta buffers.
//!
//! Layout, little-endian:
//!
//! ```text
//! magic:u16 | opcode:u8 | reserved:u8 | block_size:u32 | block_count:u32
//! block_count x ( addr:u64 | len:u32 | rkey:u32 )
//! ```

use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

pub const CONTROL_MAGIC: u16 = 0xCB4E;
pub const HEADER_LEN: usize = 12;
pub const ENTRY_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    RegisterRecvBuffers = 1,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("control message truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("bad control magic {0:#06x}")]
    BadMagic(u16),
    #[error("unknown control opcode {0}")]
    UnknownOpcode(u8),
}

/// A receive block the peer may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAdvert {
    pub addr: u64,
    pub len: u32,
    pub rkey: u32,
}

/// Advertises a connection's registered receive blocks to its peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRecvBuffers {
    pub block_size: u32,
    pub blocks: Vec<BlockAdvert>,
}

impl RegisterRecvBuffers {
    pub fn encoded_len_for(block_count: usize) -> usize {
        HEADER_LEN + ENTRY_LEN * block_count
    }

    pub fn encoded_len(&self) -> usize {
        Self::encoded_len_for(self.blocks.len())
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u16_le(CONTROL_MAGIC);
        dst.put_u8(Opcode::RegisterRecvBuffers.into());
        dst.put_u8(0);
        dst.put_u32_le(self.block_size);
        dst.put_u32_le(self.blocks.len() as u32);
        for block in &self.blocks {
            dst.put_u64_le(block.addr);
            dst.put_u32_le(block.len);
            dst.put_u32_le(block.rkey);
        }
    }

    pub fn decode(mut src: &[u8]) -> Result<Self, ControlError> {
        if src.len() < HEADER_LEN {
            return Err(ControlError::Truncated {
                need: HEADER_LEN,
                have: src.len(),
            });
        }
        let magic = src.get_u16_le();
        if magic != CONTROL_MAGIC {
            return Err(ControlError::BadMagic(magic));
        }
        let opcode = src.get_u8();
        Opcode::try_from(opcode).map_err(|_| ControlError::UnknownOpcode(opcode))?;
        src.advance(1);
        let block_size = src.get_u32_le();
        let count = src.get_u32_le() as usize;
        let need = ENTRY_LEN * count;
        if src.remaining() < need {
            return Err(ControlError::Truncated {
                need: HEADER_LEN + need,
                have: HEADER_LEN + src.remaining(),
            });
        }
        let blocks = (0..count)
            .map(|_| BlockAdvert {
                addr: src.get_u64_le(),
                len: src.get_u32_le(),
                rkey: src.get_u32_le(),
            })
            .collect();
        Ok(Self { block_size, blocks })
    }
}
