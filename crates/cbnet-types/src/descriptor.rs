//! Network descriptor codec.
//!
//! A descriptor is the opaque 64-bit handle handed to applications in place
//! of a connection or listener reference. Internally it is a tagged struct;
//! the packed form only exists at the API boundary:
//!
//! ```text
//!  63  62  61          48 47                                   0
//! +---+---+--------------+--------------------------------------+
//! | S | A |  worker (14) |             sequence (48)            |
//! +---+---+--------------+--------------------------------------+
//! ```
//!
//! `S` marks a listener, `A` an actively originated connection; a passively
//! accepted connection has neither bit. Decoding is a pure function and needs
//! no lock.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

use crate::ids::{Sequence, WorkerId};

const ROLE_SHIFT: u32 = 62;
const WORKER_SHIFT: u32 = 48;
const WORKER_BITS: u32 = 14;
const WORKER_MASK: u64 = (1 << WORKER_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << WORKER_SHIFT) - 1;

/// Largest worker count a descriptor can address.
pub const MAX_WORKERS: usize = 1 << WORKER_BITS;

/// What kind of entity a descriptor names.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum Role {
    /// Connection created by a listener's accept path.
    Passive = 0b00,
    /// Connection originated by `connect`.
    Active = 0b01,
    /// Listener created by `listen`.
    Server = 0b10,
}

impl Role {
    pub fn is_server(self) -> bool {
        self == Role::Server
    }

    pub fn is_connection(self) -> bool {
        !self.is_server()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Passive => write!(f, "passive"),
            Role::Active => write!(f, "active"),
            Role::Server => write!(f, "server"),
        }
    }
}

/// Errors decoding a raw descriptor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("descriptor {0:#018x} has both server and active bits set")]
    InvalidRole(u64),
    #[error("descriptor {0:#018x} has a zero sequence")]
    ZeroSequence(u64),
}

/// Decoded form of a network descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u64", try_from = "u64")]
pub struct NetworkDescriptor {
    raw: u64,
}

impl NetworkDescriptor {
    /// Pack the three fields. The worker and sequence are truncated to their
    /// field widths; callers obtain descriptors from `DescriptorAllocator`,
    /// which never exceeds them.
    pub fn new(role: Role, worker: WorkerId, sequence: Sequence) -> Self {
        let role_bits = u8::from(role) as u64;
        let raw = (role_bits << ROLE_SHIFT)
            | ((worker.0 as u64 & WORKER_MASK) << WORKER_SHIFT)
            | (sequence.0 & SEQUENCE_MASK);
        Self { raw }
    }

    /// Decode a raw handle received from an application.
    pub fn decode(raw: u64) -> Result<Self, DescriptorError> {
        let role_bits = (raw >> ROLE_SHIFT) as u8;
        Role::try_from(role_bits).map_err(|_| DescriptorError::InvalidRole(raw))?;
        if raw & SEQUENCE_MASK == 0 {
            return Err(DescriptorError::ZeroSequence(raw));
        }
        Ok(Self { raw })
    }

    /// The packed 64-bit form.
    pub fn encode(self) -> u64 {
        self.raw
    }

    pub fn role(self) -> Role {
        // Every constructor validated the role bits.
        match (self.raw >> ROLE_SHIFT) as u8 {
            0b10 => Role::Server,
            0b01 => Role::Active,
            _ => Role::Passive,
        }
    }

    pub fn worker(self) -> WorkerId {
        WorkerId(((self.raw >> WORKER_SHIFT) & WORKER_MASK) as u16)
    }

    pub fn sequence(self) -> Sequence {
        Sequence(self.raw & SEQUENCE_MASK)
    }
}

impl fmt::Debug for NetworkDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for NetworkDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "nd({}/w{}/#{})",
            self.role(),
            self.worker(),
            self.sequence()
        )
    }
}

impl From<NetworkDescriptor> for u64 {
    fn from(nd: NetworkDescriptor) -> Self {
        nd.encode()
    }
}

impl TryFrom<u64> for NetworkDescriptor {
    type Error = DescriptorError;

    fn try_from(raw: u64) -> Result<Self, Self::Error> {
        Self::decode(raw)
    }
}

/// Hands out fresh descriptors.
///
/// Workers are chosen round-robin; the sequence is a process-lifetime
/// counter starting at 1, so no two allocations ever collide.
#[derive(Debug)]
pub struct DescriptorAllocator {
    worker_count: u16,
    next_worker: AtomicU64,
    next_sequence: AtomicU64,
}

impl DescriptorAllocator {
    /// `worker_count` must be in `1..=MAX_WORKERS`.
    pub fn new(worker_count: usize) -> Self {
        assert!(
            (1..=MAX_WORKERS).contains(&worker_count),
            "worker count {worker_count} outside 1..={MAX_WORKERS}"
        );
        Self {
            worker_count: worker_count as u16,
            next_worker: AtomicU64::new(0),
            next_sequence: AtomicU64::new(1),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count as usize
    }

    /// Allocate a descriptor on the next worker in round-robin order.
    pub fn allocate(&self, role: Role) -> NetworkDescriptor {
        let slot = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let worker = WorkerId((slot % self.worker_count as u64) as u16);
        self.allocate_on(role, worker)
    }

    /// Allocate a descriptor pinned to `worker`.
    pub fn allocate_on(&self, role: Role, worker: WorkerId) -> NetworkDescriptor {
        debug_assert!(worker.index() < self.worker_count());
        let sequence = Sequence(self.next_sequence.fetch_add(1, Ordering::Relaxed));
        NetworkDescriptor::new(role, worker, sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_fields_survive_encoding() {
        let nd = NetworkDescriptor::new(Role::Active, WorkerId(7), Sequence(123_456));
        let back = NetworkDescriptor::decode(nd.encode()).unwrap();
        assert_eq!(back.role(), Role::Active);
        assert_eq!(back.worker(), WorkerId(7));
        assert_eq!(back.sequence(), Sequence(123_456));
    }

    #[test]
    fn test_role_bits() {
        let server = NetworkDescriptor::new(Role::Server, WorkerId(0), Sequence(1));
        assert_eq!(server.encode() >> 63, 1);
        let active = NetworkDescriptor::new(Role::Active, WorkerId(0), Sequence(1));
        assert_eq!((active.encode() >> 62) & 1, 1);
        let passive = NetworkDescriptor::new(Role::Passive, WorkerId(0), Sequence(1));
        assert_eq!(passive.encode() >> 62, 0);
    }

    #[test]
    fn test_decode_rejects_both_role_bits() {
        let raw = (0b11u64 << 62) | 1;
        assert_eq!(
            NetworkDescriptor::decode(raw),
            Err(DescriptorError::InvalidRole(raw))
        );
    }

    #[test]
    fn test_decode_rejects_zero_sequence() {
        assert!(matches!(
            NetworkDescriptor::decode(1u64 << 62),
            Err(DescriptorError::ZeroSequence(_))
        ));
    }

    #[test]
    fn test_allocator_round_robin() {
        let alloc = DescriptorAllocator::new(3);
        let workers: Vec<u16> = (0..6)
            .map(|_| alloc.allocate(Role::Active).worker().get())
            .collect();
        assert_eq!(workers, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_allocate_on_pins_worker() {
        let alloc = DescriptorAllocator::new(4);
        let nd = alloc.allocate_on(Role::Passive, WorkerId(2));
        assert_eq!(nd.worker(), WorkerId(2));
        assert_eq!(nd.role(), Role::Passive);
    }

    #[test]
    fn test_allocations_are_unique_across_threads() {
        let alloc = Arc::new(DescriptorAllocator::new(4));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let alloc = Arc::clone(&alloc);
                std::thread::spawn(move || {
                    let role = if i % 2 == 0 { Role::Active } else { Role::Server };
                    (0..1000).map(|_| alloc.allocate(role)).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for nd in handle.join().unwrap() {
                assert!(nd.worker().index() < 4);
                assert!(seen.insert(nd.encode()), "duplicate descriptor {nd}");
            }
        }
        assert_eq!(seen.len(), 4000);
    }

    #[test]
    fn test_display() {
        let nd = NetworkDescriptor::new(Role::Server, WorkerId(1), Sequence(9));
        assert_eq!(nd.to_string(), "nd(server/w1/#9)");
    }

    #[test]
    fn test_serde_as_raw_u64() {
        let nd = NetworkDescriptor::new(Role::Active, WorkerId(2), Sequence(5));
        let json = serde_json::to_string(&nd).unwrap();
        assert_eq!(json, nd.encode().to_string());
        let back: NetworkDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, nd);
        assert!(serde_json::from_str::<NetworkDescriptor>("0").is_err());
    }
}
