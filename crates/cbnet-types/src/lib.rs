//! Leaf types shared by every cbnet crate.
//!
//! - `NetworkDescriptor`: the opaque 64-bit handle applications hold instead
//!   of connection pointers, with its lock-free codec and allocator.
//! - `WorkerId` / `Sequence`: the strongly-typed fields packed into it.
//! - `Address`: an IPv4 endpoint as accepted by `listen` and `connect`.

#[macro_use]
pub mod strong_type;

pub mod address;
pub mod descriptor;
pub mod ids;

pub use address::{Address, AddressParseError};
pub use descriptor::{DescriptorAllocator, DescriptorError, NetworkDescriptor, Role};
pub use ids::*;
