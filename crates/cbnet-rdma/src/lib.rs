//! RDMA connection management.
//!
//! Turns the event-driven connection-manager and verbs primitives into a
//! descriptor-based API: `listen`, `connect`, `close` and per-connection
//! counters, callable from any thread.
//!
//! # Architecture
//!
//! - [`Environment`]: owns the device, the event channel, the dispatcher
//!   thread, the workers and the server registry.
//! - [`Worker`]: a protection domain and completion queue shared by its
//!   connections, plus the live and closing connection registries.
//! - [`Server`]: a listening identity and the defaults for accepted
//!   connections.
//! - [`Connection`]: one peer link and its state machine.
//! - [`fabric::Fabric`]: the transport seam; [`fabric::loopback`] is an
//!   in-process implementation.

pub mod buf;
pub mod config;
pub mod connection;
pub mod control;
pub mod device;
mod dispatch;
pub mod env;
pub mod error;
pub mod fabric;
pub mod hooks;
pub mod listener;
pub mod worker;

pub use buf::{BufferSpec, ConnBuffers, MemoryBlock, MemoryClass};
pub use config::EnvConfig;
pub use connection::{ConnCounters, ConnRef, ConnState, Connection};
pub use env::{CloseOutcome, EnvMetrics, Environment};
pub use error::{RdmaError, Result};
pub use hooks::{accept_callback, AcceptCallback, ConnCallback, Hooks, UserContext};
pub use listener::Server;
pub use worker::{MapKind, Worker};
