use cbnet_config::ConfigError;
use cbnet_types::{AddressParseError, DescriptorError, NetworkDescriptor, WorkerId};
use thiserror::Error;

use crate::connection::ConnState;

/// Errors surfaced by the connection layer.
#[derive(Debug, Error)]
pub enum RdmaError {
    #[error("receive block size {size} below minimum {min}")]
    BlockSizeTooSmall { size: u32, min: u32 },

    #[error("receive block count {count} below minimum {min}")]
    BlockCountTooSmall { count: u32, min: u32 },

    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddressParseError),

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(#[from] DescriptorError),

    #[error("device error: {0}")]
    Device(String),

    /// A transport primitive failed.
    #[error("{op} failed: {reason}")]
    Transport { op: &'static str, reason: String },

    #[error("memory registration of {len} bytes failed: {reason}")]
    Registration { len: usize, reason: String },

    #[error("connect {nd} timed out after {waited_ms} ms")]
    ConnectTimeout { nd: NetworkDescriptor, waited_ms: u64 },

    #[error("connect {nd} failed in state {state}")]
    ConnectFailed { nd: NetworkDescriptor, state: ConnState },

    #[error("no such worker: {0}")]
    NoSuchWorker(WorkerId),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("environment is shutting down")]
    ShuttingDown,
}

impl RdmaError {
    pub fn transport(op: &'static str, reason: impl Into<String>) -> Self {
        RdmaError::Transport {
            op,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RdmaError>;

#[cfg(test)]
mod tests {
    use super::*;
    use cbnet_types::{Role, Sequence};

    #[test]
    fn test_display_minimums() {
        let err = RdmaError::BlockSizeTooSmall { size: 63, min: 64 };
        assert_eq!(err.to_string(), "receive block size 63 below minimum 64");
        let err = RdmaError::BlockCountTooSmall { count: 3, min: 4 };
        assert!(err.to_string().contains("count 3"));
    }

    #[test]
    fn test_display_transport() {
        let err = RdmaError::transport("resolve_route", "no route to host");
        assert_eq!(err.to_string(), "resolve_route failed: no route to host");
    }

    #[test]
    fn test_display_connect_failed() {
        let nd = NetworkDescriptor::new(Role::Active, WorkerId(0), Sequence(4));
        let err = RdmaError::ConnectFailed {
            nd,
            state: ConnState::Disconnected,
        };
        assert_eq!(
            err.to_string(),
            "connect nd(active/w0/#4) failed in state DISCONNECTED"
        );
    }

    #[test]
    fn test_address_error_conversion() {
        let parse_err = cbnet_types::Address::parse_ip("x", 1).unwrap_err();
        let err: RdmaError = parse_err.into();
        assert!(matches!(err, RdmaError::InvalidAddress(_)));
    }
}
