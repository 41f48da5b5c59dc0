use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// IPv4 endpoint used by `listen` and `connect`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    /// IPv4 address, most significant octet first.
    pub ip: u32,
    pub port: u16,
}

impl Address {
    pub const fn new(ip: u32, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn from_octets(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        Self {
            ip: u32::from_be_bytes([a, b, c, d]),
            port,
        }
    }

    /// Build an address from a dotted-quad string and a port, as the public
    /// `listen`/`connect` entry points receive them.
    pub fn parse_ip(ip: &str, port: u16) -> Result<Self, AddressParseError> {
        let ip: Ipv4Addr = ip
            .trim()
            .parse()
            .map_err(|_| AddressParseError::InvalidIp(ip.to_string()))?;
        Ok(Self::from(SocketAddrV4::new(ip, port)))
    }

    pub fn octets(&self) -> [u8; 4] {
        self.ip.to_be_bytes()
    }

    pub fn ipv4(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip)
    }

    pub fn is_unspecified(&self) -> bool {
        self.ip == 0
    }

    /// Same port on `0.0.0.0`.
    pub fn wildcard(&self) -> Self {
        Self::new(0, self.port)
    }

    pub fn to_socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ipv4(), self.port)
    }
}

impl From<SocketAddrV4> for Address {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(u32::from(*addr.ip()), addr.port())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.octets();
        write!(f, "{}.{}.{}.{}:{}", a, b, c, d, self.port)
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    /// Parse `"192.168.1.1:8080"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip_str, port_str) = s.rsplit_once(':').ok_or(AddressParseError::MissingPort)?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| AddressParseError::InvalidPort(port_str.to_string()))?;
        Self::parse_ip(ip_str, port)
    }
}

/// Errors when parsing an `Address`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    #[error("missing port")]
    MissingPort,
    #[error("invalid port number: {0}")]
    InvalidPort(String),
    #[error("invalid IPv4 address: {0}")]
    InvalidIp(String),
}
