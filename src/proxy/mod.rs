//! Proxy traversal
//!
//! Client-side negotiation against HTTP CONNECT and SOCKS4/5 proxies. After a
//! successful negotiation the stream is opaque and is handed to the next link
//! layer.

mod http;
mod socks;

pub use http::http_connect;
pub use socks::{socks4_connect, socks5_connect};

use thiserror::Error;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Proxy authentication failed")]
    Auth,

    #[error("Proxy protocol error: {0}")]
    Protocol(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Connection refused by proxy")]
    ConnectionRefused,

    #[error("Host unreachable")]
    HostUnreachable,

    #[error("Network unreachable")]
    NetworkUnreachable,
}

/// Proxy target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address and port
    Ipv4([u8; 4], u16),
    /// IPv6 address and port
    Ipv6([u8; 16], u16),
    /// Domain name and port
    Domain(String, u16),
}

impl Address {
    /// Parse a `host:port` string
    pub fn parse(target: &str) -> Result<Self, ProxyError> {
        let (host, port_str) = target
            .rsplit_once(':')
            .ok_or_else(|| ProxyError::InvalidAddress(target.to_string()))?;

        let port: u16 = port_str
            .parse()
            .map_err(|_| ProxyError::InvalidAddress(target.to_string()))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');

        if let Ok(ip) = host.parse::<std::net::Ipv4Addr>() {
            Ok(Address::Ipv4(ip.octets(), port))
        } else if let Ok(ip) = host.parse::<std::net::Ipv6Addr>() {
            Ok(Address::Ipv6(ip.octets(), port))
        } else if host.is_empty() {
            Err(ProxyError::InvalidAddress(target.to_string()))
        } else {
            Ok(Address::Domain(host.to_string(), port))
        }
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) => *port,
            Address::Ipv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Ipv4(ip, port) => {
                write!(f, "{}.{}.{}.{}:{}", ip[0], ip[1], ip[2], ip[3], port)
            }
            Address::Ipv6(ip, port) => {
                write!(f, "[{}]:{}", std::net::Ipv6Addr::from(*ip), port)
            }
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}
