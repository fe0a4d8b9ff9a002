//! Link protocol stack
//!
//! Composes a single reliable, ordered, encrypted byte stream from stacked
//! link layers: physical TCP, optional proxy traversal, optional circuit
//! relay chain, TLS. Every layer exposes the same stream contract
//! ([`LinkStream`]); composition is driven by the [`Endpoint`] descriptor at
//! runtime.

pub mod buffered;
pub mod circuit;
mod tcp;
mod tls;

pub use buffered::{BufferedReader, BufferedStream, BufferedWriter};
pub use circuit::Relay;
pub use tls::TlsContext;

use crate::config::CircuitNode;
use crate::endpoint::{Endpoint, EndpointError, ProxyEndpoint};
use crate::proxy::{self, ProxyError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Uniform stream contract shared by every link layer
pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug> LinkStream for T {}

/// A fully composed link stack
pub type BoxedStream = Box<dyn LinkStream>;

/// Default TLS handshake timeout
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default TCP connect timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Network unreachable")]
    NetworkUnreachable,

    #[error("Timeout")]
    TimedOut,

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Circuit hop {hop} failed")]
    CircuitHop { hop: usize },

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("TLS peer verification failed")]
    TlsPeerVerify,

    #[error("Connection closed")]
    Closed,
}

impl From<EndpointError> for TransportError {
    fn from(err: EndpointError) -> Self {
        TransportError::InvalidArgument(err.to_string())
    }
}

/// Flattened dial plan derived from a recursive endpoint.
///
/// The physical TCP connection goes to the proxy when one is configured,
/// otherwise to the entry node (the first circuit hop, or the terminal server
/// when no circuit is used). `hops` are the relay requests issued in order;
/// the last entry is always the terminal server when a circuit is present.
struct DialPlan<'a> {
    dial: CircuitNode,
    proxy: Option<&'a ProxyEndpoint>,
    proxy_target: CircuitNode,
    hops: Vec<CircuitNode>,
    tls: Option<&'a crate::config::TlsConfig>,
}

fn plan(endpoint: &Endpoint) -> Result<DialPlan<'_>, TransportError> {
    // Peel layers outermost first; only the canonical order
    // tls? -> circuit? -> proxy? -> tcp is a valid stack.
    let mut current = endpoint;

    let tls = match current {
        Endpoint::Tls { tls, next } => {
            current = next;
            Some(tls)
        }
        _ => None,
    };

    let circuit = match current {
        Endpoint::Circuit { nodes, next } => {
            if nodes.is_empty() {
                return Err(TransportError::InvalidArgument(
                    "circuit: empty node list".to_string(),
                ));
            }
            current = next;
            Some(nodes)
        }
        _ => None,
    };

    let proxy = match current {
        Endpoint::Proxy { proxy, next } => {
            current = next;
            Some(proxy)
        }
        _ => None,
    };

    let Endpoint::Tcp { host, port } = current else {
        return Err(TransportError::InvalidArgument(
            "malformed endpoint stack".to_string(),
        ));
    };
    let terminal = CircuitNode {
        host: host.clone(),
        port: *port,
    };

    let (entry, hops) = match circuit {
        Some(nodes) => {
            let mut hops: Vec<CircuitNode> = nodes[1..].to_vec();
            hops.push(terminal);
            (nodes[0].clone(), hops)
        }
        None => (terminal, Vec::new()),
    };

    let dial = match proxy {
        Some(ProxyEndpoint::Http(http)) => CircuitNode {
            host: http.host.clone(),
            port: http.port,
        },
        Some(ProxyEndpoint::Socks(socks)) => CircuitNode {
            host: socks.host.clone(),
            port: socks.port,
        },
        None => entry.clone(),
    };

    Ok(DialPlan {
        dial,
        proxy,
        proxy_target: entry,
        hops,
        tls,
    })
}

/// Connect the full client link stack described by `endpoint`.
pub async fn connect_endpoint(endpoint: &Endpoint) -> Result<BoxedStream, TransportError> {
    let plan = plan(endpoint)?;

    let mut stream: BoxedStream =
        Box::new(tcp::connect(&plan.dial.host, plan.dial.port, CONNECT_TIMEOUT).await?);

    match plan.proxy {
        Some(ProxyEndpoint::Http(http)) => {
            proxy::http_connect(&mut stream, http, &plan.proxy_target.to_string()).await?;
            debug!(target: "network_crypto", "http proxy traversed via {}", plan.dial);
        }
        Some(ProxyEndpoint::Socks(socks)) => {
            let target = plan.proxy_target.to_string();
            match socks.version {
                4 => proxy::socks4_connect(&mut stream, socks, &target).await?,
                5 => proxy::socks5_connect(&mut stream, socks, &target).await?,
                v => {
                    return Err(TransportError::InvalidArgument(format!(
                        "socks_proxy: unsupported version {}",
                        v
                    )))
                }
            }
            debug!(target: "network_crypto", "socks proxy traversed via {}", plan.dial);
        }
        None => {}
    }

    for (hop, node) in plan.hops.iter().enumerate() {
        circuit::relay_request(&mut stream, node)
            .await
            .map_err(|_| TransportError::CircuitHop { hop })?;
        debug!(target: "network_crypto", "circuit hop {} established to {}", hop, node);
    }

    if let Some(tls_config) = plan.tls {
        let context = TlsContext::from_config(tls_config)?;
        let sni = endpoint.target().0.to_string();
        stream = context.client_handshake(stream, &sni, HANDSHAKE_TIMEOUT).await?;
        debug!(target: "network_crypto", "tls handshake complete");
    }

    Ok(stream)
}

/// Server side of the link stack: TCP listen, then TLS accept per connection.
pub struct Listener {
    listener: tokio::net::TcpListener,
    tls: Option<TlsContext>,
}

impl Listener {
    /// Bind a listener; when `tls` is set every accepted connection performs
    /// a server-side handshake with mandatory client verification.
    pub async fn bind(
        addr: &str,
        tls: Option<&crate::config::TlsConfig>,
    ) -> Result<Self, TransportError> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let tls = tls.map(TlsContext::from_config).transpose()?;
        Ok(Self { listener, tls })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one connection and run it through the TLS layer when enabled.
    pub async fn accept(&self) -> Result<(BoxedStream, std::net::SocketAddr), TransportError> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true).ok();

        let stream: BoxedStream = match &self.tls {
            Some(context) => {
                context
                    .server_handshake(Box::new(stream), HANDSHAKE_TIMEOUT)
                    .await?
            }
            None => Box::new(stream),
        };

        Ok((stream, peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, SocksProxyConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_direct_tcp_stack() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let endpoint = Endpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port: addr.port(),
        };
        let mut stream = connect_endpoint(&endpoint).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_socks5_stack_traversal() {
        // Minimal SOCKS5 proxy that tunnels to the requested IPv4 target.
        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy.local_addr().unwrap();

        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 1];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        tokio::spawn(async move {
            let (mut stream, _) = proxy.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[5, 0]).await.unwrap();
            let mut request = [0u8; 10];
            stream.read_exact(&mut request).await.unwrap();
            let ip = std::net::Ipv4Addr::new(request[4], request[5], request[6], request[7]);
            let port = u16::from_be_bytes([request[8], request[9]]);
            let upstream = tokio::net::TcpStream::connect((ip, port)).await.unwrap();
            stream
                .write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            let (mut a, mut b) = (stream, upstream);
            let _ = tokio::io::copy_bidirectional(&mut a, &mut b).await;
        });

        let config = Config {
            socks_proxy: Some(SocksProxyConfig {
                version: 5,
                host: "127.0.0.1".to_string(),
                port: proxy_addr.port(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let endpoint = Endpoint::from_config(&config, "127.0.0.1", echo_addr.port()).unwrap();

        let mut stream = connect_endpoint(&endpoint).await.unwrap();
        stream.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");
    }

    #[tokio::test]
    async fn test_refused_connect() {
        // A listener that is immediately dropped leaves a port nothing
        // listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let endpoint = Endpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port: addr.port(),
        };
        let err = connect_endpoint(&endpoint).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::ConnectionRefused | TransportError::Io(_)
        ));
    }
}
