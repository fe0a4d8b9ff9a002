//! Circuit relay layer
//!
//! A circuit is an ordered chain of intermediate relays traversed before
//! reaching the terminal server. After the inner stream reaches relay *i*, a
//! relay request names the next node; on success the stream logically
//! terminates at relay *i*+1. Intermediate relays only forward bytes; the
//! layers above (TLS and everything inside it) are negotiated end to end.
//!
//! Relay request wire format: a `u32` little-endian length prefix followed by
//! the UTF-8 `host:port` of the next node. The relay answers with one status
//! byte, 0 for success.

use super::TransportError;
use crate::config::CircuitNode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

/// Relay granted the request
pub const RELAY_OK: u8 = 0;

/// Relay failed to reach the next node
pub const RELAY_FAILED: u8 = 1;

/// Upper bound on a relay request, well above any `host:port`
const MAX_REQUEST_LEN: usize = 1024;

/// Encode a relay request for `node`.
pub fn encode_relay_request(node: &CircuitNode) -> Vec<u8> {
    let target = node.to_string();
    let mut buf = Vec::with_capacity(4 + target.len());
    buf.extend_from_slice(&(target.len() as u32).to_le_bytes());
    buf.extend_from_slice(target.as_bytes());
    buf
}

/// Read one relay request, returning the requested target.
pub async fn read_relay_request<S>(stream: &mut S) -> Result<String, TransportError>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len == 0 || len > MAX_REQUEST_LEN {
        return Err(TransportError::InvalidArgument(format!(
            "circuit: bad relay request length {}",
            len
        )));
    }

    let mut target = vec![0u8; len];
    stream.read_exact(&mut target).await?;
    String::from_utf8(target).map_err(|_| {
        TransportError::InvalidArgument("circuit: relay request is not UTF-8".to_string())
    })
}

/// Issue a relay request for `node` over an established stream and wait for
/// the status byte.
pub async fn relay_request<S>(stream: &mut S, node: &CircuitNode) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&encode_relay_request(node)).await?;
    stream.flush().await?;

    let mut status = [0u8; 1];
    stream.read_exact(&mut status).await?;
    if status[0] != RELAY_OK {
        return Err(TransportError::Closed);
    }
    Ok(())
}

/// A forwarding relay node. Accepts connections, reads one relay request,
/// dials the requested target and then forwards bytes verbatim in both
/// directions.
pub struct Relay {
    listener: TcpListener,
}

impl Relay {
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and forward connections until the listener fails.
    pub async fn run(&self) -> Result<(), TransportError> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            debug!(target: "network_crypto", "relay connection from {}", peer);
            tokio::spawn(async move {
                if let Err(e) = Self::handle(stream).await {
                    debug!(target: "network_crypto", "relay session ended: {}", e);
                }
            });
        }
    }

    async fn handle(mut stream: TcpStream) -> Result<(), TransportError> {
        let target = match read_relay_request(&mut stream).await {
            Ok(target) => target,
            Err(e) => {
                warn!(target: "network_crypto", "malformed relay request: {}", e);
                return Err(e);
            }
        };

        let mut upstream = match TcpStream::connect(&target).await {
            Ok(upstream) => {
                upstream.set_nodelay(true).ok();
                upstream
            }
            Err(e) => {
                warn!(target: "network_crypto", "relay dial to {} failed: {}", target, e);
                stream.write_all(&[RELAY_FAILED]).await?;
                return Err(TransportError::Io(e));
            }
        };

        stream.write_all(&[RELAY_OK]).await?;
        stream.flush().await?;

        let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
        Ok(())
    }
}
