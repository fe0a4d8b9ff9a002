//! Physical TCP layer

use super::TransportError;
use std::time::Duration;
use tokio::net::TcpStream;

/// Dial a TCP connection with a timeout, Nagle disabled.
pub(crate) async fn connect(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TcpStream, TransportError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| TransportError::TimedOut)?
        .map_err(map_connect_error)?;

    stream.set_nodelay(true).ok();
    Ok(stream)
}

fn map_connect_error(err: std::io::Error) -> TransportError {
    match err.kind() {
        std::io::ErrorKind::ConnectionRefused => TransportError::ConnectionRefused,
        std::io::ErrorKind::TimedOut => TransportError::TimedOut,
        kind if kind.to_string().contains("network unreachable") => {
            TransportError::NetworkUnreachable
        }
        _ => TransportError::Io(err),
    }
}
