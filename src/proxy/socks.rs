//! SOCKS4/4a and SOCKS5 traversal (RFC 1928, RFC 1929)

use super::{Address, ProxyError};
use crate::config::SocksProxyConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// SOCKS5 version byte
const SOCKS5_VERSION: u8 = 0x05;

/// SOCKS4 version byte
const SOCKS4_VERSION: u8 = 0x04;

/// SOCKS4 request granted
const SOCKS4_GRANTED: u8 = 90;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AuthMethod {
    NoAuth = 0x00,
    UsernamePassword = 0x02,
    NoAcceptable = 0xFF,
}

/// Address types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
    Ipv6 = 0x04,
}

/// Negotiate a CONNECT through a SOCKS5 proxy to `target` (`host:port`).
pub async fn socks5_connect<S>(
    stream: &mut S,
    config: &SocksProxyConfig,
    target: &str,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let address = Address::parse(target)?;

    // Greeting: offer no-auth, plus user/pass when credentials are configured.
    let has_credentials = !config.username.is_empty();
    let mut greeting = vec![SOCKS5_VERSION, 1, AuthMethod::NoAuth as u8];
    if has_credentials {
        greeting[1] = 2;
        greeting.push(AuthMethod::UsernamePassword as u8);
    }
    stream.write_all(&greeting).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS5_VERSION {
        return Err(ProxyError::Protocol(format!(
            "bad SOCKS version in method selection: {}",
            choice[0]
        )));
    }

    match choice[1] {
        m if m == AuthMethod::NoAuth as u8 => {}
        m if m == AuthMethod::UsernamePassword as u8 => {
            if !has_credentials {
                return Err(ProxyError::Auth);
            }
            subnegotiate_userpass(stream, &config.username, &config.password).await?;
        }
        m if m == AuthMethod::NoAcceptable as u8 => return Err(ProxyError::Auth),
        m => {
            return Err(ProxyError::Protocol(format!(
                "unexpected auth method: {}",
                m
            )))
        }
    }

    // CONNECT request: VER CMD RSV ATYP DST.ADDR DST.PORT
    let mut request = vec![SOCKS5_VERSION, 0x01, 0x00];
    match &address {
        Address::Ipv4(ip, port) => {
            request.push(AddressType::Ipv4 as u8);
            request.extend_from_slice(ip);
            request.extend_from_slice(&port.to_be_bytes());
        }
        Address::Ipv6(ip, port) => {
            request.push(AddressType::Ipv6 as u8);
            request.extend_from_slice(ip);
            request.extend_from_slice(&port.to_be_bytes());
        }
        Address::Domain(domain, port) => {
            if domain.len() > 255 {
                return Err(ProxyError::InvalidAddress(domain.clone()));
            }
            request.push(AddressType::Domain as u8);
            request.push(domain.len() as u8);
            request.extend_from_slice(domain.as_bytes());
            request.extend_from_slice(&port.to_be_bytes());
        }
    }
    stream.write_all(&request).await?;

    // Reply: VER REP RSV ATYP BND.ADDR BND.PORT
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(ProxyError::Protocol(format!(
            "bad SOCKS version in reply: {}",
            head[0]
        )));
    }

    match head[1] {
        0x00 => {}
        0x03 => return Err(ProxyError::NetworkUnreachable),
        0x04 => return Err(ProxyError::HostUnreachable),
        0x05 => return Err(ProxyError::ConnectionRefused),
        code => {
            return Err(ProxyError::Protocol(format!(
                "CONNECT rejected with code {}",
                code
            )))
        }
    }

    // Consume the bound address; its content is irrelevant.
    let bound_len = match head[3] {
        t if t == AddressType::Ipv4 as u8 => 4,
        t if t == AddressType::Ipv6 as u8 => 16,
        t if t == AddressType::Domain as u8 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        t => {
            return Err(ProxyError::Protocol(format!(
                "unknown address type in reply: {}",
                t
            )))
        }
    };
    let mut bound = vec![0u8; bound_len + 2];
    stream.read_exact(&mut bound).await?;

    debug!(target: "network_crypto", "socks5 tunnel established to {}", address);
    Ok(())
}

async fn subnegotiate_userpass<S>(
    stream: &mut S,
    username: &str,
    password: &str,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if username.len() > 255 || password.len() > 255 {
        return Err(ProxyError::Auth);
    }

    let mut msg = vec![0x01, username.len() as u8];
    msg.extend_from_slice(username.as_bytes());
    msg.push(password.len() as u8);
    msg.extend_from_slice(password.as_bytes());
    stream.write_all(&msg).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(ProxyError::Auth);
    }
    Ok(())
}

/// Negotiate a CONNECT through a SOCKS4 proxy. Non-IPv4 hosts use the 4a
/// extension (destination IP 0.0.0.1 with the hostname appended).
pub async fn socks4_connect<S>(
    stream: &mut S,
    config: &SocksProxyConfig,
    target: &str,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let address = Address::parse(target)?;

    let mut request = vec![SOCKS4_VERSION, 0x01];
    match &address {
        Address::Ipv4(ip, port) => {
            request.extend_from_slice(&port.to_be_bytes());
            request.extend_from_slice(ip);
            request.extend_from_slice(config.username.as_bytes());
            request.push(0);
        }
        Address::Domain(domain, port) => {
            request.extend_from_slice(&port.to_be_bytes());
            request.extend_from_slice(&[0, 0, 0, 1]);
            request.extend_from_slice(config.username.as_bytes());
            request.push(0);
            request.extend_from_slice(domain.as_bytes());
            request.push(0);
        }
        Address::Ipv6(..) => {
            return Err(ProxyError::InvalidAddress(
                "SOCKS4 cannot address IPv6".to_string(),
            ))
        }
    }
    stream.write_all(&request).await?;

    // Reply: VN CD DSTPORT DSTIP
    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await?;
    if reply[0] != 0x00 {
        return Err(ProxyError::Protocol(format!(
            "bad SOCKS4 reply version: {}",
            reply[0]
        )));
    }
    if reply[1] != SOCKS4_GRANTED {
        return Err(ProxyError::ConnectionRefused);
    }

    debug!(target: "network_crypto", "socks4 tunnel established to {}", address);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    fn socks_config(version: u8, username: &str, password: &str) -> SocksProxyConfig {
        SocksProxyConfig {
            version,
            host: "127.0.0.1".to_string(),
            port: 1080,
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    #[tokio::test]
    async fn test_socks5_no_auth() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [5, 1, 0]);
            stream.write_all(&[5, 0]).await.unwrap();

            let mut head = [0u8; 4];
            stream.read_exact(&mut head).await.unwrap();
            assert_eq!(head, [5, 1, 0, 1]);
            let mut rest = [0u8; 6];
            stream.read_exact(&mut rest).await.unwrap();
            assert_eq!(&rest[..4], &[10, 0, 0, 5]);
            assert_eq!(u16::from_be_bytes([rest[4], rest[5]]), 443);

            stream
                .write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        socks5_connect(&mut stream, &socks_config(5, "", ""), "10.0.0.5:443")
            .await
            .unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_socks5_userpass() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut greeting = [0u8; 4];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [5, 2, 0, 2]);
            stream.write_all(&[5, 2]).await.unwrap();

            let mut head = [0u8; 2];
            stream.read_exact(&mut head).await.unwrap();
            assert_eq!(head[0], 1);
            let mut user = vec![0u8; head[1] as usize];
            stream.read_exact(&mut user).await.unwrap();
            assert_eq!(user, b"user");
            let mut plen = [0u8; 1];
            stream.read_exact(&mut plen).await.unwrap();
            let mut pass = vec![0u8; plen[0] as usize];
            stream.read_exact(&mut pass).await.unwrap();
            assert_eq!(pass, b"secret");
            stream.write_all(&[1, 0]).await.unwrap();

            let mut head = [0u8; 4];
            stream.read_exact(&mut head).await.unwrap();
            assert_eq!(head[3], 3); // domain
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.unwrap();
            let mut rest = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut rest).await.unwrap();

            stream
                .write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        socks5_connect(
            &mut stream,
            &socks_config(5, "user", "secret"),
            "example.com:443",
        )
        .await
        .unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_socks5_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[5, 0]).await.unwrap();
            let mut request = [0u8; 10];
            stream.read_exact(&mut request).await.unwrap();
            stream
                .write_all(&[5, 5, 0, 1, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let err = socks5_connect(&mut stream, &socks_config(5, "", ""), "10.0.0.5:443")
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::ConnectionRefused));
    }

    #[tokio::test]
    async fn test_socks4_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut head = [0u8; 8];
            stream.read_exact(&mut head).await.unwrap();
            assert_eq!(head[0], 4);
            assert_eq!(head[1], 1);
            assert_eq!(u16::from_be_bytes([head[2], head[3]]), 22);
            assert_eq!(&head[4..8], &[192, 168, 0, 9]);
            let mut userid = [0u8; 1];
            stream.read_exact(&mut userid).await.unwrap();
            assert_eq!(userid[0], 0);

            stream
                .write_all(&[0, SOCKS4_GRANTED, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        socks4_connect(&mut stream, &socks_config(4, "", ""), "192.168.0.9:22")
            .await
            .unwrap();
        server.await.unwrap();
    }
}
