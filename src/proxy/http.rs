//! HTTP CONNECT traversal

use super::ProxyError;
use crate::config::HttpProxyConfig;
use base64::Engine;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Authentication schemes in increasing order of strength. Only Basic is
/// implemented; stronger challenges are recognized so exhaustion is reported
/// accurately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum AuthScheme {
    Basic,
    Digest,
    Ntlm,
    Negotiate,
}

impl AuthScheme {
    fn parse(challenge: &str) -> Option<Self> {
        let scheme = challenge.split_whitespace().next()?;
        match scheme.to_ascii_lowercase().as_str() {
            "basic" => Some(AuthScheme::Basic),
            "digest" => Some(AuthScheme::Digest),
            "ntlm" => Some(AuthScheme::Ntlm),
            "negotiate" => Some(AuthScheme::Negotiate),
            _ => None,
        }
    }
}

/// Negotiate a tunnel to `target` (`host:port`) through an HTTP proxy.
///
/// The first request is sent without credentials. On 407 the
/// `Proxy-Authenticate` challenges are collected and the request is retried
/// once with the strongest supported scheme; if no offered scheme is
/// supported or credentials are missing the negotiation fails with
/// [`ProxyError::Auth`]. On 200 the stream is opaque.
pub async fn http_connect<S>(
    stream: &mut S,
    config: &HttpProxyConfig,
    target: &str,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_connect_request(stream, config, target, None).await?;
    let response = read_response(stream).await?;

    match response.status {
        200..=299 => return Ok(()),
        407 => {}
        status => {
            return Err(ProxyError::Protocol(format!(
                "CONNECT rejected with status {}",
                status
            )))
        }
    }

    // 407: pick the strongest scheme we can actually answer.
    let offered: Vec<AuthScheme> = response
        .challenges
        .iter()
        .filter_map(|c| AuthScheme::parse(c))
        .collect();

    debug!(target: "network_crypto", "proxy auth required, offered schemes: {:?}", offered);

    let has_credentials = !config.username.is_empty();
    if !offered.contains(&AuthScheme::Basic) || !has_credentials {
        return Err(ProxyError::Auth);
    }

    send_connect_request(stream, config, target, Some(AuthScheme::Basic)).await?;
    let response = read_response(stream).await?;

    match response.status {
        200..=299 => Ok(()),
        407 => Err(ProxyError::Auth),
        status => Err(ProxyError::Protocol(format!(
            "CONNECT rejected with status {}",
            status
        ))),
    }
}

async fn send_connect_request<S>(
    stream: &mut S,
    config: &HttpProxyConfig,
    target: &str,
    auth: Option<AuthScheme>,
) -> Result<(), ProxyError>
where
    S: AsyncWrite + Unpin,
{
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);

    if !config.user_agent.is_empty() {
        request.push_str(&format!("User-Agent: {}\r\n", config.user_agent));
    }

    if let Some(AuthScheme::Basic) = auth {
        let user = if config.domain.is_empty() {
            config.username.clone()
        } else {
            format!("{}\\{}", config.domain, config.username)
        };
        let credentials = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", user, config.password));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", credentials));
    }

    request.push_str("Proxy-Connection: keep-alive\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

struct ProxyResponse {
    status: u16,
    challenges: Vec<String>,
}

/// Read the status line and headers, then drain any advertised body so a
/// retry can reuse the connection. Reads one byte at a time: nothing past the
/// response may be consumed, the stream is opaque afterwards.
async fn read_response<S>(stream: &mut S) -> Result<ProxyResponse, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let status_line = read_line(stream).await?;
    let mut parts = status_line.split_whitespace();

    let version = parts
        .next()
        .ok_or_else(|| ProxyError::Protocol("empty status line".to_string()))?;
    if !version.starts_with("HTTP/") {
        return Err(ProxyError::Protocol(format!(
            "malformed status line: {}",
            status_line.trim()
        )));
    }

    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProxyError::Protocol(format!("malformed status line: {}", status_line)))?;

    let mut challenges = Vec::new();
    let mut content_length: usize = 0;
    let mut chunked = false;

    loop {
        let line = read_line(stream).await?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }

        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();
            match key.as_str() {
                "proxy-authenticate" => challenges.push(value.to_string()),
                "content-length" => {
                    content_length = value.parse().map_err(|_| {
                        ProxyError::Protocol(format!("bad Content-Length: {}", value))
                    })?;
                }
                "transfer-encoding" => {
                    chunked = value.to_ascii_lowercase().contains("chunked");
                }
                _ => {}
            }
        }
    }

    if chunked {
        // A chunked 407 body cannot be skipped reliably without a full
        // decoder; treat it as a protocol violation from the proxy.
        return Err(ProxyError::Protocol(
            "chunked proxy response body".to_string(),
        ));
    }

    let mut remaining = content_length;
    let mut skip = [0u8; 512];
    while remaining > 0 {
        let n = remaining.min(skip.len());
        stream.read_exact(&mut skip[..n]).await?;
        remaining -= n;
    }

    Ok(ProxyResponse { status, challenges })
}

async fn read_line<S>(stream: &mut S) -> Result<String, ProxyError>
where
    S: AsyncRead + Unpin,
{
    const MAX_LINE: usize = 8192;

    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_LINE {
            return Err(ProxyError::Protocol("header line too long".to_string()));
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).map_err(|_| ProxyError::Protocol("non-UTF-8 header".to_string()))
}
