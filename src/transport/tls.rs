//! TLS link layer
//!
//! One [`TlsContext`] per endpoint, shared by every socket derived from it.
//! Peer verification is mutual: clients always validate the server chain
//! against the CA bundle, and servers require a client certificate signed by
//! the same bundle unless `verify_peer` is disabled in the configuration.

use super::{BoxedStream, TransportError};
use crate::config::TlsConfig;
use rustls::crypto::ring as ring_provider;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedCipherSuite};
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

/// TLS configuration bundle shared by all sockets of one endpoint
#[derive(Clone, Debug)]
pub struct TlsContext {
    client: Arc<ClientConfig>,
    server: Arc<ServerConfig>,
}

impl TlsContext {
    /// Build client and server configurations from certificate material on
    /// disk. The DH parameters path from the configuration is accepted but
    /// unused: key exchange is negotiated by the TLS library.
    pub fn from_config(config: &TlsConfig) -> Result<Self, TransportError> {
        let ca_certs = load_certs(&config.ca_cert)?;
        let cert_chain = load_certs(&config.cert)?;
        let key = load_key(&config.key)?;

        let mut roots = RootCertStore::empty();
        for cert in &ca_certs {
            roots.add(cert.clone()).map_err(|e| {
                TransportError::InvalidArgument(format!("tls: bad CA certificate: {}", e))
            })?;
        }
        let roots = Arc::new(roots);

        let provider = Arc::new(CryptoProvider {
            cipher_suites: map_cipher_suites(&config.cipher_alg)?,
            ..ring_provider::default_provider()
        });

        let client = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(rustls::DEFAULT_VERSIONS)
            .map_err(|e| TransportError::TlsHandshake(e.to_string()))?
            .with_root_certificates(roots.clone())
            .with_client_auth_cert(cert_chain.clone(), key.clone_key())
            .map_err(|e| {
                TransportError::InvalidArgument(format!("tls: bad certificate or key: {}", e))
            })?;

        let verifier = if config.verify_peer {
            WebPkiClientVerifier::builder_with_provider(roots, provider.clone())
                .build()
                .map_err(|e| {
                    TransportError::InvalidArgument(format!("tls: client verifier: {}", e))
                })?
        } else {
            WebPkiClientVerifier::no_client_auth()
        };

        let server = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(rustls::DEFAULT_VERSIONS)
            .map_err(|e| TransportError::TlsHandshake(e.to_string()))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(cert_chain, key)
            .map_err(|e| {
                TransportError::InvalidArgument(format!("tls: bad certificate or key: {}", e))
            })?;

        Ok(Self {
            client: Arc::new(client),
            server: Arc::new(server),
        })
    }

    /// Client-side handshake over an established inner stream.
    pub async fn client_handshake(
        &self,
        stream: BoxedStream,
        server_name: &str,
        timeout: Duration,
    ) -> Result<BoxedStream, TransportError> {
        let connector = TlsConnector::from(self.client.clone());
        let name = ServerName::try_from(server_name.to_string()).map_err(|_| {
            TransportError::InvalidArgument(format!("tls: invalid server name `{}`", server_name))
        })?;

        let tls_stream = tokio::time::timeout(timeout, connector.connect(name, stream))
            .await
            .map_err(|_| TransportError::TimedOut)?
            .map_err(map_handshake_error)?;

        debug!(target: "network_crypto", "client handshake complete with {}", server_name);
        Ok(Box::new(tls_stream))
    }

    /// Server-side handshake over an accepted inner stream.
    pub async fn server_handshake(
        &self,
        stream: BoxedStream,
        timeout: Duration,
    ) -> Result<BoxedStream, TransportError> {
        let acceptor = TlsAcceptor::from(self.server.clone());

        let tls_stream = tokio::time::timeout(timeout, acceptor.accept(stream))
            .await
            .map_err(|_| TransportError::TimedOut)?
            .map_err(map_handshake_error)?;

        Ok(Box::new(tls_stream))
    }
}

fn map_handshake_error(err: std::io::Error) -> TransportError {
    let message = err.to_string();
    if message.to_ascii_lowercase().contains("certificate") {
        TransportError::TlsPeerVerify
    } else {
        TransportError::TlsHandshake(message)
    }
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = std::fs::File::open(path).map_err(|e| {
        TransportError::InvalidArgument(format!("tls: cannot open `{}`: {}", path, e))
    })?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .map_err(|e| {
            TransportError::InvalidArgument(format!("tls: cannot parse `{}`: {}", path, e))
        })?;
    if certs.is_empty() {
        return Err(TransportError::InvalidArgument(format!(
            "tls: no certificates in `{}`",
            path
        )));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = std::fs::File::open(path).map_err(|e| {
        TransportError::InvalidArgument(format!("tls: cannot open `{}`: {}", path, e))
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| TransportError::InvalidArgument(format!("tls: cannot parse `{}`: {}", path, e)))?
        .ok_or_else(|| {
            TransportError::InvalidArgument(format!("tls: no private key in `{}`", path))
        })
}

/// Map an OpenSSL-style colon-separated cipher list onto the rustls suite
/// table. DHE names map to their ECDHE equivalents (rustls has no finite
/// field DHE); the TLS 1.3 suite family is always enabled. An empty list
/// selects the provider defaults.
fn map_cipher_suites(cipher_alg: &str) -> Result<Vec<SupportedCipherSuite>, TransportError> {
    use rustls::crypto::ring::cipher_suite;

    if cipher_alg.is_empty() {
        return Ok(ring_provider::default_provider().cipher_suites);
    }

    let mut suites = vec![
        cipher_suite::TLS13_AES_256_GCM_SHA384,
        cipher_suite::TLS13_AES_128_GCM_SHA256,
        cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
    ];

    for name in cipher_alg.split(':').filter(|n| !n.is_empty()) {
        let suite = match name.trim_start_matches("DHE-").trim_start_matches("ECDHE-") {
            "RSA-AES256-GCM-SHA384" => cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            "RSA-AES128-GCM-SHA256" => cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            "ECDSA-AES256-GCM-SHA384" => cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            "ECDSA-AES128-GCM-SHA256" => cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            "RSA-CHACHA20-POLY1305" => cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
            "ECDSA-CHACHA20-POLY1305" => {
                cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256
            }
            _ => {
                return Err(TransportError::InvalidArgument(format!(
                    "tls: unknown cipher `{}`",
                    name
                )))
            }
        };
        if !suites.contains(&suite) {
            suites.push(suite);
        }
    }

    Ok(suites)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_suite_mapping() {
        // The original default maps onto the ECDHE equivalent.
        let suites = map_cipher_suites("DHE-RSA-AES256-GCM-SHA384").unwrap();
        assert!(suites
            .iter()
            .any(|s| format!("{:?}", s).contains("ECDHE_RSA_WITH_AES_256_GCM_SHA384")));

        let defaults = map_cipher_suites("").unwrap();
        assert!(!defaults.is_empty());

        let err = map_cipher_suites("RC4-MD5").unwrap_err();
        assert!(matches!(err, TransportError::InvalidArgument(_)));
    }

    #[test]
    fn test_missing_certificate_files() {
        let config = TlsConfig {
            ca_cert: "/nonexistent/ca.crt".to_string(),
            cert: "/nonexistent/cert.crt".to_string(),
            key: "/nonexistent/key.pem".to_string(),
            key_password: String::new(),
            dh: String::new(),
            cipher_alg: String::new(),
            verify_peer: true,
        };
        let err = TlsContext::from_config(&config).unwrap_err();
        assert!(matches!(err, TransportError::InvalidArgument(_)));
    }
}
