//! Configuration management

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// TLS layer configuration
    pub tls: Option<TlsConfig>,
    /// HTTP CONNECT proxy to traverse
    pub http_proxy: Option<HttpProxyConfig>,
    /// SOCKS proxy to traverse
    pub socks_proxy: Option<SocksProxyConfig>,
    /// Ordered list of circuit relay hops
    #[serde(default)]
    pub circuit: Vec<CircuitNode>,
    /// Enabled user services and their parameters
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// TLS layer configuration
///
/// Peer verification is mutual: the client validates the server certificate
/// against the CA bundle and the server requires a client certificate signed
/// by the same bundle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsConfig {
    /// CA certificate bundle path (PEM)
    pub ca_cert: String,
    /// Certificate chain path (PEM)
    pub cert: String,
    /// Private key path (PEM)
    pub key: String,
    /// Private key password
    #[serde(default)]
    pub key_password: String,
    /// Diffie-Hellman ephemeral parameters path (accepted for compatibility,
    /// key exchange is negotiated by the TLS library)
    #[serde(default)]
    pub dh: String,
    /// Cipher suite algorithms (OpenSSL-style colon-separated list)
    #[serde(default = "default_cipher_alg")]
    pub cipher_alg: String,
    /// Require peer certificate verification
    #[serde(default = "default_true")]
    pub verify_peer: bool,
}

fn default_cipher_alg() -> String {
    "DHE-RSA-AES256-GCM-SHA384".to_string()
}

fn default_true() -> bool {
    true
}

/// HTTP CONNECT proxy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpProxyConfig {
    /// Proxy host
    pub host: String,
    /// Proxy port
    pub port: u16,
    /// Credentials username
    #[serde(default)]
    pub username: String,
    /// Credentials user's domain
    #[serde(default)]
    pub domain: String,
    /// Credentials password
    #[serde(default)]
    pub password: String,
    /// Custom user agent
    #[serde(default)]
    pub user_agent: String,
    /// Reuse default NTLM credentials
    #[serde(default)]
    pub reuse_ntlm: bool,
    /// Reuse default Kerberos/Negotiate credentials
    #[serde(default)]
    pub reuse_kerb: bool,
}

impl HttpProxyConfig {
    pub fn is_set(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }
}

/// SOCKS proxy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SocksProxyConfig {
    /// SOCKS protocol version (4 or 5)
    pub version: u8,
    /// Proxy host
    pub host: String,
    /// Proxy port
    pub port: u16,
    /// Username (version 5 only)
    #[serde(default)]
    pub username: String,
    /// Password (version 5 only)
    #[serde(default)]
    pub password: String,
}

impl SocksProxyConfig {
    pub fn is_set(&self) -> bool {
        (self.version == 4 || self.version == 5) && !self.host.is_empty() && self.port != 0
    }
}

/// One circuit relay hop
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CircuitNode {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for CircuitNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One enabled user service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Service name (e.g. "forward")
    pub service: String,
    /// Per-service parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let raw = r#"
            [tls]
            ca_cert = "./certs/trusted/ca.crt"
            cert = "./certs/certificate.crt"
            key = "./certs/private.key"
            cipher_alg = "DHE-RSA-AES256-GCM-SHA384"

            [http_proxy]
            host = "proxy.example.com"
            port = 3128
            username = "user"
            password = "pass"

            [[circuit]]
            host = "relay1.example.com"
            port = 9001

            [[circuit]]
            host = "relay2.example.com"
            port = 9001

            [[services]]
            service = "forward"
            [services.parameters]
            local_port = "9000"
            remote_addr = "127.0.0.1:22"
        "#;

        let config: Config = toml::from_str(raw).unwrap();
        let tls = config.tls.as_ref().unwrap();
        assert_eq!(tls.ca_cert, "./certs/trusted/ca.crt");
        assert!(tls.verify_peer);
        assert!(config.http_proxy.as_ref().unwrap().is_set());
        assert_eq!(config.circuit.len(), 2);
        assert_eq!(config.circuit[1].to_string(), "relay2.example.com:9001");
        assert_eq!(config.services[0].service, "forward");
        assert_eq!(
            config.services[0].parameters.get("local_port").unwrap(),
            "9000"
        );
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.tls.is_none());
        assert!(config.circuit.is_empty());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_socks_proxy_is_set() {
        let mut socks = SocksProxyConfig {
            version: 5,
            host: "127.0.0.1".to_string(),
            port: 1080,
            ..Default::default()
        };
        assert!(socks.is_set());

        socks.version = 6;
        assert!(!socks.is_set());
    }
}
