//! Endpoint descriptors for the link protocol stack
//!
//! An endpoint is a recursive descriptor built from a sequence of link-layer
//! parameter sets, innermost first: physical address, optional proxy
//! traversal, optional circuit node list, TLS. Each layer claims exactly one
//! parameter set and recursively builds the next endpoint. Endpoints are
//! immutable once built.

use crate::config::{CircuitNode, Config, HttpProxyConfig, SocksProxyConfig, TlsConfig};
use std::collections::BTreeMap;
use thiserror::Error;

/// Parameters of a single link layer
pub type LayerParameters = BTreeMap<String, String>;

/// Full parameter sequence, innermost layer first
pub type ParameterStack = Vec<LayerParameters>;

/// Endpoint construction errors
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Proxy traversal variant of an endpoint layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEndpoint {
    Http(HttpProxyConfig),
    Socks(SocksProxyConfig),
}

/// A recursive link stack descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Physical TCP layer (innermost)
    Tcp { host: String, port: u16 },
    /// Proxy traversal layer
    Proxy {
        proxy: ProxyEndpoint,
        next: Box<Endpoint>,
    },
    /// Circuit relay layer
    Circuit {
        nodes: Vec<CircuitNode>,
        next: Box<Endpoint>,
    },
    /// TLS layer (outermost)
    Tls {
        tls: TlsConfig,
        next: Box<Endpoint>,
    },
}

fn require<'a>(
    params: &'a LayerParameters,
    layer: &str,
    key: &str,
) -> Result<&'a str, EndpointError> {
    params
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| EndpointError::InvalidArgument(format!("{}: missing key `{}`", layer, key)))
}

fn require_port(params: &LayerParameters, layer: &str, key: &str) -> Result<u16, EndpointError> {
    require(params, layer, key)?.parse::<u16>().map_err(|_| {
        EndpointError::InvalidArgument(format!("{}: key `{}` is not a port", layer, key))
    })
}

fn optional(params: &LayerParameters, key: &str) -> String {
    params.get(key).cloned().unwrap_or_default()
}

fn flag(params: &LayerParameters, key: &str) -> bool {
    matches!(params.get(key).map(String::as_str), Some("true") | Some("1"))
}

impl Endpoint {
    /// Build an endpoint from a parameter stack, innermost layer first.
    ///
    /// Each parameter set carries a `layer` key identifying the layer it
    /// configures; the first set must describe the physical TCP layer.
    pub fn from_stack(stack: &ParameterStack) -> Result<Self, EndpointError> {
        let mut layers = stack.iter();

        let first = layers.next().ok_or_else(|| {
            EndpointError::InvalidArgument("empty parameter stack".to_string())
        })?;
        if require(first, "stack", "layer")? != "tcp" {
            return Err(EndpointError::InvalidArgument(
                "stack: innermost layer must be `tcp`".to_string(),
            ));
        }

        let mut endpoint = Endpoint::Tcp {
            host: require(first, "tcp", "host")?.to_string(),
            port: require_port(first, "tcp", "port")?,
        };

        for params in layers {
            endpoint = match require(params, "stack", "layer")? {
                "http_proxy" => Endpoint::Proxy {
                    proxy: ProxyEndpoint::Http(HttpProxyConfig {
                        host: require(params, "http_proxy", "host")?.to_string(),
                        port: require_port(params, "http_proxy", "port")?,
                        username: optional(params, "username"),
                        domain: optional(params, "domain"),
                        password: optional(params, "password"),
                        user_agent: optional(params, "user_agent"),
                        reuse_ntlm: flag(params, "reuse_ntlm"),
                        reuse_kerb: flag(params, "reuse_kerb"),
                    }),
                    next: Box::new(endpoint),
                },
                "socks_proxy" => Endpoint::Proxy {
                    proxy: ProxyEndpoint::Socks(SocksProxyConfig {
                        version: require(params, "socks_proxy", "version")?
                            .parse::<u8>()
                            .ok()
                            .filter(|v| *v == 4 || *v == 5)
                            .ok_or_else(|| {
                                EndpointError::InvalidArgument(
                                    "socks_proxy: version must be 4 or 5".to_string(),
                                )
                            })?,
                        host: require(params, "socks_proxy", "host")?.to_string(),
                        port: require_port(params, "socks_proxy", "port")?,
                        username: optional(params, "username"),
                        password: optional(params, "password"),
                    }),
                    next: Box::new(endpoint),
                },
                "circuit" => Endpoint::Circuit {
                    nodes: parse_nodes(require(params, "circuit", "nodes")?)?,
                    next: Box::new(endpoint),
                },
                "tls" => Endpoint::Tls {
                    tls: TlsConfig {
                        ca_cert: require(params, "tls", "ca_cert")?.to_string(),
                        cert: require(params, "tls", "cert")?.to_string(),
                        key: require(params, "tls", "key")?.to_string(),
                        key_password: optional(params, "key_password"),
                        dh: optional(params, "dh"),
                        cipher_alg: optional(params, "cipher_alg"),
                        verify_peer: !matches!(
                            params.get("verify_peer").map(String::as_str),
                            Some("false") | Some("0")
                        ),
                    },
                    next: Box::new(endpoint),
                },
                "tcp" => {
                    return Err(EndpointError::InvalidArgument(
                        "stack: `tcp` is only valid as the innermost layer".to_string(),
                    ))
                }
                other => {
                    return Err(EndpointError::InvalidArgument(format!(
                        "stack: unknown layer `{}`",
                        other
                    )))
                }
            };
        }

        Ok(endpoint)
    }

    /// Serialize back into a parameter stack, innermost layer first.
    pub fn to_stack(&self) -> ParameterStack {
        let mut stack = ParameterStack::new();
        self.push_layers(&mut stack);
        stack
    }

    fn push_layers(&self, stack: &mut ParameterStack) {
        let mut params = LayerParameters::new();
        match self {
            Endpoint::Tcp { host, port } => {
                params.insert("layer".into(), "tcp".into());
                params.insert("host".into(), host.clone());
                params.insert("port".into(), port.to_string());
            }
            Endpoint::Proxy { proxy, next } => {
                next.push_layers(stack);
                match proxy {
                    ProxyEndpoint::Http(http) => {
                        params.insert("layer".into(), "http_proxy".into());
                        params.insert("host".into(), http.host.clone());
                        params.insert("port".into(), http.port.to_string());
                        insert_nonempty(&mut params, "username", &http.username);
                        insert_nonempty(&mut params, "domain", &http.domain);
                        insert_nonempty(&mut params, "password", &http.password);
                        insert_nonempty(&mut params, "user_agent", &http.user_agent);
                        insert_flag(&mut params, "reuse_ntlm", http.reuse_ntlm);
                        insert_flag(&mut params, "reuse_kerb", http.reuse_kerb);
                    }
                    ProxyEndpoint::Socks(socks) => {
                        params.insert("layer".into(), "socks_proxy".into());
                        params.insert("version".into(), socks.version.to_string());
                        params.insert("host".into(), socks.host.clone());
                        params.insert("port".into(), socks.port.to_string());
                        insert_nonempty(&mut params, "username", &socks.username);
                        insert_nonempty(&mut params, "password", &socks.password);
                    }
                }
            }
            Endpoint::Circuit { nodes, next } => {
                next.push_layers(stack);
                params.insert("layer".into(), "circuit".into());
                params.insert(
                    "nodes".into(),
                    nodes
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(","),
                );
            }
            Endpoint::Tls { tls, next } => {
                next.push_layers(stack);
                params.insert("layer".into(), "tls".into());
                params.insert("ca_cert".into(), tls.ca_cert.clone());
                params.insert("cert".into(), tls.cert.clone());
                params.insert("key".into(), tls.key.clone());
                insert_nonempty(&mut params, "key_password", &tls.key_password);
                insert_nonempty(&mut params, "dh", &tls.dh);
                insert_nonempty(&mut params, "cipher_alg", &tls.cipher_alg);
                if !tls.verify_peer {
                    params.insert("verify_peer".into(), "false".into());
                }
            }
        }
        stack.push(params);
    }

    /// Assemble the standard client stack from a configuration: physical TCP
    /// to `host:port`, optional proxy traversal, optional circuit, optional
    /// TLS, outermost last.
    pub fn from_config(config: &Config, host: &str, port: u16) -> Result<Self, EndpointError> {
        if host.is_empty() {
            return Err(EndpointError::InvalidArgument(
                "tcp: missing key `host`".to_string(),
            ));
        }

        let mut endpoint = Endpoint::Tcp {
            host: host.to_string(),
            port,
        };

        match (&config.socks_proxy, &config.http_proxy) {
            (Some(socks), _) if socks.is_set() => {
                endpoint = Endpoint::Proxy {
                    proxy: ProxyEndpoint::Socks(socks.clone()),
                    next: Box::new(endpoint),
                };
            }
            (_, Some(http)) if http.is_set() => {
                endpoint = Endpoint::Proxy {
                    proxy: ProxyEndpoint::Http(http.clone()),
                    next: Box::new(endpoint),
                };
            }
            _ => {}
        }

        if !config.circuit.is_empty() {
            endpoint = Endpoint::Circuit {
                nodes: config.circuit.clone(),
                next: Box::new(endpoint),
            };
        }

        if let Some(tls) = &config.tls {
            endpoint = Endpoint::Tls {
                tls: tls.clone(),
                next: Box::new(endpoint),
            };
        }

        Ok(endpoint)
    }

    /// The physical target at the bottom of the stack.
    pub fn target(&self) -> (&str, u16) {
        match self {
            Endpoint::Tcp { host, port } => (host, *port),
            Endpoint::Proxy { next, .. }
            | Endpoint::Circuit { next, .. }
            | Endpoint::Tls { next, .. } => next.target(),
        }
    }
}

fn insert_nonempty(params: &mut LayerParameters, key: &str, value: &str) {
    if !value.is_empty() {
        params.insert(key.to_string(), value.to_string());
    }
}

fn insert_flag(params: &mut LayerParameters, key: &str, value: bool) {
    if value {
        params.insert(key.to_string(), "true".to_string());
    }
}

fn parse_nodes(raw: &str) -> Result<Vec<CircuitNode>, EndpointError> {
    raw.split(',')
        .map(|node| {
            let (host, port) = node.rsplit_once(':').ok_or_else(|| {
                EndpointError::InvalidArgument(format!("circuit: malformed node `{}`", node))
            })?;
            let port = port.parse::<u16>().map_err(|_| {
                EndpointError::InvalidArgument(format!("circuit: malformed node `{}`", node))
            })?;
            Ok(CircuitNode {
                host: host.to_string(),
                port,
            })
        })
        .collect()
}

/// Serialize a parameter stack into a single string, layers separated by `|`
/// and entries by `;`.
pub fn serialize_parameter_stack(stack: &ParameterStack) -> Result<String, EndpointError> {
    let mut layers = Vec::with_capacity(stack.len());
    for params in stack {
        let mut entries = Vec::with_capacity(params.len());
        for (key, value) in params {
            if key.contains(['=', ';', '|']) || value.contains(['=', ';', '|']) {
                return Err(EndpointError::InvalidArgument(format!(
                    "parameter `{}` contains a reserved separator",
                    key
                )));
            }
            entries.push(format!("{}={}", key, value));
        }
        layers.push(entries.join(";"));
    }
    Ok(layers.join("|"))
}

/// Parse a string produced by [`serialize_parameter_stack`].
pub fn parse_parameter_stack(raw: &str) -> Result<ParameterStack, EndpointError> {
    raw.split('|')
        .map(|layer| {
            let mut params = LayerParameters::new();
            for entry in layer.split(';').filter(|e| !e.is_empty()) {
                let (key, value) = entry.split_once('=').ok_or_else(|| {
                    EndpointError::InvalidArgument(format!("malformed entry `{}`", entry))
                })?;
                params.insert(key.to_string(), value.to_string());
            }
            Ok(params)
        })
        .collect()
}
