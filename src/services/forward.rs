//! TCP port forwarding
//!
//! The canonical user service: the initiating side listens on a local TCP
//! address and opens one fiber per connection; the hosting side accepts
//! those fibers and dials the configured target, piping bytes both ways.

use super::{ServiceError, ServiceFactoryFn, ServiceHandle, UserService};
use crate::admin::requests::CreateServiceRequest;
use crate::config::ServiceConfig;
use crate::fiber::{Demux, FiberStream};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Numeric service id of the remote forwarding half
pub const SERVICE_ID: u32 = 2;

/// Service name in the configuration file
pub const SERVICE_NAME: &str = "forward";

/// Pipe a fiber and a TCP stream into each other until both directions end.
pub async fn pipe(fiber: FiberStream, tcp: TcpStream) {
    let (mut fiber_read, mut fiber_write) = fiber.split();
    let (mut tcp_read, mut tcp_write) = tcp.into_split();

    let to_fiber = tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match tcp_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if fiber_write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = fiber_write.shutdown();
    });

    let to_tcp = tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match fiber_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tcp_write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = tcp_write.shutdown().await;
    });

    let _ = to_fiber.await;
    let _ = to_tcp.await;
}

/// Factory for the hosting side: listens on the configured fiber port and
/// dials the target per accepted fiber.
pub fn remote_factory() -> ServiceFactoryFn {
    Box::new(|demux: Demux, parameters: &BTreeMap<String, String>| {
        let fiber_port: u32 = parameters
            .get("fiber_port")
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| ServiceError::InvalidParameters("fiber_port".to_string()))?;
        let remote_addr = parameters
            .get("remote_addr")
            .cloned()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| ServiceError::InvalidParameters("remote_addr".to_string()))?;

        let mut listener = demux
            .listen(fiber_port)
            .map_err(|e| ServiceError::InvalidParameters(e.to_string()))?;
        let cleanup_demux = demux.clone();

        let task = tokio::spawn(async move {
            loop {
                let fiber = match listener.accept().await {
                    Ok(fiber) => fiber,
                    Err(_) => break,
                };
                let remote_addr = remote_addr.clone();
                tokio::spawn(async move {
                    match TcpStream::connect(&remote_addr).await {
                        Ok(tcp) => {
                            tcp.set_nodelay(true).ok();
                            pipe(fiber, tcp).await;
                        }
                        Err(e) => {
                            warn!(target: "microservice", "[forward] dial {} failed: {}", remote_addr, e);
                            let mut fiber = fiber;
                            fiber.reset();
                        }
                    }
                });
            }
        });

        Ok(ServiceHandle::with_cleanup(vec![task], move || {
            cleanup_demux.unlisten(fiber_port);
        }))
    })
}

/// The initiating half: local TCP listener forwarding through the funnel.
pub struct ForwardService {
    local_addr: String,
    fiber_port: u32,
    remote_addr: String,
    bound_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ForwardService {
    pub fn new(
        local_addr: impl Into<String>,
        fiber_port: u32,
        remote_addr: impl Into<String>,
    ) -> Self {
        Self {
            local_addr: local_addr.into(),
            fiber_port,
            remote_addr: remote_addr.into(),
            bound_addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Build from a `[[services]]` configuration entry.
    pub fn from_config(config: &ServiceConfig) -> Result<Self, ServiceError> {
        let get = |key: &str| {
            config
                .parameters
                .get(key)
                .cloned()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ServiceError::InvalidParameters(key.to_string()))
        };

        let fiber_port = get("fiber_port")?
            .parse()
            .map_err(|_| ServiceError::InvalidParameters("fiber_port".to_string()))?;

        Ok(Self::new(get("local_addr")?, fiber_port, get("remote_addr")?))
    }

    /// The locally bound address, once started.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock().unwrap()
    }
}

#[async_trait]
impl UserService for ForwardService {
    fn name(&self) -> &'static str {
        SERVICE_NAME
    }

    fn create_requests(&self) -> Vec<CreateServiceRequest> {
        let mut request = CreateServiceRequest::new(SERVICE_ID);
        request.add_parameter("fiber_port", self.fiber_port.to_string());
        request.add_parameter("remote_addr", self.remote_addr.clone());
        vec![request]
    }

    async fn start(&self, demux: &Demux) -> Result<(), ServiceError> {
        let listener = TcpListener::bind(&self.local_addr).await?;
        let bound = listener.local_addr()?;
        *self.bound_addr.lock().unwrap() = Some(bound);
        debug!(target: "microservice", "[forward] listening on {} -> fiber {}", bound, self.fiber_port);

        let demux = demux.clone();
        let fiber_port = self.fiber_port;
        let task = tokio::spawn(async move {
            loop {
                let (tcp, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => break,
                };
                debug!(target: "microservice", "[forward] connection from {}", peer);
                tcp.set_nodelay(true).ok();

                let demux = demux.clone();
                tokio::spawn(async move {
                    match demux.connect(fiber_port).await {
                        Ok(fiber) => pipe(fiber, tcp).await,
                        Err(e) => {
                            warn!(target: "microservice", "[forward] fiber connect failed: {}", e);
                        }
                    }
                });
            }
        });

        self.tasks.lock().unwrap().push(task);
        Ok(())
    }

    async fn stop(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}
