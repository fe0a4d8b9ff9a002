//! Session objects tying the stack together
//!
//! A client session builds the endpoint from configuration, connects the
//! link stack, wraps it in the buffered adapter, starts the demux and runs
//! the admin client until its services are initialized. The server mirrors
//! it per accepted connection.

use crate::admin::{Admin, AdminHandle};
use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::fiber::{Demux, FiberError};
use crate::services::{forward, ServiceRegistry, UserService};
use crate::transport::{self, BufferedStream, Listener};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Build the configured user services from the `services` config section.
pub fn user_services_from_config(config: &Config) -> crate::Result<Vec<Arc<dyn UserService>>> {
    let mut services: Vec<Arc<dyn UserService>> = Vec::new();
    for entry in &config.services {
        match entry.service.as_str() {
            forward::SERVICE_NAME => {
                let service = forward::ForwardService::from_config(entry)
                    .map_err(|e| crate::Error::Config(e.to_string()))?;
                services.push(Arc::new(service));
            }
            other => {
                return Err(crate::Error::Config(format!(
                    "unknown service `{}`",
                    other
                )));
            }
        }
    }
    Ok(services)
}

fn start_demux(stream: transport::BoxedStream) -> Demux {
    let mut buffered = BufferedStream::new(stream);
    buffered.start_pulling();
    let (read_half, write_half) = buffered.split();
    Demux::start(read_half, write_half)
}

/// A running client session
pub struct ClientSession {
    demux: Demux,
    registry: Arc<ServiceRegistry>,
    services: Vec<Arc<dyn UserService>>,
    admin_handle: AdminHandle,
    admin_task: JoinHandle<Result<(), crate::admin::AdminError>>,
}

impl ClientSession {
    /// Connect the full stack to `host:port` and initialize the user
    /// services on the peer.
    pub async fn connect(
        config: &Config,
        host: &str,
        port: u16,
        services: Vec<Arc<dyn UserService>>,
    ) -> crate::Result<Self> {
        let endpoint = Endpoint::from_config(config, host, port)?;
        let stream = transport::connect_endpoint(&endpoint).await?;
        info!(target: "network_crypto", "transport established to {}:{}", host, port);

        let demux = start_demux(stream);

        let registry = ServiceRegistry::with_defaults();
        registry.attach(demux.clone());

        let (admin, admin_handle, init_rx) =
            Admin::new_client(demux.clone(), Arc::clone(&registry), services.clone());
        let admin_task = tokio::spawn(admin.run());

        match init_rx.await {
            Ok(Ok(())) => {
                info!(target: "microservice", "services initialized");
            }
            Ok(Err(e)) => {
                demux.close();
                return Err(e.into());
            }
            Err(_) => {
                // The admin service died before initialization finished;
                // surface its error rather than a generic abort.
                demux.close();
                return match admin_task.await {
                    Ok(Err(e)) => Err(e.into()),
                    _ => Err(crate::Error::OperationAborted),
                };
            }
        }

        Ok(Self {
            demux,
            registry,
            services,
            admin_handle,
            admin_task,
        })
    }

    pub fn demux(&self) -> &Demux {
        &self.demux
    }

    pub fn admin(&self) -> &AdminHandle {
        &self.admin_handle
    }

    /// Wait until the session terminates, returning the reason.
    pub async fn closed(&self) -> FiberError {
        self.demux.closed().await
    }

    /// Tear the session down: stop local services, close the demux.
    pub async fn close(self) {
        for service in &self.services {
            service.stop().await;
        }
        self.registry.stop_all();
        self.demux.close();
        self.admin_task.abort();
    }
}

/// Accepts connections and spawns one server session per peer
pub struct Server {
    listener: Listener,
}

impl Server {
    /// Bind the server stack: TCP listen, TLS accept when configured.
    pub async fn bind(config: &Config, addr: &str) -> crate::Result<Self> {
        let listener = Listener::bind(addr, config.tls.as_ref()).await?;
        info!(target: "network_crypto", "listening on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one connection and start its session.
    pub async fn accept(&self) -> crate::Result<ServerSession> {
        let (stream, peer) = self.listener.accept().await?;
        debug!(target: "network_crypto", "connection from {}", peer);

        let demux = start_demux(stream);

        let registry = ServiceRegistry::with_defaults();
        registry.attach(demux.clone());

        let (admin, _admin_handle) = Admin::new_server(demux.clone(), Arc::clone(&registry));
        let registry_for_run = Arc::clone(&registry);
        let demux_for_run = demux.clone();
        let admin_task = tokio::spawn(async move {
            let result = admin.run().await;
            if let Err(e) = &result {
                warn!(target: "microservice", "admin service ended: {}", e);
            }
            // The session is over either way; release the hosted services.
            demux_for_run.close();
            registry_for_run.stop_all();
            result
        });

        Ok(ServerSession {
            demux,
            registry,
            peer,
            admin_task,
        })
    }

    /// Accept connections forever.
    pub async fn run(&self) -> crate::Result<()> {
        loop {
            match self.accept().await {
                Ok(session) => {
                    info!(target: "network_crypto", "session started with {}", session.peer());
                    tokio::spawn(async move {
                        let reason = session.closed().await;
                        info!(target: "network_crypto", "session ended: {}", reason);
                    });
                }
                Err(e) => {
                    warn!(target: "network_crypto", "accept failed: {}", e);
                }
            }
        }
    }
}

/// One accepted peer session on the server
pub struct ServerSession {
    demux: Demux,
    registry: Arc<ServiceRegistry>,
    peer: SocketAddr,
    admin_task: JoinHandle<Result<(), crate::admin::AdminError>>,
}

impl ServerSession {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn demux(&self) -> &Demux {
        &self.demux
    }

    pub async fn closed(&self) -> FiberError {
        self.demux.closed().await
    }

    pub fn close(self) {
        self.registry.stop_all();
        self.demux.close();
        self.admin_task.abort();
    }
}
