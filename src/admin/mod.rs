//! Admin service
//!
//! Runs on fiber 0 of the demux. Roles are asymmetric: the client initiates
//! user services, the server hosts service factories. The first byte each
//! way is the 8-bit protocol version; afterwards both sides exchange
//! length-prefixed commands, send keep-alives while idle, and the client
//! drives its initialization state machine to bootstrap the configured
//! services on the peer.

pub mod command;
pub mod requests;

pub use command::{read_command, AdminCommand, SerialAllocator, COMMAND_HEADER_SIZE};
pub use requests::{
    CommandFactory, CreateServiceRequest, ServiceStatus, StopServiceRequest,
};

use crate::fiber::{Demux, FiberError, FiberWriteHalf};
use crate::services::{ServiceRegistry, UserService};
use requests::status;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Keep-alive cadence; a missing reply for one full interval closes the
/// demux.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Attempts per create request during initialization
pub const SERVICE_STATUS_RETRY_COUNT: u32 = 50;

/// Reply deadline for one command round trip
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between retries of a refused create request
const INIT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Admin layer errors
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("Admin version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: u8, remote: u8 },

    #[error("Unknown admin command: {0}")]
    UnknownCommand(u32),

    #[error("Remote failure (status {0})")]
    RemoteFailure(u32),

    #[error("Command reply timed out")]
    Timeout,

    #[error("Command payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Serialization failed: {0}")]
    Serialize(String),

    #[error("Admin channel closed")]
    Closed,

    #[error("Fiber error: {0}")]
    Fiber(#[from] FiberError),
}

struct AdminShared {
    handlers: Mutex<HashMap<u32, oneshot::Sender<Vec<u8>>>>,
    serials: Mutex<SerialAllocator>,
    writer: tokio::sync::Mutex<Option<FiberWriteHalf>>,
}

/// Sends commands and routes their replies by serial.
#[derive(Clone)]
struct CommandSender {
    shared: Arc<AdminShared>,
}

impl CommandSender {
    /// Send one command, registering a reply handler for its serial.
    async fn send(
        &self,
        command_id: u32,
        payload: Vec<u8>,
    ) -> Result<(u32, oneshot::Receiver<Vec<u8>>), AdminError> {
        let (tx, rx) = oneshot::channel();
        let serial = {
            let mut handlers = self.shared.handlers.lock().unwrap();
            let mut serials = self.shared.serials.lock().unwrap();
            let serial = serials.allocate(|s| handlers.contains_key(&s));
            handlers.insert(serial, tx);
            serial
        };

        let command = AdminCommand::new(serial, command_id, payload);
        let mut writer = self.shared.writer.lock().await;
        let Some(write_half) = writer.as_mut() else {
            self.shared.handlers.lock().unwrap().remove(&serial);
            return Err(AdminError::Closed);
        };
        if let Err(e) = write_half.write_all(&command.encode()).await {
            self.shared.handlers.lock().unwrap().remove(&serial);
            return Err(e.into());
        }

        Ok((serial, rx))
    }

    /// Send and wait for the reply payload. The reply handler fires exactly
    /// once: on the reply, or it is erased here on timeout.
    async fn round_trip(
        &self,
        command_id: u32,
        payload: Vec<u8>,
        deadline: Duration,
    ) -> Result<Vec<u8>, AdminError> {
        let (serial, rx) = self.send(command_id, payload).await?;
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(AdminError::Closed),
            Err(_) => {
                self.shared.handlers.lock().unwrap().remove(&serial);
                Err(AdminError::Timeout)
            }
        }
    }
}

/// Client-side handle for driving remote services outside initialization.
#[derive(Clone)]
pub struct AdminHandle {
    sender: CommandSender,
}

impl AdminHandle {
    /// Ask the peer to instantiate a service; returns its status reply.
    pub async fn create_remote_service(
        &self,
        request: &CreateServiceRequest,
    ) -> Result<ServiceStatus, AdminError> {
        let payload =
            serde_json::to_vec(request).map_err(|e| AdminError::Serialize(e.to_string()))?;
        let reply = self
            .sender
            .round_trip(requests::CREATE_SERVICE, payload, COMMAND_TIMEOUT)
            .await?;
        serde_json::from_slice(&reply).map_err(|e| AdminError::Serialize(e.to_string()))
    }

    /// Ask the peer to tear down a service by its runtime id.
    pub async fn stop_remote_service(&self, id: u32) -> Result<ServiceStatus, AdminError> {
        let payload = serde_json::to_vec(&StopServiceRequest { id })
            .map_err(|e| AdminError::Serialize(e.to_string()))?;
        let reply = self
            .sender
            .round_trip(requests::STOP_SERVICE, payload, COMMAND_TIMEOUT)
            .await?;
        serde_json::from_slice(&reply).map_err(|e| AdminError::Serialize(e.to_string()))
    }
}

/// The admin service on fiber 0
pub struct Admin {
    demux: Demux,
    is_server: bool,
    registry: Arc<ServiceRegistry>,
    factory: CommandFactory,
    shared: Arc<AdminShared>,
    user_services: Vec<Arc<dyn UserService>>,
    init_tx: Option<oneshot::Sender<Result<(), AdminError>>>,
}

impl Admin {
    fn new(demux: Demux, registry: Arc<ServiceRegistry>, is_server: bool) -> Self {
        let serials = if is_server {
            SerialAllocator::new_server()
        } else {
            SerialAllocator::new_client()
        };
        Self {
            demux,
            is_server,
            registry,
            factory: CommandFactory::with_default_commands(),
            shared: Arc::new(AdminShared {
                handlers: Mutex::new(HashMap::new()),
                serials: Mutex::new(serials),
                writer: tokio::sync::Mutex::new(None),
            }),
            user_services: Vec::new(),
            init_tx: None,
        }
    }

    /// Server role: host service factories, answer commands, keep-alive.
    pub fn new_server(demux: Demux, registry: Arc<ServiceRegistry>) -> (Self, AdminHandle) {
        let admin = Self::new(demux, registry, true);
        let handle = AdminHandle {
            sender: CommandSender {
                shared: Arc::clone(&admin.shared),
            },
        };
        (admin, handle)
    }

    /// Client role: bootstrap `user_services` on the peer. The receiver
    /// resolves with the overall initialization result.
    pub fn new_client(
        demux: Demux,
        registry: Arc<ServiceRegistry>,
        user_services: Vec<Arc<dyn UserService>>,
    ) -> (Self, AdminHandle, oneshot::Receiver<Result<(), AdminError>>) {
        let mut admin = Self::new(demux, registry, false);
        admin.user_services = user_services;
        let (init_tx, init_rx) = oneshot::channel();
        admin.init_tx = Some(init_tx);
        let handle = AdminHandle {
            sender: CommandSender {
                shared: Arc::clone(&admin.shared),
            },
        };
        (admin, handle, init_rx)
    }

    /// Run the admin service until its fiber or demux terminates.
    pub async fn run(mut self) -> Result<(), AdminError> {
        let fiber = self.demux.admin_fiber().ok_or(AdminError::Closed)?;
        let (mut read_half, mut write_half) = fiber.split();

        // Version exchange: one byte each way, mismatch closes the demux.
        write_half.write_all(&[crate::ADMIN_VERSION]).await?;
        let mut version = [0u8; 1];
        if read_half.read(&mut version).await? == 0 {
            return Err(AdminError::Closed);
        }
        if version[0] != crate::ADMIN_VERSION {
            warn!(
                target: "microservice",
                "[admin] version mismatch: local {}, remote {}",
                crate::ADMIN_VERSION, version[0]
            );
            self.demux.close();
            return Err(AdminError::VersionMismatch {
                local: crate::ADMIN_VERSION,
                remote: version[0],
            });
        }
        debug!(target: "microservice", "[admin] version {} agreed", crate::ADMIN_VERSION);

        *self.shared.writer.lock().await = Some(write_half);
        let sender = CommandSender {
            shared: Arc::clone(&self.shared),
        };

        if !self.is_server {
            let init_tx = self.init_tx.take().expect("client admin has an init channel");
            let services = self.user_services.clone();
            let demux = self.demux.clone();
            let init_sender = sender.clone();
            tokio::spawn(async move {
                let result = initialize(init_sender, demux, services).await;
                let _ = init_tx.send(result);
            });
        }

        // Dedicated reader task; command parsing must not race the timer.
        let (command_tx, mut command_rx) = mpsc::channel::<Result<AdminCommand, AdminError>>(16);
        tokio::spawn(async move {
            loop {
                match read_command(&mut read_half).await {
                    Ok(command) => {
                        if command_tx.send(Ok(command)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = command_tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });

        let mut keepalive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        keepalive.tick().await; // consume the immediate first tick
        let mut outstanding: Option<oneshot::Receiver<Vec<u8>>> = None;

        loop {
            tokio::select! {
                message = command_rx.recv() => {
                    match message {
                        Some(Ok(command)) => self.handle_command(command).await?,
                        Some(Err(e)) => {
                            debug!(target: "microservice", "[admin] channel ended: {}", e);
                            return Ok(());
                        }
                        None => return Ok(()),
                    }
                }
                _ = keepalive.tick() => {
                    if let Some(mut reply) = outstanding.take() {
                        match reply.try_recv() {
                            Ok(_) => {}
                            Err(oneshot::error::TryRecvError::Empty) => {
                                warn!(target: "microservice", "[admin] keep-alive reply missing, closing");
                                self.demux.close_with(FiberError::TimedOut);
                                return Err(AdminError::Fiber(FiberError::TimedOut));
                            }
                            Err(oneshot::error::TryRecvError::Closed) => return Ok(()),
                        }
                    }
                    trace!(target: "microservice", "[admin] keep-alive");
                    let (_, reply) = sender.send(requests::KEEP_ALIVE, Vec::new()).await?;
                    outstanding = Some(reply);
                }
            }
        }
    }

    async fn handle_command(&self, command: AdminCommand) -> Result<(), AdminError> {
        // A reply reuses our serial; its handler fires exactly once.
        if let Some(tx) = self.shared.handlers.lock().unwrap().remove(&command.serial) {
            let _ = tx.send(command.payload.clone());
        }

        match self.factory.get(command.command_id) {
            Some((reply_id, handler)) => {
                if let Some(payload) = handler(&command.payload, &self.registry) {
                    self.send_reply(command.serial, *reply_id, payload).await?;
                }
            }
            None => {
                warn!(target: "microservice", "[admin] unknown command id {}", command.command_id);
                let payload =
                    requests::encode_status(&ServiceStatus::failure(status::UNKNOWN_COMMAND));
                self.send_reply(command.serial, requests::SERVICE_STATUS, payload)
                    .await?;
            }
        }
        Ok(())
    }

    async fn send_reply(
        &self,
        serial: u32,
        command_id: u32,
        payload: Vec<u8>,
    ) -> Result<(), AdminError> {
        let reply = AdminCommand::new(serial, command_id, payload);
        let mut writer = self.shared.writer.lock().await;
        let Some(write_half) = writer.as_mut() else {
            return Err(AdminError::Closed);
        };
        write_half.write_all(&reply.encode()).await?;
        Ok(())
    }
}

/// Client initialization states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitState {
    SendingCreateRequests,
    WaitingReplies,
    NotifyingServices,
    Done,
    Failed,
}

/// Drive the client initialization state machine: send every create
/// request, wait for the replies (retrying transient refusals), start the
/// local service halves, and on unrecoverable failure stop whatever was
/// created before surfacing the error.
async fn initialize(
    sender: CommandSender,
    demux: Demux,
    services: Vec<Arc<dyn UserService>>,
) -> Result<(), AdminError> {
    let mut state = InitState::SendingCreateRequests;
    let mut pending: Vec<CreateServiceRequest> = Vec::new();
    let mut created: Vec<u32> = Vec::new();
    let mut failure: Option<AdminError> = None;

    loop {
        state = match state {
            InitState::SendingCreateRequests => {
                for service in &services {
                    pending.extend(service.create_requests());
                }
                debug!(
                    target: "microservice",
                    "[admin] initializing {} remote services", pending.len()
                );
                InitState::WaitingReplies
            }

            InitState::WaitingReplies => {
                let mut next = InitState::NotifyingServices;

                'requests: for request in &pending {
                    let payload = match serde_json::to_vec(request) {
                        Ok(payload) => payload,
                        Err(e) => {
                            failure = Some(AdminError::Serialize(e.to_string()));
                            next = InitState::Failed;
                            break 'requests;
                        }
                    };

                    let mut attempt = 0u32;
                    loop {
                        attempt += 1;
                        match sender
                            .round_trip(requests::CREATE_SERVICE, payload.clone(), COMMAND_TIMEOUT)
                            .await
                        {
                            Ok(reply) => match serde_json::from_slice::<ServiceStatus>(&reply) {
                                Ok(reply_status) if reply_status.ok() => {
                                    created.push(reply_status.id);
                                    break;
                                }
                                Ok(reply_status) => {
                                    if attempt >= SERVICE_STATUS_RETRY_COUNT {
                                        failure = Some(AdminError::RemoteFailure(
                                            reply_status.error_code,
                                        ));
                                        next = InitState::Failed;
                                        break 'requests;
                                    }
                                    tokio::time::sleep(INIT_RETRY_DELAY).await;
                                }
                                Err(e) => {
                                    failure = Some(AdminError::Serialize(e.to_string()));
                                    next = InitState::Failed;
                                    break 'requests;
                                }
                            },
                            Err(AdminError::Timeout) => {
                                if attempt >= SERVICE_STATUS_RETRY_COUNT {
                                    failure = Some(AdminError::Timeout);
                                    next = InitState::Failed;
                                    break 'requests;
                                }
                            }
                            Err(e) => {
                                failure = Some(e);
                                next = InitState::Failed;
                                break 'requests;
                            }
                        }
                    }
                }
                next
            }

            InitState::NotifyingServices => {
                let mut next = InitState::Done;
                for service in &services {
                    if let Err(e) = service.start(&demux).await {
                        warn!(
                            target: "microservice",
                            "[admin] local service {} failed to start: {}",
                            service.name(), e
                        );
                        failure = Some(AdminError::RemoteFailure(e.status_code()));
                        next = InitState::Failed;
                        break;
                    }
                }
                next
            }

            InitState::Done => {
                debug!(target: "microservice", "[admin] initialization complete");
                return Ok(());
            }

            InitState::Failed => {
                for id in &created {
                    if let Ok(payload) = serde_json::to_vec(&StopServiceRequest { id: *id }) {
                        let _ = sender
                            .round_trip(requests::STOP_SERVICE, payload, COMMAND_TIMEOUT)
                            .await;
                    }
                }
                for service in &services {
                    service.stop().await;
                }
                return Err(failure.take().unwrap_or(AdminError::Closed));
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{ServiceError, ServiceHandle};
    use std::collections::BTreeMap;

    fn demux_pair() -> (Demux, Demux) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (Demux::start(a_read, a_write), Demux::start(b_read, b_write))
    }

    /// Registers an echo factory: listens on the fiber port named by the
    /// request parameters and echoes every accepted fiber.
    fn echo_registry(demux: &Demux) -> Arc<ServiceRegistry> {
        let registry = ServiceRegistry::new();
        registry.attach(demux.clone());
        registry.register_factory(
            42,
            Box::new(|demux: Demux, parameters: &BTreeMap<String, String>| {
                let port: u32 = parameters
                    .get("fiber_port")
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(|| ServiceError::InvalidParameters("fiber_port".to_string()))?;
                let mut listener = demux
                    .listen(port)
                    .map_err(|e| ServiceError::InvalidParameters(e.to_string()))?;
                let cleanup_demux = demux.clone();
                let task = tokio::spawn(async move {
                    while let Ok(mut fiber) = listener.accept().await {
                        tokio::spawn(async move {
                            let mut buf = [0u8; 4096];
                            loop {
                                match fiber.read(&mut buf).await {
                                    Ok(0) | Err(_) => break,
                                    Ok(n) => {
                                        if fiber.write_all(&buf[..n]).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                        });
                    }
                });
                Ok(ServiceHandle::with_cleanup(vec![task], move || {
                    cleanup_demux.unlisten(port);
                }))
            }),
        );
        registry
    }

    #[tokio::test]
    async fn test_version_mismatch_closes_demux() {
        let (client_demux, server_demux) = demux_pair();

        // Peer that speaks a different admin version.
        let mut peer = server_demux.admin_fiber().unwrap();
        peer.write_all(&[99]).await.unwrap();

        let registry = ServiceRegistry::new();
        let (admin, _handle, _init) = Admin::new_client(client_demux.clone(), registry, Vec::new());
        let err = admin.run().await.unwrap_err();
        assert!(matches!(err, AdminError::VersionMismatch { remote: 99, .. }));
        assert!(client_demux.is_closed());
    }

    #[tokio::test]
    async fn test_create_stop_round_trip() {
        let (client_demux, server_demux) = demux_pair();

        let server_registry = echo_registry(&server_demux);
        let (server_admin, _server_handle) =
            Admin::new_server(server_demux.clone(), server_registry.clone());
        tokio::spawn(server_admin.run());

        let client_registry = ServiceRegistry::new();
        let (client_admin, handle, init_rx) =
            Admin::new_client(client_demux.clone(), client_registry, Vec::new());
        tokio::spawn(client_admin.run());
        init_rx.await.unwrap().unwrap();

        // Create the echo service remotely and exercise it through a fiber.
        let mut request = CreateServiceRequest::new(42);
        request.add_parameter("fiber_port", "700");
        let created = handle.create_remote_service(&request).await.unwrap();
        assert!(created.ok());
        assert_eq!(server_registry.running_count(), 1);

        let mut fiber = client_demux.connect(700).await.unwrap();
        fiber.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        let mut got = 0;
        while got < 4 {
            let n = fiber.read(&mut buf[got..]).await.unwrap();
            got += n;
        }
        assert_eq!(&buf, b"ping");
        drop(fiber);

        // Stop releases the acceptor; a new create on the same port works.
        let stopped = handle.stop_remote_service(created.id).await.unwrap();
        assert!(stopped.ok());
        assert_eq!(server_registry.running_count(), 0);

        let recreated = handle.create_remote_service(&request).await.unwrap();
        assert!(recreated.ok());
        assert_ne!(recreated.id, created.id);
    }

    #[tokio::test]
    async fn test_unknown_command_gets_failure_reply() {
        let (client_demux, server_demux) = demux_pair();

        let (server_admin, _handle) =
            Admin::new_server(server_demux.clone(), ServiceRegistry::new());
        tokio::spawn(server_admin.run());

        // Raw client: version exchange, then a bogus command id.
        let fiber = client_demux.admin_fiber().unwrap();
        let (mut read_half, mut write_half) = fiber.split();
        write_half.write_all(&[crate::ADMIN_VERSION]).await.unwrap();
        let mut version = [0u8; 1];
        read_half.read(&mut version).await.unwrap();

        let bogus = AdminCommand::new(3, 999, Vec::new());
        write_half.write_all(&bogus.encode()).await.unwrap();

        let reply = read_command(&mut read_half).await.unwrap();
        assert_eq!(reply.serial, 3);
        assert_eq!(reply.command_id, requests::SERVICE_STATUS);
        let reply_status: ServiceStatus = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(reply_status.error_code, status::UNKNOWN_COMMAND);
    }

    #[tokio::test]
    async fn test_failed_create_aborts_initialization() {
        let (client_demux, server_demux) = demux_pair();

        // Server registry without the requested factory.
        let server_registry = ServiceRegistry::new();
        server_registry.attach(server_demux.clone());
        let (server_admin, _handle) = Admin::new_server(server_demux.clone(), server_registry);
        tokio::spawn(server_admin.run());

        struct Doomed;
        #[async_trait::async_trait]
        impl UserService for Doomed {
            fn name(&self) -> &'static str {
                "doomed"
            }
            fn create_requests(&self) -> Vec<CreateServiceRequest> {
                vec![CreateServiceRequest::new(77)]
            }
            async fn start(&self, _demux: &Demux) -> Result<(), ServiceError> {
                panic!("must not start after a failed create");
            }
            async fn stop(&self) {}
        }

        let (client_admin, _handle, init_rx) = Admin::new_client(
            client_demux.clone(),
            ServiceRegistry::new(),
            vec![Arc::new(Doomed) as Arc<dyn UserService>],
        );
        tokio::spawn(client_admin.run());

        let err = init_rx.await.unwrap().unwrap_err();
        assert!(matches!(err, AdminError::RemoteFailure(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_exchange_keeps_session_open() {
        let (client_demux, server_demux) = demux_pair();

        let (server_admin, _sh) = Admin::new_server(server_demux.clone(), ServiceRegistry::new());
        tokio::spawn(server_admin.run());
        let (client_admin, _ch, init_rx) =
            Admin::new_client(client_demux.clone(), ServiceRegistry::new(), Vec::new());
        tokio::spawn(client_admin.run());
        init_rx.await.unwrap().unwrap();

        // Idle across two keep-alive intervals; the probes are answered and
        // nothing disconnects.
        for _ in 0..26 {
            tokio::time::advance(Duration::from_secs(10)).await;
            tokio::task::yield_now().await;
        }
        assert!(!client_demux.is_closed());
        assert!(!server_demux.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_timeout_closes_demux() {
        let (client_demux, server_demux) = demux_pair();

        // The peer completes the version exchange but then goes silent:
        // its demux still ACKs frames, yet no admin service answers.
        let silent = server_demux.admin_fiber().unwrap();
        let (mut silent_read, mut silent_write) = silent.split();
        silent_write.write_all(&[crate::ADMIN_VERSION]).await.unwrap();
        let silent_task = tokio::spawn(async move {
            let mut sink = [0u8; 1024];
            while silent_read.read(&mut sink).await.unwrap_or(0) > 0 {}
            silent_write
        });

        let (client_admin, _handle, _init) =
            Admin::new_client(client_demux.clone(), ServiceRegistry::new(), Vec::new());
        let run = tokio::spawn(client_admin.run());

        // First interval sends the probe, the second notices the missing
        // reply.
        for _ in 0..26 {
            tokio::time::advance(Duration::from_secs(10)).await;
            tokio::task::yield_now().await;
        }

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, AdminError::Fiber(FiberError::TimedOut)));
        assert_eq!(client_demux.closed().await, FiberError::TimedOut);

        silent_task.abort();
    }
}
