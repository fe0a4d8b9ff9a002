//! User service plumbing
//!
//! The admin service drives two registries: a per-session
//! [`ServiceRegistry`] on the hosting side that instantiates remote service
//! halves by numeric id, and a set of [`UserService`] implementations on the
//! initiating side that emit create requests and run the local halves.

pub mod forward;

use crate::admin::requests::{status, CreateServiceRequest};
use crate::fiber::Demux;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::debug;

/// Service layer errors
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Unknown service id: {0}")]
    Unknown(u32),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("No service running with id {0}")]
    NotRunning(u32),

    #[error("Registry is not attached to a session")]
    Inactive,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    /// Status code carried back in a `ServiceStatus` reply.
    pub fn status_code(&self) -> u32 {
        match self {
            ServiceError::Unknown(_) => status::UNKNOWN_COMMAND,
            ServiceError::InvalidParameters(_) => status::INVALID_REQUEST,
            ServiceError::NotRunning(_) => status::NOT_RUNNING,
            _ => status::SERVICE_FAILED,
        }
    }
}

/// Tasks backing one running service instance. Stopping aborts them and
/// runs the cleanup closure so externally visible resources (listeners,
/// acceptor ports) are released before the stop is acknowledged.
pub struct ServiceHandle {
    tasks: Vec<JoinHandle<()>>,
    cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl ServiceHandle {
    pub fn new(tasks: Vec<JoinHandle<()>>) -> Self {
        Self {
            tasks,
            cleanup: None,
        }
    }

    pub fn with_cleanup(tasks: Vec<JoinHandle<()>>, cleanup: impl FnOnce() + Send + 'static) -> Self {
        Self {
            tasks,
            cleanup: Some(Box::new(cleanup)),
        }
    }

    fn stop(self) {
        for task in &self.tasks {
            task.abort();
        }
        if let Some(cleanup) = self.cleanup {
            cleanup();
        }
    }
}

/// Instantiates one service kind from its parameters
pub type ServiceFactoryFn =
    Box<dyn Fn(Demux, &BTreeMap<String, String>) -> Result<ServiceHandle, ServiceError> + Send + Sync>;

struct RunningService {
    service_id: u32,
    handle: ServiceHandle,
}

/// Per-session registry of service factories and running instances
pub struct ServiceRegistry {
    demux: Mutex<Option<Demux>>,
    factories: Mutex<HashMap<u32, ServiceFactoryFn>>,
    running: Mutex<HashMap<u32, RunningService>>,
    next_id: AtomicU32,
}

impl ServiceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            demux: Mutex::new(None),
            factories: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        })
    }

    /// A registry with the built-in service factories registered.
    pub fn with_defaults() -> Arc<Self> {
        let registry = Self::new();
        registry.register_factory(forward::SERVICE_ID, forward::remote_factory());
        registry
    }

    /// Bind the registry to a session's demux. Factories are inert until
    /// attached.
    pub fn attach(&self, demux: Demux) {
        *self.demux.lock().unwrap() = Some(demux);
    }

    /// Register a factory for `service_id`. Returns false if taken.
    pub fn register_factory(&self, service_id: u32, factory: ServiceFactoryFn) -> bool {
        let mut factories = self.factories.lock().unwrap();
        if factories.contains_key(&service_id) {
            return false;
        }
        factories.insert(service_id, factory);
        true
    }

    /// Instantiate and run a service, returning its runtime id.
    pub fn create_run(
        &self,
        service_id: u32,
        parameters: &BTreeMap<String, String>,
    ) -> Result<u32, ServiceError> {
        let demux = self
            .demux
            .lock()
            .unwrap()
            .clone()
            .ok_or(ServiceError::Inactive)?;

        let factories = self.factories.lock().unwrap();
        let factory = factories
            .get(&service_id)
            .ok_or(ServiceError::Unknown(service_id))?;
        let handle = factory(demux, parameters)?;
        drop(factories);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.running
            .lock()
            .unwrap()
            .insert(id, RunningService { service_id, handle });

        debug!(target: "microservice", "service {} running with id {}", service_id, id);
        Ok(id)
    }

    /// Tear down the service with runtime id `id`, releasing its resources.
    pub fn stop(&self, id: u32) -> Result<(), ServiceError> {
        let service = self
            .running
            .lock()
            .unwrap()
            .remove(&id)
            .ok_or(ServiceError::NotRunning(id))?;
        service.handle.stop();
        debug!(target: "microservice", "service id {} stopped (kind {})", id, service.service_id);
        Ok(())
    }

    /// Tear down every running service.
    pub fn stop_all(&self) {
        let mut running = self.running.lock().unwrap();
        for (_, service) in running.drain() {
            service.handle.stop();
        }
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap().len()
    }
}

/// A user service configured on the initiating side. The admin service asks
/// it for create requests, starts it once the peer confirmed, and stops it
/// on teardown.
#[async_trait]
pub trait UserService: Send + Sync {
    fn name(&self) -> &'static str;

    /// Requests the peer must fulfill before this service can start.
    fn create_requests(&self) -> Vec<CreateServiceRequest>;

    /// Start the local half once every create request succeeded.
    async fn start(&self, demux: &Demux) -> Result<(), ServiceError>;

    /// Stop the local half.
    async fn stop(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_factory() -> ServiceFactoryFn {
        Box::new(|_, _| Ok(ServiceHandle::new(Vec::new())))
    }

    fn demux_pair() -> (Demux, Demux) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (Demux::start(a_read, a_write), Demux::start(b_read, b_write))
    }

    #[tokio::test]
    async fn test_create_stop_create_cycle() {
        let registry = ServiceRegistry::new();
        let (demux, _peer) = demux_pair();
        registry.attach(demux);
        registry.register_factory(42, noop_factory());

        let params = BTreeMap::new();
        let first = registry.create_run(42, &params).unwrap();
        assert_eq!(registry.running_count(), 1);

        registry.stop(first).unwrap();
        assert_eq!(registry.running_count(), 0);

        // Resources released, the next create succeeds with a fresh id.
        let second = registry.create_run(42, &params).unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_unknown_service_rejected() {
        let registry = ServiceRegistry::new();
        let (demux, _peer) = demux_pair();
        registry.attach(demux);

        let err = registry.create_run(9, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, ServiceError::Unknown(9)));
        assert_eq!(err.status_code(), status::UNKNOWN_COMMAND);
    }

    #[tokio::test]
    async fn test_stop_unknown_id() {
        let registry = ServiceRegistry::new();
        let err = registry.stop(7).unwrap_err();
        assert!(matches!(err, ServiceError::NotRunning(7)));
    }

    #[test]
    fn test_unattached_registry_inactive() {
        let registry = ServiceRegistry::new();
        registry.register_factory(1, noop_factory());
        let err = registry.create_run(1, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, ServiceError::Inactive));
    }
}
