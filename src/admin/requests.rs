//! Admin request payloads and the command registry
//!
//! Commands are registered by numeric id on each side at startup. A
//! registered entry carries the reply command id and a receive handler; the
//! handler's output, when present, is sent back with the request's serial.

use crate::services::ServiceRegistry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Ask the peer to instantiate a service
pub const CREATE_SERVICE: u32 = 1;
/// Service creation/stop outcome; also the reply form for commands 1 and 3
pub const SERVICE_STATUS: u32 = 2;
/// Ask the peer to tear down a running service
pub const STOP_SERVICE: u32 = 3;
/// Liveness probe
pub const KEEP_ALIVE: u32 = 4;
/// Liveness probe reply
pub const KEEP_ALIVE_REPLY: u32 = 5;

/// Status error codes carried in [`ServiceStatus::error_code`]
pub mod status {
    pub const OK: u32 = 0;
    pub const SERVICE_FAILED: u32 = 1;
    pub const UNKNOWN_COMMAND: u32 = 2;
    pub const INVALID_REQUEST: u32 = 3;
    pub const NOT_RUNNING: u32 = 4;
}

/// Request the peer to instantiate the remote half of a user service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateServiceRequest {
    pub service_id: u32,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl CreateServiceRequest {
    pub fn new(service_id: u32) -> Self {
        Self {
            service_id,
            parameters: BTreeMap::new(),
        }
    }

    pub fn add_parameter(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.parameters.insert(key.into(), value.into());
    }
}

/// Outcome of a create or stop request. `id` is the runtime id assigned by
/// the peer's service registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub id: u32,
    pub service_id: u32,
    pub error_code: u32,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl ServiceStatus {
    pub fn failure(error_code: u32) -> Self {
        Self {
            id: 0,
            service_id: 0,
            error_code,
            parameters: BTreeMap::new(),
        }
    }

    pub fn ok(&self) -> bool {
        self.error_code == status::OK
    }
}

/// Request the peer to tear down the service with runtime id `id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopServiceRequest {
    pub id: u32,
}

/// Receive handler: parses the payload, acts on the registry, and returns
/// the reply payload when one is due.
pub type ReceiveHandler =
    Box<dyn Fn(&[u8], &Arc<ServiceRegistry>) -> Option<Vec<u8>> + Send + Sync>;

/// Registry mapping command ids to their reply id and receive handler
pub struct CommandFactory {
    entries: HashMap<u32, (u32, ReceiveHandler)>,
}

impl CommandFactory {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register a command. Returns false if the id was already taken.
    pub fn register(&mut self, command_id: u32, reply_id: u32, handler: ReceiveHandler) -> bool {
        if self.entries.contains_key(&command_id) {
            return false;
        }
        self.entries.insert(command_id, (reply_id, handler));
        true
    }

    pub fn get(&self, command_id: u32) -> Option<&(u32, ReceiveHandler)> {
        self.entries.get(&command_id)
    }

    /// The factory with the built-in command set registered.
    pub fn with_default_commands() -> Self {
        let mut factory = Self::new();

        factory.register(CREATE_SERVICE, SERVICE_STATUS, Box::new(on_create_service));
        factory.register(STOP_SERVICE, SERVICE_STATUS, Box::new(on_stop_service));
        factory.register(SERVICE_STATUS, SERVICE_STATUS, Box::new(on_service_status));
        factory.register(KEEP_ALIVE, KEEP_ALIVE_REPLY, Box::new(|_, _| Some(Vec::new())));
        factory.register(KEEP_ALIVE_REPLY, KEEP_ALIVE_REPLY, Box::new(|_, _| None));

        factory
    }
}

impl Default for CommandFactory {
    fn default() -> Self {
        Self::with_default_commands()
    }
}

fn on_create_service(payload: &[u8], registry: &Arc<ServiceRegistry>) -> Option<Vec<u8>> {
    let request: CreateServiceRequest = match serde_json::from_slice(payload) {
        Ok(request) => request,
        Err(_) => {
            warn!(target: "microservice", "[admin] create service: cannot extract request");
            return Some(encode_status(&ServiceStatus::failure(status::INVALID_REQUEST)));
        }
    };

    let reply = match registry.create_run(request.service_id, &request.parameters) {
        Ok(id) => {
            debug!(target: "microservice", "[admin] create service: {} -> id {}", request.service_id, id);
            ServiceStatus {
                id,
                service_id: request.service_id,
                error_code: status::OK,
                parameters: request.parameters,
            }
        }
        Err(e) => {
            warn!(target: "microservice", "[admin] create service {} failed: {}", request.service_id, e);
            ServiceStatus {
                id: 0,
                service_id: request.service_id,
                error_code: e.status_code(),
                parameters: request.parameters,
            }
        }
    };

    Some(encode_status(&reply))
}

fn on_stop_service(payload: &[u8], registry: &Arc<ServiceRegistry>) -> Option<Vec<u8>> {
    let request: StopServiceRequest = match serde_json::from_slice(payload) {
        Ok(request) => request,
        Err(_) => {
            warn!(target: "microservice", "[admin] stop service: cannot extract request");
            return Some(encode_status(&ServiceStatus::failure(status::INVALID_REQUEST)));
        }
    };

    let reply = match registry.stop(request.id) {
        Ok(()) => {
            debug!(target: "microservice", "[admin] stop service: id {}", request.id);
            ServiceStatus {
                id: request.id,
                service_id: 0,
                error_code: status::OK,
                parameters: BTreeMap::new(),
            }
        }
        Err(e) => {
            warn!(target: "microservice", "[admin] stop service {} failed: {}", request.id, e);
            ServiceStatus {
                id: request.id,
                service_id: 0,
                error_code: e.status_code(),
                parameters: BTreeMap::new(),
            }
        }
    };

    Some(encode_status(&reply))
}

fn on_service_status(payload: &[u8], _registry: &Arc<ServiceRegistry>) -> Option<Vec<u8>> {
    match serde_json::from_slice::<ServiceStatus>(payload) {
        Ok(status) => {
            debug!(
                target: "microservice",
                "[admin] service status: {} for service {} - ec {}",
                status.id, status.service_id, status.error_code
            );
        }
        Err(_) => {
            warn!(target: "microservice", "[admin] service status: cannot extract request");
        }
    }
    None
}

pub(crate) fn encode_status(status: &ServiceStatus) -> Vec<u8> {
    serde_json::to_vec(status).expect("status serialization is infallible")
}
