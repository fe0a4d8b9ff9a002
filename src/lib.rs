//! # Socket Funnel
//!
//! An end-to-end encrypted tunneling service that multiplexes many logical
//! streams ("fibers") over a single authenticated transport, able to traverse
//! hostile network environments through HTTP CONNECT or SOCKS proxies and
//! chains of intermediate relays.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   User Services                      │
//! │      (port forwarding, SOCKS egress, copy, ...)     │
//! ├─────────────────────────────────────────────────────┤
//! │                   Admin Service                      │
//! │      (service bootstrap, keep-alive, fiber 0)       │
//! ├─────────────────────────────────────────────────────┤
//! │                 Fiber Multiplexer                    │
//! │     (port-pair fibers, flow control, fairness)      │
//! ├─────────────────────────────────────────────────────┤
//! │               Buffered TLS Adapter                   │
//! │      (record pull loop, strand-serialized writes)   │
//! ├─────────────────────────────────────────────────────┤
//! │                 Link Protocol Stack                  │
//! │      (TCP → proxy traversal → circuit → TLS)        │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod admin;
pub mod config;
pub mod endpoint;
pub mod fiber;
pub mod proxy;
pub mod services;
pub mod session;
pub mod transport;

pub use config::Config;

/// Protocol version exchanged on the admin fiber
pub const ADMIN_VERSION: u8 = 1;

/// Default port for the funnel server
pub const DEFAULT_PORT: u16 = 8011;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Endpoint error: {0}")]
    Endpoint(#[from] endpoint::EndpointError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Fiber error: {0}")]
    Fiber(#[from] fiber::FiberError),

    #[error("Admin error: {0}")]
    Admin(#[from] admin::AdminError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout")]
    TimedOut,

    #[error("Operation aborted")]
    OperationAborted,
}
