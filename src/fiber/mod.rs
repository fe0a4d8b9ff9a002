//! Fiber multiplexer
//!
//! Splits one transport stream into many in-order logical streams
//! ("fibers") identified by (local-port, remote-port) pairs, with
//! connect/accept/close control frames and per-fiber credit-based flow
//! control. Port 0 is reserved for the admin service on both ends.

mod demux;
mod frame;
mod stream;

pub use demux::{Demux, FiberListener, FiberReadHalf, FiberStream, FiberWriteHalf};
pub use frame::{flags, Frame, FrameHeader, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use stream::FiberState;

use thiserror::Error;

/// Fiber layer errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FiberError {
    #[error("Fiber refused (no acceptor)")]
    Refused,

    #[error("Fiber reset")]
    Reset,

    #[error("Demux faulted: {0}")]
    Faulted(String),

    #[error("Fiber closed")]
    Closed,

    #[error("Operation aborted")]
    Aborted,

    #[error("Keep-alive timed out")]
    TimedOut,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Port in use: {0}")]
    PortInUse(u32),
}

/// Fiber port reserved for the admin service
pub const ADMIN_PORT: u32 = 0;

/// Default per-fiber flow control window (1 MiB)
pub const DEFAULT_WINDOW_SIZE: u32 = 1024 * 1024;

/// Receive buffer size above which the demux reader pauses. Only reached
/// when the peer violates its send window.
pub const RECV_HIGH_WATER: usize = 2 * 1024 * 1024;

/// Receive buffer size below which the demux reader resumes
pub const RECV_LOW_WATER: usize = 1024 * 1024;

/// First ephemeral port
pub const EPHEMERAL_BASE: u32 = 0x8000_0000;
