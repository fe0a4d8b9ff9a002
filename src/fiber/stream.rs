//! Per-fiber state tracked by the demux

use super::{FiberError, DEFAULT_WINDOW_SIZE, MAX_PAYLOAD_SIZE, RECV_HIGH_WATER};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};

/// Fiber lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// SYN sent, waiting for the peer's verdict
    Connecting,
    /// Both directions open
    Established,
    /// Local side sent FIN
    HalfClosedLocal,
    /// Remote side sent FIN
    HalfClosedRemote,
    /// Both FIN exchanged
    Closed,
}

/// Bookkeeping for one fiber. Owned by the demux; user handles reach it
/// through the demux state lock.
pub(crate) struct Fiber {
    pub state: FiberState,

    // Send side
    pub send_queue: VecDeque<Bytes>,
    pub queued_bytes: usize,
    pub in_flight: u32,
    pub send_window: u32,
    pub fin_pending: bool,
    pub fin_sent: bool,

    // Receive side
    pub recv_chunks: VecDeque<Bytes>,
    pub recv_len: usize,
    pub pending_credit: u32,
    pub fin_received: bool,
    pub over_high: bool,

    pub error: Option<FiberError>,
    /// User handle dropped; reap once fully closed
    pub detached: bool,

    pub recv_notify: Arc<Notify>,
    pub send_notify: Arc<Notify>,
    pub connect_tx: Option<oneshot::Sender<Result<(), FiberError>>>,
}

impl Fiber {
    fn new(state: FiberState) -> Self {
        Self {
            state,
            send_queue: VecDeque::new(),
            queued_bytes: 0,
            in_flight: 0,
            send_window: DEFAULT_WINDOW_SIZE,
            fin_pending: false,
            fin_sent: false,
            recv_chunks: VecDeque::new(),
            recv_len: 0,
            pending_credit: 0,
            fin_received: false,
            over_high: false,
            error: None,
            detached: false,
            recv_notify: Arc::new(Notify::new()),
            send_notify: Arc::new(Notify::new()),
            connect_tx: None,
        }
    }

    pub fn new_connecting(connect_tx: oneshot::Sender<Result<(), FiberError>>) -> Self {
        let mut fiber = Self::new(FiberState::Connecting);
        fiber.connect_tx = Some(connect_tx);
        fiber
    }

    pub fn new_established() -> Self {
        Self::new(FiberState::Established)
    }

    /// Whether user writes are admissible in the current state.
    pub fn can_write(&self) -> bool {
        self.error.is_none()
            && !self.fin_pending
            && !self.fin_sent
            && matches!(
                self.state,
                FiberState::Established | FiberState::HalfClosedRemote
            )
    }

    /// Space left in the send window, counting queued and in-flight bytes.
    pub fn send_space(&self) -> usize {
        (self.send_window as usize).saturating_sub(self.in_flight as usize + self.queued_bytes)
    }

    /// Queue user bytes, split into frame-sized chunks. Caller checks the
    /// window via [`send_space`].
    pub fn queue_send(&mut self, data: &[u8]) {
        for chunk in data.chunks(MAX_PAYLOAD_SIZE) {
            self.send_queue.push_back(Bytes::copy_from_slice(chunk));
        }
        self.queued_bytes += data.len();
    }

    /// Take the next outbound chunk, moving its bytes into flight.
    pub fn next_send_chunk(&mut self) -> Option<Bytes> {
        if self.error.is_some() {
            return None;
        }
        let chunk = self.send_queue.pop_front()?;
        self.queued_bytes -= chunk.len();
        self.in_flight += chunk.len() as u32;
        Some(chunk)
    }

    /// Apply a credit grant from the peer.
    pub fn apply_credit(&mut self, granted: u32) {
        self.in_flight = self.in_flight.saturating_sub(granted);
        self.send_notify.notify_one();
    }

    /// Buffer received bytes. Returns true when the receive buffer crosses
    /// its high-water mark.
    pub fn push_recv(&mut self, data: Bytes) -> bool {
        self.recv_len += data.len();
        self.recv_chunks.push_back(data);
        self.recv_notify.notify_one();

        if !self.over_high && self.recv_len >= RECV_HIGH_WATER {
            self.over_high = true;
            return true;
        }
        false
    }

    /// Copy buffered bytes out, in order.
    pub fn read_into(&mut self, buf: &mut [u8]) -> usize {
        let mut total = 0;
        while total < buf.len() {
            let Some(front) = self.recv_chunks.front_mut() else {
                break;
            };
            let n = front.len().min(buf.len() - total);
            buf[total..total + n].copy_from_slice(&front[..n]);
            total += n;
            if n == front.len() {
                self.recv_chunks.pop_front();
            } else {
                *front = front.slice(n..);
            }
        }
        self.recv_len -= total;
        total
    }

    pub fn mark_fin_sent(&mut self) {
        self.fin_sent = true;
        self.state = match self.state {
            FiberState::Established => FiberState::HalfClosedLocal,
            FiberState::HalfClosedRemote => FiberState::Closed,
            other => other,
        };
    }

    pub fn mark_fin_received(&mut self) {
        self.fin_received = true;
        self.state = match self.state {
            FiberState::Established => FiberState::HalfClosedRemote,
            FiberState::HalfClosedLocal => FiberState::Closed,
            other => other,
        };
        self.recv_notify.notify_one();
    }

    /// Fail the fiber: drop buffered data, fail pending operations, wake
    /// every waiter.
    pub fn fail(&mut self, error: FiberError) {
        if self.error.is_none() {
            self.error = Some(error.clone());
        }
        self.send_queue.clear();
        self.queued_bytes = 0;
        self.recv_chunks.clear();
        self.recv_len = 0;
        if let Some(tx) = self.connect_tx.take() {
            let _ = tx.send(Err(error));
        }
        self.recv_notify.notify_one();
        self.send_notify.notify_one();
    }

    /// Fully closed or failed; nothing more will flow.
    pub fn finished(&self) -> bool {
        self.error.is_some() || self.state == FiberState::Closed
    }
}
