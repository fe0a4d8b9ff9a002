//! The fiber demultiplexer
//!
//! Owns the single underlying transport stream and runs exactly one reader
//! task and one writer task over it. Fibers are kept in an arena keyed by
//! (local-port, remote-port); user handles capture the demux handle and the
//! key and look the fiber up through the demux, never the fiber itself.

use super::frame::{flags, Frame, FrameHeader, CREDIT_PAYLOAD_SIZE, FRAME_HEADER_SIZE};
use super::stream::{Fiber, FiberState};
use super::{FiberError, ADMIN_PORT, DEFAULT_WINDOW_SIZE, EPHEMERAL_BASE, RECV_LOW_WATER};
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// (local_port, remote_port)
pub(crate) type FiberKey = (u32, u32);

/// Upper bound on remembered closed fiber keys before pruning
const RECENTLY_CLOSED_LIMIT: usize = 1024;

struct DemuxState {
    fibers: BTreeMap<FiberKey, Fiber>,
    /// Acceptors carry a generation id so a stale listener drop cannot
    /// unregister a successor on the same port.
    acceptors: HashMap<u32, (u64, mpsc::UnboundedSender<FiberKey>)>,
    control: VecDeque<Frame>,
    next_acceptor_id: u64,
    next_ephemeral: u32,
    /// Keys closed recently enough that in-flight peer frames are expected
    recently_closed: HashSet<FiberKey>,
    /// Fibers currently above their receive high-water mark
    over_high_count: usize,
    /// Terminal error handed to operations once fibers are gone
    terminal_error: Option<FiberError>,
    shut: bool,
    admin_taken: bool,
    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
}

struct DemuxInner {
    state: Mutex<DemuxState>,
    writer_notify: Notify,
    reader_resume: Notify,
    status_tx: watch::Sender<Option<FiberError>>,
    status_rx: watch::Receiver<Option<FiberError>>,
}

/// Handle to a fiber demultiplexer. Cheap to clone.
#[derive(Clone)]
pub struct Demux {
    inner: Arc<DemuxInner>,
}

impl Demux {
    /// Start a demux over the two halves of an established transport
    /// stream. The admin fiber (port 0 on both ends) exists immediately.
    pub fn start<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (status_tx, status_rx) = watch::channel(None);

        let mut fibers = BTreeMap::new();
        fibers.insert((ADMIN_PORT, ADMIN_PORT), Fiber::new_established());

        let inner = Arc::new(DemuxInner {
            state: Mutex::new(DemuxState {
                fibers,
                acceptors: HashMap::new(),
                control: VecDeque::new(),
                next_acceptor_id: 1,
                next_ephemeral: EPHEMERAL_BASE,
                recently_closed: HashSet::new(),
                over_high_count: 0,
                terminal_error: None,
                shut: false,
                admin_taken: false,
                reader_task: None,
                writer_task: None,
            }),
            writer_notify: Notify::new(),
            reader_resume: Notify::new(),
            status_tx,
            status_rx,
        });

        let demux = Self { inner };

        let reader_task = tokio::spawn(reader_loop(demux.clone(), reader));
        let writer_task = tokio::spawn(writer_loop(demux.clone(), writer));
        {
            let mut state = demux.inner.state.lock().unwrap();
            state.reader_task = Some(reader_task);
            state.writer_task = Some(writer_task);
        }

        demux
    }

    /// Take the admin fiber. Returns `None` after the first call.
    pub fn admin_fiber(&self) -> Option<FiberStream> {
        let mut state = self.inner.state.lock().unwrap();
        if state.admin_taken || state.shut {
            return None;
        }
        state.admin_taken = true;
        drop(state);
        Some(FiberStream::attach(self.clone(), (ADMIN_PORT, ADMIN_PORT)))
    }

    /// Open a fiber to `remote_port` on the peer. Completes once the peer
    /// accepted (SYN|ACK) or refused (RST) the request.
    pub async fn connect(&self, remote_port: u32) -> Result<FiberStream, FiberError> {
        let (tx, rx) = oneshot::channel();

        let key = {
            let mut guard = self.inner.state.lock().unwrap();
            let state = &mut *guard;
            if state.shut {
                return Err(state.terminal_error.clone().unwrap_or(FiberError::Closed));
            }
            let local_port = alloc_ephemeral(state)?;
            let key = (local_port, remote_port);
            state.fibers.insert(key, Fiber::new_connecting(tx));
            state.control.push_back(Frame::syn(remote_port, local_port));
            key
        };
        self.inner.writer_notify.notify_one();

        match rx.await {
            Ok(Ok(())) => Ok(FiberStream::attach(self.clone(), key)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(FiberError::Aborted),
        }
    }

    /// Register an acceptor for `local_port`.
    pub fn listen(&self, local_port: u32) -> Result<FiberListener, FiberError> {
        if local_port == ADMIN_PORT {
            return Err(FiberError::PortInUse(ADMIN_PORT));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.inner.state.lock().unwrap();
            if state.shut {
                return Err(state.terminal_error.clone().unwrap_or(FiberError::Closed));
            }
            if state.acceptors.contains_key(&local_port) {
                return Err(FiberError::PortInUse(local_port));
            }
            let id = state.next_acceptor_id;
            state.next_acceptor_id += 1;
            state.acceptors.insert(local_port, (id, tx));
            id
        };

        Ok(FiberListener {
            demux: self.clone(),
            port: local_port,
            id,
            rx,
        })
    }

    /// Synchronously unregister the acceptor on `local_port`. Its listener's
    /// pending `accept` completes with an error. Returns whether an acceptor
    /// was present.
    pub fn unlisten(&self, local_port: u32) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        state.acceptors.remove(&local_port).is_some()
    }

    /// Close the demux; every fiber and pending operation completes with
    /// `Aborted`.
    pub fn close(&self) {
        self.shutdown(FiberError::Aborted, FiberError::Aborted);
    }

    /// Close the demux recording `reason` as the terminal status.
    pub fn close_with(&self, reason: FiberError) {
        self.shutdown(FiberError::Aborted, reason);
    }

    /// Wait until the demux terminates, returning the reason.
    pub async fn closed(&self) -> FiberError {
        let mut rx = self.inner.status_rx.clone();
        loop {
            if let Some(reason) = rx.borrow().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return FiberError::Closed;
            }
        }
    }

    /// Whether the demux has terminated.
    pub fn is_closed(&self) -> bool {
        self.inner.status_rx.borrow().is_some()
    }

    fn shutdown(&self, fiber_error: FiberError, reason: FiberError) {
        let (reader_task, writer_task) = {
            let mut guard = self.inner.state.lock().unwrap();
            let state = &mut *guard;
            if state.shut {
                return;
            }
            state.shut = true;
            state.terminal_error = Some(fiber_error.clone());

            for fiber in state.fibers.values_mut() {
                fiber.fail(fiber_error.clone());
            }
            state.fibers.clear();
            state.acceptors.clear();
            state.control.clear();
            state.over_high_count = 0;

            (state.reader_task.take(), state.writer_task.take())
        };

        let _ = self.inner.status_tx.send(Some(reason));
        self.inner.writer_notify.notify_one();
        self.inner.reader_resume.notify_one();

        if let Some(task) = reader_task {
            task.abort();
        }
        if let Some(task) = writer_task {
            task.abort();
        }
    }

    fn fault(&self, message: String) {
        warn!(target: "network_crypto", "demux faulted: {}", message);
        self.shutdown(FiberError::Reset, FiberError::Faulted(message));
    }
}

fn alloc_ephemeral(state: &mut DemuxState) -> Result<u32, FiberError> {
    for _ in 0..1_000_000 {
        let candidate = state.next_ephemeral;
        state.next_ephemeral = match state.next_ephemeral.checked_add(1) {
            Some(next) => next,
            None => EPHEMERAL_BASE,
        };

        let in_use = state
            .fibers
            .range((candidate, 0)..=(candidate, u32::MAX))
            .next()
            .is_some();
        if !in_use {
            return Ok(candidate);
        }
    }
    Err(FiberError::PortInUse(state.next_ephemeral))
}

/// Remove a detached fiber once nothing more will flow on it.
fn maybe_reap(state: &mut DemuxState, key: FiberKey) {
    let Some(fiber) = state.fibers.get(&key) else {
        return;
    };
    if fiber.detached && fiber.finished() {
        remove_fiber(state, key);
    }
}

fn remove_fiber(state: &mut DemuxState, key: FiberKey) {
    if let Some(fiber) = state.fibers.remove(&key) {
        if fiber.over_high {
            state.over_high_count -= 1;
        }
        state.recently_closed.insert(key);
        if state.recently_closed.len() > RECENTLY_CLOSED_LIMIT {
            state.recently_closed.clear();
        }
    }
}

async fn reader_loop<R>(demux: Demux, mut reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let inner = Arc::clone(&demux.inner);
    let mut header_buf = [0u8; FRAME_HEADER_SIZE];

    loop {
        // Receive-side backpressure gate: while any fiber is above its
        // high-water mark, stop pulling frames so the pressure propagates to
        // the transport.
        loop {
            let resumed = inner.reader_resume.notified();
            {
                let state = inner.state.lock().unwrap();
                if state.shut {
                    return;
                }
                if state.over_high_count == 0 {
                    break;
                }
            }
            resumed.await;
        }

        if let Err(e) = reader.read_exact(&mut header_buf).await {
            debug!(target: "network_crypto", "transport read ended: {}", e);
            demux.shutdown(FiberError::Reset, FiberError::Reset);
            return;
        }

        let header = match FrameHeader::parse(&header_buf) {
            Ok(header) => header,
            Err(e) => {
                demux.fault(e.to_string());
                return;
            }
        };

        let payload = if header.length > 0 {
            let mut payload = vec![0u8; header.length as usize];
            if let Err(e) = reader.read_exact(&mut payload).await {
                debug!(target: "network_crypto", "transport read ended: {}", e);
                demux.shutdown(FiberError::Reset, FiberError::Reset);
                return;
            }
            Bytes::from(payload)
        } else {
            Bytes::new()
        };

        if let Err(message) = dispatch(&demux, header, payload) {
            demux.fault(message);
            return;
        }
    }
}

/// Handle one inbound frame. `Err` is a protocol violation that faults the
/// whole demux.
fn dispatch(demux: &Demux, header: FrameHeader, payload: Bytes) -> Result<(), String> {
    let inner = &demux.inner;
    let key: FiberKey = (header.dest_port, header.src_port);
    let mut wake_writer = false;

    let mut guard = inner.state.lock().unwrap();
    let state = &mut *guard;
    if state.shut {
        return Ok(());
    }

    match header.flags {
        f if f == flags::SYN => {
            let reply_dest = header.src_port;
            let reply_src = header.dest_port;

            if state.fibers.contains_key(&key) {
                // Collides with a live fiber; refuse.
                state.control.push_back(Frame::rst(reply_dest, reply_src));
            } else {
                match state
                    .acceptors
                    .get(&header.dest_port)
                    .map(|(_, tx)| tx.clone())
                {
                    Some(acceptor) => {
                        state.fibers.insert(key, Fiber::new_established());
                        if acceptor.send(key).is_ok() {
                            state
                                .control
                                .push_back(Frame::syn_ack(reply_dest, reply_src));
                            trace!(target: "network_crypto", "fiber {}:{} accepted", key.0, key.1);
                        } else {
                            // Listener dropped between lookup and delivery.
                            state.fibers.remove(&key);
                            state.control.push_back(Frame::rst(reply_dest, reply_src));
                        }
                    }
                    None => {
                        trace!(target: "network_crypto", "SYN for port {} refused", header.dest_port);
                        state.control.push_back(Frame::rst(reply_dest, reply_src));
                    }
                }
            }
            wake_writer = true;
        }

        f if f == flags::SYN | flags::ACK => match state.fibers.get_mut(&key) {
            Some(fiber) if fiber.state == FiberState::Connecting => {
                fiber.state = FiberState::Established;
                if let Some(tx) = fiber.connect_tx.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Some(_) => {}
            None => {
                if !state.recently_closed.contains(&key) {
                    return Err(format!("SYN|ACK for unknown fiber {}:{}", key.0, key.1));
                }
            }
        },

        f if f == flags::ACK => {
            if payload.len() != CREDIT_PAYLOAD_SIZE {
                return Err(format!("credit frame with {} payload bytes", payload.len()));
            }
            let granted = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
            if let Some(fiber) = state.fibers.get_mut(&key) {
                fiber.apply_credit(granted);
            }
        }

        f if f == flags::FIN => {
            if let Some(fiber) = state.fibers.get_mut(&key) {
                fiber.mark_fin_received();
                maybe_reap(state, key);
            }
        }

        f if f == flags::RST => {
            if let Some(fiber) = state.fibers.get_mut(&key) {
                if fiber.state == FiberState::Connecting {
                    fiber.fail(FiberError::Refused);
                    remove_fiber(state, key);
                } else {
                    fiber.fail(FiberError::Reset);
                    maybe_reap(state, key);
                }
            }
        }

        f if f == flags::DATA => {
            match state.fibers.get_mut(&key) {
                Some(fiber) if fiber.error.is_none() => {
                    if !payload.is_empty() && fiber.push_recv(payload) {
                        state.over_high_count += 1;
                    }
                }
                Some(_) => {} // errored fiber, drop in-flight data
                None => {
                    if !state.recently_closed.contains(&key) {
                        return Err(format!("DATA for nonexistent fiber {}:{}", key.0, key.1));
                    }
                }
            }
        }

        _ => unreachable!("header flags validated on parse"),
    }

    drop(guard);
    if wake_writer {
        inner.writer_notify.notify_one();
    }
    Ok(())
}

async fn writer_loop<W>(demux: Demux, mut writer: W)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let inner = Arc::clone(&demux.inner);
    let mut status_rx = inner.status_rx.clone();
    let mut wire = BytesMut::new();

    loop {
        let batch = collect_batch(&inner);

        if batch.is_empty() {
            if status_rx.borrow().is_some() {
                return;
            }
            tokio::select! {
                _ = inner.writer_notify.notified() => {}
                _ = status_rx.changed() => {}
            }
            continue;
        }

        wire.clear();
        for frame in &batch {
            frame.encode_into(&mut wire);
        }

        if let Err(e) = writer.write_all(&wire).await {
            debug!(target: "network_crypto", "transport write failed: {}", e);
            demux.shutdown(FiberError::Reset, FiberError::Reset);
            return;
        }
        let _ = writer.flush().await;
    }
}

/// Drain the control queue (global FIFO order), then take at most one DATA
/// frame per fiber in port order so no fiber starves the others. A pending
/// FIN is emitted only once the fiber's queue is empty, after its last DATA.
fn collect_batch(inner: &Arc<DemuxInner>) -> Vec<Frame> {
    let mut guard = inner.state.lock().unwrap();
    let state = &mut *guard;

    let mut frames: Vec<Frame> = state.control.drain(..).collect();

    let mut emitted_fin: Vec<FiberKey> = Vec::new();
    for (&(local, remote), fiber) in state.fibers.iter_mut() {
        if let Some(chunk) = fiber.next_send_chunk() {
            frames.push(Frame::data(remote, local, chunk));
        } else if fiber.fin_pending && !fiber.fin_sent && fiber.error.is_none() {
            fiber.mark_fin_sent();
            frames.push(Frame::fin(remote, local));
            emitted_fin.push((local, remote));
        }
    }
    for key in emitted_fin {
        maybe_reap(state, key);
    }

    frames
}

/// Shared drop guard: the last handle half releases the fiber.
struct FiberGuard {
    demux: Demux,
    key: FiberKey,
}

impl Drop for FiberGuard {
    fn drop(&mut self) {
        let mut guard = self.demux.inner.state.lock().unwrap();
        let state = &mut *guard;
        let Some(fiber) = state.fibers.get_mut(&self.key) else {
            return;
        };

        if fiber.finished() {
            remove_fiber(state, self.key);
        } else if fiber.fin_pending || fiber.fin_sent {
            // Graceful close in progress; reap once the peer's FIN arrives.
            fiber.detached = true;
        } else {
            // Dropped without shutdown: abortive close.
            let (local, remote) = self.key;
            state.control.push_back(Frame::rst(remote, local));
            state.fibers.get_mut(&self.key).unwrap().fail(FiberError::Aborted);
            remove_fiber(state, self.key);
            drop(guard);
            self.demux.inner.writer_notify.notify_one();
        }
    }
}

/// A logical bidirectional byte stream multiplexed over the transport.
pub struct FiberStream {
    demux: Demux,
    key: FiberKey,
    guard: Arc<FiberGuard>,
}

impl std::fmt::Debug for FiberStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberStream")
            .field("local_port", &self.key.0)
            .field("remote_port", &self.key.1)
            .finish()
    }
}

impl FiberStream {
    fn attach(demux: Demux, key: FiberKey) -> Self {
        let guard = Arc::new(FiberGuard {
            demux: demux.clone(),
            key,
        });
        Self { demux, key, guard }
    }

    pub fn local_port(&self) -> u32 {
        self.key.0
    }

    pub fn remote_port(&self) -> u32 {
        self.key.1
    }

    /// Split into independently owned read and write halves.
    pub fn split(self) -> (FiberReadHalf, FiberWriteHalf) {
        let read = FiberReadHalf {
            demux: self.demux.clone(),
            key: self.key,
            guard: Arc::clone(&self.guard),
        };
        let write = FiberWriteHalf {
            demux: self.demux,
            key: self.key,
            guard: self.guard,
        };
        (read, write)
    }

    /// Read buffered bytes, waiting for data. `Ok(0)` signals end of stream
    /// after the peer's FIN has been drained.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, FiberError> {
        read_fiber(&self.demux, self.key, buf).await
    }

    /// Write all of `data`, blocking on the flow control window.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), FiberError> {
        write_fiber(&self.demux, self.key, data).await
    }

    /// Signal end-of-write. The FIN goes out after any queued data.
    pub fn shutdown(&mut self) -> Result<(), FiberError> {
        shutdown_fiber(&self.demux, self.key)
    }

    /// Abortive close: drop queued data and reset the peer.
    pub fn reset(&mut self) {
        reset_fiber(&self.demux, self.key);
    }
}

/// Read half of a split fiber
pub struct FiberReadHalf {
    demux: Demux,
    key: FiberKey,
    #[allow(dead_code)] // holds the fiber alive until both halves drop
    guard: Arc<FiberGuard>,
}

impl FiberReadHalf {
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, FiberError> {
        read_fiber(&self.demux, self.key, buf).await
    }
}

/// Write half of a split fiber
pub struct FiberWriteHalf {
    demux: Demux,
    key: FiberKey,
    #[allow(dead_code)]
    guard: Arc<FiberGuard>,
}

impl FiberWriteHalf {
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), FiberError> {
        write_fiber(&self.demux, self.key, data).await
    }

    pub fn shutdown(&mut self) -> Result<(), FiberError> {
        shutdown_fiber(&self.demux, self.key)
    }
}

async fn read_fiber(demux: &Demux, key: FiberKey, buf: &mut [u8]) -> Result<usize, FiberError> {
    if buf.is_empty() {
        return Ok(0);
    }

    loop {
        let notify = {
            let mut guard = demux.inner.state.lock().unwrap();
            let state = &mut *guard;
            let Some(fiber) = state.fibers.get_mut(&key) else {
                return Err(state.terminal_error.clone().unwrap_or(FiberError::Closed));
            };

            if let Some(error) = &fiber.error {
                return Err(error.clone());
            }

            if fiber.recv_len > 0 {
                let n = fiber.read_into(buf);

                // Consuming grants the peer credit to send more. Grants are
                // batched to one frame per half window, but a fully drained
                // buffer flushes them immediately so low-traffic fibers do
                // not strand the peer's window.
                fiber.pending_credit += n as u32;
                let mut wake_writer = false;
                if fiber.pending_credit >= DEFAULT_WINDOW_SIZE / 2
                    || (fiber.recv_len == 0 && fiber.pending_credit > 0)
                {
                    let granted = fiber.pending_credit;
                    fiber.pending_credit = 0;
                    state.control.push_back(Frame::credit(key.1, key.0, granted));
                    wake_writer = true;
                }

                let mut resume_reader = false;
                if fiber.over_high && fiber.recv_len < RECV_LOW_WATER {
                    fiber.over_high = false;
                    state.over_high_count -= 1;
                    resume_reader = state.over_high_count == 0;
                }

                drop(guard);
                if wake_writer {
                    demux.inner.writer_notify.notify_one();
                }
                if resume_reader {
                    demux.inner.reader_resume.notify_one();
                }
                return Ok(n);
            }

            if fiber.fin_received {
                return Ok(0);
            }

            Arc::clone(&fiber.recv_notify)
        };

        notify.notified().await;
    }
}

async fn write_fiber(demux: &Demux, key: FiberKey, data: &[u8]) -> Result<(), FiberError> {
    let mut offset = 0;

    while offset < data.len() {
        let notify = {
            let mut guard = demux.inner.state.lock().unwrap();
            let state = &mut *guard;
            let Some(fiber) = state.fibers.get_mut(&key) else {
                return Err(state.terminal_error.clone().unwrap_or(FiberError::Closed));
            };

            if let Some(error) = &fiber.error {
                return Err(error.clone());
            }
            if !fiber.can_write() {
                return Err(FiberError::Closed);
            }

            let space = fiber.send_space();
            if space > 0 {
                let end = data.len().min(offset + space);
                fiber.queue_send(&data[offset..end]);
                offset = end;
                drop(guard);
                demux.inner.writer_notify.notify_one();
                continue;
            }

            Arc::clone(&fiber.send_notify)
        };

        notify.notified().await;
    }

    Ok(())
}

fn shutdown_fiber(demux: &Demux, key: FiberKey) -> Result<(), FiberError> {
    let mut guard = demux.inner.state.lock().unwrap();
    let state = &mut *guard;
    let Some(fiber) = state.fibers.get_mut(&key) else {
        return Err(state.terminal_error.clone().unwrap_or(FiberError::Closed));
    };
    if let Some(error) = &fiber.error {
        return Err(error.clone());
    }
    fiber.fin_pending = true;
    drop(guard);
    demux.inner.writer_notify.notify_one();
    Ok(())
}

fn reset_fiber(demux: &Demux, key: FiberKey) {
    let mut guard = demux.inner.state.lock().unwrap();
    let state = &mut *guard;
    if let Some(fiber) = state.fibers.get_mut(&key) {
        if fiber.error.is_none() {
            let (local, remote) = key;
            state.control.push_back(Frame::rst(remote, local));
            state.fibers.get_mut(&key).unwrap().fail(FiberError::Aborted);
            drop(guard);
            demux.inner.writer_notify.notify_one();
        }
    }
}

/// An acceptor for inbound fibers on one local port
pub struct FiberListener {
    demux: Demux,
    port: u32,
    id: u64,
    rx: mpsc::UnboundedReceiver<FiberKey>,
}

impl std::fmt::Debug for FiberListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberListener")
            .field("port", &self.port)
            .finish()
    }
}

impl FiberListener {
    pub fn port(&self) -> u32 {
        self.port
    }

    /// Wait for the next established inbound fiber.
    pub async fn accept(&mut self) -> Result<FiberStream, FiberError> {
        match self.rx.recv().await {
            Some(key) => Ok(FiberStream::attach(self.demux.clone(), key)),
            None => {
                let state = self.demux.inner.state.lock().unwrap();
                Err(state.terminal_error.clone().unwrap_or(FiberError::Closed))
            }
        }
    }
}

impl Drop for FiberListener {
    fn drop(&mut self) {
        let mut guard = self.demux.inner.state.lock().unwrap();
        let state = &mut *guard;
        if state
            .acceptors
            .get(&self.port)
            .is_some_and(|(id, _)| *id == self.id)
        {
            state.acceptors.remove(&self.port);
        }

        // Reset fibers that were queued but never accepted.
        let mut wake_writer = false;
        while let Ok(key) = self.rx.try_recv() {
            if let Some(fiber) = state.fibers.get_mut(&key) {
                if fiber.error.is_none() {
                    let (local, remote) = key;
                    state.control.push_back(Frame::rst(remote, local));
                    state.fibers.get_mut(&key).unwrap().fail(FiberError::Aborted);
                    wake_writer = true;
                }
                remove_fiber(state, key);
            }
        }
        drop(guard);
        if wake_writer {
            self.demux.inner.writer_notify.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn demux_pair() -> (Demux, Demux) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (Demux::start(a_read, a_write), Demux::start(b_read, b_write))
    }

    #[tokio::test]
    async fn test_connect_refused_without_acceptor() {
        let (client, _server) = demux_pair();
        let err = client.connect(80).await.unwrap_err();
        assert_eq!(err, FiberError::Refused);
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let (client, server) = demux_pair();

        let mut listener = server.listen(80).unwrap();
        let echo = tokio::spawn(async move {
            let mut fiber = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            loop {
                let n = fiber.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                fiber.write_all(&buf[..n]).await.unwrap();
            }
            fiber.shutdown().unwrap();
            // Drain the peer FIN so the close completes cleanly.
            while fiber.read(&mut buf).await.unwrap_or(0) > 0 {}
        });

        let mut fiber = client.connect(80).await.unwrap();
        assert!(fiber.local_port() >= EPHEMERAL_BASE);
        assert_eq!(fiber.remote_port(), 80);

        fiber.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        let mut got = 0;
        while got < 5 {
            let n = fiber.read(&mut buf[got..]).await.unwrap();
            assert!(n > 0);
            got += n;
        }
        assert_eq!(&buf, b"hello");

        fiber.shutdown().unwrap();
        let n = fiber.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_fin_surfaces_eof_after_drain() {
        let (client, server) = demux_pair();
        let mut listener = server.listen(7).unwrap();

        let mut fiber = client.connect(7).await.unwrap();
        let mut accepted = listener.accept().await.unwrap();

        fiber.write_all(b"last words").await.unwrap();
        fiber.shutdown().unwrap();

        // All buffered data is surfaced before the EOF.
        let mut collected = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            let n = accepted.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, b"last words");
    }

    #[tokio::test]
    async fn test_distinct_ephemeral_ports() {
        let (client, server) = demux_pair();
        let mut listener = server.listen(9).unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok(fiber) = listener.accept().await {
                held.push(fiber);
            }
        });

        let f1 = client.connect(9).await.unwrap();
        let f2 = client.connect(9).await.unwrap();
        assert_ne!(f1.local_port(), f2.local_port());
    }

    #[tokio::test]
    async fn test_admin_fiber_exists_immediately() {
        let (client, server) = demux_pair();

        let mut client_admin = client.admin_fiber().unwrap();
        let mut server_admin = server.admin_fiber().unwrap();
        assert!(client.admin_fiber().is_none(), "admin fiber is taken once");

        client_admin.write_all(&[1u8]).await.unwrap();
        let mut buf = [0u8; 1];
        server_admin.read(&mut buf).await.unwrap();
        assert_eq!(buf[0], 1);

        server_admin.write_all(&[2u8]).await.unwrap();
        client_admin.read(&mut buf).await.unwrap();
        assert_eq!(buf[0], 2);
    }

    #[tokio::test]
    async fn test_malformed_frame_faults_demux() {
        let (raw, b) = tokio::io::duplex(64 * 1024);
        let (b_read, b_write) = tokio::io::split(b);
        let demux = Demux::start(b_read, b_write);

        let mut admin = demux.admin_fiber().unwrap();

        // Unknown flag combination in the header.
        let (_raw_read, mut raw_write) = tokio::io::split(raw);
        let mut bad = [0u8; FRAME_HEADER_SIZE];
        bad[8] = 0b0110_0000;
        raw_write.write_all(&bad).await.unwrap();

        let reason = demux.closed().await;
        assert!(matches!(reason, FiberError::Faulted(_)));

        // Every fiber observes the reset.
        let mut buf = [0u8; 4];
        let err = admin.read(&mut buf).await.unwrap_err();
        assert_eq!(err, FiberError::Reset);
    }

    #[tokio::test]
    async fn test_data_to_nonexistent_fiber_faults() {
        let (raw, b) = tokio::io::duplex(64 * 1024);
        let (b_read, b_write) = tokio::io::split(b);
        let demux = Demux::start(b_read, b_write);

        let (_raw_read, mut raw_write) = tokio::io::split(raw);
        let frame = Frame::data(12345, 5, Bytes::from_static(b"stray"));
        raw_write.write_all(&frame.encode()).await.unwrap();

        let reason = demux.closed().await;
        assert!(matches!(reason, FiberError::Faulted(_)));
    }

    #[tokio::test]
    async fn test_zero_length_data_is_noop() {
        let (raw, b) = tokio::io::duplex(64 * 1024);
        let (b_read, b_write) = tokio::io::split(b);
        let demux = Demux::start(b_read, b_write);

        let (_raw_read, mut raw_write) = tokio::io::split(raw);
        // Empty DATA to the admin fiber: valid no-op.
        let frame = Frame::data(0, 0, Bytes::new());
        raw_write.write_all(&frame.encode()).await.unwrap();
        let frame = Frame::data(0, 0, Bytes::from_static(b"real"));
        raw_write.write_all(&frame.encode()).await.unwrap();

        let mut admin = demux.admin_fiber().unwrap();
        let mut buf = [0u8; 4];
        let n = admin.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"real");
        assert!(!demux.is_closed());
    }

    #[tokio::test]
    async fn test_transport_eof_resets_fibers() {
        let (raw, b) = tokio::io::duplex(64 * 1024);
        let (b_read, b_write) = tokio::io::split(b);
        let demux = Demux::start(b_read, b_write);
        let mut admin = demux.admin_fiber().unwrap();

        // The transport peer goes away.
        drop(raw);

        let reason = demux.closed().await;
        assert_eq!(reason, FiberError::Reset);

        let mut buf = [0u8; 1];
        let err = admin.read(&mut buf).await.unwrap_err();
        assert_eq!(err, FiberError::Reset);
    }

    #[tokio::test]
    async fn test_window_blocks_and_credit_resumes() {
        let (client, server) = demux_pair();
        let mut listener = server.listen(80).unwrap();

        let total = 3 * DEFAULT_WINDOW_SIZE as usize;
        let reader = tokio::spawn(async move {
            let mut fiber = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64 * 1024];
            let mut seen = 0usize;
            let mut next = 0u8;
            while seen < total {
                let n = fiber.read(&mut buf).await.unwrap();
                assert!(n > 0);
                for &b in &buf[..n] {
                    assert_eq!(b, next, "byte order violated at offset {}", seen);
                    next = next.wrapping_add(1);
                }
                seen += n;
            }
            seen
        });

        let mut fiber = client.connect(80).await.unwrap();
        let mut data = vec![0u8; total];
        let mut next = 0u8;
        for b in data.iter_mut() {
            *b = next;
            next = next.wrapping_add(1);
        }
        // Needs three windows of credit to complete.
        fiber.write_all(&data).await.unwrap();

        assert_eq!(reader.await.unwrap(), total);
    }

    #[tokio::test]
    async fn test_blocked_fiber_does_not_starve_others() {
        let (client, server) = demux_pair();
        let mut slow_listener = server.listen(80).unwrap();
        let mut fast_listener = server.listen(81).unwrap();

        // Fill the slow fiber's window; its receiver never reads.
        let mut slow = client.connect(80).await.unwrap();
        let _slow_peer = slow_listener.accept().await.unwrap();
        slow.write_all(&vec![0u8; DEFAULT_WINDOW_SIZE as usize])
            .await
            .unwrap();

        // The fast fiber still makes progress.
        let echo = tokio::spawn(async move {
            let mut fiber = fast_listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = fiber.read(&mut buf).await.unwrap();
            fiber.write_all(&buf[..n]).await.unwrap();
            fiber
        });

        let mut fast = client.connect(81).await.unwrap();
        fast.write_all(b"still alive").await.unwrap();
        let mut buf = [0u8; 16];
        let n = fast.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"still alive");
        let _ = echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_propagates() {
        let (client, server) = demux_pair();
        let mut listener = server.listen(80).unwrap();

        let mut fiber = client.connect(80).await.unwrap();
        let mut accepted = listener.accept().await.unwrap();

        fiber.reset();

        let mut buf = [0u8; 4];
        let err = accepted.read(&mut buf).await.unwrap_err();
        assert_eq!(err, FiberError::Reset);
        let err = fiber.write_all(b"x").await.unwrap_err();
        assert_eq!(err, FiberError::Aborted);
    }

    #[tokio::test]
    async fn test_many_concurrent_fibers() {
        let (client, server) = demux_pair();
        let mut listener = server.listen(443).unwrap();

        tokio::spawn(async move {
            loop {
                let Ok(mut fiber) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
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
                    let _ = fiber.shutdown();
                });
            }
        });

        let mut tasks = Vec::new();
        for i in 0u32..50 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                let mut fiber = client.connect(443).await.unwrap();
                let payload = vec![(i % 251) as u8; 4096];
                fiber.write_all(&payload).await.unwrap();

                let mut got = Vec::with_capacity(payload.len());
                let mut buf = [0u8; 1024];
                while got.len() < payload.len() {
                    let n = fiber.read(&mut buf).await.unwrap();
                    assert!(n > 0);
                    got.extend_from_slice(&buf[..n]);
                }
                assert_eq!(got, payload);
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_listener_port_collision() {
        let (client, _server) = demux_pair();
        let _first = client.listen(9000).unwrap();
        let err = client.listen(9000).unwrap_err();
        assert_eq!(err, FiberError::PortInUse(9000));
        assert!(client.listen(0).is_err(), "admin port is reserved");
    }

    #[tokio::test]
    async fn test_unlisten_releases_port_immediately() {
        let (client, _server) = demux_pair();

        let mut first = client.listen(9001).unwrap();
        assert!(client.unlisten(9001));
        assert!(first.accept().await.is_err());

        // The port is free again, and the stale listener's drop must not
        // unregister its successor.
        let second = client.listen(9001).unwrap();
        drop(first);
        assert!(client.unlisten(9001), "successor acceptor was lost");
        drop(second);
    }
}
