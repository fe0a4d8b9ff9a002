//! Buffered stream adapter
//!
//! TLS record boundaries do not match user read sizes, and interleaving many
//! small reads with writes across many fibers contends on the TLS state
//! machine. The adapter decouples the record pull from user reads: a single
//! pull task continuously reads record-sized chunks into a bounded internal
//! buffer and user reads are served from it. Writes bypass the buffer and go
//! straight to the write half; the split halves serialize access to the
//! underlying stream so it sees strictly ordered operations.
//!
//! The pull task is a small state machine: `Idle` until [`BufferedStream::
//! start_pulling`], then `Pulling`; it transitions to `Paused` when the
//! buffer reaches the high-water mark and resumes once a user read drains it
//! below the low-water mark; any read failure moves it to `Errored` and the
//! saved error fails every subsequent read. Exactly one pull operation is
//! outstanding at any time, so the buffer never overshoots the high-water
//! mark by more than one record.

use super::BoxedStream;
use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Pull read size, roughly one TLS record plus framing
pub const RECORD_SIZE: usize = 50 * 1024;

/// Buffer size above which pulling pauses
pub const HIGH_WATER: usize = 16 * 1024 * 1024;

/// Buffer size below which pulling resumes
pub const LOW_WATER: usize = 1024 * 1024;

/// Pull task states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullState {
    Idle,
    Pulling,
    Paused,
    Errored,
}

struct BufferState {
    chunks: VecDeque<Bytes>,
    len: usize,
    pull: PullState,
    error: Option<(io::ErrorKind, String)>,
    eof: bool,
    cancelled: bool,
    read_waker: Option<Waker>,
    record_size: usize,
    high_water: usize,
    low_water: usize,
}

impl BufferState {
    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }
}

struct Shared {
    state: Mutex<BufferState>,
    resume: Notify,
}

/// Read side of the adapter, served from the internal buffer
pub struct BufferedReader {
    shared: Arc<Shared>,
    read_half: Option<ReadHalf<BoxedStream>>,
    task: Option<JoinHandle<()>>,
}

/// Write side of the adapter, a pass-through to the underlying stream
pub struct BufferedWriter {
    inner: WriteHalf<BoxedStream>,
}

/// Buffered adapter over a composed link stream
pub struct BufferedStream {
    reader: BufferedReader,
    writer: BufferedWriter,
}

impl BufferedStream {
    /// Wrap a link stream with the default record size and water marks.
    pub fn new(stream: BoxedStream) -> Self {
        Self::with_watermarks(stream, RECORD_SIZE, HIGH_WATER, LOW_WATER)
    }

    /// Wrap a link stream with explicit tuning, for tests and diagnostics.
    pub fn with_watermarks(
        stream: BoxedStream,
        record_size: usize,
        high_water: usize,
        low_water: usize,
    ) -> Self {
        assert!(record_size > 0 && low_water < high_water);

        let (read_half, write_half) = tokio::io::split(stream);
        let shared = Arc::new(Shared {
            state: Mutex::new(BufferState {
                chunks: VecDeque::new(),
                len: 0,
                pull: PullState::Idle,
                error: None,
                eof: false,
                cancelled: false,
                read_waker: None,
                record_size,
                high_water,
                low_water,
            }),
            resume: Notify::new(),
        });

        Self {
            reader: BufferedReader {
                shared,
                read_half: Some(read_half),
                task: None,
            },
            writer: BufferedWriter { inner: write_half },
        }
    }

    /// Start the pull task. Idempotent.
    pub fn start_pulling(&mut self) {
        self.reader.start_pulling();
    }

    /// Split into independent read and write halves.
    pub fn split(self) -> (BufferedReader, BufferedWriter) {
        (self.reader, self.writer)
    }

    /// Clear the buffer, fail pending reads and stop pulling.
    pub fn cancel(&mut self) {
        self.reader.cancel();
    }
}

impl BufferedReader {
    /// Start the pull task. Idempotent.
    pub fn start_pulling(&mut self) {
        if let Some(read_half) = self.read_half.take() {
            {
                let mut state = self.shared.state.lock().unwrap();
                state.pull = PullState::Pulling;
            }
            let shared = Arc::clone(&self.shared);
            self.task = Some(tokio::spawn(pull_loop(shared, read_half)));
        }
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().unwrap().len
    }

    /// Current pull state.
    pub fn pull_state(&self) -> PullState {
        self.shared.state.lock().unwrap().pull
    }

    /// Clear the buffer, fail pending reads with an aborted error and stop
    /// the pull task.
    pub fn cancel(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.cancelled = true;
            state.chunks.clear();
            state.len = 0;
            state.pull = PullState::Errored;
            state.error = Some((io::ErrorKind::Interrupted, "operation aborted".to_string()));
            state.wake_reader();
        }
        self.shared.resume.notify_one();
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

impl Drop for BufferedReader {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

async fn pull_loop(shared: Arc<Shared>, mut read_half: ReadHalf<BoxedStream>) {
    let record_size = shared.state.lock().unwrap().record_size;
    let mut buf = vec![0u8; record_size];

    loop {
        // Gate on the high-water mark before issuing the next read.
        loop {
            let resumed = shared.resume.notified();
            {
                let mut state = shared.state.lock().unwrap();
                if state.cancelled {
                    return;
                }
                if state.len < state.high_water {
                    state.pull = PullState::Pulling;
                    break;
                }
                state.pull = PullState::Paused;
            }
            resumed.await;
        }

        match read_half.read(&mut buf).await {
            Ok(0) => {
                let mut state = shared.state.lock().unwrap();
                state.eof = true;
                state.pull = PullState::Errored;
                state.wake_reader();
                return;
            }
            Ok(n) => {
                let mut state = shared.state.lock().unwrap();
                if state.cancelled {
                    return;
                }
                state.chunks.push_back(Bytes::copy_from_slice(&buf[..n]));
                state.len += n;
                state.wake_reader();
            }
            Err(e) => {
                let mut state = shared.state.lock().unwrap();
                state.error = Some((e.kind(), e.to_string()));
                state.pull = PullState::Errored;
                state.wake_reader();
                return;
            }
        }
    }
}

impl AsyncRead for BufferedReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut state = this.shared.state.lock().unwrap();

        if let Some((kind, message)) = &state.error {
            return Poll::Ready(Err(io::Error::new(*kind, message.clone())));
        }

        if state.len > 0 {
            while buf.remaining() > 0 {
                let (n, pop) = {
                    let Some(front) = state.chunks.front_mut() else {
                        break;
                    };
                    let n = front.len().min(buf.remaining());
                    buf.put_slice(&front[..n]);
                    let pop = n == front.len();
                    if !pop {
                        *front = front.slice(n..);
                    }
                    (n, pop)
                };
                state.len -= n;
                if pop {
                    state.chunks.pop_front();
                }
            }
            if state.pull == PullState::Paused && state.len < state.low_water {
                this.shared.resume.notify_one();
            }
            return Poll::Ready(Ok(()));
        }

        if state.eof {
            return Poll::Ready(Ok(()));
        }

        state.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for BufferedWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl AsyncRead for BufferedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for BufferedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}
