//! Per-connection reader/writer
//!
//! [`IrcClient`] owns one socket. A writer task drains a bounded queue
//! through the flood throttle; a reader task frames inbound lines and
//! keeps the connection alive with PINGs. Both observe a shared shutdown
//! signal so `close` can drain, terminate and release the socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, warn};

use crate::{Error, Result};

/// Outbound lines are capped to this, terminator included.
const MAX_LINE_OUT: usize = 512;
/// Inbound lines are tolerated up to this before being discarded.
const MAX_LINE_IN: usize = 8192;
/// Depth of the outbound queue; writers block when it is full.
const WRITE_QUEUE: usize = 64;
/// Bound on draining queued writes during close.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Any bidirectional byte stream a connection can run over.
pub trait ConnStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ConnStream for T {}

/// Leaky-bucket write throttle measured in seconds owed.
#[derive(Debug, Clone)]
pub(crate) struct FloodControl {
    len_penalty: u64,
    timeout: f64,
    step: f64,
    penalty: f64,
    last: Option<Instant>,
}

impl FloodControl {
    pub(crate) fn new(len_penalty: u64, timeout: Duration, step: Duration) -> Self {
        Self {
            len_penalty: len_penalty.max(1),
            timeout: timeout.as_secs_f64(),
            step: step.as_secs_f64().max(f64::EPSILON),
            penalty: 0.0,
            last: None,
        }
    }

    /// Charge one outbound line of `len` bytes and return how long the
    /// writer must sleep before sending it. The penalty decays by `step`
    /// seconds per wall-clock second; a sleep is owed once it exceeds
    /// `timeout`.
    pub(crate) fn charge(&mut self, len: usize, now: Instant) -> Duration {
        if let Some(last) = self.last {
            let decay = now.saturating_duration_since(last).as_secs_f64() * self.step;
            self.penalty = (self.penalty - decay).max(0.0);
        }
        self.last = Some(now);

        self.penalty += (len as u64 / self.len_penalty).max(1) as f64;

        if self.penalty > self.timeout {
            Duration::from_secs_f64((self.penalty - self.timeout) / self.step)
        } else {
            Duration::ZERO
        }
    }

    #[cfg(test)]
    fn penalty_at(&self, now: Instant) -> f64 {
        let decay = self
            .last
            .map(|last| now.saturating_duration_since(last).as_secs_f64() * self.step)
            .unwrap_or(0.0);
        (self.penalty - decay).max(0.0)
    }
}

fn sanitize_line(buf: &mut Vec<u8>) {
    while matches!(buf.last(), Some(b'\r') | Some(b'\n')) {
        buf.pop();
    }
    if buf.len() > MAX_LINE_OUT - 2 {
        buf.truncate(MAX_LINE_OUT - 2);
    }
    buf.extend_from_slice(b"\r\n");
}

/// One live connection's IO workers and queues.
pub struct IrcClient {
    server_name: String,
    flood: FloodControl,
    keep_alive: Duration,

    write_tx: mpsc::Sender<Vec<u8>>,
    write_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    read_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    read_rx: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
    stream: Mutex<Option<Box<dyn ConnStream>>>,

    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl IrcClient {
    pub fn new(
        stream: Box<dyn ConnStream>,
        server_name: impl Into<String>,
        flood_len_penalty: u64,
        flood_timeout: Duration,
        flood_step: Duration,
        keep_alive: Duration,
    ) -> Self {
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE);
        let (read_tx, read_rx) = mpsc::channel(WRITE_QUEUE);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            server_name: server_name.into(),
            flood: FloodControl::new(flood_len_penalty, flood_timeout, flood_step),
            keep_alive,
            write_tx,
            write_rx: Mutex::new(Some(write_rx)),
            read_tx: Mutex::new(Some(read_tx)),
            read_rx: AsyncMutex::new(read_rx),
            stream: Mutex::new(Some(stream)),
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// The sender feeding this connection's write queue.
    pub(crate) fn write_sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.write_tx.clone()
    }

    /// Start the writer and reader tasks. Call once.
    pub fn spawn_workers(&self, write: bool, read: bool) {
        let Some(stream) = self.stream.lock().take() else {
            return;
        };
        let (read_half, write_half) = tokio::io::split(stream);
        let mut workers = self.workers.lock();

        if write {
            let rx = self.write_rx.lock().take();
            if let Some(rx) = rx {
                workers.push(tokio::spawn(write_worker(
                    write_half,
                    rx,
                    self.flood.clone(),
                    self.shutdown_tx.subscribe(),
                )));
            }
        }
        // The sender moves into the reader so EOF closes the message
        // stream; without a reader it is dropped here for the same effect.
        let read_tx = self.read_tx.lock().take();
        if read {
            if let Some(read_tx) = read_tx {
                workers.push(tokio::spawn(read_worker(
                    read_half,
                    read_tx,
                    self.write_tx.clone(),
                    self.keep_alive,
                    self.server_name.clone(),
                    self.shutdown_tx.subscribe(),
                )));
            }
        }
    }

    /// Queue one line for sending. Blocks while the queue is full; fails
    /// after `close`.
    pub async fn write(&self, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ClientClosed);
        }
        self.write_tx
            .send(buf.to_vec())
            .await
            .map_err(|_| Error::ClientClosed)
    }

    /// Receive the next inbound line, `None` after EOF or close.
    pub async fn read_message(&self) -> Option<Vec<u8>> {
        self.read_rx.lock().await.recv().await
    }

    /// Signal both workers to stop. Queued writes are drained with a
    /// bounded wait and the socket is released when the workers exit.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        // Never spawned: dropping the stream closes the socket and
        // dropping the sender ends the message stream.
        self.stream.lock().take();
        self.read_tx.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait for both workers to exit.
    pub async fn wait(&self) {
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
    }
}

async fn write_worker(
    mut out: WriteHalf<Box<dyn ConnStream>>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    mut flood: FloodControl,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                let drain = async {
                    while let Ok(mut buf) = rx.try_recv() {
                        sanitize_line(&mut buf);
                        if out.write_all(&buf).await.is_err() {
                            return;
                        }
                    }
                    let _ = out.flush().await;
                };
                let _ = timeout(DRAIN_TIMEOUT, drain).await;
                break;
            }
            maybe = rx.recv() => {
                let Some(mut buf) = maybe else { break };
                sanitize_line(&mut buf);
                let delay = flood.charge(buf.len(), Instant::now());
                if !delay.is_zero() {
                    debug!(delay_ms = delay.as_millis() as u64, "flood throttle");
                    sleep(delay).await;
                }
                if let Err(e) = out.write_all(&buf).await {
                    warn!(error = %e, "write failed");
                    break;
                }
            }
        }
    }
    let _ = out.shutdown().await;
}

async fn read_worker(
    input: tokio::io::ReadHalf<Box<dyn ConnStream>>,
    read_tx: mpsc::Sender<Vec<u8>>,
    write_tx: mpsc::Sender<Vec<u8>>,
    keep_alive: Duration,
    server_name: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut framed = FramedRead::new(input, LinesCodec::new_with_max_length(MAX_LINE_IN));
    let mut last_read = Instant::now();
    let mut ping_sent = false;

    loop {
        let deadline = last_read
            + if ping_sent {
                keep_alive + keep_alive
            } else {
                keep_alive
            };

        tokio::select! {
            _ = shutdown.changed() => break,
            item = framed.next() => {
                match item {
                    Some(Ok(line)) => {
                        last_read = Instant::now();
                        ping_sent = false;
                        if read_tx.send(line.into_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        // Oversized line; the codec discards to the next
                        // terminator and the stream continues.
                        warn!(error = %e, "discarding unreadable line");
                        last_read = Instant::now();
                    }
                    None => break,
                }
            }
            _ = sleep_until(deadline) => {
                if ping_sent {
                    debug!("keepalive expired, closing connection");
                    break;
                }
                let ping = format!("PING :{}", server_name).into_bytes();
                if write_tx.send(ping).await.is_err() {
                    break;
                }
                ping_sent = true;
            }
        }
    }
}
