//! Length-prefixed message connection.
//!
//! # Responsibilities
//! - Turn a byte stream (plain TCP or TLS) into an ordered sequence of [`Message`]s
//! - Serialize outbound messages as single, non-interleaved writes
//! - Close connections that stay silent longer than the idle timeout
//!
//! # Tasks
//! ```text
//! reader:  awaiting header (4 bytes) → awaiting body (N bytes) → decode → handler → repeat
//! writer:  queue → write_all(header + payload) → flush → notify sender
//! idle:    sleep until last_message + idle → close or reschedule
//! ```
//!
//! All three tasks watch the same closed flag and exit once it flips.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::net::connection::ConnectionId;
use crate::observability::metrics;
use crate::protocol::codec::{self, DecodeError, FrameError, DEFAULT_MAX_FRAME_LEN, HEADER_LEN};
use crate::protocol::Message;

/// Upper bound on flushing already-queued frames after a close.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Receives decoded messages for one connection.
///
/// `on_message` runs on the connection's reader task; the next frame is not
/// read until it returns, which keeps per-connection delivery FIFO.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, conn: &FramedConnection, message: Message);

    /// Called exactly once, after the connection has closed for any reason.
    fn on_closed(&self, _conn: &FramedConnection) {}
}

/// Per-connection framing options.
#[derive(Debug, Clone, Copy)]
pub struct FrameOptions {
    /// Close after this long without an inbound message. `None` disables the check.
    pub idle_timeout: Option<Duration>,
    /// Largest payload accepted or sent.
    pub max_frame_len: usize,
}

impl Default for FrameOptions {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Error type for connection operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection is closed")]
    Closed,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {0} timed out")]
    ConnectTimeout(String),
}

/// Why a connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called locally.
    Local,
    /// Stream ended, possibly mid-header.
    PeerClosed,
    /// No inbound message within the idle timeout.
    Idle,
    /// Length prefix above the frame limit.
    Oversize,
    /// Payload did not decode to a valid message.
    Malformed,
    /// Socket read or write failed.
    IoError,
}

impl CloseReason {
    fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Local => "local",
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::Idle => "idle",
            CloseReason::Oversize => "oversize",
            CloseReason::Malformed => "malformed",
            CloseReason::IoError => "io_error",
        }
    }
}

struct Outbound {
    bytes: Vec<u8>,
    flushed: Option<oneshot::Sender<()>>,
}

struct Inner {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed_tx: watch::Sender<bool>,
    close_reason: Mutex<Option<CloseReason>>,
    last_message: Mutex<Instant>,
    max_frame_len: usize,
}

/// A message-oriented connection. Clones share the same socket.
#[derive(Clone)]
pub struct FramedConnection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for FramedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedConnection")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl FramedConnection {
    /// Wrap `stream` and start its reader, writer and (optional) idle tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<S>(
        stream: S,
        peer_addr: Option<SocketAddr>,
        handler: Arc<dyn MessageHandler>,
        options: FrameOptions,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);

        let conn = Self {
            inner: Arc::new(Inner {
                id: ConnectionId::new(),
                peer_addr,
                outbound,
                closed_tx,
                close_reason: Mutex::new(None),
                last_message: Mutex::new(Instant::now()),
                max_frame_len: options.max_frame_len,
            }),
        };

        metrics::record_connection_opened();
        tracing::debug!(
            connection_id = %conn.id(),
            peer_addr = ?peer_addr,
            idle_timeout = ?options.idle_timeout,
            "Framed connection opened"
        );

        let (reader, writer) = tokio::io::split(stream);
        tokio::spawn(write_loop(conn.clone(), writer, outbound_rx));
        tokio::spawn(read_loop(conn.clone(), reader, handler));
        if let Some(idle) = options.idle_timeout {
            tokio::spawn(idle_supervisor(conn.clone(), idle));
        }

        conn
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Queue a message. Header and payload go out in one write.
    pub fn send(&self, message: &Message) -> Result<(), ConnectionError> {
        self.enqueue(message, None)
    }

    /// Queue a message; the receiver resolves once it has been flushed to the socket.
    pub fn send_with_flush(&self, message: &Message) -> Result<oneshot::Receiver<()>, ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(message, Some(tx))?;
        Ok(rx)
    }

    fn enqueue(&self, message: &Message, flushed: Option<oneshot::Sender<()>>) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let bytes = codec::frame(message, self.inner.max_frame_len)?;
        self.inner
            .outbound
            .send(Outbound { bytes, flushed })
            .map_err(|_| ConnectionError::Closed)?;
        metrics::record_frame_sent();
        Ok(())
    }

    /// Close the connection. Frames already queued are still flushed.
    pub fn close(&self) {
        self.shutdown(CloseReason::Local);
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed_tx.borrow()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *lock(&self.inner.close_reason)
    }

    /// Time the most recent inbound frame header arrived (or creation time).
    pub fn last_message_time(&self) -> Instant {
        *lock(&self.inner.last_message)
    }

    fn touch(&self) {
        *lock(&self.inner.last_message) = Instant::now();
    }

    fn shutdown(&self, reason: CloseReason) {
        let first = self.inner.closed_tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });
        if !first {
            return;
        }

        *lock(&self.inner.close_reason) = Some(reason);
        metrics::record_connection_closed(reason.as_str());
        match reason {
            CloseReason::Local | CloseReason::PeerClosed | CloseReason::Idle => tracing::debug!(
                connection_id = %self.id(),
                peer_addr = ?self.peer_addr(),
                reason = reason.as_str(),
                "Connection closed"
            ),
            _ => tracing::warn!(
                connection_id = %self.id(),
                peer_addr = ?self.peer_addr(),
                reason = reason.as_str(),
                "Connection closed"
            ),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, thiserror::Error)]
enum ReadError {
    #[error("stream ended before a full header")]
    ShortHeader,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl ReadError {
    fn close_reason(&self) -> CloseReason {
        match self {
            ReadError::ShortHeader => CloseReason::PeerClosed,
            ReadError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => CloseReason::PeerClosed,
            ReadError::Io(_) => CloseReason::IoError,
            ReadError::Frame(_) => CloseReason::Oversize,
            ReadError::Decode(_) => CloseReason::Malformed,
        }
    }
}

async fn read_frame<R>(reader: &mut R, conn: &FramedConnection) -> Result<Message, ReadError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ReadError::ShortHeader
        } else {
            ReadError::Io(e)
        }
    })?;
    conn.touch();

    let len = codec::payload_len(header);
    codec::check_len(len, conn.inner.max_frame_len)?;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(codec::decode(&body)?)
}

async fn read_loop<R>(conn: FramedConnection, mut reader: R, handler: Arc<dyn MessageHandler>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = conn.closed() => break,
            frame = read_frame(&mut reader, &conn) => frame,
        };

        match frame {
            Ok(message) => {
                metrics::record_frame_received();
                handler.on_message(&conn, message);
            }
            Err(e) => {
                match &e {
                    ReadError::ShortHeader => {}
                    other => tracing::debug!(connection_id = %conn.id(), error = %other, "Read failed"),
                }
                conn.shutdown(e.close_reason());
                break;
            }
        }
    }

    handler.on_closed(&conn);
}

async fn write_loop<W>(conn: FramedConnection, mut writer: W, mut queue: mpsc::UnboundedReceiver<Outbound>)
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            item = queue.recv() => match item {
                Some(out) => {
                    if let Err(e) = write_one(&mut writer, out).await {
                        tracing::debug!(connection_id = %conn.id(), error = %e, "Write failed");
                        conn.shutdown(CloseReason::IoError);
                        return;
                    }
                }
                None => break,
            },
            _ = conn.closed() => break,
        }
    }

    let drain = async {
        while let Ok(out) = queue.try_recv() {
            if write_one(&mut writer, out).await.is_err() {
                return;
            }
        }
        let _ = writer.shutdown().await;
    };
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, drain).await;
}

async fn write_one<W>(writer: &mut W, out: Outbound) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&out.bytes).await?;
    writer.flush().await?;
    if let Some(tx) = out.flushed {
        let _ = tx.send(());
    }
    Ok(())
}

async fn idle_supervisor(conn: FramedConnection, idle: Duration) {
    loop {
        let deadline = conn.last_message_time() + idle;
        tokio::select! {
            _ = conn.closed() => return,
            _ = tokio::time::sleep_until(deadline) => {}
        }

        if conn.is_closed() {
            return;
        }
        if conn.last_message_time().elapsed() >= idle {
            conn.shutdown(CloseReason::Idle);
            return;
        }
    }
}
