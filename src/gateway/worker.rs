//! Worker connection contract and its TCP implementation.
//!
//! A worker speaks the same framed protocol as relay peers, unencrypted.
//! The gateway only sees [`WorkerHandle`] plus a channel of inbound messages;
//! the channel closes when the worker connection does.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::net::framed::{ConnectionError, FrameOptions, FramedConnection, MessageHandler};
use crate::protocol::Message;

/// Error type for worker operations.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("no worker endpoints configured")]
    NoWorkers,

    #[error("invalid worker address '{0}'")]
    InvalidAddress(String),

    #[error("connect to worker {0} timed out")]
    Timeout(WorkerEndpoint),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Host and port of a compute worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerEndpoint {
    pub host: String,
    pub port: u16,
}

impl WorkerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`. An empty host means localhost.
    pub fn parse(address: &str) -> Result<Self, WorkerError> {
        let invalid = || WorkerError::InvalidAddress(address.to_string());
        let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse().map_err(|_| invalid())?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let host = if host.is_empty() { "127.0.0.1" } else { host };
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for WorkerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Outbound half of a worker connection.
pub trait WorkerHandle: Send + Sync + 'static {
    fn send(&self, message: &Message) -> Result<(), WorkerError>;

    fn close(&self);
}

/// A connected worker: the handle plus everything it sends back, in order.
pub struct WorkerLink {
    pub handle: Arc<dyn WorkerHandle>,
    pub messages: mpsc::UnboundedReceiver<Message>,
}

/// Opens worker connections. The caller bounds the attempt with its own timeout.
#[async_trait]
pub trait WorkerConnector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &WorkerEndpoint) -> Result<WorkerLink, WorkerError>;
}

/// Dials workers over plain TCP and frames the stream.
#[derive(Debug, Clone, Default)]
pub struct TcpWorkerConnector {
    options: FrameOptions,
}

impl TcpWorkerConnector {
    pub fn new(options: FrameOptions) -> Self {
        Self { options }
    }
}

struct ForwardToChannel(mpsc::UnboundedSender<Message>);

impl MessageHandler for ForwardToChannel {
    fn on_message(&self, conn: &FramedConnection, message: Message) {
        if self.0.send(message).is_err() {
            // Nobody is listening any more.
            conn.close();
        }
    }
}

struct TcpWorkerHandle(FramedConnection);

impl WorkerHandle for TcpWorkerHandle {
    fn send(&self, message: &Message) -> Result<(), WorkerError> {
        Ok(self.0.send(message)?)
    }

    fn close(&self) {
        self.0.close();
    }
}

#[async_trait]
impl WorkerConnector for TcpWorkerConnector {
    async fn connect(&self, endpoint: &WorkerEndpoint) -> Result<WorkerLink, WorkerError> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|source| ConnectionError::Connect {
                addr: endpoint.to_string(),
                source,
            })?;
        let _ = stream.set_nodelay(true);
        let peer_addr = stream.peer_addr().ok();

        let (tx, messages) = mpsc::unbounded_channel();
        let conn = FramedConnection::spawn(stream, peer_addr, Arc::new(ForwardToChannel(tx)), self.options);
        tracing::debug!(connection_id = %conn.id(), worker = %endpoint, "Worker connected");

        Ok(WorkerLink {
            handle: Arc::new(TcpWorkerHandle(conn)),
            messages,
        })
    }
}
