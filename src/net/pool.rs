//! Outbound peer connection pool.
//!
//! # Responsibilities
//! - Cache one live connection per (host, port)
//! - Detect closed connections lazily, at lookup time
//! - Serialize connection attempts per endpoint so one lookup dials at a time

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::config::{LimitsConfig, PeerConfig};
use crate::net::framed::{ConnectionError, FrameOptions, FramedConnection, MessageHandler};
use crate::net::tls::{load_peer_connector, server_name, TlsError};
use crate::protocol::Message;

/// Error type for pool lookups.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("TLS handshake with {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Handler for messages peers send back on outbound connections.
#[derive(Debug, Default)]
pub struct LogReplies;

impl MessageHandler for LogReplies {
    fn on_message(&self, conn: &FramedConnection, message: Message) {
        tracing::debug!(connection_id = %conn.id(), message = ?message, "Reply on outbound peer connection");
    }
}

/// Dials peers, over TLS when a CA is configured.
#[derive(Clone)]
pub struct PeerConnector {
    tls: Option<TlsConnector>,
    connect_timeout: Duration,
    options: FrameOptions,
    handler: Arc<dyn MessageHandler>,
}

impl PeerConnector {
    /// Plain TCP connector.
    pub fn plain(connect_timeout: Duration) -> Self {
        Self {
            tls: None,
            connect_timeout,
            options: FrameOptions::default(),
            handler: Arc::new(LogReplies),
        }
    }

    /// TLS connector using `connector` for the handshake.
    pub fn tls(connector: TlsConnector, connect_timeout: Duration) -> Self {
        Self {
            tls: Some(connector),
            ..Self::plain(connect_timeout)
        }
    }

    pub fn from_config(peers: &PeerConfig, limits: &LimitsConfig) -> Result<Self, TlsError> {
        let timeout = Duration::from_secs(peers.connect_timeout_secs);
        let connector = match &peers.ca_path {
            Some(ca) => Self::tls(load_peer_connector(std::path::Path::new(ca))?, timeout),
            None => Self::plain(timeout),
        };
        Ok(connector.with_options(FrameOptions {
            idle_timeout: None,
            max_frame_len: limits.max_frame_bytes,
        }))
    }

    pub fn with_options(mut self, options: FrameOptions) -> Self {
        self.options = options;
        self
    }

    /// Route messages arriving on outbound connections to `handler`.
    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Open a new framed connection to `host:port`.
    pub async fn connect(&self, host: &str, port: u16) -> Result<FramedConnection, PoolError> {
        let addr = format!("{host}:{port}");

        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ConnectionError::Connect { addr, source }.into()),
            Err(_) => return Err(ConnectionError::ConnectTimeout(addr).into()),
        };
        let _ = stream.set_nodelay(true);
        let peer_addr = stream.peer_addr().ok();

        let conn = match &self.tls {
            None => FramedConnection::spawn(stream, peer_addr, self.handler.clone(), self.options),
            Some(connector) => {
                let name = server_name(host)?;
                let tls_stream = match tokio::time::timeout(self.connect_timeout, connector.connect(name, stream)).await {
                    Ok(Ok(s)) => s,
                    Ok(Err(source)) => return Err(PoolError::Handshake { addr, source }),
                    Err(_) => return Err(ConnectionError::ConnectTimeout(addr).into()),
                };
                FramedConnection::spawn(tls_stream, peer_addr, self.handler.clone(), self.options)
            }
        };

        tracing::debug!(connection_id = %conn.id(), peer = %addr, tls = self.tls.is_some(), "Peer connection established");
        Ok(conn)
    }
}

type Slot = Arc<tokio::sync::Mutex<Option<FramedConnection>>>;

/// Cache of outbound peer connections keyed by endpoint.
pub struct ConnectionPool {
    connector: PeerConnector,
    slots: Mutex<HashMap<(String, u16), Slot>>,
}

impl ConnectionPool {
    pub fn new(connector: PeerConnector) -> Self {
        Self {
            connector,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<(String, u16), Slot>> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn slot(&self, host: &str, port: u16) -> Slot {
        self.slots().entry((host.to_string(), port)).or_default().clone()
    }

    fn is_current(&self, host: &str, port: u16, slot: &Slot) -> bool {
        self.slots()
            .get(&(host.to_string(), port))
            .is_some_and(|s| Arc::ptr_eq(s, slot))
    }

    /// Drop the map entry for an endpoint that could not be dialed.
    fn forget(&self, host: &str, port: u16, slot: &Slot) {
        let mut slots = self.slots();
        let key = (host.to_string(), port);
        if slots.get(&key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(&key);
        }
    }

    /// Return the cached connection if it is still open; otherwise dial, cache and return a new one.
    pub async fn get(&self, host: &str, port: u16) -> Result<FramedConnection, PoolError> {
        loop {
            let slot = self.slot(host, port);
            let mut entry = slot.lock().await;
            // A failed dial may have dropped this slot while we waited on it.
            if !self.is_current(host, port, &slot) {
                continue;
            }

            if let Some(conn) = entry.as_ref() {
                if !conn.is_closed() {
                    return Ok(conn.clone());
                }
                tracing::debug!(connection_id = %conn.id(), host, port, "Evicting closed peer connection");
                *entry = None;
            }

            return match self.connector.connect(host, port).await {
                Ok(conn) => {
                    *entry = Some(conn.clone());
                    Ok(conn)
                }
                Err(e) => {
                    self.forget(host, port, &slot);
                    Err(e)
                }
            };
        }
    }

    /// Endpoints with a pool entry, live or not.
    pub fn endpoint_count(&self) -> usize {
        self.slots().len()
    }

    /// Send one message to a peer through the pooled connection.
    pub async fn send(&self, host: &str, port: u16, message: &Message) -> Result<(), PoolError> {
        let conn = self.get(host, port).await?;
        conn.send(message)?;
        Ok(())
    }

    /// Drop and close the cached connection for an endpoint.
    pub async fn evict(&self, host: &str, port: u16) -> Option<FramedConnection> {
        let slot = self.slots().get(&(host.to_string(), port)).cloned()?;
        let conn = slot.lock().await.take();
        if let Some(conn) = &conn {
            conn.close();
        }
        conn
    }

    /// Number of cached connections that are still open.
    pub async fn len(&self) -> usize {
        let slots: Vec<Slot> = self.slots().values().cloned().collect();
        let mut live = 0;
        for slot in slots {
            if slot.lock().await.as_ref().is_some_and(|c| !c.is_closed()) {
                live += 1;
            }
        }
        live
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close every cached connection.
    pub async fn close_all(&self) {
        let slots: Vec<Slot> = self.slots().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            if let Some(conn) = slot.lock().await.take() {
                conn.close();
            }
        }
    }
}
