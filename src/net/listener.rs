//! Peer listener with backpressure.
//!
//! # Responsibilities
//! - Bind to the configured address
//! - Accept incoming TCP connections, bounded by max_connections
//! - Run the TLS handshake off the accept loop
//! - Hand each connection to its own [`FramedConnection`] bound to the dispatcher

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tokio_rustls::TlsAcceptor;

use crate::config::ListenerConfig;
use crate::net::connection::ConnectionTracker;
use crate::net::framed::{FrameOptions, FramedConnection, MessageHandler};
use crate::net::tls::{load_server_acceptor, TlsError};

/// Handshake bound used when the connection has no idle timeout.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("Failed to bind: {0}")]
    Bind(#[from] std::io::Error),

    #[error("Invalid bind address '{0}'")]
    Address(String),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),
}

/// Accepts peer connections and frames them.
pub struct RelayListener {
    inner: TcpListener,
    tls: Option<TlsAcceptor>,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
    tracker: ConnectionTracker,
}

impl RelayListener {
    /// Bind to the configured address, loading TLS material if configured.
    pub async fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let addr: SocketAddr = config
            .bind_address
            .parse()
            .map_err(|_| ListenerError::Address(config.bind_address.clone()))?;

        let tls = match &config.tls {
            Some(tls) => Some(load_server_acceptor(Path::new(&tls.cert_path), Path::new(&tls.key_path))?),
            None => None,
        };

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        tracing::info!(
            address = %local_addr,
            max_connections = config.max_connections,
            tls = tls.is_some(),
            "Peer listener bound"
        );

        Ok(Self {
            inner: listener,
            tls,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
            tracker: ConnectionTracker::new(),
        })
    }

    /// Replace the TLS acceptor (or disable TLS with `None`).
    pub fn with_tls(mut self, acceptor: Option<TlsAcceptor>) -> Self {
        self.tls = acceptor;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }

    /// Tracker counting live accepted connections.
    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Accept until `shutdown` fires. Accepted connections are closed on shutdown too.
    pub async fn serve(
        self,
        handler: Arc<dyn MessageHandler>,
        options: FrameOptions,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            // Acquire permit first (backpressure)
            let permit = tokio::select! {
                permit = self.connection_limit.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = shutdown.recv() => break,
            };

            let (stream, addr) = tokio::select! {
                accepted = self.inner.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
                _ = shutdown.recv() => break,
            };

            tracing::debug!(
                peer_addr = %addr,
                available_permits = self.connection_limit.available_permits(),
                "Connection accepted"
            );

            let tls = self.tls.clone();
            let handler = handler.clone();
            let guard = self.tracker.track();
            let mut conn_shutdown = shutdown.resubscribe();

            tokio::spawn(async move {
                let _permit = permit;
                let _guard = guard;

                let Some(conn) = establish(stream, addr, tls, handler, options).await else {
                    return;
                };

                tokio::select! {
                    _ = conn.closed() => {}
                    _ = conn_shutdown.recv() => conn.close(),
                }
            });
        }

        tracing::info!("Peer listener stopped accepting");
    }
}

async fn establish(
    stream: TcpStream,
    addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    handler: Arc<dyn MessageHandler>,
    options: FrameOptions,
) -> Option<FramedConnection> {
    let _ = stream.set_nodelay(true);

    let Some(acceptor) = tls else {
        return Some(FramedConnection::spawn(stream, Some(addr), handler, options));
    };

    let handshake_timeout = options.idle_timeout.unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT);
    match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
        Ok(Ok(tls_stream)) => Some(FramedConnection::spawn(tls_stream, Some(addr), handler, options)),
        Ok(Err(e)) => {
            tracing::warn!(peer_addr = %addr, error = %e, "TLS handshake failed");
            None
        }
        Err(_) => {
            tracing::warn!(peer_addr = %addr, "TLS handshake timed out");
            None
        }
    }
}
