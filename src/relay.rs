//! The relay instance.
//!
//! # Responsibilities
//! - Own the connection pool, result cache, worker pool and session registry
//! - Start the peer listener and the browser HTTP server
//! - Apply reloaded configuration and tear everything down on shutdown
//!
//! Nothing here is process-global, so several relays can run side by side.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::browser::{OriginSchemeInference, SessionRegistry};
use crate::cache::ResultCache;
use crate::config::RelayConfig;
use crate::gateway::workers::parse_endpoints;
use crate::gateway::{ExecutionContext, ExecutionGateway, TcpWorkerConnector, WorkerConnector, WorkerPool};
use crate::http::{AppState, HttpServer};
use crate::lifecycle::Shutdown;
use crate::net::tls::TlsError;
use crate::net::{
    ConnectionPool, ConnectionTracker, FrameOptions, FramedConnection, ListenerError, MessageHandler, PeerConnector,
    RelayListener,
};
use crate::observability::metrics;
use crate::protocol::Message;

/// How long teardown waits for inbound peer connections to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for relay startup.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("HTTP server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Receives messages from peer relays, inbound or as replies on pooled connections.
pub struct PeerDispatcher {
    received: AtomicU64,
    subscribers: broadcast::Sender<Message>,
}

impl PeerDispatcher {
    pub fn new() -> Self {
        let (subscribers, _) = broadcast::channel(64);
        Self {
            received: AtomicU64::new(0),
            subscribers,
        }
    }

    /// Messages received from peers since startup.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Observe peer messages as they arrive.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.subscribers.subscribe()
    }
}

impl Default for PeerDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageHandler for PeerDispatcher {
    fn on_message(&self, conn: &FramedConnection, message: Message) {
        self.received.fetch_add(1, Ordering::Relaxed);
        metrics::record_peer_message();
        tracing::info!(
            connection_id = %conn.id(),
            peer_addr = ?conn.peer_addr(),
            request_id = message.id,
            message_type = message.r#type,
            "Peer message received"
        );
        let _ = self.subscribers.send(message);
    }

    fn on_closed(&self, conn: &FramedConnection) {
        tracing::debug!(connection_id = %conn.id(), reason = ?conn.close_reason(), "Peer connection finished");
    }
}

/// Addresses and tasks of a started relay.
pub struct RelayHandle {
    pub peer_addr: SocketAddr,
    pub http_addr: Option<SocketAddr>,
    tracker: ConnectionTracker,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayHandle {
    /// Live inbound peer connections.
    pub fn peer_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Wait for the listener and HTTP tasks to stop.
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// One relay instance and everything it owns.
pub struct Relay {
    config: RelayConfig,
    pool: Arc<ConnectionPool>,
    gateway: Arc<ExecutionGateway>,
    workers: Arc<WorkerPool>,
    sessions: SessionRegistry,
    dispatcher: Arc<PeerDispatcher>,
}

impl Relay {
    /// Build a relay that reaches workers over TCP.
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        let connector = TcpWorkerConnector::new(FrameOptions {
            idle_timeout: None,
            max_frame_len: config.limits.max_frame_bytes,
        });
        Self::with_connector(config, Arc::new(connector))
    }

    /// Build a relay with a custom worker connector.
    pub fn with_connector(config: RelayConfig, connector: Arc<dyn WorkerConnector>) -> Result<Self, RelayError> {
        let dispatcher = Arc::new(PeerDispatcher::new());

        let peer_connector = PeerConnector::from_config(&config.peers, &config.limits)?
            .with_handler(dispatcher.clone());
        let pool = Arc::new(ConnectionPool::new(peer_connector));

        let workers = Arc::new(WorkerPool::from_config(&config));
        let ctx = ExecutionContext {
            cache: Arc::new(ResultCache::in_memory(config.cache.capacity)),
            workers: workers.clone(),
            connector,
            connect_timeout: config.timeouts.worker_connect(),
        };
        let gateway = Arc::new(ExecutionGateway::new(ctx, config.gateway.mode));

        tracing::info!(
            workers = workers.len(),
            mode = config.gateway.mode.as_str(),
            cache_capacity = config.cache.capacity,
            peer_tls = config.peers.ca_path.is_some(),
            "Relay initialized"
        );

        Ok(Self {
            config,
            pool,
            gateway,
            workers,
            sessions: SessionRegistry::new(),
            dispatcher,
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn gateway(&self) -> &Arc<ExecutionGateway> {
        &self.gateway
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn dispatcher(&self) -> &Arc<PeerDispatcher> {
        &self.dispatcher
    }

    fn app_state(&self) -> AppState {
        AppState {
            gateway: self.gateway.clone(),
            sessions: self.sessions.clone(),
            pool: self.pool.clone(),
            scheme: Arc::new(OriginSchemeInference::default()),
            mode: self.config.gateway.mode,
        }
    }

    /// Bind the peer listener and (if enabled) the HTTP server, and start serving.
    pub async fn start(&self, shutdown: &Shutdown) -> Result<RelayHandle, RelayError> {
        let listener = RelayListener::bind(&self.config.listener).await?;
        let peer_addr = listener.local_addr().map_err(ListenerError::from)?;
        let tracker = listener.tracker();
        let options = FrameOptions {
            idle_timeout: Some(self.config.timeouts.idle()),
            max_frame_len: self.config.limits.max_frame_bytes,
        };

        let mut tasks = vec![tokio::spawn(listener.serve(
            self.dispatcher.clone(),
            options,
            shutdown.subscribe(),
        ))];

        let mut http_addr = None;
        if self.config.http.enabled {
            let http_listener = TcpListener::bind(&self.config.http.bind_address).await?;
            http_addr = Some(http_listener.local_addr()?);
            let server = HttpServer::new(self.app_state(), &self.config.http);
            let stop = shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = server.run(http_listener, stop).await {
                    tracing::error!(error = %e, "HTTP server failed");
                }
            }));
        }

        tracing::info!(peer_address = %peer_addr, http_address = ?http_addr, "Relay started");
        Ok(RelayHandle {
            peer_addr,
            http_addr,
            tracker,
            tasks,
        })
    }

    /// Run until `shutdown` fires, then tear down.
    pub async fn run(&self, shutdown: &Shutdown) -> Result<(), RelayError> {
        let mut stop = shutdown.subscribe();
        let handle = self.start(shutdown).await?;

        let _ = stop.recv().await;
        tracing::info!("Relay shutting down");

        self.teardown().await;
        if !handle.tracker.wait_for_drain(DRAIN_TIMEOUT).await {
            tracing::warn!(remaining = handle.peer_connections(), "Peer connections still open after drain timeout");
        }
        handle.join().await;
        Ok(())
    }

    /// Swap in settings that can change without a restart.
    pub fn apply_config(&self, config: &RelayConfig) {
        self.workers.replace(parse_endpoints(&config.worker_addresses()));

        if config.listener != self.config.listener
            || config.peers != self.config.peers
            || config.http != self.config.http
            || config.gateway != self.config.gateway
            || config.cache != self.config.cache
        {
            tracing::warn!("Listener, peer, HTTP, gateway and cache settings take effect on restart");
        }
    }

    /// Close browser sessions and pooled peer connections.
    pub async fn teardown(&self) {
        self.sessions.close_all();
        self.pool.close_all().await;
        tracing::info!("Relay torn down");
    }
}
