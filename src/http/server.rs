//! HTTP server setup.
//!
//! # Responsibilities
//! - Create the Axum router: liveness, message types, websocket, debug routes
//! - Wire up tracing middleware
//! - Serve until the shutdown signal fires

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use crate::browser::{SchemeInference, SessionRegistry};
use crate::config::{ExecutionMode, HttpConfig};
use crate::gateway::ExecutionGateway;
use crate::http::websocket::ws_handler;
use crate::net::ConnectionPool;
use crate::protocol::{message_types_json, Message};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<ExecutionGateway>,
    pub sessions: SessionRegistry,
    pub pool: Arc<ConnectionPool>,
    pub scheme: Arc<dyn SchemeInference>,
    pub mode: ExecutionMode,
}

/// Browser-facing HTTP server.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    pub fn new(state: AppState, config: &HttpConfig) -> Self {
        Self {
            router: build_router(state, config.debug_routes),
        }
    }

    /// The configured router, for serving or in-process testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve on `listener` until `shutdown` fires.
    pub async fn run(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Build the Axum router with all middleware layers.
pub fn build_router(state: AppState, debug_routes: bool) -> Router {
    let mut router = Router::new()
        .route("/alive", get(alive).options(alive))
        .route("/message/types", get(message_types))
        .route("/ws", get(ws_handler));

    if debug_routes {
        router = router.route("/test/peer-message", get(peer_message));
    }

    router.with_state(state).layer(TraceLayer::new_for_http())
}

async fn alive() -> &'static str {
    "ok"
}

async fn message_types() -> Json<serde_json::Value> {
    Json(message_types_json())
}

#[derive(Debug, Deserialize)]
struct PeerMessageQuery {
    #[serde(default = "default_hostname")]
    hostname: String,
    port: u16,
}

fn default_hostname() -> String {
    "localhost".to_string()
}

/// Send a fixed test message to another relay through the connection pool.
async fn peer_message(State(state): State<AppState>, Query(query): Query<PeerMessageQuery>) -> impl IntoResponse {
    tracing::info!(hostname = %query.hostname, port = query.port, "Testing peer message path");
    let started = Instant::now();
    let message = Message::output(7, "some output", "", true);

    match state.pool.send(&query.hostname, query.port, &message).await {
        Ok(()) => {
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            (StatusCode::OK, format!("sent message successfully in {elapsed_ms:.1} milliseconds"))
        }
        Err(e) => {
            tracing::warn!(hostname = %query.hostname, port = query.port, error = %e, "Peer test message failed");
            (StatusCode::BAD_GATEWAY, format!("failed to send message: {e}"))
        }
    }
}
