//! Browser websocket transport.
//!
//! # Responsibilities
//! - Complete the upgrade, advertising the socket location, and register a browser session
//! - Decode JSON text frames into [`Message`]s for the gateway session
//! - Encode gateway output back to JSON text frames
//!
//! # Data Flow
//! ```text
//! Browser ──text(JSON)──→ reader loop → GatewaySession::handle
//! Browser ←─text(JSON)─── writer task ← ChannelSession ← executions
//! ```
//!
//! # Design Decisions
//! - The reader handles one request at a time, so per-session order holds
//! - The registry holds the only long-lived strong reference to the session

use std::sync::{Arc, Weak};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderMap, HeaderName, HeaderValue, Uri},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::browser::{BrowserSession, ChannelSession};
use crate::http::server::AppState;
use crate::protocol::Message;

/// Where the browser should consider this socket to live, with the scheme
/// the request arrived under (which a TLS-terminating proxy hides).
pub const WEBSOCKET_LOCATION: HeaderName = HeaderName::from_static("sec-websocket-location");

pub async fn ws_handler(State(state): State<AppState>, headers: HeaderMap, uri: Uri, ws: WebSocketUpgrade) -> Response {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    let scheme = state.scheme.websocket_scheme(origin);
    let location = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .and_then(|host| HeaderValue::from_str(&format!("{scheme}://{host}{}", uri.path())).ok());
    tracing::debug!(origin = ?origin, location = ?location, "Browser websocket upgrade");

    let mut response = ws.on_upgrade(move |socket| handle_socket(socket, state)).into_response();
    if let Some(location) = location {
        response.headers_mut().insert(WEBSOCKET_LOCATION, location);
    }
    response
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (session, outbound) = ChannelSession::new();
    let session_id = session.id();
    state.sessions.insert(session.clone());

    let weak: Weak<dyn BrowserSession> = Arc::downgrade(&session) as Weak<dyn BrowserSession>;
    let mut gateway_session = state.gateway.open_session(weak, state.mode);

    let (sender, mut receiver) = socket.split();
    let writer = tokio::spawn(write_loop(sender, outbound));

    loop {
        tokio::select! {
            _ = session.closed() => break,
            frame = receiver.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<Message>(text.as_str()) {
                    Ok(message) => gateway_session.handle(message).await,
                    Err(e) => tracing::warn!(session_id = %session_id, error = %e, "Invalid browser message"),
                },
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(session_id = %session_id, error = %e, "Websocket read failed");
                    break;
                }
            },
        }
    }

    // Killed fragments still reach the writer before the session goes away.
    gateway_session.close();
    state.sessions.remove(&session_id);
    drop(session);
    let _ = writer.await;
}

async fn write_loop(
    mut sender: futures_util::stream::SplitSink<WebSocket, WsMessage>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = outbound.recv().await {
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode browser message");
                continue;
            }
        };
        if sender.send(WsMessage::Text(text.into())).await.is_err() {
            break;
        }
    }
    let _ = sender.close().await;
}
