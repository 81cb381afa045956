//! Browser session contract.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::protocol::Message;

/// Returned when sending to a session whose transport has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("browser session closed")]
pub struct SessionClosed;

/// A browser-side endpoint that accepts outbound messages.
///
/// The gateway holds sessions weakly and never decides their lifetime.
pub trait BrowserSession: Send + Sync + 'static {
    fn id(&self) -> Uuid;

    fn send(&self, message: &Message) -> Result<(), SessionClosed>;

    /// Ask the transport to close. Transports without a close signal ignore this.
    fn close(&self) {}
}

/// Session backed by an unbounded channel; the receiving half feeds the transport.
#[derive(Debug)]
pub struct ChannelSession {
    id: Uuid,
    tx: mpsc::UnboundedSender<Message>,
    closed: watch::Sender<bool>,
}

impl ChannelSession {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        Self::with_id(Uuid::new_v4())
    }

    pub fn with_id(id: Uuid) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        (Arc::new(Self { id, tx, closed }), rx)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.tx.is_closed()
    }

    /// Resolves once `close` has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }
}

impl BrowserSession for ChannelSession {
    fn id(&self) -> Uuid {
        self.id
    }

    fn send(&self, message: &Message) -> Result<(), SessionClosed> {
        if *self.closed.borrow() {
            return Err(SessionClosed);
        }
        self.tx.send(message.clone()).map_err(|_| SessionClosed)
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }
}
