//! In-process worker doubles for gateway tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::browser::{BrowserSession, ChannelSession};
use crate::cache::ResultCache;
use crate::gateway::worker::{WorkerConnector, WorkerEndpoint, WorkerError, WorkerHandle, WorkerLink};
use crate::gateway::workers::WorkerPool;
use crate::gateway::ExecutionContext;
use crate::net::framed::ConnectionError;
use crate::protocol::Message;

/// Test side of one fake worker connection.
pub struct MockWorker {
    pub requests: mpsc::UnboundedReceiver<Message>,
    pub replies: Option<mpsc::UnboundedSender<Message>>,
    pub closed: Arc<AtomicBool>,
}

impl MockWorker {
    pub fn reply(&self, message: Message) {
        if let Some(tx) = &self.replies {
            let _ = tx.send(message);
        }
    }

    /// Drop the reply channel, as if the worker hung up.
    pub fn hang_up(&mut self) {
        self.replies = None;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MockHandle {
    requests: mpsc::UnboundedSender<Message>,
    closed: Arc<AtomicBool>,
}

impl WorkerHandle for MockHandle {
    fn send(&self, message: &Message) -> Result<(), WorkerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed.into());
        }
        self.requests.send(message.clone()).map_err(|_| ConnectionError::Closed)?;
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Connector handing each new connection to the test through a channel.
pub struct MockConnector {
    connects: AtomicUsize,
    workers: mpsc::UnboundedSender<MockWorker>,
    fail: AtomicBool,
    gate: Option<Arc<Notify>>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockWorker>) {
        Self::build(None)
    }

    /// Every connect waits for one `notify_one` on the returned gate.
    pub fn gated() -> (Arc<Self>, mpsc::UnboundedReceiver<MockWorker>, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let (connector, workers) = Self::build(Some(gate.clone()));
        (connector, workers, gate)
    }

    fn build(gate: Option<Arc<Notify>>) -> (Arc<Self>, mpsc::UnboundedReceiver<MockWorker>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            connects: AtomicUsize::new(0),
            workers: tx,
            fail: AtomicBool::new(false),
            gate,
        });
        (connector, rx)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerConnector for MockConnector {
    async fn connect(&self, endpoint: &WorkerEndpoint) -> Result<WorkerLink, WorkerError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ConnectionError::Connect {
                addr: endpoint.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            }
            .into());
        }

        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (replies, messages) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let _ = self.workers.send(MockWorker {
            requests,
            replies: Some(replies),
            closed: closed.clone(),
        });

        Ok(WorkerLink {
            handle: Arc::new(MockHandle {
                requests: requests_tx,
                closed,
            }),
            messages,
        })
    }
}

pub fn context(connector: Arc<dyn WorkerConnector>) -> ExecutionContext {
    ExecutionContext {
        cache: Arc::new(ResultCache::in_memory(64)),
        workers: Arc::new(WorkerPool::new(vec![WorkerEndpoint::new("127.0.0.1", 6000)])),
        connector,
        connect_timeout: Duration::from_secs(1),
    }
}

pub fn browser() -> (Arc<ChannelSession>, Weak<dyn BrowserSession>, mpsc::UnboundedReceiver<Message>) {
    let (session, rx) = ChannelSession::new();
    let weak: Weak<dyn BrowserSession> = Arc::downgrade(&session) as Weak<dyn BrowserSession>;
    (session, weak, rx)
}

/// Next browser message, failing the test if none arrives promptly.
pub async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for browser message")
        .expect("browser channel closed")
}

pub async fn next_worker(rx: &mut mpsc::UnboundedReceiver<MockWorker>) -> MockWorker {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for worker connect")
        .expect("connector dropped")
}

/// Yield until `cond` holds or two seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}
