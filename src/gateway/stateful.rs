//! Stateful execution: one long-lived worker per browser session.
//!
//! Requests made before the worker is ready are queued in order and sent
//! once it is. If the worker cannot be reached, every queued request and
//! every later one gets the "unable to connect to worker" fragment.
//! Results depend on session history and are never cached.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::browser::BrowserSession;
use crate::gateway::worker::WorkerHandle;
use crate::gateway::{emit, ExecutionContext};
use crate::observability::metrics;
use crate::protocol::{Message, MessageType};

const MODE: &str = "stateful";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Ready,
    /// Connect failed or the worker went away.
    Unavailable,
    Killed,
}

struct State {
    phase: Phase,
    worker: Option<Arc<dyn WorkerHandle>>,
    queued: VecDeque<(i64, String)>,
    /// Ids sent to the worker whose `done` fragment has not arrived.
    outstanding: VecDeque<i64>,
}

struct Shared {
    session: Weak<dyn BrowserSession>,
    state: Mutex<State>,
}

impl Shared {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn send_to_worker(&self, state: &mut State, id: i64, code: String) {
        let sent = match &state.worker {
            Some(worker) => worker.send(&Message::execute_code(id, code)),
            None => return self.refuse(id),
        };
        match sent {
            Ok(()) => state.outstanding.push_back(id),
            Err(e) => {
                tracing::warn!(request_id = id, error = %e, "Worker rejected request");
                self.refuse(id);
            }
        }
    }

    fn refuse(&self, id: i64) {
        emit(&self.session, &Message::connect_failed(id));
        metrics::record_execution(MODE, "connect_failed");
    }
}

/// A browser session's dedicated worker connection.
pub struct StatefulSession {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl StatefulSession {
    /// Start connecting to a worker. Requests can be issued immediately.
    pub fn open(ctx: &ExecutionContext, session: Weak<dyn BrowserSession>) -> Self {
        let shared = Arc::new(Shared {
            session,
            state: Mutex::new(State {
                phase: Phase::Connecting,
                worker: None,
                queued: VecDeque::new(),
                outstanding: VecDeque::new(),
            }),
        });
        let task = tokio::spawn(run(ctx.clone(), shared.clone()));
        Self { shared, task }
    }

    /// True once the worker connection is up.
    pub fn is_ready(&self) -> bool {
        self.shared.state().phase == Phase::Ready
    }

    /// True while a request sent to the worker has not finished.
    pub fn is_busy(&self) -> bool {
        !self.shared.state().outstanding.is_empty()
    }

    /// True after `kill`; such a session accepts no more requests.
    pub fn is_killed(&self) -> bool {
        self.shared.state().phase == Phase::Killed
    }

    /// True once the session can never reach a worker again: killed, failed
    /// to connect, or its worker went away.
    pub fn is_finished(&self) -> bool {
        matches!(self.shared.state().phase, Phase::Unavailable | Phase::Killed)
    }

    /// Run `code` on the session's worker, queueing it if the worker is still connecting.
    pub fn execute(&self, code: impl Into<String>, id: i64) {
        let code = code.into();
        let mut state = self.shared.state();
        let phase = state.phase;
        match phase {
            Phase::Ready => {
                tracing::debug!(request_id = id, "Sending code to session worker");
                self.shared.send_to_worker(&mut state, id, code);
            }
            Phase::Connecting => {
                tracing::debug!(request_id = id, queued = state.queued.len() + 1, "Worker not ready, queueing request");
                state.queued.push_back((id, code));
            }
            Phase::Unavailable | Phase::Killed => self.shared.refuse(id),
        }
    }

    /// Close the worker and end every open or queued request with `killed`.
    /// Returns false if there was nothing to kill.
    pub fn kill(&self) -> bool {
        let mut guard = self.shared.state();
        let state = &mut *guard;
        if !matches!(state.phase, Phase::Connecting | Phase::Ready) {
            return false;
        }

        state.phase = Phase::Killed;
        if let Some(worker) = state.worker.take() {
            worker.close();
        }
        let pending: Vec<i64> = state
            .outstanding
            .drain(..)
            .chain(state.queued.drain(..).map(|(id, _)| id))
            .collect();
        for id in &pending {
            emit(&self.shared.session, &Message::killed(*id));
            metrics::record_execution(MODE, "killed");
        }
        self.task.abort();
        drop(guard);

        tracing::info!(killed_requests = pending.len(), "Stateful session killed");
        true
    }
}

impl Drop for StatefulSession {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn run(ctx: ExecutionContext, shared: Arc<Shared>) {
    let link = match ctx.connect_worker().await {
        Ok(link) => link,
        Err(e) => {
            tracing::warn!(error = %e, "Unable to connect session worker");
            let mut state = shared.state();
            if state.phase == Phase::Connecting {
                state.phase = Phase::Unavailable;
                for (id, _) in std::mem::take(&mut state.queued) {
                    shared.refuse(id);
                }
            }
            return;
        }
    };

    {
        let mut state = shared.state();
        if state.phase != Phase::Connecting {
            link.handle.close();
            return;
        }
        state.worker = Some(link.handle.clone());
        state.phase = Phase::Ready;
        let queued = std::mem::take(&mut state.queued);
        if !queued.is_empty() {
            tracing::debug!(count = queued.len(), "Flushing queued requests");
        }
        for (id, code) in queued {
            shared.send_to_worker(&mut state, id, code);
        }
    }
    tracing::debug!("Session worker ready");

    stream(&shared, link.messages).await;
}

async fn stream(shared: &Shared, mut messages: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = messages.recv().await {
        if message.message_type() != Some(MessageType::Output) || message.output.is_none() {
            tracing::debug!(message_type = message.r#type, "Ignoring non-output worker message");
            continue;
        }

        let mut state = shared.state();
        if state.phase != Phase::Ready {
            return;
        }
        if !emit(&shared.session, &message) {
            // Browser is gone.
            state.phase = Phase::Unavailable;
            if let Some(worker) = state.worker.take() {
                worker.close();
            }
            return;
        }
        if message.is_done() {
            if let Some(pos) = state.outstanding.iter().position(|id| *id == message.id) {
                state.outstanding.remove(pos);
            }
            metrics::record_execution(MODE, "completed");
        }
    }

    let mut state = shared.state();
    if state.phase == Phase::Ready {
        tracing::warn!("Session worker closed");
        state.phase = Phase::Unavailable;
        state.worker = None;
        for id in std::mem::take(&mut state.outstanding) {
            emit(&shared.session, &Message::output(id, "", "worker connection closed", true));
            metrics::record_execution(MODE, "worker_closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::{browser, context, eventually, next, next_worker, MockConnector};

    #[tokio::test]
    async fn forwards_output_with_worker_ids() {
        let (connector, mut workers) = MockConnector::new();
        let ctx = context(connector);
        let (_session, weak, mut rx) = browser();

        let stateful = StatefulSession::open(&ctx, weak);
        let mut worker = next_worker(&mut workers).await;
        eventually(|| stateful.is_ready()).await;

        stateful.execute("x = 1", 1);
        assert_eq!(worker.requests.recv().await.unwrap(), Message::execute_code(1, "x = 1"));
        assert!(stateful.is_busy());

        worker.reply(Message::output(1, "", "", false));
        worker.reply(Message::output(1, "", "", true));
        assert_eq!(next(&mut rx).await, Message::output(1, "", "", false));
        assert_eq!(next(&mut rx).await, Message::output(1, "", "", true));
        eventually(|| !stateful.is_busy()).await;

        stateful.execute("x", 2);
        assert_eq!(worker.requests.recv().await.unwrap(), Message::execute_code(2, "x"));
        worker.reply(Message::output(2, "1", "", true));
        assert_eq!(next(&mut rx).await, Message::output(2, "1", "", true));
        assert!(ctx.cache.get("x").await.is_none());
    }

    #[tokio::test]
    async fn requests_before_ready_are_queued_in_order() {
        let (connector, mut workers, gate) = MockConnector::gated();
        let ctx = context(connector);
        let (_session, weak, _rx) = browser();

        let stateful = StatefulSession::open(&ctx, weak);
        stateful.execute("a", 1);
        stateful.execute("b", 2);
        assert!(!stateful.is_ready());

        gate.notify_one();
        let mut worker = next_worker(&mut workers).await;
        assert_eq!(worker.requests.recv().await.unwrap(), Message::execute_code(1, "a"));
        assert_eq!(worker.requests.recv().await.unwrap(), Message::execute_code(2, "b"));
        assert!(stateful.is_ready());
        assert!(stateful.is_busy());
    }

    #[tokio::test]
    async fn connect_failure_answers_queued_and_later_requests() {
        let (connector, _workers, gate) = MockConnector::gated();
        connector.set_failing(true);
        let ctx = context(connector);
        let (_session, weak, mut rx) = browser();

        let stateful = StatefulSession::open(&ctx, weak);
        stateful.execute("a", 1);
        gate.notify_one();

        assert_eq!(next(&mut rx).await, Message::connect_failed(1));
        stateful.execute("b", 2);
        assert_eq!(next(&mut rx).await, Message::connect_failed(2));
        assert!(!stateful.is_ready());
        assert!(!stateful.kill());
    }

    #[tokio::test]
    async fn kill_ends_outstanding_request() {
        let (connector, mut workers) = MockConnector::new();
        let ctx = context(connector);
        let (_session, weak, mut rx) = browser();

        let stateful = StatefulSession::open(&ctx, weak);
        let mut worker = next_worker(&mut workers).await;
        eventually(|| stateful.is_ready()).await;

        stateful.execute("while True: pass", 3);
        worker.requests.recv().await.unwrap();

        assert!(stateful.kill());
        assert_eq!(next(&mut rx).await, Message::killed(3));
        assert!(worker.is_closed());
        assert!(stateful.is_killed());
        assert!(!stateful.kill());
    }

    #[tokio::test]
    async fn worker_hang_up_ends_outstanding_request() {
        let (connector, mut workers) = MockConnector::new();
        let ctx = context(connector);
        let (_session, weak, mut rx) = browser();

        let stateful = StatefulSession::open(&ctx, weak);
        let mut worker = next_worker(&mut workers).await;
        eventually(|| stateful.is_ready()).await;

        stateful.execute("exit()", 4);
        worker.requests.recv().await.unwrap();
        worker.hang_up();

        let last = next(&mut rx).await;
        assert_eq!(last.id, 4);
        assert_eq!(last.output.unwrap().stderr, "worker connection closed");

        assert!(stateful.is_finished());
        assert!(!stateful.is_killed());

        stateful.execute("1", 5);
        assert_eq!(next(&mut rx).await, Message::connect_failed(5));
    }
}
