//! Stateless execution: one request, one short-lived worker, cacheable result.
//!
//! # States
//! ```text
//! Idle → CacheCheck ─ hit ─────────────────────────────→ Done
//!                   └ miss → AwaitingWorkerConnect → Streaming → Done
//!                              │                      │
//!                              └──────── kill ────────┴→ Killed
//! ```
//!
//! The cache check runs inside `start`, so a hit is fully replayed before
//! `start` returns. Everything after a miss runs on a spawned task. The state
//! lives behind a mutex that the task and `kill` both take before talking to
//! the browser, so nothing reaches the browser after the kill fragment.

use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::browser::BrowserSession;
use crate::cache::{Flight, FlightGuard};
use crate::gateway::worker::WorkerHandle;
use crate::gateway::{emit, ExecutionContext};
use crate::observability::metrics;
use crate::protocol::{Message, MessageType};

const MODE: &str = "stateless";

/// Where a stateless execution is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Idle,
    CacheCheck,
    /// Connecting to a worker, or waiting for another execution of the same code.
    AwaitingWorkerConnect,
    Streaming,
    Done,
    Killed,
}

impl ExecutionState {
    fn is_killable(&self) -> bool {
        matches!(self, ExecutionState::AwaitingWorkerConnect | ExecutionState::Streaming)
    }
}

struct Progress {
    state: ExecutionState,
    worker: Option<Arc<dyn WorkerHandle>>,
}

struct Shared {
    id: i64,
    code: String,
    session: Weak<dyn BrowserSession>,
    progress: Mutex<Progress>,
}

impl Shared {
    fn progress(&self) -> std::sync::MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Run `f` with the lock held if the execution is still in `expected`.
    fn if_state<R>(&self, expected: ExecutionState, f: impl FnOnce(&mut Progress) -> R) -> Option<R> {
        let mut progress = self.progress();
        (progress.state == expected).then(|| f(&mut progress))
    }

    fn finish(&self, progress: &mut Progress, outcome: &'static str) {
        progress.state = ExecutionState::Done;
        if let Some(worker) = progress.worker.take() {
            worker.close();
        }
        metrics::record_execution(MODE, outcome);
        tracing::debug!(request_id = self.id, outcome, "Stateless execution finished");
    }

    fn replay(&self, progress: &mut Progress, sequence: &[Message]) {
        for fragment in sequence {
            if !emit(&self.session, &fragment.with_id(self.id)) {
                break;
            }
        }
        self.finish(progress, "cache_hit");
    }
}

/// One browser request executed against a fresh worker connection.
pub struct StatelessExecution {
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for StatelessExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatelessExecution")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl StatelessExecution {
    /// Check the cache, replaying a hit immediately; on a miss, start the worker flow in the background.
    pub async fn start(
        ctx: &ExecutionContext,
        session: Weak<dyn BrowserSession>,
        id: i64,
        code: impl Into<String>,
    ) -> Self {
        let shared = Arc::new(Shared {
            id,
            code: code.into(),
            session,
            progress: Mutex::new(Progress {
                state: ExecutionState::Idle,
                worker: None,
            }),
        });

        shared.progress().state = ExecutionState::CacheCheck;
        if let Some(sequence) = ctx.cache.get(&shared.code).await {
            tracing::debug!(request_id = id, fragments = sequence.len(), "Replaying cached result");
            let mut progress = shared.progress();
            shared.replay(&mut progress, &sequence);
            drop(progress);
            return Self { shared, task: None };
        }

        shared.progress().state = ExecutionState::AwaitingWorkerConnect;
        let task = tokio::spawn(run(ctx.clone(), shared.clone()));
        Self {
            shared,
            task: Some(task),
        }
    }

    pub fn id(&self) -> i64 {
        self.shared.id
    }

    pub fn state(&self) -> ExecutionState {
        self.shared.progress().state
    }

    /// Cancel while connecting or streaming. Sends the `killed` fragment,
    /// closes the worker and discards partial output. Returns false in any other state.
    pub fn kill(&self) -> bool {
        let mut progress = self.shared.progress();
        if !progress.state.is_killable() {
            return false;
        }

        progress.state = ExecutionState::Killed;
        if let Some(worker) = progress.worker.take() {
            worker.close();
        }
        emit(&self.shared.session, &Message::killed(self.shared.id));
        if let Some(task) = &self.task {
            task.abort();
        }
        drop(progress);

        metrics::record_execution(MODE, "killed");
        tracing::info!(request_id = self.shared.id, "Stateless execution killed");
        true
    }
}

async fn run(ctx: ExecutionContext, shared: Arc<Shared>) {
    loop {
        match ctx.cache.claim(&shared.code) {
            Flight::Leader(guard) => {
                execute(&ctx, &shared, guard).await;
                return;
            }
            Flight::Follower(wait) => {
                tracing::debug!(request_id = shared.id, "Waiting on in-flight execution of the same code");
                wait.wait().await;
                if let Some(sequence) = ctx.cache.get(&shared.code).await {
                    shared.if_state(ExecutionState::AwaitingWorkerConnect, |p| shared.replay(p, &sequence));
                    return;
                }
                // The leader produced nothing cacheable; try to lead.
            }
        }
    }
}

async fn execute(ctx: &ExecutionContext, shared: &Shared, _flight: FlightGuard) {
    let link = match ctx.connect_worker().await {
        Ok(link) => link,
        Err(e) => {
            tracing::warn!(request_id = shared.id, error = %e, "Unable to connect to worker");
            shared.if_state(ExecutionState::AwaitingWorkerConnect, |p| {
                emit(&shared.session, &Message::connect_failed(shared.id));
                shared.finish(p, "connect_failed");
            });
            return;
        }
    };

    let started = shared.if_state(ExecutionState::AwaitingWorkerConnect, |p| {
        if let Err(e) = link.handle.send(&Message::execute_code(shared.id, shared.code.clone())) {
            tracing::warn!(request_id = shared.id, error = %e, "Worker rejected request");
            emit(&shared.session, &Message::connect_failed(shared.id));
            link.handle.close();
            shared.finish(p, "connect_failed");
            return false;
        }
        p.worker = Some(link.handle.clone());
        p.state = ExecutionState::Streaming;
        true
    });

    match started {
        Some(true) => {}
        Some(false) => return,
        None => {
            // Killed while connecting.
            link.handle.close();
            return;
        }
    }

    if let Some(sequence) = stream(shared, link.messages).await {
        if ctx.cache.insert_if_absent(&shared.code, sequence).await {
            tracing::debug!(request_id = shared.id, "Cached execution result");
        }
    }
}

/// Forward worker output until `done`. Returns the full sequence if it completed.
async fn stream(shared: &Shared, mut messages: mpsc::UnboundedReceiver<Message>) -> Option<Vec<Message>> {
    let mut buffer = Vec::new();

    while let Some(message) = messages.recv().await {
        let Some(output) = message.output.as_ref().filter(|_| message.message_type() == Some(MessageType::Output)) else {
            tracing::debug!(request_id = shared.id, message_type = message.r#type, "Ignoring non-output worker message");
            continue;
        };
        let fragment = Message::output(message.id, output.stdout.clone(), output.stderr.clone(), output.done);

        let outcome = shared.if_state(ExecutionState::Streaming, |p| {
            if !emit(&shared.session, &fragment) {
                shared.finish(p, "abandoned");
                return Some(false);
            }
            if fragment.is_done() {
                shared.finish(p, "completed");
                return Some(true);
            }
            None
        })?;

        buffer.push(fragment);
        match outcome {
            Some(true) => return Some(buffer),
            Some(false) => return None,
            None => {}
        }
    }

    shared.if_state(ExecutionState::Streaming, |p| {
        tracing::warn!(request_id = shared.id, "Worker closed before finishing");
        emit(&shared.session, &Message::output(shared.id, "", "worker connection closed", true));
        shared.finish(p, "worker_closed");
    });
    None
}
