//! Execution gateway subsystem.
//!
//! # Data Flow
//! ```text
//! browser EXECUTE_CODE
//!     → GatewaySession::handle
//!     → stateless: kill previous → cache check → (hit) replay with new id
//!                                              → (miss) claim flight → worker → stream → cache
//!     → stateful:  session worker (queued until ready) → stream
//!     → OUTPUT fragments back to the browser session
//! ```
//!
//! # Design Decisions
//! - Browser sessions are held weakly; the transport owns their lifetime
//! - At most one stateless execution per session; a new request preempts
//! - Every response sequence ends with exactly one `done` fragment

pub mod session;
pub mod stateful;
pub mod stateless;
pub mod worker;
pub mod workers;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::browser::BrowserSession;
use crate::cache::ResultCache;
use crate::config::ExecutionMode;
use crate::protocol::Message;

pub use session::GatewaySession;
pub use stateful::StatefulSession;
pub use stateless::{ExecutionState, StatelessExecution};
pub use worker::{TcpWorkerConnector, WorkerConnector, WorkerEndpoint, WorkerError, WorkerHandle, WorkerLink};
pub use workers::WorkerPool;

/// What every execution needs: the cache, where workers are, and how to reach them.
#[derive(Clone)]
pub struct ExecutionContext {
    pub cache: Arc<ResultCache>,
    pub workers: Arc<WorkerPool>,
    pub connector: Arc<dyn WorkerConnector>,
    pub connect_timeout: Duration,
}

impl ExecutionContext {
    /// Connect to the next worker, bounded by the connect timeout.
    pub async fn connect_worker(&self) -> Result<WorkerLink, WorkerError> {
        let endpoint = self.workers.next().ok_or(WorkerError::NoWorkers)?;
        match tokio::time::timeout(self.connect_timeout, self.connector.connect(&endpoint)).await {
            Ok(result) => result,
            Err(_) => Err(WorkerError::Timeout(endpoint)),
        }
    }
}

/// Deliver `message` to the browser. False once the session is gone.
pub(crate) fn emit(session: &Weak<dyn BrowserSession>, message: &Message) -> bool {
    match session.upgrade() {
        Some(session) => session.send(message).is_ok(),
        None => false,
    }
}

/// Entry point for browser sessions.
pub struct ExecutionGateway {
    ctx: ExecutionContext,
    default_mode: ExecutionMode,
}

impl ExecutionGateway {
    pub fn new(ctx: ExecutionContext, default_mode: ExecutionMode) -> Self {
        Self { ctx, default_mode }
    }

    /// Bind a browser session to the gateway. Stateful sessions start their worker now.
    pub fn open_session(&self, session: Weak<dyn BrowserSession>, mode: ExecutionMode) -> GatewaySession {
        GatewaySession::open(self.ctx.clone(), session, mode)
    }

    pub fn default_mode(&self) -> ExecutionMode {
        self.default_mode
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.ctx.cache
    }

    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.ctx.workers
    }
}
