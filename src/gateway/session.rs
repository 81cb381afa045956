//! Per-browser routing of execute requests.

use std::sync::Weak;

use uuid::Uuid;

use crate::browser::BrowserSession;
use crate::config::ExecutionMode;
use crate::gateway::stateful::StatefulSession;
use crate::gateway::stateless::StatelessExecution;
use crate::gateway::ExecutionContext;
use crate::protocol::{Message, MessageType};

/// Gateway state for one browser session.
///
/// `handle` takes `&mut self`, so requests from one browser are processed one
/// at a time in arrival order.
pub struct GatewaySession {
    ctx: ExecutionContext,
    session: Weak<dyn BrowserSession>,
    mode: ExecutionMode,
    current: Option<StatelessExecution>,
    stateful: Option<StatefulSession>,
}

impl GatewaySession {
    pub(crate) fn open(ctx: ExecutionContext, session: Weak<dyn BrowserSession>, mode: ExecutionMode) -> Self {
        let stateful = match mode {
            ExecutionMode::Stateful => Some(StatefulSession::open(&ctx, session.clone())),
            ExecutionMode::Stateless => None,
        };
        Self {
            ctx,
            session,
            mode,
            current: None,
            stateful,
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    fn session_id(&self) -> Option<Uuid> {
        self.session.upgrade().map(|s| s.id())
    }

    /// Route one inbound browser message.
    pub async fn handle(&mut self, message: Message) {
        let Some(code) = message.code().filter(|_| message.message_type() == Some(MessageType::ExecuteCode)) else {
            tracing::debug!(
                session_id = ?self.session_id(),
                message_type = message.r#type,
                "Ignoring browser message"
            );
            return;
        };
        let code = code.to_string();

        tracing::info!(session_id = ?self.session_id(), request_id = message.id, mode = self.mode.as_str(), "Execute request");
        match self.mode {
            ExecutionMode::Stateless => self.execute_stateless(message.id, code).await,
            ExecutionMode::Stateful => self.execute_stateful(message.id, code),
        }
    }

    async fn execute_stateless(&mut self, id: i64, code: String) {
        if let Some(previous) = self.current.take() {
            if previous.kill() {
                tracing::debug!(request_id = previous.id(), preempted_by = id, "Preempted running execution");
            }
        }
        self.current = Some(StatelessExecution::start(&self.ctx, self.session.clone(), id, code).await);
    }

    fn execute_stateful(&mut self, id: i64, code: String) {
        // A killed or broken session is replaced so the browser can keep working.
        if self.stateful.as_ref().map_or(true, |s| s.is_finished()) {
            self.stateful = Some(StatefulSession::open(&self.ctx, self.session.clone()));
        }
        if let Some(stateful) = &self.stateful {
            stateful.execute(code, id);
        }
    }

    /// Kill whatever is running for this session.
    pub fn kill(&mut self) -> bool {
        let stateless = self.current.as_ref().is_some_and(|e| e.kill());
        let stateful = self.stateful.as_ref().is_some_and(|s| s.kill());
        stateless || stateful
    }

    /// Kill anything in flight and release the session worker.
    pub fn close(&mut self) {
        self.kill();
        self.current = None;
        self.stateful = None;
    }
}

impl Drop for GatewaySession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::{browser, context, eventually, next, next_worker, MockConnector};
    use crate::gateway::ExecutionGateway;

    #[tokio::test]
    async fn new_request_preempts_running_one() {
        let (connector, mut workers) = MockConnector::new();
        let gateway = ExecutionGateway::new(context(connector), ExecutionMode::Stateless);
        let (_browser, weak, mut rx) = browser();
        let mut session = gateway.open_session(weak, ExecutionMode::Stateless);

        session.handle(Message::execute_code(1, "sleep(10)")).await;
        let first = next_worker(&mut workers).await;
        first.reply(Message::output(1, "tick", "", false));
        assert_eq!(next(&mut rx).await.output.unwrap().stdout, "tick");

        session.handle(Message::execute_code(2, "1+1")).await;
        assert_eq!(next(&mut rx).await, Message::killed(1));
        assert!(first.is_closed());

        let mut second = next_worker(&mut workers).await;
        assert_eq!(second.requests.recv().await.unwrap(), Message::execute_code(2, "1+1"));
        second.reply(Message::output(2, "2", "", true));
        assert_eq!(next(&mut rx).await, Message::output(2, "2", "", true));

        assert!(gateway.cache().get("sleep(10)").await.is_none());
    }

    #[tokio::test]
    async fn preempting_a_finished_execution_sends_nothing_extra() {
        let (connector, mut workers) = MockConnector::new();
        let gateway = ExecutionGateway::new(context(connector), ExecutionMode::Stateless);
        let (_browser, weak, mut rx) = browser();
        let mut session = gateway.open_session(weak, ExecutionMode::Stateless);

        session.handle(Message::execute_code(1, "a")).await;
        let worker = next_worker(&mut workers).await;
        worker.reply(Message::output(1, "A", "", true));
        assert!(next(&mut rx).await.is_done());
        eventually(|| worker.is_closed()).await;

        session.handle(Message::execute_code(2, "b")).await;
        let _second = next_worker(&mut workers).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_execute_messages_are_ignored() {
        let (connector, _workers) = MockConnector::new();
        let gateway = ExecutionGateway::new(context(connector.clone()), ExecutionMode::Stateless);
        let (_browser, weak, mut rx) = browser();
        let mut session = gateway.open_session(weak, ExecutionMode::Stateless);

        session.handle(Message::output(1, "x", "", true)).await;
        assert_eq!(connector.connects(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stateful_session_replaced_after_kill() {
        let (connector, mut workers) = MockConnector::new();
        let gateway = ExecutionGateway::new(context(connector.clone()), ExecutionMode::Stateful);
        let (_browser, weak, mut rx) = browser();
        let mut session = gateway.open_session(weak, ExecutionMode::Stateful);

        let mut first = next_worker(&mut workers).await;
        session.handle(Message::execute_code(1, "x = 1")).await;
        first.requests.recv().await.unwrap();

        assert!(session.kill());
        assert_eq!(next(&mut rx).await, Message::killed(1));

        session.handle(Message::execute_code(2, "x")).await;
        let mut second = next_worker(&mut workers).await;
        assert_eq!(second.requests.recv().await.unwrap(), Message::execute_code(2, "x"));
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn stateful_session_replaced_after_worker_hang_up() {
        let (connector, mut workers) = MockConnector::new();
        let gateway = ExecutionGateway::new(context(connector.clone()), ExecutionMode::Stateful);
        let (_browser, weak, mut rx) = browser();
        let mut session = gateway.open_session(weak, ExecutionMode::Stateful);

        let mut first = next_worker(&mut workers).await;
        session.handle(Message::execute_code(1, "exit()")).await;
        first.requests.recv().await.unwrap();
        first.hang_up();
        assert_eq!(next(&mut rx).await.output.unwrap().stderr, "worker connection closed");

        session.handle(Message::execute_code(2, "x = 1")).await;
        let mut second = next_worker(&mut workers).await;
        assert_eq!(second.requests.recv().await.unwrap(), Message::execute_code(2, "x = 1"));
        second.reply(Message::output(2, "", "", true));
        assert_eq!(next(&mut rx).await, Message::output(2, "", "", true));
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn close_kills_in_flight_execution() {
        let (connector, mut workers) = MockConnector::new();
        let gateway = ExecutionGateway::new(context(connector), ExecutionMode::Stateless);
        let (_browser, weak, mut rx) = browser();
        let mut session = gateway.open_session(weak, ExecutionMode::Stateless);

        session.handle(Message::execute_code(1, "forever")).await;
        let worker = next_worker(&mut workers).await;
        drop(session);

        assert_eq!(next(&mut rx).await, Message::killed(1));
        eventually(|| worker.is_closed()).await;
    }
}
