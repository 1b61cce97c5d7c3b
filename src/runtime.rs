//! Agent runtime: hosts instances, routes messages and correlates calls
//!
//! Every registered agent gets a bounded inbox and exactly one mailbox loop
//! that processes messages in arrival order, one at a time. Different agents
//! run concurrently. [`Runtime::call`] layers a blocking request/response on
//! top of the mailboxes: the reply slot is registered under the request id and
//! the matching response bypasses every inbox.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::agent::{AgentConfig, AgentHandle, AgentHandler, AgentInstance, Tool};
use crate::bus::EventBus;
use crate::config::RuntimeConfig;
use crate::error::{AgentError, RuntimeError};
use crate::protocol::{AgentId, Message, MessageType, ACTION_EXECUTE_TASK, ACTION_TASK_RESULT};

/// Wall clock in epoch milliseconds
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

fn system_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().timestamp_millis())
}

struct RuntimeInner {
    config: RuntimeConfig,
    agents: RwLock<HashMap<AgentId, AgentHandle>>,
    global_tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    /// Context of each outstanding call, handed to the handler serving it
    request_tokens: Mutex<HashMap<String, CancellationToken>>,
    bus: EventBus,
    clock: Clock,
    last_timestamp: AtomicI64,
    root: CancellationToken,
}

/// The agent runtime
///
/// Cheap to clone; all clones share the same agents and pending calls.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    /// Runtime with an injected wall clock
    pub fn with_clock(config: RuntimeConfig, clock: Clock) -> Self {
        let bus = EventBus::new(config.bus_buffer);
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                agents: RwLock::new(HashMap::new()),
                global_tools: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                request_tokens: Mutex::new(HashMap::new()),
                bus,
                clock,
                last_timestamp: AtomicI64::new(0),
                root: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Event bus shared with observers
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Start an agent with its own inbox and mailbox loop
    ///
    /// The instance is addressed as `agent_<config.id>`. Registering the same
    /// id again stops the previous instance.
    pub fn register_detached_agent(
        &self,
        config: AgentConfig,
        handler: Arc<dyn AgentHandler>,
    ) -> AgentHandle {
        let id = config.agent_id();
        let token = self.inner.root.child_token();
        let (handle, instance, inbox) =
            AgentHandle::create(id.clone(), config, self.inner.config.mailbox_capacity, token);

        let previous = self.inner.agents.write().insert(id.clone(), handle.clone());
        if let Some(previous) = previous {
            warn!(agent_id = %id, "Replacing running agent instance");
            previous.stop();
        }

        tokio::spawn(run_agent_loop(self.clone(), instance, inbox, handler));

        info!(agent_id = %id, name = %handle.config().name, "Registered agent");
        handle
    }

    /// Stop an agent and forget it
    pub fn unregister_agent(&self, id: &AgentId) -> Result<(), RuntimeError> {
        let handle = self
            .inner
            .agents
            .write()
            .remove(id)
            .ok_or_else(|| RuntimeError::AgentNotFound(id.clone()))?;
        handle.stop();
        info!(agent_id = %id, "Unregistered agent");
        Ok(())
    }

    pub fn agent(&self, id: &AgentId) -> Option<AgentHandle> {
        self.inner.agents.read().get(id).cloned()
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.inner.agents.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn agent_count(&self) -> usize {
        self.inner.agents.read().len()
    }

    /// Number of calls awaiting a reply
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Make a tool available for granting
    pub fn register_global_tool(&self, name: impl Into<String>, tool: impl Tool + 'static) {
        let name = name.into();
        debug!(tool = %name, "Registered global tool");
        self.inner.global_tools.write().insert(name, Arc::new(tool));
    }

    /// Grant a registered tool to an agent
    pub fn grant_tool(
        &self,
        admin: &AgentId,
        target: &AgentId,
        name: &str,
    ) -> Result<(), RuntimeError> {
        let handle = self
            .agent(target)
            .ok_or_else(|| RuntimeError::AgentNotFound(target.clone()))?;
        let tool = self
            .inner
            .global_tools
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::ToolNotFound(name.to_string()))?;

        handle.grant(name, tool);
        info!(admin = %admin, agent_id = %target, tool = %name, "Granted tool");
        Ok(())
    }

    /// Deliver a message without waiting
    ///
    /// A response or error whose id matches a pending call goes straight to
    /// that caller. Anything else is enqueued on the target inbox; a full
    /// inbox fails immediately.
    pub fn send_message(&self, msg: Message) -> Result<(), RuntimeError> {
        let msg = match self.deliver_pending(msg) {
            None => return Ok(()),
            Some(msg) => msg,
        };

        let target = self
            .agent(&msg.to)
            .ok_or_else(|| RuntimeError::AgentNotFound(msg.to.clone()))?;
        target.try_deliver(msg)
    }

    /// Send a request and wait for its response
    ///
    /// Returns [`RuntimeError::Cancelled`] if `token` fires first. The pending
    /// entry is removed on every exit path, including the future being dropped,
    /// and the handler serving the request sees its context cancelled.
    #[instrument(skip_all, fields(from = %from, to = %to, action = %action))]
    pub async fn call(
        &self,
        token: &CancellationToken,
        from: &AgentId,
        to: &AgentId,
        action: &str,
        payload: Value,
    ) -> Result<Message, RuntimeError> {
        let mut request = Message::request(from.clone(), to.clone(), action, payload);
        request.timestamp = self.next_timestamp();

        let (tx, rx) = oneshot::channel();
        let _slot = PendingSlot::register(&self.inner, request.id.clone(), tx, token.child_token());

        self.send_message(request)?;

        tokio::select! {
            biased;
            reply = rx => reply.map_err(|_| RuntimeError::ReplyDropped),
            _ = token.cancelled() => {
                debug!("Call cancelled before reply");
                Err(RuntimeError::Cancelled)
            }
        }
    }

    /// [`Runtime::call`] with a deadline
    pub async fn call_with_timeout(
        &self,
        timeout: Duration,
        token: &CancellationToken,
        from: &AgentId,
        to: &AgentId,
        action: &str,
        payload: Value,
    ) -> Result<Message, RuntimeError> {
        tokio::time::timeout(timeout, self.call(token, from, to, action, payload))
            .await
            .unwrap_or(Err(RuntimeError::Timeout(timeout)))
    }

    /// Fire-and-forget `execute_task` request; returns the message id
    ///
    /// The reply lands in the sender's inbox rather than a pending slot.
    pub fn dispatch_task(
        &self,
        from: &AgentId,
        to: &AgentId,
        content: &str,
    ) -> Result<String, RuntimeError> {
        let mut msg = Message::request(
            from.clone(),
            to.clone(),
            ACTION_EXECUTE_TASK,
            json!({ "content": content }),
        );
        msg.timestamp = self.next_timestamp();
        let id = msg.id.clone();
        self.send_message(msg)?;
        Ok(id)
    }

    /// Strictly increasing timestamp: wall-clock millis scaled by 10^6 with a
    /// logical tie-break
    pub fn next_timestamp(&self) -> i64 {
        let candidate = (self.inner.clock)().saturating_mul(1_000_000);
        let previous = self
            .inner
            .last_timestamp
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(candidate.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        candidate.max(previous + 1)
    }

    /// Stop every agent loop
    pub fn shutdown(&self) {
        info!(agents = self.agent_count(), "Shutting down runtime");
        self.inner.root.cancel();
        self.inner.agents.write().clear();
    }

    /// Context of the call waiting on `request_id`, if it is still waiting
    fn request_token(&self, request_id: &str) -> Option<CancellationToken> {
        self.inner.request_tokens.lock().get(request_id).cloned()
    }

    /// Hand a terminal message to its waiting caller; gives it back otherwise
    fn deliver_pending(&self, msg: Message) -> Option<Message> {
        if !msg.is_terminal() || msg.id.is_empty() {
            return Some(msg);
        }
        let slot = self.inner.pending.lock().remove(&msg.id);
        match slot {
            Some(slot) => {
                if slot.send(msg).is_err() {
                    debug!("Caller went away before its reply arrived");
                }
                None
            }
            None => Some(msg),
        }
    }

    fn finish_reply(
        &self,
        agent: &AgentId,
        request: &Message,
        outcome: Result<Message, AgentError>,
    ) -> Message {
        match outcome {
            Ok(mut reply) => {
                reply.id = request.id.clone();
                reply.from = agent.clone();
                reply.to = request.from.clone();
                reply.kind = MessageType::Response;
                if reply.action.is_empty() {
                    reply.action = ACTION_TASK_RESULT.to_string();
                }
                if reply.trace.trace_id.is_empty() {
                    reply.trace = request.trace.child();
                }
                if reply.timestamp == 0 {
                    reply.timestamp = self.next_timestamp();
                }
                reply
            }
            Err(e) => {
                debug!(agent_id = %agent, error = %e, "Handler failed");
                let mut reply = Message::reply_to(request);
                reply.from = agent.clone();
                reply.payload = json!({ "error": e.to_string() });
                reply.timestamp = self.next_timestamp();
                reply
            }
        }
    }
}

/// Removes a pending entry when the waiting call ends, however it ends, and
/// cancels the request's context
struct PendingSlot<'a> {
    inner: &'a RuntimeInner,
    id: String,
    token: CancellationToken,
}

impl<'a> PendingSlot<'a> {
    fn register(
        inner: &'a RuntimeInner,
        id: String,
        tx: oneshot::Sender<Message>,
        token: CancellationToken,
    ) -> Self {
        inner.pending.lock().insert(id.clone(), tx);
        inner.request_tokens.lock().insert(id.clone(), token.clone());
        Self { inner, id, token }
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.inner.pending.lock().remove(&self.id);
        self.inner.request_tokens.lock().remove(&self.id);
        self.token.cancel();
    }
}

async fn run_agent_loop(
    runtime: Runtime,
    mut agent: AgentInstance,
    mut inbox: mpsc::Receiver<Message>,
    handler: Arc<dyn AgentHandler>,
) {
    let token = agent.token().clone();
    let agent_id = agent.id.clone();
    debug!(agent_id = %agent_id, "Agent loop started");

    loop {
        let msg = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            msg = inbox.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        match msg.kind {
            MessageType::Request => {
                // Fire-and-forget requests have no caller context
                let request = runtime.request_token(&msg.id);
                let caller_gone = request.clone().unwrap_or_default();
                agent.begin_request(request);

                let outcome = tokio::select! {
                    outcome = handler.handle(&runtime, &mut agent, msg.clone()) => Some(outcome),
                    _ = token.cancelled() => Some(Err(AgentError::Failed(format!("agent {agent_id} stopped")))),
                    _ = caller_gone.cancelled() => None,
                };
                agent.end_request();

                match outcome {
                    Some(outcome) => {
                        let reply = runtime.finish_reply(&agent_id, &msg, outcome);
                        if let Err(e) = runtime.send_message(reply) {
                            warn!(agent_id = %agent_id, error = %e, "Failed to deliver reply");
                        }
                    }
                    None => debug!(agent_id = %agent_id, request_id = %msg.id, "Caller gave up; request abandoned"),
                }
            }
            MessageType::Response | MessageType::Error => {
                if runtime.deliver_pending(msg).is_some() {
                    debug!(agent_id = %agent_id, "Dropping response with no pending call");
                }
            }
            MessageType::Notification | MessageType::StreamChunk => {
                if let Err(e) = handler.notify(&runtime, &mut agent, msg).await {
                    warn!(agent_id = %agent_id, error = %e, "Notification handler failed");
                }
            }
        }

        if token.is_cancelled() {
            break;
        }
    }

    debug!(agent_id = %agent_id, "Agent loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::FnTool;
    use crate::handlers::CommandHandler;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn uppercase_tool() -> FnTool<impl Fn(Value) -> Result<Value, AgentError> + Send + Sync + 'static> {
        FnTool::new(|args: Value| {
            let text = args["text"].as_str().unwrap_or_default();
            Ok(Value::String(text.to_uppercase()))
        })
    }

    fn content(text: &str) -> Value {
        json!({ "content": text })
    }

    async fn exec(runtime: &Runtime, from: &AgentId, to: &AgentId, text: &str) -> Message {
        let token = CancellationToken::new();
        runtime
            .call_with_timeout(TIMEOUT, &token, from, to, ACTION_EXECUTE_TASK, content(text))
            .await
            .unwrap()
    }

    fn two_agents(runtime: &Runtime) -> (AgentHandle, AgentHandle) {
        let a = runtime.register_detached_agent(
            AgentConfig::new("1", "A").with_mode("chat"),
            Arc::new(CommandHandler),
        );
        let b = runtime.register_detached_agent(
            AgentConfig::new("2", "B").with_mode("chat"),
            Arc::new(CommandHandler),
        );
        (a, b)
    }

    /// Reports each request id, then blocks until released
    struct GateHandler {
        started: mpsc::UnboundedSender<String>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl AgentHandler for GateHandler {
        async fn handle(
            &self,
            _runtime: &Runtime,
            agent: &mut AgentInstance,
            msg: Message,
        ) -> Result<Message, AgentError> {
            let _ = self.started.send(msg.id.clone());
            tokio::select! {
                _ = self.release.notified() => {}
                _ = agent.token().cancelled() => {}
            }
            Ok(Message::result(json!({ "result": "released" })))
        }
    }

    /// Records the order of the requests it sees
    struct OrderHandler {
        seen: Arc<Mutex<Vec<i64>>>,
    }

    #[async_trait]
    impl AgentHandler for OrderHandler {
        async fn handle(
            &self,
            _runtime: &Runtime,
            _agent: &mut AgentInstance,
            msg: Message,
        ) -> Result<Message, AgentError> {
            let n = msg.payload["n"].as_i64().unwrap_or_default();
            tokio::task::yield_now().await;
            self.seen.lock().push(n);
            Ok(Message::result(json!({ "result": n })))
        }
    }

    #[tokio::test]
    async fn test_register_detached_agent() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let (a, b) = two_agents(&runtime);

        assert_eq!(a.id().as_str(), "agent_1");
        assert_eq!(b.id().as_str(), "agent_2");
        assert_eq!(runtime.agent_count(), 2);
        assert_eq!(runtime.agent_ids(), vec![a.id().clone(), b.id().clone()]);
    }

    #[tokio::test]
    async fn test_memory_isolation() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let (a, b) = two_agents(&runtime);

        exec(&runtime, a.id(), a.id(), "remember apple").await;
        exec(&runtime, a.id(), b.id(), "remember banana").await;

        let recall_a = exec(&runtime, a.id(), a.id(), "recall").await;
        let recall_b = exec(&runtime, a.id(), b.id(), "recall").await;

        assert_eq!(recall_a.result_text(), Some("apple"));
        assert_eq!(recall_b.result_text(), Some("banana"));
    }

    #[tokio::test]
    async fn test_tool_authorization() {
        let runtime = Runtime::new(RuntimeConfig::default());
        runtime.register_global_tool("uppercase", uppercase_tool());
        let (a, b) = two_agents(&runtime);

        runtime.grant_tool(a.id(), b.id(), "uppercase").unwrap();
        assert_eq!(b.granted_tools(), vec!["uppercase".to_string()]);

        let granted = exec(&runtime, a.id(), b.id(), "use uppercase hello").await;
        assert_eq!(granted.result_text(), Some("HELLO"));

        let denied = exec(&runtime, a.id(), a.id(), "use uppercase hello").await;
        assert_eq!(denied.kind, MessageType::Response);
        assert!(denied.error_text().unwrap().contains("not granted"));
    }

    #[tokio::test]
    async fn test_grant_unknown_tool_or_agent() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let (a, _b) = two_agents(&runtime);

        let err = runtime.grant_tool(a.id(), a.id(), "missing").unwrap_err();
        assert!(matches!(err, RuntimeError::ToolNotFound(_)));

        runtime.register_global_tool("uppercase", uppercase_tool());
        let err = runtime
            .grant_tool(a.id(), &AgentId::new("agent_9"), "uppercase")
            .unwrap_err();
        assert!(matches!(err, RuntimeError::AgentNotFound(_)));
    }

    #[tokio::test]
    async fn test_dispatch_through_call() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let (a, b) = two_agents(&runtime);

        exec(&runtime, a.id(), b.id(), "remember banana").await;
        let dispatched = exec(&runtime, a.id(), a.id(), &format!("dispatch {} recall", b.id())).await;

        assert_eq!(dispatched.result_text(), Some("banana"));
        assert_eq!(runtime.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_response_echoes_request_id() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let (a, b) = two_agents(&runtime);

        let reply = exec(&runtime, a.id(), b.id(), "hello").await;
        assert_eq!(reply.kind, MessageType::Response);
        assert_eq!(reply.action, ACTION_TASK_RESULT);
        assert_eq!(reply.from, *b.id());
        assert_eq!(reply.to, *a.id());
        assert_eq!(reply.result_text(), Some("echo: hello"));
        assert!(reply.timestamp > 0);
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let token = CancellationToken::new();

        let err = runtime
            .call(&token, &AgentId::new("tester"), &AgentId::new("agent_404"), ACTION_EXECUTE_TASK, Value::Null)
            .await
            .unwrap_err();

        assert!(matches!(err, RuntimeError::AgentNotFound(_)));
        assert_eq!(runtime.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_call_releases_pending_slot() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let release = Arc::new(Notify::new());
        let agent = runtime.register_detached_agent(
            AgentConfig::new("gate", "gate"),
            Arc::new(GateHandler { started: started_tx, release: Arc::clone(&release) }),
        );

        let caller = AgentId::new("tester");
        let token = CancellationToken::new();
        let call = {
            let runtime = runtime.clone();
            let token = token.clone();
            let caller = caller.clone();
            let target = agent.id().clone();
            tokio::spawn(async move {
                runtime.call(&token, &caller, &target, ACTION_EXECUTE_TASK, Value::Null).await
            })
        };

        let request_id = started_rx.recv().await.unwrap();
        assert_eq!(runtime.pending_calls(), 1);
        token.cancel();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RuntimeError::Cancelled));
        assert_eq!(runtime.pending_calls(), 0);

        // A late response carrying the real call id has nowhere to go
        let mut late = Message::result(json!({ "result": "late" }));
        late.id = request_id;
        late.to = caller.clone();
        let err = runtime.send_message(late).unwrap_err();
        assert!(matches!(err, RuntimeError::AgentNotFound(ref id) if *id == caller));
        assert_eq!(runtime.pending_calls(), 0);

        // The handler saw its context cancelled and the agent is free again
        let next = {
            let runtime = runtime.clone();
            let target = agent.id().clone();
            tokio::spawn(async move {
                runtime
                    .call_with_timeout(TIMEOUT, &CancellationToken::new(), &caller, &target, ACTION_EXECUTE_TASK, Value::Null)
                    .await
            })
        };
        assert!(started_rx.recv().await.is_some());
        release.notify_one();
        let reply = next.await.unwrap().unwrap();
        assert_eq!(reply.result_text(), Some("released"));
    }

    #[tokio::test]
    async fn test_cancelling_outer_call_cancels_nested_dispatch() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let release = Arc::new(Notify::new());
        let dispatcher = runtime.register_detached_agent(AgentConfig::new("1", "A"), Arc::new(CommandHandler));
        let stuck = runtime.register_detached_agent(
            AgentConfig::new("gate", "gate"),
            Arc::new(GateHandler { started: started_tx, release: Arc::clone(&release) }),
        );
        let caller = AgentId::new("tester");

        let token = CancellationToken::new();
        let outer = {
            let runtime = runtime.clone();
            let token = token.clone();
            let caller = caller.clone();
            let target = dispatcher.id().clone();
            let command = content(&format!("dispatch {} recall", stuck.id()));
            tokio::spawn(async move {
                runtime.call(&token, &caller, &target, ACTION_EXECUTE_TASK, command).await
            })
        };

        started_rx.recv().await.unwrap();
        assert_eq!(runtime.pending_calls(), 2);
        token.cancel();

        let err = outer.await.unwrap().unwrap_err();
        assert!(matches!(err, RuntimeError::Cancelled));
        tokio::time::timeout(TIMEOUT, async {
            while runtime.pending_calls() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("nested call slot was not released");

        let recall = exec(&runtime, &caller, dispatcher.id(), "recall").await;
        assert_eq!(recall.result_text(), Some(""));

        let next = {
            let runtime = runtime.clone();
            let target = stuck.id().clone();
            tokio::spawn(async move {
                runtime
                    .call_with_timeout(TIMEOUT, &CancellationToken::new(), &caller, &target, ACTION_EXECUTE_TASK, Value::Null)
                    .await
            })
        };
        started_rx.recv().await.unwrap();
        release.notify_one();
        assert_eq!(next.await.unwrap().unwrap().result_text(), Some("released"));
    }

    #[tokio::test]
    async fn test_late_reply_after_cancel_is_not_delivered() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let release = Arc::new(Notify::new());
        let agent = runtime.register_detached_agent(
            AgentConfig::new("gate", "gate"),
            Arc::new(GateHandler { started: started_tx, release: Arc::clone(&release) }),
        );

        let token = CancellationToken::new();
        token.cancel();
        let err = runtime
            .call(&token, &AgentId::new("tester"), agent.id(), ACTION_EXECUTE_TASK, Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Cancelled));
        assert_eq!(runtime.pending_calls(), 0);

        // The handler still runs; its reply finds no slot and no agent "tester"
        let request_id = started_rx.recv().await.unwrap();
        release.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runtime.pending_calls(), 0);
        assert!(agent.is_running());

        let mut late = Message::result(json!({ "result": "late" }));
        late.id = request_id;
        late.to = AgentId::new("tester");
        let err = runtime.send_message(late).unwrap_err();
        assert!(matches!(err, RuntimeError::AgentNotFound(ref id) if id.as_str() == "tester"));
        assert_eq!(runtime.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_timeout_releases_pending_slot() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let (started_tx, _started_rx) = mpsc::unbounded_channel();
        let agent = runtime.register_detached_agent(
            AgentConfig::new("gate", "gate"),
            Arc::new(GateHandler { started: started_tx, release: Arc::new(Notify::new()) }),
        );

        let token = CancellationToken::new();
        let err = runtime
            .call_with_timeout(
                Duration::from_millis(50),
                &token,
                &AgentId::new("tester"),
                agent.id(),
                ACTION_EXECUTE_TASK,
                Value::Null,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RuntimeError::Timeout(_)));
        assert_eq!(runtime.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_full_mailbox_fails_fast() {
        let runtime = Runtime::new(RuntimeConfig { mailbox_capacity: 1, ..Default::default() });
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let release = Arc::new(Notify::new());
        let agent = runtime.register_detached_agent(
            AgentConfig::new("gate", "gate"),
            Arc::new(GateHandler { started: started_tx, release: Arc::clone(&release) }),
        );
        let from = AgentId::new("tester");

        runtime.dispatch_task(&from, agent.id(), "first").unwrap();
        started_rx.recv().await.unwrap();

        runtime.dispatch_task(&from, agent.id(), "second").unwrap();
        let err = runtime.dispatch_task(&from, agent.id(), "third").unwrap_err();
        assert!(matches!(err, RuntimeError::MailboxFull(_)));
        assert!(err.to_string().contains("inbox full"));

        release.notify_one();
    }

    #[tokio::test]
    async fn test_fifo_per_agent() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let agent = runtime.register_detached_agent(
            AgentConfig::new("order", "order"),
            Arc::new(OrderHandler { seen: Arc::clone(&seen) }),
        );
        let from = AgentId::new("tester");

        for n in 0..20 {
            let msg = Message::request(from.clone(), agent.id().clone(), ACTION_EXECUTE_TASK, json!({ "n": n }));
            runtime.send_message(msg).unwrap();
        }
        let last = exec(&runtime, &from, agent.id(), "").await;
        assert!(last.error_text().is_none());

        let seen = seen.lock().clone();
        assert_eq!(seen[..20], (0..20).collect::<Vec<i64>>()[..]);
    }

    #[tokio::test]
    async fn test_agents_run_concurrently() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let release = Arc::new(Notify::new());
        let blocked = runtime.register_detached_agent(
            AgentConfig::new("gate", "gate"),
            Arc::new(GateHandler { started: started_tx, release: Arc::clone(&release) }),
        );
        let (a, _b) = two_agents(&runtime);
        let from = AgentId::new("tester");

        runtime.dispatch_task(&from, blocked.id(), "hold").unwrap();
        started_rx.recv().await.unwrap();

        let reply = exec(&runtime, &from, a.id(), "still responsive").await;
        assert_eq!(reply.result_text(), Some("echo: still responsive"));
        release.notify_one();
    }

    #[tokio::test]
    async fn test_unregister_stops_agent() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let (a, b) = two_agents(&runtime);

        runtime.unregister_agent(b.id()).unwrap();
        assert!(!b.is_running());
        assert_eq!(runtime.agent_count(), 1);

        let token = CancellationToken::new();
        let err = runtime
            .call(&token, a.id(), b.id(), ACTION_EXECUTE_TASK, content("recall"))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::AgentNotFound(_)));

        assert!(runtime.unregister_agent(b.id()).is_err());
    }

    #[tokio::test]
    async fn test_reregister_replaces_instance() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let (a, _b) = two_agents(&runtime);
        exec(&runtime, a.id(), a.id(), "remember apple").await;

        let fresh = runtime.register_detached_agent(AgentConfig::new("1", "A"), Arc::new(CommandHandler));
        assert!(!a.is_running());

        let recall = exec(&runtime, fresh.id(), fresh.id(), "recall").await;
        assert_eq!(recall.result_text(), Some(""));
    }

    #[tokio::test]
    async fn test_shutdown_stops_all_loops() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let (a, b) = two_agents(&runtime);

        runtime.shutdown();
        assert!(!a.is_running());
        assert!(!b.is_running());
        assert_eq!(runtime.agent_count(), 0);
    }

    #[test]
    fn test_timestamps_strictly_increase_with_frozen_clock() {
        let runtime = Runtime::with_clock(RuntimeConfig::default(), Arc::new(|| 1_700_000_000_000));
        let first = runtime.next_timestamp();
        let second = runtime.next_timestamp();
        assert_eq!(first, 1_700_000_000_000 * 1_000_000);
        assert_eq!(second, first + 1);
    }

    #[test]
    fn test_timestamps_survive_clock_going_backwards() {
        let now = Arc::new(AtomicI64::new(2_000));
        let clock_now = Arc::clone(&now);
        let runtime = Runtime::with_clock(
            RuntimeConfig::default(),
            Arc::new(move || clock_now.load(Ordering::SeqCst)),
        );

        let before = runtime.next_timestamp();
        now.store(1_000, Ordering::SeqCst);
        assert!(runtime.next_timestamp() > before);
    }

    #[test]
    fn test_timestamps_unique_across_threads() {
        let runtime = Runtime::with_clock(RuntimeConfig::default(), Arc::new(|| 5));
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let runtime = runtime.clone();
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    let stamps: Vec<i64> = (0..250).map(|_| runtime.next_timestamp()).collect();
                    counter.fetch_add(stamps.len(), Ordering::SeqCst);
                    stamps
                })
            })
            .collect();

        let mut all: Vec<i64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), counter.load(Ordering::SeqCst));
    }
}
