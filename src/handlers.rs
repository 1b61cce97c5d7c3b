//! Built-in agent handlers
//!
//! [`ActionTable`] dispatches on the message action to per-action handlers.
//! [`CommandHandler`] interprets a small text command language against the
//! agent's private memory, its granted tools and other agents:
//!
//! | command | effect |
//! |---|---|
//! | `remember <text>` | append to memory |
//! | `recall` | memory joined by newlines |
//! | `use <tool> <text>` | invoke a granted tool with `{"text": ...}` |
//! | `dispatch <agent> <command>` | forward a command to another agent |
//! | anything else | `echo: <text>` |

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::agent::{AgentHandler, AgentInstance};
use crate::error::AgentError;
use crate::protocol::{AgentId, Message, ACTION_EXECUTE_TASK};
use crate::runtime::Runtime;

/// Routes each request to the handler registered for its action
#[derive(Default, Clone)]
pub struct ActionTable {
    actions: HashMap<String, Arc<dyn AgentHandler>>,
    fallback: Option<Arc<dyn AgentHandler>>,
}

impl ActionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, action: impl Into<String>, handler: Arc<dyn AgentHandler>) -> Self {
        self.actions.insert(action.into(), handler);
        self
    }

    /// Handler for actions without an entry
    pub fn fallback(mut self, handler: Arc<dyn AgentHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    pub fn actions(&self) -> Vec<&str> {
        let mut actions: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        actions.sort_unstable();
        actions
    }
}

#[async_trait]
impl AgentHandler for ActionTable {
    async fn handle(
        &self,
        runtime: &Runtime,
        agent: &mut AgentInstance,
        msg: Message,
    ) -> Result<Message, AgentError> {
        let handler = self
            .actions
            .get(&msg.action)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| AgentError::UnsupportedAction(msg.action.clone()))?;
        handler.handle(runtime, agent, msg).await
    }

    async fn notify(
        &self,
        runtime: &Runtime,
        agent: &mut AgentInstance,
        msg: Message,
    ) -> Result<(), AgentError> {
        match self.actions.get(&msg.action).or(self.fallback.as_ref()).cloned() {
            Some(handler) => handler.notify(runtime, agent, msg).await,
            None => Ok(()),
        }
    }
}

/// Text command interpreter over agent memory, tools and dispatch
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandHandler;

/// The command text of a request
///
/// Accepts a bare string payload, `{"content": ...}`, or a task-shaped
/// payload carrying `description`.
pub fn payload_content(payload: &Value) -> Result<String, AgentError> {
    if let Some(text) = payload.as_str() {
        return Ok(text.to_string());
    }
    ["content", "description"]
        .iter()
        .find_map(|key| payload.get(key).and_then(Value::as_str))
        .map(str::to_string)
        .ok_or_else(|| AgentError::InvalidPayload("missing content".into()))
}

fn result(text: impl Into<String>) -> Message {
    Message::result(json!({ "result": text.into() }))
}

#[async_trait]
impl AgentHandler for CommandHandler {
    async fn handle(
        &self,
        runtime: &Runtime,
        agent: &mut AgentInstance,
        msg: Message,
    ) -> Result<Message, AgentError> {
        let content = payload_content(&msg.payload)?;
        let content = content.trim();

        if content.is_empty() {
            return Ok(result(""));
        }

        if let Some(value) = content.strip_prefix("remember ") {
            agent.memory.push(value.trim().to_string());
            return Ok(result("ok"));
        }

        if content == "recall" {
            return Ok(result(agent.memory.join("\n")));
        }

        if let Some(rest) = content.strip_prefix("use ") {
            let (tool, text) = rest.trim().split_once(' ').unwrap_or((rest.trim(), ""));
            let out = agent.invoke_tool(tool.trim(), json!({ "text": text.trim() })).await?;
            let out = match out {
                Value::String(s) => s,
                other => other.to_string(),
            };
            return Ok(result(out));
        }

        if let Some(rest) = content.strip_prefix("dispatch ") {
            let (target, task) = rest.trim().split_once(' ').unwrap_or((rest.trim(), ""));
            if target.is_empty() {
                return Err(AgentError::InvalidPayload("missing agent id".into()));
            }
            debug!(agent_id = %agent.id, to = target, "Dispatching sub-task");
            let reply = runtime
                .call(
                    agent.token(),
                    &agent.id,
                    &AgentId::new(target),
                    ACTION_EXECUTE_TASK,
                    json!({ "content": task.trim() }),
                )
                .await?;
            return Ok(Message::result(reply.payload));
        }

        Ok(result(format!("echo: {content}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentConfig;
    use crate::config::RuntimeConfig;
    use tokio_util::sync::CancellationToken;

    /// Answers every request with a fixed label
    struct Label(&'static str);

    #[async_trait]
    impl AgentHandler for Label {
        async fn handle(
            &self,
            _runtime: &Runtime,
            _agent: &mut AgentInstance,
            _msg: Message,
        ) -> Result<Message, AgentError> {
            Ok(result(self.0))
        }
    }

    #[test]
    fn test_payload_content() {
        assert_eq!(payload_content(&json!("raw")).unwrap(), "raw");
        assert_eq!(payload_content(&json!({"content": "c"})).unwrap(), "c");
        assert_eq!(payload_content(&json!({"description": "d", "title": "t"})).unwrap(), "d");
        assert!(payload_content(&json!({"other": 1})).is_err());
    }

    #[tokio::test]
    async fn test_action_table_routes_by_action() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let table = ActionTable::new()
            .on("plan", Arc::new(Label("planned")))
            .on(ACTION_EXECUTE_TASK, Arc::new(CommandHandler));
        assert_eq!(table.actions(), vec![ACTION_EXECUTE_TASK, "plan"]);

        let agent = runtime.register_detached_agent(AgentConfig::new("t", "table"), Arc::new(table));
        let token = CancellationToken::new();
        let caller = AgentId::new("tester");

        let planned = runtime.call(&token, &caller, agent.id(), "plan", Value::Null).await.unwrap();
        assert_eq!(planned.result_text(), Some("planned"));

        let echoed = runtime
            .call(&token, &caller, agent.id(), ACTION_EXECUTE_TASK, json!({"content": "hi"}))
            .await
            .unwrap();
        assert_eq!(echoed.result_text(), Some("echo: hi"));

        let unknown = runtime.call(&token, &caller, agent.id(), "dance", Value::Null).await.unwrap();
        assert!(unknown.error_text().unwrap().contains("unsupported action"));
    }

    #[tokio::test]
    async fn test_action_table_fallback() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let table = ActionTable::new().fallback(Arc::new(Label("fallback")));
        let agent = runtime.register_detached_agent(AgentConfig::new("f", "fallback"), Arc::new(table));

        let reply = runtime
            .call(&CancellationToken::new(), &AgentId::new("tester"), agent.id(), "anything", Value::Null)
            .await
            .unwrap();
        assert_eq!(reply.result_text(), Some("fallback"));
    }

    #[tokio::test]
    async fn test_invalid_payload_becomes_error_response() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let agent = runtime.register_detached_agent(AgentConfig::new("c", "cmd"), Arc::new(CommandHandler));

        let reply = runtime
            .call(&CancellationToken::new(), &AgentId::new("tester"), agent.id(), ACTION_EXECUTE_TASK, json!(42))
            .await
            .unwrap();
        assert!(reply.error_text().unwrap().contains("missing content"));
    }

    #[tokio::test]
    async fn test_dispatch_to_unknown_agent_reports_error() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let agent = runtime.register_detached_agent(AgentConfig::new("c", "cmd"), Arc::new(CommandHandler));

        let reply = runtime
            .call(
                &CancellationToken::new(),
                &AgentId::new("tester"),
                agent.id(),
                ACTION_EXECUTE_TASK,
                json!({"content": "dispatch agent_missing recall"}),
            )
            .await
            .unwrap();
        assert!(reply.error_text().unwrap().contains("agent_missing not found"));
    }
}
