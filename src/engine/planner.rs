//! Goal decomposition

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::decode_reply;
use super::workflow::TaskTree;
use crate::error::{EngineError, RuntimeError};
use crate::protocol::{AgentId, ACTION_PLAN};
use crate::runtime::Runtime;

/// Breaks a goal into a task tree
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, token: &CancellationToken, goal: &str) -> Result<TaskTree, EngineError>;
}

/// Asks a planning agent via `plan` requests carrying `{"goal": ...}`
#[derive(Clone)]
pub struct AgentPlanner {
    runtime: Runtime,
    planner: AgentId,
    caller: AgentId,
}

impl AgentPlanner {
    pub fn new(runtime: Runtime, planner: AgentId, caller: AgentId) -> Self {
        Self {
            runtime,
            planner,
            caller,
        }
    }
}

#[async_trait]
impl Planner for AgentPlanner {
    async fn plan(&self, token: &CancellationToken, goal: &str) -> Result<TaskTree, EngineError> {
        let reply = self
            .runtime
            .call(token, &self.caller, &self.planner, ACTION_PLAN, json!({ "goal": goal }))
            .await
            .map_err(|e| match e {
                RuntimeError::Cancelled => EngineError::Cancelled,
                other => EngineError::Planner(other.to_string()),
            })?;

        if let Some(error) = reply.error_text() {
            return Err(EngineError::Planner(error.to_string()));
        }
        let mut tree: TaskTree =
            decode_reply(&reply.payload).map_err(|e| EngineError::Planner(e.to_string()))?;
        if tree.tasks.is_empty() {
            return Err(EngineError::Planner(format!("no tasks planned for {goal:?}")));
        }
        if tree.goal.is_empty() {
            tree.goal = goal.to_string();
        }

        info!(planner = %self.planner, tasks = tree.tasks.len(), "Planned goal");
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentConfig, AgentHandler, AgentInstance};
    use crate::config::RuntimeConfig;
    use crate::error::AgentError;
    use crate::protocol::Message;
    use std::sync::Arc;

    struct Fixed(serde_json::Value);

    #[async_trait]
    impl AgentHandler for Fixed {
        async fn handle(
            &self,
            _runtime: &Runtime,
            _agent: &mut AgentInstance,
            _msg: Message,
        ) -> Result<Message, AgentError> {
            Ok(Message::result(self.0.clone()))
        }
    }

    fn planner_with(reply: serde_json::Value) -> AgentPlanner {
        let runtime = Runtime::new(RuntimeConfig::default());
        let handle = runtime.register_detached_agent(AgentConfig::new("plan", "planner"), Arc::new(Fixed(reply)));
        AgentPlanner::new(runtime, handle.id().clone(), AgentId::new("orchestrator"))
    }

    #[tokio::test]
    async fn test_plan_from_structured_payload() {
        let planner = planner_with(json!({
            "goal": "",
            "tasks": [
                {"id": "t1", "title": "analyze", "capability": "code_analysis"},
                {"id": "t2", "title": "fix", "dependsOn": ["t1"], "capability": "code_writing"}
            ]
        }));

        let tree = planner.plan(&CancellationToken::new(), "fix the bug").await.unwrap();
        assert_eq!(tree.goal, "fix the bug");
        assert_eq!(tree.tasks.len(), 2);
        assert_eq!(tree.tasks[1].depends_on, vec!["t1".to_string()]);
    }

    #[tokio::test]
    async fn test_plan_from_text_result() {
        let planner = planner_with(json!({
            "result": "Here is the plan:\n{\"goal\": \"g\", \"tasks\": [{\"id\": \"t1\", \"title\": \"search\", \"capability\": \"web_search\"}]}\nDone."
        }));

        let tree = planner.plan(&CancellationToken::new(), "g").await.unwrap();
        assert_eq!(tree.tasks[0].capability, "web_search");
    }

    #[tokio::test]
    async fn test_empty_plan_is_an_error() {
        let planner = planner_with(json!({"goal": "g", "tasks": []}));
        let err = planner.plan(&CancellationToken::new(), "g").await.unwrap_err();
        assert!(matches!(err, EngineError::Planner(_)));
    }
}
