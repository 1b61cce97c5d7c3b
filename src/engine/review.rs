//! Output review gate

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::decode_reply;
use super::workflow::WorkflowTask;
use crate::error::{EngineError, RuntimeError};
use crate::protocol::{AgentId, Message, ACTION_REVIEW_RESULT, ACTION_REVIEW_TASK, ACTION_TASK_RESULT};
use crate::runtime::Runtime;

/// A reviewer's judgement of one task output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub approved: bool,
    #[serde(default)]
    pub feedback: String,
}

impl ReviewVerdict {
    pub fn approve() -> Self {
        Self {
            approved: true,
            feedback: String::new(),
        }
    }

    pub fn reject(feedback: impl Into<String>) -> Self {
        Self {
            approved: false,
            feedback: feedback.into(),
        }
    }

    /// Reply body for a reviewer agent answering `review_task`
    pub fn into_reply(self) -> Message {
        Message {
            action: ACTION_REVIEW_RESULT.to_string(),
            ..Message::result(json!(self))
        }
    }
}

/// Judges task outputs before they are accepted
#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(
        &self,
        token: &CancellationToken,
        task: &WorkflowTask,
        output: &Value,
    ) -> Result<ReviewVerdict, EngineError>;
}

/// Delegates review to an agent through `review_task` requests
///
/// The agent answers with `{"approved": bool, "feedback": string}`, either as
/// the payload itself or under `result`. Replies must carry the
/// `review_result` or `task_result` action.
#[derive(Clone)]
pub struct AgentReviewer {
    runtime: Runtime,
    reviewer: AgentId,
    caller: AgentId,
}

impl AgentReviewer {
    pub fn new(runtime: Runtime, reviewer: AgentId, caller: AgentId) -> Self {
        Self {
            runtime,
            reviewer,
            caller,
        }
    }
}

#[async_trait]
impl Reviewer for AgentReviewer {
    async fn review(
        &self,
        token: &CancellationToken,
        task: &WorkflowTask,
        output: &Value,
    ) -> Result<ReviewVerdict, EngineError> {
        let payload = json!({
            "taskId": task.task_id,
            "title": task.title,
            "description": task.description,
            "output": output,
        });
        let reply = self
            .runtime
            .call(token, &self.caller, &self.reviewer, ACTION_REVIEW_TASK, payload)
            .await
            .map_err(|e| match e {
                RuntimeError::Cancelled => EngineError::Cancelled,
                other => EngineError::Review(other.to_string()),
            })?;

        if let Some(error) = reply.error_text() {
            return Err(EngineError::Review(error.to_string()));
        }
        if reply.action != ACTION_REVIEW_RESULT && reply.action != ACTION_TASK_RESULT {
            return Err(EngineError::Review(format!(
                "unexpected reply action {}",
                reply.action
            )));
        }
        let verdict: ReviewVerdict =
            decode_reply(&reply.payload).map_err(|e| EngineError::Review(e.to_string()))?;
        debug!(
            task_id = %task.task_id,
            reviewer = %self.reviewer,
            approved = verdict.approved,
            "Review completed"
        );
        Ok(verdict)
    }
}
