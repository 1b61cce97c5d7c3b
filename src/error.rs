//! Conclave error types

use std::time::Duration;

use thiserror::Error;

use crate::protocol::AgentId;

/// Errors returned by the runtime to callers of `call`/`send_message`
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// No agent registered under this id
    #[error("agent {0} not found")]
    AgentNotFound(AgentId),

    /// The target inbox is at capacity; the message was not enqueued
    #[error("agent {0} inbox full")]
    MailboxFull(AgentId),

    /// Tool missing from the global registry
    #[error("tool {0} is not registered")]
    ToolNotFound(String),

    /// The caller's context was cancelled before a reply arrived
    #[error("call cancelled")]
    Cancelled,

    /// No reply within the deadline
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The reply slot was dropped without a reply
    #[error("reply channel closed")]
    ReplyDropped,
}

/// Errors raised inside agent handlers and tools
#[derive(Debug, Error)]
pub enum AgentError {
    /// Tool invoked without a grant
    #[error("tool {tool} not granted to {agent}")]
    ToolNotGranted { agent: AgentId, tool: String },

    /// Tool failed
    #[error("tool error: {0}")]
    Tool(String),

    /// The request payload could not be understood
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// No handler for the requested action
    #[error("unsupported action: {0}")]
    UnsupportedAction(String),

    /// A nested call failed
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// Handler-specific failure
    #[error("{0}")]
    Failed(String),
}

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Agent unknown to the directory
    #[error("agent {0} not found in registry")]
    AgentNotFound(AgentId),

    /// Directory backend failure
    #[error("directory error: {0}")]
    Directory(String),
}

/// Execution engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    /// Duplicate ids, dangling dependencies or cycles
    #[error("invalid task graph: {0}")]
    InvalidGraph(String),

    /// Routing found no online agent
    #[error("no agent found for {capability}")]
    NoAgent { capability: String },

    /// Registry lookup failed
    #[error("routing error: {0}")]
    Routing(#[from] RegistryError),

    /// Delivery or cancellation error from the runtime
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// The agent answered with an error payload
    #[error("task {task_id} failed: {message}")]
    Execution { task_id: String, message: String },

    /// The reviewer rejected the output
    #[error("review failed: {feedback}")]
    Rejected { feedback: String },

    /// The reviewer itself failed
    #[error("review error: {0}")]
    Review(String),

    /// Planner failure
    #[error("planner error: {0}")]
    Planner(String),

    /// Persistence failure
    #[error("repository error: {0}")]
    Repository(String),

    /// Payload encoding or decoding failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The workflow context was cancelled
    #[error("workflow cancelled")]
    Cancelled,

    /// Workers drained without finishing every task
    #[error("workflow execution incomplete")]
    Incomplete,
}

impl EngineError {
    /// Whether another attempt may succeed: execution failures and review
    /// verdicts are retried, routing, delivery and cancellation are not
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Execution { .. } | EngineError::Rejected { .. } | EngineError::Review(_)
        )
    }
}

/// Errors that can occur anywhere in conclave
#[derive(Debug, Error)]
pub enum ConclaveError {
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}
