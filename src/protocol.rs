//! Message envelope and capability types shared by every component

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Action sent to an agent to execute a unit of work
pub const ACTION_EXECUTE_TASK: &str = "execute_task";
/// Default action of a response
pub const ACTION_TASK_RESULT: &str = "task_result";
/// Action sent to a reviewer agent
pub const ACTION_REVIEW_TASK: &str = "review_task";
/// Action of a reviewer's verdict
pub const ACTION_REVIEW_RESULT: &str = "review_result";
/// Action sent to a planner agent
pub const ACTION_PLAN: &str = "plan";
/// Action of a status notification
pub const ACTION_STATUS: &str = "status";

/// Predefined capability names
pub mod capabilities {
    pub const CODE_ANALYSIS: &str = "code_analysis";
    pub const CODE_WRITING: &str = "code_writing";
    pub const WEB_SEARCH: &str = "web_search";
    pub const FILE_OPERATION: &str = "file_operation";
    pub const COMMAND_EXECUTION: &str = "command_execution";
}

/// Address of an agent (or of a non-agent caller such as the engine)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Runtime address of an agent built from its configuration id
    pub fn for_config(config_id: impl fmt::Display) -> Self {
        Self(format!("agent_{config_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for AgentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Kind of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Request,
    Response,
    Notification,
    Error,
    StreamChunk,
}

/// Trace and span identifiers carried by every message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl TraceContext {
    /// Start a new trace
    pub fn root() -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            span_id: Uuid::new_v4().to_string(),
            parent_id: None,
        }
    }

    /// Child span within the same trace
    pub fn child(&self) -> Self {
        if self.trace_id.is_empty() {
            return Self::root();
        }
        Self {
            trace_id: self.trace_id.clone(),
            span_id: Uuid::new_v4().to_string(),
            parent_id: Some(self.span_id.clone()),
        }
    }
}

/// Retry policy as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireRetryPolicy {
    pub max_attempts: u32,
    /// Milliseconds between attempts
    pub interval: u64,
}

/// Delivery metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Time to live in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<WireRetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// The envelope exchanged between agents
///
/// A `response` carries the `id` of the `request` it answers; `response` and
/// `error` are terminal for that id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    pub from: AgentId,
    pub to: AgentId,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub trace: TraceContext,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub timestamp: i64,
}

impl Message {
    /// A request with a fresh correlation id
    pub fn request(
        from: impl Into<AgentId>,
        to: impl Into<AgentId>,
        action: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from: from.into(),
            to: to.into(),
            kind: MessageType::Request,
            action: action.into(),
            payload,
            trace: TraceContext::root(),
            ..Default::default()
        }
    }

    /// A notification; not correlated with anything
    pub fn notification(
        from: impl Into<AgentId>,
        to: impl Into<AgentId>,
        action: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            kind: MessageType::Notification,
            ..Self::request(from, to, action, payload)
        }
    }

    /// A bare result body for a handler to return
    ///
    /// Routing fields are filled in by the runtime when the reply is sent.
    pub fn result(payload: Value) -> Self {
        Self {
            kind: MessageType::Response,
            action: ACTION_TASK_RESULT.to_string(),
            payload,
            ..Default::default()
        }
    }

    /// A response answering `request`
    pub fn reply_to(request: &Message) -> Self {
        Self {
            id: request.id.clone(),
            from: request.to.clone(),
            to: request.from.clone(),
            kind: MessageType::Response,
            action: ACTION_TASK_RESULT.to_string(),
            trace: request.trace.child(),
            ..Default::default()
        }
    }

    /// Whether this message ends the exchange for its id
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, MessageType::Response | MessageType::Error)
    }

    /// The `error` field of an error payload, if any
    pub fn error_text(&self) -> Option<&str> {
        if self.kind == MessageType::Error && self.payload.is_string() {
            return self.payload.as_str();
        }
        self.payload.get("error").and_then(Value::as_str)
    }

    /// The `result` field of the payload, if it is a string
    pub fn result_text(&self) -> Option<&str> {
        self.payload.get("result").and_then(Value::as_str)
    }
}

/// A named, schema-described function an agent claims to perform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Capability {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the input
    #[serde(default)]
    pub parameters: Value,
    /// JSON schema of the output
    #[serde(default)]
    pub returns: Value,
}

impl Capability {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Value::Null,
            returns: Value::Null,
        }
    }

    pub fn with_schemas(mut self, parameters: Value, returns: Value) -> Self {
        self.parameters = parameters;
        self.returns = returns;
        self
    }
}
