//! Agent instances, handles and the handler/tool contracts

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{AgentError, RuntimeError};
use crate::protocol::{AgentId, Capability, Message};
use crate::runtime::Runtime;

/// Static configuration of an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AgentConfig {
    /// Configuration id; the runtime address is `agent_<id>`
    pub id: String,
    pub name: String,
    pub description: String,
    /// Declared modes (e.g. `chat`, `plan`)
    pub modes: Vec<String>,
    pub capabilities: Vec<Capability>,
}

impl AgentConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.modes.push(mode.into());
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    /// Runtime address of an instance of this agent
    pub fn agent_id(&self) -> AgentId {
        AgentId::for_config(&self.id)
    }
}

/// A callable granted to agents
#[async_trait]
pub trait Tool: Send + Sync {
    async fn invoke(&self, args: Value) -> Result<Value, AgentError>;
}

/// Adapts a synchronous closure into a [`Tool`]
pub struct FnTool<F>(F);

impl<F> FnTool<F>
where
    F: Fn(Value) -> Result<Value, AgentError> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> Tool for FnTool<F>
where
    F: Fn(Value) -> Result<Value, AgentError> + Send + Sync + 'static,
{
    async fn invoke(&self, args: Value) -> Result<Value, AgentError> {
        (self.0)(args)
    }
}

type ToolMap = Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>;

/// Behavior of an agent
///
/// Called once per request, sequentially per instance. Implementations must
/// honor [`AgentInstance::token`] instead of blocking indefinitely.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Answer a request; the runtime fills in routing fields of the reply
    async fn handle(
        &self,
        runtime: &Runtime,
        agent: &mut AgentInstance,
        msg: Message,
    ) -> Result<Message, AgentError>;

    /// Observe a notification; nothing is sent back
    async fn notify(
        &self,
        _runtime: &Runtime,
        agent: &mut AgentInstance,
        msg: Message,
    ) -> Result<(), AgentError> {
        debug!(agent_id = %agent.id, action = %msg.action, "Ignoring notification");
        Ok(())
    }
}

/// A running agent, owned by its mailbox loop
///
/// Only the loop that owns an instance ever touches its memory.
pub struct AgentInstance {
    pub id: AgentId,
    pub config: AgentConfig,
    /// Agent-local memory, never shared
    pub memory: Vec<String>,
    tools: ToolMap,
    token: CancellationToken,
    /// Set while a request is being handled; fires when its caller gives up
    request: Option<CancellationToken>,
}

impl AgentInstance {
    /// Cancellation context for the work in progress
    ///
    /// While a request from [`Runtime::call`] is being handled this is that
    /// call's context, so nested calls made with it are cancelled together
    /// with the outer one. Otherwise it is the instance's own token.
    pub fn token(&self) -> &CancellationToken {
        self.request.as_ref().unwrap_or(&self.token)
    }

    pub(crate) fn begin_request(&mut self, token: Option<CancellationToken>) {
        self.request = token;
    }

    pub(crate) fn end_request(&mut self) {
        self.request = None;
    }

    /// Whether a tool has been granted to this instance
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    /// Invoke a granted tool
    pub async fn invoke_tool(&self, name: &str, args: Value) -> Result<Value, AgentError> {
        let tool = self.tools.read().get(name).cloned();
        let tool = tool.ok_or_else(|| AgentError::ToolNotGranted {
            agent: self.id.clone(),
            tool: name.to_string(),
        })?;
        tool.invoke(args).await
    }
}

impl fmt::Debug for AgentInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentInstance")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("memory", &self.memory.len())
            .finish()
    }
}

struct AgentEntry {
    id: AgentId,
    config: AgentConfig,
    inbox: mpsc::Sender<Message>,
    tools: ToolMap,
    token: CancellationToken,
}

/// Handle to an agent for external interaction
#[derive(Clone)]
pub struct AgentHandle {
    inner: Arc<AgentEntry>,
}

impl AgentHandle {
    /// Build the handle, the loop-owned instance and the inbox receiver
    pub(crate) fn create(
        id: AgentId,
        config: AgentConfig,
        capacity: usize,
        token: CancellationToken,
    ) -> (Self, AgentInstance, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let tools: ToolMap = Arc::new(RwLock::new(HashMap::new()));

        let instance = AgentInstance {
            id: id.clone(),
            config: config.clone(),
            memory: Vec::new(),
            tools: Arc::clone(&tools),
            token: token.clone(),
            request: None,
        };
        let handle = Self {
            inner: Arc::new(AgentEntry {
                id,
                config,
                inbox: tx,
                tools,
                token,
            }),
        };
        (handle, instance, rx)
    }

    pub fn id(&self) -> &AgentId {
        &self.inner.id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    /// Names of the tools granted so far
    pub fn granted_tools(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.tools.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether the mailbox loop is still running
    pub fn is_running(&self) -> bool {
        !self.inner.token.is_cancelled() && !self.inner.inbox.is_closed()
    }

    /// Number of messages waiting in the inbox
    pub fn queued(&self) -> usize {
        self.inner.inbox.max_capacity() - self.inner.inbox.capacity()
    }

    pub(crate) fn grant(&self, name: &str, tool: Arc<dyn Tool>) {
        self.inner.tools.write().insert(name.to_string(), tool);
    }

    /// Enqueue without waiting; a full inbox is reported, not awaited
    pub(crate) fn try_deliver(&self, msg: Message) -> Result<(), RuntimeError> {
        self.inner.inbox.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => RuntimeError::MailboxFull(self.inner.id.clone()),
            TrySendError::Closed(_) => RuntimeError::AgentNotFound(self.inner.id.clone()),
        })
    }

    /// Cancel the instance context, ending its loop
    pub(crate) fn stop(&self) {
        self.inner.token.cancel();
    }
}

impl fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.config.name)
            .finish()
    }
}
