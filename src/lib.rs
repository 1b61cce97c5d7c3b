//! # Conclave
//!
//! In-process multi-agent runtime and workflow engine.
//!
//! Agents are long-lived workers with a private inbox and memory. They talk
//! only through messages; a synchronous call is a request plus a correlated
//! response. A registry tracks what each agent can do, and the execution
//! engine runs dependency graphs of capability-tagged tasks across them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          EXECUTION ENGINE                             │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐                │
//! │  │   Planner    │  │  Ready Queue │  │   Reviewer   │                │
//! │  └──────────────┘  └──────────────┘  └──────────────┘                │
//! └───────────┬─────────────────────────────────────┬────────────────────┘
//!             │ route(capability)                   │ call(execute_task)
//!             ▼                                     ▼
//!   ┌───────────────────┐                ┌────────────────────┐
//!   │ Router ─▶ Registry│                │      RUNTIME       │
//!   │  (liveness, caps) │                │ pending calls, bus │
//!   └───────────────────┘                └─────────┬──────────┘
//!                                                  │ bounded inboxes
//!                                     ┌────────────┼────────────┐
//!                                     ▼            ▼            ▼
//!                                  ┌─────┐      ┌─────┐      ┌─────┐
//!                                  │ A1  │      │ A2  │      │ A3  │
//!                                  └─────┘      └─────┘      └─────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Agent**: an isolated worker with its own inbox, memory and granted tools
//! - **Message**: the envelope every interaction travels in
//! - **Call**: request/response correlated by message id, cancellable
//! - **Workflow**: a goal decomposed into dependent tasks

pub mod agent;
pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod runtime;

pub use agent::{AgentConfig, AgentHandle, AgentHandler, AgentInstance, FnTool, Tool};
pub use bus::{EventBus, TOPIC_WORKFLOW_STATUS};
pub use config::{ConclaveConfig, EngineConfig, RegistryConfig, RetryPolicy, RuntimeConfig};
pub use engine::{
    AgentPlanner, AgentReviewer, ExecutionEngine, InMemoryWorkflowRepository, Planner,
    ReviewVerdict, Reviewer, TaskStatus, TaskTree, Workflow, WorkflowRepository,
    WorkflowStatus, WorkflowTask,
};
pub use error::{AgentError, ConclaveError, EngineError, RegistryError, RuntimeError};
pub use handlers::{ActionTable, CommandHandler};
pub use protocol::{AgentId, Capability, Message, MessageType};
pub use registry::{AgentRecord, AgentStatus, Registry};
pub use router::Router;
pub use runtime::Runtime;
