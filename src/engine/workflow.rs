//! Workflow and task records and task-graph validation

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineError;
use crate::protocol::AgentId;

/// Lifecycle of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Lifecycle of a task; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    fn can_become(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Skipped)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A goal and the outcome of running its task graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Unique identifier
    pub id: String,
    /// What the workflow is meant to achieve
    pub goal: String,
    /// Current status
    pub status: WorkflowStatus,
    /// Set when execution begins
    pub started_at: Option<DateTime<Utc>>,
    /// Set on reaching a terminal status
    pub completed_at: Option<DateTime<Utc>>,
    /// Task outputs by task id on success, the failure reason otherwise
    pub result: Option<Value>,
    /// First error that ended the run
    pub error: Option<String>,
}

impl Workflow {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            goal: goal.into(),
            status: WorkflowStatus::Pending,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    /// Workflow and tasks for a planner's output
    pub fn from_plan(tree: TaskTree) -> (Self, Vec<WorkflowTask>) {
        let workflow = Self::new(tree.goal);
        let tasks = tree
            .tasks
            .into_iter()
            .map(|sub| {
                let mut task = WorkflowTask::new(sub.id, sub.title, sub.capability)
                    .with_description(sub.description)
                    .depends_on(sub.depends_on);
                task.workflow_id = workflow.id.clone();
                task
            })
            .collect();
        (workflow, tasks)
    }
}

/// One capability-tagged node of a workflow's graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTask {
    /// Owning workflow
    pub workflow_id: String,
    /// Identifier, unique within the workflow
    pub task_id: String,
    pub title: String,
    pub description: String,
    /// Capability an agent must offer to run this task
    pub capability: String,
    /// Tasks that must complete first
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Current status
    pub status: TaskStatus,
    /// Caller-supplied input passed through to the agent
    #[serde(default)]
    pub input: Value,
    /// Accepted output once completed
    pub output: Option<Value>,
    /// Why the task failed
    pub error: Option<String>,
    /// Reviewer feedback from rejected attempts, oldest first
    #[serde(default)]
    pub feedback: Vec<String>,
    /// Agent that ran the latest attempt
    pub agent_id: Option<AgentId>,
    /// Execution attempts made so far
    #[serde(default)]
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowTask {
    pub fn new(
        task_id: impl Into<String>,
        title: impl Into<String>,
        capability: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id: String::new(),
            task_id: task_id.into(),
            title: title.into(),
            description: String::new(),
            capability: capability.into(),
            depends_on: Vec::new(),
            status: TaskStatus::Pending,
            input: Value::Null,
            output: None,
            error: None,
            feedback: Vec::new(),
            agent_id: None,
            attempts: 0,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    fn transition(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_become(next) {
            return false;
        }
        self.status = next;
        true
    }

    pub(crate) fn mark_running(&mut self) -> bool {
        let moved = self.transition(TaskStatus::Running);
        if moved {
            self.started_at = Some(Utc::now());
        }
        moved
    }

    pub(crate) fn mark_completed(&mut self, output: Value) -> bool {
        let moved = self.transition(TaskStatus::Completed);
        if moved {
            self.output = Some(output);
            self.completed_at = Some(Utc::now());
        }
        moved
    }

    pub(crate) fn mark_failed(&mut self, error: impl Into<String>) -> bool {
        let moved = self.transition(TaskStatus::Failed);
        if moved {
            self.error = Some(error.into());
            self.completed_at = Some(Utc::now());
        }
        moved
    }

    pub(crate) fn mark_skipped(&mut self) -> bool {
        self.transition(TaskStatus::Skipped)
    }
}

/// Planner sub-task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubTask {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub capability: String,
}

/// Planner output: a goal broken into dependent sub-tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTree {
    pub goal: String,
    pub tasks: Vec<SubTask>,
}

/// Reject duplicate ids, dependencies on unknown tasks and cycles
pub fn validate_graph(tasks: &[WorkflowTask]) -> Result<(), EngineError> {
    let mut ids = HashSet::with_capacity(tasks.len());
    for task in tasks {
        if !ids.insert(task.task_id.as_str()) {
            return Err(EngineError::InvalidGraph(format!(
                "duplicate task id {}",
                task.task_id
            )));
        }
    }

    let mut indegree: HashMap<&str, usize> = HashMap::with_capacity(tasks.len());
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in tasks {
        indegree.insert(task.task_id.as_str(), task.depends_on.len());
        for dep in &task.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(EngineError::InvalidGraph(format!(
                    "task {} depends on unknown task {}",
                    task.task_id, dep
                )));
            }
            dependents.entry(dep.as_str()).or_default().push(task.task_id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        for next in dependents.get(id).into_iter().flatten() {
            if let Some(n) = indegree.get_mut(next) {
                *n -= 1;
                if *n == 0 {
                    queue.push_back(*next);
                }
            }
        }
    }

    if visited != tasks.len() {
        let mut stuck: Vec<&str> = indegree
            .into_iter()
            .filter(|(_, n)| *n > 0)
            .map(|(id, _)| id)
            .collect();
        stuck.sort_unstable();
        return Err(EngineError::InvalidGraph(format!(
            "dependency cycle among {}",
            stuck.join(", ")
        )));
    }
    Ok(())
}
