//! Workflow persistence

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::workflow::{Workflow, WorkflowTask};
use crate::error::EngineError;

/// Where workflow and task state is recorded as it changes
///
/// The engine logs failures here and carries on; persistence never decides
/// the outcome of a workflow.
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn create(&self, workflow: &Workflow) -> Result<(), EngineError>;
    async fn update(&self, workflow: &Workflow) -> Result<(), EngineError>;
    async fn create_task(&self, task: &WorkflowTask) -> Result<(), EngineError>;
    async fn update_task(&self, task: &WorkflowTask) -> Result<(), EngineError>;
}

/// Process-local repository
#[derive(Debug, Default)]
pub struct InMemoryWorkflowRepository {
    workflows: RwLock<HashMap<String, Workflow>>,
    /// Tasks per workflow, in creation order
    tasks: RwLock<HashMap<String, Vec<WorkflowTask>>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workflow(&self, id: &str) -> Option<Workflow> {
        self.workflows.read().get(id).cloned()
    }

    pub fn tasks(&self, workflow_id: &str) -> Vec<WorkflowTask> {
        self.tasks.read().get(workflow_id).cloned().unwrap_or_default()
    }

    pub fn task(&self, workflow_id: &str, task_id: &str) -> Option<WorkflowTask> {
        self.tasks
            .read()
            .get(workflow_id)?
            .iter()
            .find(|t| t.task_id == task_id)
            .cloned()
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn create(&self, workflow: &Workflow) -> Result<(), EngineError> {
        let mut workflows = self.workflows.write();
        if workflows.contains_key(&workflow.id) {
            return Err(EngineError::Repository(format!(
                "workflow {} already exists",
                workflow.id
            )));
        }
        workflows.insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn update(&self, workflow: &Workflow) -> Result<(), EngineError> {
        match self.workflows.write().get_mut(&workflow.id) {
            Some(stored) => {
                *stored = workflow.clone();
                Ok(())
            }
            None => Err(EngineError::Repository(format!(
                "workflow {} not found",
                workflow.id
            ))),
        }
    }

    async fn create_task(&self, task: &WorkflowTask) -> Result<(), EngineError> {
        let mut tasks = self.tasks.write();
        let list = tasks.entry(task.workflow_id.clone()).or_default();
        if list.iter().any(|t| t.task_id == task.task_id) {
            return Err(EngineError::Repository(format!(
                "task {} already exists",
                task.task_id
            )));
        }
        list.push(task.clone());
        Ok(())
    }

    async fn update_task(&self, task: &WorkflowTask) -> Result<(), EngineError> {
        let mut tasks = self.tasks.write();
        let stored = tasks
            .get_mut(&task.workflow_id)
            .and_then(|list| list.iter_mut().find(|t| t.task_id == task.task_id))
            .ok_or_else(|| EngineError::Repository(format!("task {} not found", task.task_id)))?;
        *stored = task.clone();
        Ok(())
    }
}
