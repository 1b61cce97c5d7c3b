//! Workflow execution
//!
//! ```text
//!   goal ──▶ Planner ──▶ TaskTree ──▶ Workflow + WorkflowTasks
//!                                              │
//!                                       ExecutionEngine
//!                                              │
//!        ready queue ──▶ Router ──▶ Runtime::call(execute_task) ──▶ Reviewer
//!             ▲                                                       │
//!             └──────────── dependents released on completion ◀───────┘
//! ```
//!
//! Every ready task runs in its own tokio task. The first task to fail cancels
//! the workflow's token; in-flight calls and backoffs observe it and tasks
//! that never started are marked skipped.

pub mod planner;
pub mod repository;
pub mod review;
pub mod workflow;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub use planner::{AgentPlanner, Planner};
pub use repository::{InMemoryWorkflowRepository, WorkflowRepository};
pub use review::{AgentReviewer, ReviewVerdict, Reviewer};
pub use workflow::{
    validate_graph, SubTask, TaskStatus, TaskTree, Workflow, WorkflowStatus, WorkflowTask,
};

use crate::bus::TOPIC_WORKFLOW_STATUS;
use crate::config::EngineConfig;
use crate::error::{EngineError, RuntimeError};
use crate::protocol::{AgentId, Message, ACTION_EXECUTE_TASK, ACTION_STATUS};
use crate::router::Router;
use crate::runtime::Runtime;

/// How long in-flight workers get to wind down after the workflow is cancelled
const CANCEL_GRACE: Duration = Duration::from_millis(100);

/// Observer of task transitions: `(task_id, status, output)`
pub type StatusCallback = Arc<dyn Fn(&str, TaskStatus, Option<&Value>) + Send + Sync>;

/// Decode an agent reply that is either the value itself, or carries it under
/// `result` as an object or as text with embedded JSON
pub(crate) fn decode_reply<T: DeserializeOwned>(payload: &Value) -> Result<T, serde_json::Error> {
    let err = match serde_json::from_value(payload.clone()) {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };
    match payload.get("result") {
        Some(inner @ Value::Object(_)) => serde_json::from_value(inner.clone()),
        Some(Value::String(text)) => serde_json::from_str(embedded_json(text)),
        _ => Err(err),
    }
}

fn embedded_json(text: &str) -> &str {
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    }
}

/// Best-effort writes to an optional repository
#[derive(Clone, Default)]
struct Persistence(Option<Arc<dyn WorkflowRepository>>);

impl Persistence {
    async fn create_workflow(&self, workflow: &Workflow) {
        if let Some(repo) = &self.0 {
            if let Err(e) = repo.create(workflow).await {
                warn!(workflow_id = %workflow.id, error = %e, "Failed to persist workflow");
            }
        }
    }

    async fn update_workflow(&self, workflow: &Workflow) {
        if let Some(repo) = &self.0 {
            if let Err(e) = repo.update(workflow).await {
                warn!(workflow_id = %workflow.id, error = %e, "Failed to update workflow");
            }
        }
    }

    async fn create_task(&self, task: &WorkflowTask) {
        if let Some(repo) = &self.0 {
            if let Err(e) = repo.create_task(task).await {
                warn!(task_id = %task.task_id, error = %e, "Failed to persist task");
            }
        }
    }

    async fn update_task(&self, task: &WorkflowTask) {
        if let Some(repo) = &self.0 {
            if let Err(e) = repo.update_task(task).await {
                warn!(task_id = %task.task_id, error = %e, "Failed to update task");
            }
        }
    }
}

/// Runs workflow task graphs against the agents of a [`Runtime`]
pub struct ExecutionEngine {
    runtime: Runtime,
    router: Router,
    config: EngineConfig,
    reviewer: Option<Arc<dyn Reviewer>>,
    persistence: Persistence,
    on_status: Option<StatusCallback>,
}

impl ExecutionEngine {
    pub fn new(runtime: Runtime, router: Router, config: EngineConfig) -> Self {
        Self {
            runtime,
            router,
            config,
            reviewer: None,
            persistence: Persistence::default(),
            on_status: None,
        }
    }

    /// Gate every task output through `reviewer`
    pub fn with_reviewer(mut self, reviewer: Arc<dyn Reviewer>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn WorkflowRepository>) -> Self {
        self.persistence = Persistence(Some(repository));
        self
    }

    pub fn with_status_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, TaskStatus, Option<&Value>) + Send + Sync + 'static,
    {
        self.on_status = Some(Arc::new(callback));
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Plan `goal` and execute the resulting workflow
    ///
    /// Errors only when planning fails; the execution outcome is reported
    /// through the returned workflow's status.
    pub async fn run_goal(
        &self,
        token: &CancellationToken,
        planner: &dyn Planner,
        goal: &str,
    ) -> Result<(Workflow, Vec<WorkflowTask>), EngineError> {
        let tree = planner.plan(token, goal).await?;
        let (mut workflow, mut tasks) = Workflow::from_plan(tree);
        if let Err(e) = self.execute(token, &mut workflow, &mut tasks).await {
            debug!(workflow_id = %workflow.id, error = %e, "Workflow did not complete");
        }
        Ok((workflow, tasks))
    }

    /// Execute `tasks` in dependency order, updating them and `workflow` in place
    ///
    /// Returns the first task failure, [`EngineError::Cancelled`] when `token`
    /// fires, or [`EngineError::InvalidGraph`] before anything runs.
    #[instrument(skip_all, fields(workflow_id = %workflow.id))]
    pub async fn execute(
        &self,
        token: &CancellationToken,
        workflow: &mut Workflow,
        tasks: &mut [WorkflowTask],
    ) -> Result<(), EngineError> {
        for task in tasks.iter_mut() {
            task.workflow_id = workflow.id.clone();
        }

        if let Err(err) = validate_graph(tasks) {
            warn!(error = %err, "Rejected workflow");
            workflow.status = WorkflowStatus::Failed;
            workflow.error = Some(err.to_string());
            workflow.result = Some(Value::String(err.to_string()));
            workflow.completed_at = Some(Utc::now());
            self.persistence.create_workflow(workflow).await;
            return Err(err);
        }

        workflow.status = WorkflowStatus::Running;
        workflow.started_at = Some(Utc::now());
        self.persistence.create_workflow(workflow).await;
        for task in tasks.iter() {
            self.persistence.create_task(task).await;
        }
        info!(goal = %workflow.goal, tasks = tasks.len(), "Workflow started");

        let (run, mut ready) = WorkflowRun::new(self, workflow.id.clone(), token.child_token(), tasks);
        let run = Arc::new(run);
        let limit = self.config.max_concurrency.unwrap_or(usize::MAX).max(1);
        let mut workers = JoinSet::new();

        loop {
            while workers.len() < limit && !run.token.is_cancelled() {
                match ready.pop_front() {
                    Some(task_id) => {
                        workers.spawn(Arc::clone(&run).run_task(task_id));
                    }
                    None => break,
                }
            }
            if workers.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                joined = workers.join_next() => match joined {
                    Some(Ok(released)) => ready.extend(released),
                    Some(Err(e)) => {
                        error!(error = %e, "Task worker aborted");
                        run.fail(EngineError::Incomplete);
                    }
                    None => break,
                },
                _ = run.token.cancelled() => break,
            }
        }

        if !workers.is_empty() {
            let drained = tokio::time::timeout(CANCEL_GRACE, async {
                while workers.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(workers = workers.len(), "Aborting workers that ignored cancellation");
                workers.abort_all();
                while workers.join_next().await.is_some() {}
            }
        }

        let abandoned = run.fail_abandoned();
        for task in &abandoned {
            self.persistence.update_task(task).await;
            run.emit(task, TaskStatus::Failed, None);
        }

        let skipped = run.skip_unstarted();
        for task in &skipped {
            self.persistence.update_task(task).await;
            run.emit(task, TaskStatus::Skipped, None);
        }

        let outputs = run.write_back(tasks);
        let failure = run.failure.lock().take();
        let all_completed = tasks.iter().all(|t| t.status == TaskStatus::Completed);

        let outcome = if token.is_cancelled() {
            Err(EngineError::Cancelled)
        } else if let Some(err) = failure {
            Err(err)
        } else if !all_completed {
            Err(EngineError::Incomplete)
        } else {
            Ok(())
        };

        workflow.completed_at = Some(Utc::now());
        match &outcome {
            Ok(()) => {
                workflow.status = WorkflowStatus::Completed;
                workflow.result = Some(Value::Object(outputs));
                info!("Workflow completed");
            }
            Err(err) => {
                workflow.status = match err {
                    EngineError::Cancelled => WorkflowStatus::Cancelled,
                    _ => WorkflowStatus::Failed,
                };
                workflow.error = Some(err.to_string());
                workflow.result = Some(Value::String(err.to_string()));
                warn!(status = ?workflow.status, error = %err, "Workflow did not complete");
            }
        }
        self.persistence.update_workflow(workflow).await;
        outcome
    }
}

struct DagState {
    tasks: HashMap<String, WorkflowTask>,
    /// Unfinished dependencies per task
    waiting_on: HashMap<String, usize>,
    dependents: HashMap<String, Vec<String>>,
    outputs: Map<String, Value>,
}

/// Shared state of one `execute` call
struct WorkflowRun {
    runtime: Runtime,
    router: Router,
    config: EngineConfig,
    reviewer: Option<Arc<dyn Reviewer>>,
    persistence: Persistence,
    on_status: Option<StatusCallback>,
    workflow_id: String,
    token: CancellationToken,
    failure: Mutex<Option<EngineError>>,
    state: Mutex<DagState>,
}

impl WorkflowRun {
    /// The run and its initially ready tasks, in input order
    fn new(
        engine: &ExecutionEngine,
        workflow_id: String,
        token: CancellationToken,
        tasks: &[WorkflowTask],
    ) -> (Self, VecDeque<String>) {
        let mut waiting_on = HashMap::with_capacity(tasks.len());
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        let mut ready = VecDeque::new();
        for task in tasks {
            waiting_on.insert(task.task_id.clone(), task.depends_on.len());
            for dep in &task.depends_on {
                dependents.entry(dep.clone()).or_default().push(task.task_id.clone());
            }
            if task.depends_on.is_empty() {
                ready.push_back(task.task_id.clone());
            }
        }

        let run = Self {
            runtime: engine.runtime.clone(),
            router: engine.router.clone(),
            config: engine.config.clone(),
            reviewer: engine.reviewer.clone(),
            persistence: engine.persistence.clone(),
            on_status: engine.on_status.clone(),
            workflow_id,
            token,
            failure: Mutex::new(None),
            state: Mutex::new(DagState {
                tasks: tasks.iter().map(|t| (t.task_id.clone(), t.clone())).collect(),
                waiting_on,
                dependents,
                outputs: Map::new(),
            }),
        };
        (run, ready)
    }

    /// Run one task to a terminal state; returns the tasks it made ready
    async fn run_task(self: Arc<Self>, task_id: String) -> Vec<String> {
        let started = {
            let mut state = self.state.lock();
            if self.token.is_cancelled() {
                return Vec::new();
            }
            match state.tasks.get_mut(&task_id) {
                Some(task) => task.mark_running().then(|| task.clone()),
                None => None,
            }
        };
        let Some(mut task) = started else {
            return Vec::new();
        };

        debug!(task_id = %task_id, capability = %task.capability, "Task started");
        self.persistence.update_task(&task).await;
        self.emit(&task, TaskStatus::Running, None);

        match self.execute_with_retry(&mut task).await {
            Ok(output) => {
                task.mark_completed(output);
                self.persistence.update_task(&task).await;
                self.emit(&task, TaskStatus::Completed, task.output.as_ref());
                info!(task_id = %task_id, attempts = task.attempts, "Task completed");
                self.release(task)
            }
            Err(err) => {
                task.mark_failed(err.to_string());
                self.persistence.update_task(&task).await;
                self.emit(&task, TaskStatus::Failed, None);
                self.state.lock().tasks.insert(task_id, task);
                self.fail(err);
                Vec::new()
            }
        }
    }

    async fn execute_with_retry(&self, task: &mut WorkflowTask) -> Result<Value, EngineError> {
        let policy = self.config.retry;
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            task.attempts = attempt + 1;
            let err = match self.attempt(task).await {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };
            if let EngineError::Rejected { feedback } = &err {
                task.feedback.push(feedback.clone());
            }
            if !err.is_retryable() || attempt + 1 >= max_attempts {
                return Err(err);
            }

            let delay = policy.delay_after(attempt);
            warn!(
                task_id = %task.task_id,
                attempt = attempt + 1,
                error = %err,
                ?delay,
                "Task attempt failed; retrying"
            );
            tokio::select! {
                _ = self.token.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn attempt(&self, task: &mut WorkflowTask) -> Result<Value, EngineError> {
        let agent = self
            .router
            .route(&task.capability)?
            .ok_or_else(|| EngineError::NoAgent {
                capability: task.capability.clone(),
            })?;
        task.agent_id = Some(agent.id.clone());

        let payload = serde_json::to_value(&*task)?;
        let reply = self
            .runtime
            .call(
                &self.token,
                &self.config.orchestrator_id,
                &agent.id,
                ACTION_EXECUTE_TASK,
                payload,
            )
            .await
            .map_err(|e| match e {
                RuntimeError::Cancelled => EngineError::Cancelled,
                other => other.into(),
            })?;

        if let Some(message) = reply.error_text() {
            return Err(EngineError::Execution {
                task_id: task.task_id.clone(),
                message: message.to_string(),
            });
        }

        if let Some(reviewer) = &self.reviewer {
            let verdict = reviewer.review(&self.token, task, &reply.payload).await?;
            if !verdict.approved {
                return Err(EngineError::Rejected {
                    feedback: verdict.feedback,
                });
            }
        }
        Ok(reply.payload)
    }

    /// Record a completed task and decrement its dependents
    fn release(&self, task: WorkflowTask) -> Vec<String> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(output) = &task.output {
            state.outputs.insert(task.task_id.clone(), output.clone());
        }

        let mut ready = Vec::new();
        for next in state.dependents.get(&task.task_id).into_iter().flatten() {
            if let Some(waiting) = state.waiting_on.get_mut(next) {
                *waiting = waiting.saturating_sub(1);
                if *waiting == 0 {
                    ready.push(next.clone());
                }
            }
        }
        state.tasks.insert(task.task_id.clone(), task);
        ready
    }

    /// First failure wins and cancels the workflow
    fn fail(&self, err: EngineError) {
        let mut slot = self.failure.lock();
        if slot.is_some() {
            return;
        }
        if !matches!(err, EngineError::Cancelled) {
            error!(workflow_id = %self.workflow_id, error = %err, "Task failed; cancelling workflow");
        }
        *slot = Some(err);
        drop(slot);
        self.token.cancel();
    }

    /// Fail tasks whose workers were aborted mid-flight
    fn fail_abandoned(&self) -> Vec<WorkflowTask> {
        let reason = EngineError::Cancelled.to_string();
        let mut state = self.state.lock();
        state
            .tasks
            .values_mut()
            .filter(|t| t.status == TaskStatus::Running)
            .filter_map(|t| t.mark_failed(reason.as_str()).then(|| t.clone()))
            .collect()
    }

    fn skip_unstarted(&self) -> Vec<WorkflowTask> {
        let mut state = self.state.lock();
        state
            .tasks
            .values_mut()
            .filter_map(|t| t.mark_skipped().then(|| t.clone()))
            .collect()
    }

    /// Copy final task states back into the caller's slice
    fn write_back(&self, tasks: &mut [WorkflowTask]) -> Map<String, Value> {
        let mut state = self.state.lock();
        for task in tasks.iter_mut() {
            if let Some(done) = state.tasks.remove(&task.task_id) {
                *task = done;
            }
        }
        std::mem::take(&mut state.outputs)
    }

    fn emit(&self, task: &WorkflowTask, status: TaskStatus, output: Option<&Value>) {
        if let Some(callback) = &self.on_status {
            callback(&task.task_id, status, output);
        }

        let mut event = Message::notification(
            self.config.orchestrator_id.clone(),
            AgentId::new(TOPIC_WORKFLOW_STATUS),
            ACTION_STATUS,
            json!({
                "workflowId": self.workflow_id,
                "taskId": task.task_id,
                "status": status,
                "output": output,
                "error": task.error,
            }),
        );
        event.timestamp = self.runtime.next_timestamp();
        self.runtime.bus().publish(TOPIC_WORKFLOW_STATUS, event);
    }
}
