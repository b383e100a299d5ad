//! Workflow engine facade.
//!
//! Provides `WorkflowEngine`, which owns the registry of definitions and the
//! map of executions, starts executions on the tokio runtime, and exposes
//! progress, cancellation, cleanup and shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info};

use crate::agent::SharedAgentClient;
use crate::definition::WorkflowDefinition;
use crate::dispatcher::StepDispatcher;
use crate::error::{Result, WorkflowError};
use crate::events::{EventBus, WorkflowEvent};
use crate::execution::{ExecutionProgress, WorkflowExecution};
use crate::graph::DependencyGraph;
use crate::retry::RetryPolicy;
use crate::scheduler::{ExecutionHandle, ExecutionScheduler};

/// Configuration for the workflow engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Step timeout when neither the step nor its workflow sets one.
    pub default_step_timeout_secs: u64,

    /// Backoff between retries of a failed agent call.
    pub retry: RetryPolicy,

    /// Buffer size of the live event channel.
    pub event_capacity: usize,

    /// Default max age for `cleanup_completed_executions`.
    pub retention_hours: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: 30,
            retry: RetryPolicy::default(),
            event_capacity: 256,
            retention_hours: 24,
        }
    }
}

/// A validated definition together with its dependency graph.
///
/// Steps are also indexed by position in `definition.steps`, which is the
/// order of `WorkflowExecution::steps` for every execution of it.
#[derive(Debug)]
pub(crate) struct RegisteredWorkflow {
    pub(crate) definition: WorkflowDefinition,
    pub(crate) graph: DependencyGraph,
    /// Topological order, by position.
    pub(crate) order: Vec<usize>,
    /// Dependencies of each step, by position.
    pub(crate) dependencies: Vec<Vec<usize>>,
}

impl RegisteredWorkflow {
    pub(crate) fn new(mut definition: WorkflowDefinition, default_timeout_secs: u64) -> Result<Self> {
        definition.validate()?;
        let graph = DependencyGraph::build(&definition)?;

        let positions: HashMap<&str, usize> = definition
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| (step.id.as_str(), i))
            .collect();
        let order = graph
            .topological_order()
            .iter()
            .filter_map(|id| positions.get(id.as_str()).copied())
            .collect();
        let dependencies = definition
            .steps
            .iter()
            .map(|step| {
                step.dependencies
                    .iter()
                    .filter_map(|dep| positions.get(dep.as_str()).copied())
                    .collect()
            })
            .collect();

        definition.apply_defaults(default_timeout_secs);
        Ok(Self {
            definition,
            graph,
            order,
            dependencies,
        })
    }
}

/// Registries owned by one engine instance.
#[derive(Default)]
struct EngineState {
    workflows: RwLock<HashMap<String, Arc<RegisteredWorkflow>>>,
    executions: RwLock<HashMap<String, Arc<ExecutionHandle>>>,
}

/// Registers workflow definitions and runs them against an agent client.
pub struct WorkflowEngine {
    config: EngineConfig,
    state: EngineState,
    dispatcher: Arc<StepDispatcher>,
    events: EventBus,
}

impl WorkflowEngine {
    pub fn new(agent: SharedAgentClient, config: EngineConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        let dispatcher = Arc::new(StepDispatcher::new(
            agent,
            config.retry,
            Duration::from_secs(config.default_step_timeout_secs),
            events.clone(),
        ));
        info!(
            default_step_timeout_secs = config.default_step_timeout_secs,
            "Workflow engine initialized"
        );
        Self {
            config,
            state: EngineState::default(),
            dispatcher,
            events,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Validate and register a definition.
    ///
    /// Unset step timeouts and retry counts are filled from the workflow,
    /// then from the engine defaults. Fails on invalid definitions and on
    /// duplicate ids.
    pub async fn register_workflow(&self, definition: WorkflowDefinition) -> Result<()> {
        let registered =
            RegisteredWorkflow::new(definition, self.config.default_step_timeout_secs)?;
        let id = registered.definition.id.clone();
        let step_count = registered.definition.steps.len();

        let mut workflows = self.state.workflows.write().await;
        if workflows.contains_key(&id) {
            return Err(WorkflowError::DuplicateWorkflow(id));
        }
        workflows.insert(id.clone(), Arc::new(registered));
        info!(workflow_id = %id, steps = step_count, "Workflow registered");
        Ok(())
    }

    /// The registered definition, with defaults applied.
    pub async fn get_workflow(&self, workflow_id: &str) -> Option<WorkflowDefinition> {
        self.state
            .workflows
            .read()
            .await
            .get(workflow_id)
            .map(|w| w.definition.clone())
    }

    /// All registered definitions, sorted by id.
    pub async fn list_workflows(&self) -> Vec<WorkflowDefinition> {
        let mut workflows: Vec<_> = self
            .state
            .workflows
            .read()
            .await
            .values()
            .map(|w| w.definition.clone())
            .collect();
        workflows.sort_by(|a, b| a.id.cmp(&b.id));
        workflows
    }

    pub async fn dependency_graph(&self, workflow_id: &str) -> Option<DependencyGraph> {
        self.state
            .workflows
            .read()
            .await
            .get(workflow_id)
            .map(|w| w.graph.clone())
    }

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Start an execution and return it as soon as it is RUNNING.
    ///
    /// Steps run in the background; use `get_execution`,
    /// `get_execution_progress`, `wait_for_execution` or `subscribe` to
    /// follow it.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        parameters: HashMap<String, Value>,
        user_id: &str,
        context: HashMap<String, Value>,
    ) -> Result<WorkflowExecution> {
        let workflow = self
            .state
            .workflows
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_id.to_string()))?;

        let mut execution = WorkflowExecution::new(&workflow.definition, parameters, user_id, context);
        execution.start();
        let execution_id = execution.execution_id.clone();
        let snapshot = execution.clone();

        let handle = Arc::new(ExecutionHandle::new(execution, workflow, self.events.clone()));
        self.state
            .executions
            .write()
            .await
            .insert(execution_id.clone(), handle.clone());

        info!(
            execution_id = %execution_id,
            workflow_id = %workflow_id,
            user_id = %user_id,
            "Workflow execution started"
        );
        self.events.publish(WorkflowEvent::ExecutionStarted {
            execution_id,
            workflow_id: workflow_id.to_string(),
        });

        let scheduler = ExecutionScheduler::new(handle, self.dispatcher.clone(), self.events.clone());
        tokio::spawn(scheduler.run());

        Ok(snapshot)
    }

    async fn handle(&self, execution_id: &str) -> Option<Arc<ExecutionHandle>> {
        self.state.executions.read().await.get(execution_id).cloned()
    }

    /// A consistent snapshot of an execution.
    pub async fn get_execution(&self, execution_id: &str) -> Option<WorkflowExecution> {
        self.handle(execution_id).await.map(|h| h.snapshot())
    }

    /// Snapshots of all executions, optionally only those of one user,
    /// newest first.
    pub async fn list_executions(&self, user_id: Option<&str>) -> Vec<WorkflowExecution> {
        let mut executions: Vec<_> = self
            .state
            .executions
            .read()
            .await
            .values()
            .map(|h| h.snapshot())
            .filter(|e| user_id.is_none_or(|u| e.user_id == u))
            .collect();
        executions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        executions
    }

    pub async fn get_execution_progress(&self, execution_id: &str) -> Option<ExecutionProgress> {
        self.handle(execution_id)
            .await
            .map(|h| h.record.lock().progress())
    }

    /// Cancel a running execution.
    ///
    /// Returns `false` if the execution is unknown or already terminal.
    pub async fn cancel_execution(&self, execution_id: &str) -> bool {
        let Some(handle) = self.handle(execution_id).await else {
            return false;
        };
        let cancelled = handle.cancel(None);
        if cancelled {
            info!(execution_id = %execution_id, "Workflow execution cancelled");
        }
        cancelled
    }

    /// Wait for an execution to reach a terminal state and return it.
    pub async fn wait_for_execution(&self, execution_id: &str) -> Result<WorkflowExecution> {
        let handle = self
            .handle(execution_id)
            .await
            .ok_or_else(|| WorkflowError::ExecutionNotFound(execution_id.to_string()))?;
        Ok(handle.wait().await)
    }

    /// Remove terminal executions that ended more than `max_age_hours` ago.
    pub async fn cleanup_completed_executions(&self, max_age_hours: u64) -> usize {
        let hours = i64::try_from(max_age_hours).unwrap_or(i64::MAX);
        let cutoff = chrono::Duration::try_hours(hours)
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let removed = self.cleanup_executions_before(cutoff).await;
        info!(removed, max_age_hours, "Cleaned up completed executions");
        removed
    }

    /// Remove terminal executions older than the configured `retention_hours`.
    pub async fn cleanup_expired_executions(&self) -> usize {
        self.cleanup_completed_executions(self.config.retention_hours)
            .await
    }

    pub(crate) async fn cleanup_executions_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut executions = self.state.executions.write().await;
        let before = executions.len();
        executions.retain(|execution_id, handle| {
            let exec = handle.record.lock();
            let expired = exec.is_terminal() && exec.end_time.is_some_and(|end| end < cutoff);
            if expired {
                debug!(execution_id = %execution_id, "Removing expired execution");
            }
            !expired
        });
        before - executions.len()
    }

    /// Receive live events for every execution of this engine.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    /// Cancel every execution that is still running.
    ///
    /// Returns the number of executions cancelled.
    pub async fn shutdown(&self) -> usize {
        info!("Workflow engine shutting down...");
        let handles: Vec<_> = self.state.executions.read().await.values().cloned().collect();
        let cancelled = handles
            .iter()
            .filter(|h| h.cancel(Some("engine shutting down".to_string())))
            .count();
        info!(cancelled, "Workflow engine shutdown complete");
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockAgentClient;
    use crate::definition::WorkflowStep;
    use crate::execution::ExecutionStatus;

    fn engine() -> WorkflowEngine {
        WorkflowEngine::new(Arc::new(MockAgentClient::new()), EngineConfig::default())
    }

    fn simple() -> WorkflowDefinition {
        WorkflowDefinition::new("simple", "Simple")
            .with_step(WorkflowStep::action("a", "agent", "run"))
    }

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.default_step_timeout_secs, 30);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.event_capacity, 256);
        assert_eq!(config.retention_hours, 24);
    }

    #[test]
    fn test_registered_workflow_positions() {
        let definition = WorkflowDefinition::new("wf", "wf")
            .with_step(WorkflowStep::action("c", "agent", "run").depends_on("b"))
            .with_step(WorkflowStep::action("a", "agent", "run"))
            .with_step(WorkflowStep::action("b", "agent", "run").depends_on("a"));
        let registered = RegisteredWorkflow::new(definition, 30).unwrap();
        assert_eq!(registered.order, vec![1, 2, 0]);
        assert_eq!(registered.dependencies, vec![vec![2], vec![], vec![1]]);
    }

    #[tokio::test]
    async fn test_register_applies_defaults() {
        let engine = engine();
        let definition = WorkflowDefinition::new("wf", "wf")
            .with_retry_count(2)
            .with_step(WorkflowStep::action("a", "agent", "run"))
            .with_step(WorkflowStep::action("b", "agent", "run").with_retry_count(0).with_timeout_secs(5));
        engine.register_workflow(definition).await.unwrap();

        let stored = engine.get_workflow("wf").await.unwrap();
        let a = stored.step("a").unwrap();
        assert_eq!(a.timeout_secs, Some(30));
        assert_eq!(a.retry_count, Some(2));
        let b = stored.step("b").unwrap();
        assert_eq!(b.timeout_secs, Some(5));
        assert_eq!(b.retry_count, Some(0));
    }

    #[tokio::test]
    async fn test_cleanup_by_age() {
        let engine = engine();
        engine.register_workflow(simple()).await.unwrap();

        let old = engine
            .execute_workflow("simple", HashMap::new(), "u1", HashMap::new())
            .await
            .unwrap();
        let recent = engine
            .execute_workflow("simple", HashMap::new(), "u1", HashMap::new())
            .await
            .unwrap();
        let running = engine
            .execute_workflow("simple", HashMap::new(), "u1", HashMap::new())
            .await
            .unwrap();
        engine.wait_for_execution(&old.execution_id).await.unwrap();
        engine.wait_for_execution(&recent.execution_id).await.unwrap();
        engine.wait_for_execution(&running.execution_id).await.unwrap();

        let now = Utc::now();
        {
            let executions = engine.state.executions.read().await;
            executions[&old.execution_id].record.lock().end_time = Some(now - chrono::Duration::hours(25));
            executions[&recent.execution_id].record.lock().end_time = Some(now - chrono::Duration::hours(1));
            // Not terminal, never removed regardless of age
            let mut exec = executions[&running.execution_id].record.lock();
            exec.status = ExecutionStatus::Running;
            exec.end_time = Some(now - chrono::Duration::hours(48));
        }

        assert_eq!(engine.cleanup_completed_executions(24).await, 1);
        assert!(engine.get_execution(&old.execution_id).await.is_none());
        assert!(engine.get_execution(&recent.execution_id).await.is_some());
        assert!(engine.get_execution(&running.execution_id).await.is_some());
    }

    #[tokio::test]
    async fn test_cleanup_uses_configured_retention() {
        let config = EngineConfig {
            retention_hours: 2,
            ..EngineConfig::default()
        };
        let engine = WorkflowEngine::new(Arc::new(MockAgentClient::new()), config);
        engine.register_workflow(simple()).await.unwrap();

        let mut ids = Vec::new();
        for _ in 0..2 {
            let exec = engine
                .execute_workflow("simple", HashMap::new(), "u1", HashMap::new())
                .await
                .unwrap();
            engine.wait_for_execution(&exec.execution_id).await.unwrap();
            ids.push(exec.execution_id);
        }

        let now = Utc::now();
        {
            let executions = engine.state.executions.read().await;
            executions[&ids[0]].record.lock().end_time = Some(now - chrono::Duration::hours(3));
            executions[&ids[1]].record.lock().end_time = Some(now - chrono::Duration::hours(1));
        }

        assert_eq!(engine.cleanup_expired_executions().await, 1);
        assert!(engine.get_execution(&ids[0]).await.is_none());
        assert!(engine.get_execution(&ids[1]).await.is_some());
    }

    #[tokio::test]
    async fn test_cancel_unknown_execution() {
        assert!(!engine().cancel_execution("nope").await);
    }

    #[tokio::test]
    async fn test_wait_for_unknown_execution() {
        let err = engine().wait_for_execution("nope").await.unwrap_err();
        assert!(matches!(err, WorkflowError::ExecutionNotFound(_)));
    }
}
