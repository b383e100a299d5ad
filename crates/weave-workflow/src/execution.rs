//! Runtime records for workflow executions.
//!
//! A `WorkflowExecution` owns one `StepExecution` per step of its definition.
//! Both are only mutated by the scheduler and the step dispatcher while they
//! hold the execution's lock; callers receive clones.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::definition::WorkflowDefinition;

/// Lifecycle of a whole execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Whether dependents may proceed past a step in this state.
    pub fn satisfies_dependency(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Per-step runtime record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_id: String,
    pub status: StepStatus,
    pub agent_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub execution_time_ms: u64,
    /// Agent data for ACTION steps, `{"condition_result": bool}` for CONDITION steps.
    pub result: Value,
    pub error: Option<String>,
    /// Retries consumed so far.
    pub retry_count: u32,
}

impl StepExecution {
    pub fn pending(step_id: impl Into<String>, agent_id: Option<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            agent_id,
            start_time: None,
            end_time: None,
            execution_time_ms: 0,
            result: Value::Null,
            error: None,
            retry_count: 0,
        }
    }

    /// Move to RUNNING and stamp the start time.
    pub fn start(&mut self) {
        self.status = StepStatus::Running;
        self.start_time = Some(Utc::now());
    }

    /// Move to a terminal state and stamp the end time.
    pub fn finish(&mut self, status: StepStatus) {
        debug_assert!(status.is_terminal());
        let now = Utc::now();
        self.status = status;
        self.end_time = Some(now);
        self.execution_time_ms = self
            .start_time
            .map(|start| (now - start).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
    }
}

/// One invocation of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub execution_id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    pub user_id: String,
    pub context: HashMap<String, Value>,
    pub status: ExecutionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub execution_time_ms: u64,
    /// Summary of the first unrecoverable failure, or the cancellation reason.
    pub error: Option<String>,
    pub steps: Vec<StepExecution>,
    pub metadata: HashMap<String, Value>,
    /// Non-fatal anomalies such as type-mismatched condition comparisons.
    pub warnings: Vec<String>,
}

impl WorkflowExecution {
    /// Create a PENDING execution with one PENDING record per step.
    ///
    /// The context is seeded from the caller's `context`, then every
    /// parameter at the top level, then the reserved `parameters` and
    /// `workflow` keys.
    pub fn new(
        definition: &WorkflowDefinition,
        parameters: HashMap<String, Value>,
        user_id: impl Into<String>,
        context: HashMap<String, Value>,
    ) -> Self {
        let execution_id = uuid::Uuid::new_v4().to_string();
        let user_id = user_id.into();

        let mut seeded = context;
        for (key, value) in &parameters {
            seeded.insert(key.clone(), value.clone());
        }
        let parameters_value = json!(parameters);
        seeded.insert("parameters".to_string(), parameters_value.clone());
        seeded.insert(
            "workflow".to_string(),
            json!({
                "id": definition.id,
                "name": definition.name,
                "version": definition.version,
                "execution_id": execution_id,
                "user_id": user_id,
            }),
        );

        let steps = definition
            .steps
            .iter()
            .map(|step| StepExecution::pending(&step.id, step.agent.clone()))
            .collect();

        Self {
            execution_id,
            workflow_id: definition.id.clone(),
            workflow_name: definition.name.clone(),
            user_id,
            context: seeded,
            status: ExecutionStatus::Pending,
            start_time: None,
            end_time: None,
            execution_time_ms: 0,
            error: None,
            steps,
            metadata: HashMap::from([("parameters".to_string(), parameters_value)]),
            warnings: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn step(&self, step_id: &str) -> Option<&StepExecution> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut StepExecution> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    /// Move to RUNNING and stamp the start time.
    pub fn start(&mut self) {
        self.status = ExecutionStatus::Running;
        self.start_time = Some(Utc::now());
    }

    /// Move to a terminal state and stamp the end time.
    pub fn finish(&mut self, status: ExecutionStatus, error: Option<String>) {
        debug_assert!(status.is_terminal());
        let now = Utc::now();
        self.status = status;
        if error.is_some() {
            self.error = error;
        }
        self.end_time = Some(now);
        self.execution_time_ms = self
            .start_time
            .map(|start| (now - start).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
    }

    /// Cancel the execution and every step that has not finished.
    ///
    /// Returns `false` if the execution was already terminal.
    pub fn cancel(&mut self, reason: Option<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        for step in &mut self.steps {
            if !step.status.is_terminal() {
                step.finish(StepStatus::Cancelled);
            }
        }
        self.finish(ExecutionStatus::Cancelled, reason);
        true
    }

    /// Snapshot of step counts and completion percentage.
    pub fn progress(&self) -> ExecutionProgress {
        let count = |status: StepStatus| self.steps.iter().filter(|s| s.status == status).count();

        let total_steps = self.steps.len();
        let completed_steps = count(StepStatus::Completed);
        let failed_steps = count(StepStatus::Failed);
        let skipped_steps = count(StepStatus::Skipped);
        let cancelled_steps = count(StepStatus::Cancelled);
        let running_steps = count(StepStatus::Running);

        let finished = completed_steps + failed_steps + skipped_steps;
        let progress_percentage = if total_steps == 0 {
            if self.status == ExecutionStatus::Completed {
                100.0
            } else {
                0.0
            }
        } else {
            finished as f64 / total_steps as f64 * 100.0
        };

        ExecutionProgress {
            execution_id: self.execution_id.clone(),
            status: self.status,
            total_steps,
            completed_steps,
            running_steps,
            failed_steps,
            skipped_steps,
            cancelled_steps,
            progress_percentage,
            steps: self
                .steps
                .iter()
                .map(|s| StepProgress {
                    step_id: s.step_id.clone(),
                    status: s.status,
                    agent_id: s.agent_id.clone(),
                    execution_time_ms: s.execution_time_ms,
                    retry_count: s.retry_count,
                })
                .collect(),
        }
    }
}

/// A consistent view of an execution's progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionProgress {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub running_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    pub cancelled_steps: usize,
    /// Terminal, non-cancelled steps as a percentage of all steps.
    pub progress_percentage: f64,
    pub steps: Vec<StepProgress>,
}

/// Per-step line of an `ExecutionProgress`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepProgress {
    pub step_id: String,
    pub status: StepStatus,
    pub agent_id: Option<String>,
    pub execution_time_ms: u64,
    pub retry_count: u32,
}
