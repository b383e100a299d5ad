//! Declarative workflow definitions.
//!
//! A workflow is a set of steps connected by `dependencies`. ACTION steps call
//! a remote agent; CONDITION steps evaluate a rule against the execution
//! context and record the boolean for downstream steps to branch on.
//!
//! # Example TOML
//!
//! ```toml
//! [workflow]
//! id = "health_check"
//! name = "Health check"
//! version = "1.0.0"
//! timeout_secs = 600
//!
//! [[workflow.steps]]
//! id = "init"
//! name = "Initial analysis"
//! type = "action"
//! agent = "xiaoai"
//! action = "analyze"
//! parameters = { depth = "full" }
//! retry_count = 2
//!
//! [[workflow.steps]]
//! id = "check"
//! name = "Severity check"
//! type = "condition"
//! dependencies = ["init"]
//! condition = { field = "severity", operator = "greater_than", value = 5 }
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, WorkflowError};

/// Top-level wrapper matching the TOML structure `[workflow]`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowFile {
    pub workflow: WorkflowDefinition,
}

impl WorkflowFile {
    /// Parse a workflow definition from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Load a workflow definition from a file path.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| WorkflowError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml(&content)
    }
}

/// A complete declarative workflow definition. Immutable once registered.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowDefinition {
    /// Unique workflow id (registry key).
    pub id: String,

    /// Human-readable name.
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "default_version")]
    pub version: String,

    /// Steps in display order. Execution order comes from `dependencies`.
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,

    /// Overall deadline in seconds, measured from execution start.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Default retry count for steps that don't set their own.
    #[serde(default)]
    pub retry_count: Option<u32>,

    #[serde(default)]
    pub metadata: HashMap<String, Value>,

    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// Kind of work a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Call an agent capability.
    Action,
    /// Evaluate a rule and record the boolean in the context.
    Condition,
}

/// A single step within a workflow.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowStep {
    /// Unique step identifier within this workflow.
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(rename = "type", default = "default_step_type")]
    pub step_type: StepType,

    /// Agent capability identifier (ACTION only).
    #[serde(default)]
    pub agent: Option<String>,

    /// Operation name on the agent (ACTION only).
    #[serde(default)]
    pub action: Option<String>,

    /// Parameters passed to the agent.
    #[serde(default)]
    pub parameters: HashMap<String, Value>,

    /// Hard deadline for a single agent call, in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Maximum retry attempts after the first failure.
    #[serde(default)]
    pub retry_count: Option<u32>,

    /// IDs of steps that must be terminal before this one starts.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// For ACTION steps, a gate: the step is skipped when it evaluates false.
    /// For CONDITION steps, the rule whose result is recorded.
    #[serde(default)]
    pub condition: Option<ConditionRule>,
}

fn default_step_type() -> StepType {
    StepType::Action
}

impl WorkflowStep {
    /// Create an ACTION step.
    pub fn action(id: impl Into<String>, agent: impl Into<String>, action: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            step_type: StepType::Action,
            agent: Some(agent.into()),
            action: Some(action.into()),
            parameters: HashMap::new(),
            timeout_secs: None,
            retry_count: None,
            dependencies: Vec::new(),
            condition: None,
        }
    }

    /// Create a CONDITION step evaluating `rule`.
    pub fn condition(id: impl Into<String>, rule: ConditionRule) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            step_type: StepType::Condition,
            agent: None,
            action: None,
            parameters: HashMap::new(),
            timeout_secs: None,
            retry_count: None,
            dependencies: Vec::new(),
            condition: Some(rule),
        }
    }

    /// Add a dependency on another step.
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies.push(step_id.into());
        self
    }

    /// Gate this step on a rule.
    pub fn when(mut self, rule: ConditionRule) -> Self {
        self.condition = Some(rule);
        self
    }

    /// Add an agent parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.retry_count = Some(retries);
        self
    }

    /// Context key under which an ACTION step's result is stored.
    pub fn result_key(&self) -> String {
        format!("step_{}_result", self.id)
    }

    /// Context key under which a CONDITION step's boolean is stored.
    pub fn condition_key(&self) -> String {
        format!("step_{}_condition", self.id)
    }
}

/// Comparison applied by a `ConditionRule`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    Contains,
}

impl std::fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Equals => "equals",
            Self::NotEquals => "not_equals",
            Self::GreaterThan => "greater_than",
            Self::LessThan => "less_than",
            Self::GreaterOrEqual => "greater_or_equal",
            Self::LessOrEqual => "less_or_equal",
            Self::Contains => "contains",
        };
        f.write_str(s)
    }
}

/// A comparison between a context path and a literal operand.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ConditionRule {
    /// Dotted path into the execution context, e.g. `step_init_result.severity`.
    pub field: String,
    pub operator: ConditionOperator,
    pub value: Value,
}

impl ConditionRule {
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

impl WorkflowDefinition {
    /// Create an empty workflow definition.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            version: default_version(),
            steps: Vec::new(),
            timeout_secs: None,
            retry_count: None,
            metadata: HashMap::new(),
            tags: Vec::new(),
        }
    }

    /// Add a step.
    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.retry_count = Some(retries);
        self
    }

    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl WorkflowDefinition {
    /// Validate the shape of each step.
    ///
    /// Checks:
    /// - Non-empty workflow id
    /// - Non-empty, unique step IDs
    /// - ACTION steps name an agent and an action
    /// - CONDITION steps carry a rule
    /// - Timeouts, where set, are non-zero
    ///
    /// Dependency references and cycles are checked by `DependencyGraph::build`.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(WorkflowError::InvalidWorkflow(
                "Workflow id cannot be empty".into(),
            ));
        }
        if self.timeout_secs == Some(0) {
            return Err(WorkflowError::InvalidWorkflow(format!(
                "Workflow '{}' timeout_secs must be greater than zero",
                self.id
            )));
        }

        let mut seen_ids = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(WorkflowError::InvalidWorkflow(format!(
                    "Workflow '{}' has a step with an empty id",
                    self.id
                )));
            }
            if !seen_ids.insert(step.id.as_str()) {
                return Err(WorkflowError::InvalidWorkflow(format!(
                    "Duplicate step ID: {}",
                    step.id
                )));
            }
            if step.timeout_secs == Some(0) {
                return Err(WorkflowError::InvalidWorkflow(format!(
                    "Step '{}' timeout_secs must be greater than zero",
                    step.id
                )));
            }

            match step.step_type {
                StepType::Action => {
                    let has_agent = step.agent.as_deref().is_some_and(|a| !a.is_empty());
                    let has_action = step.action.as_deref().is_some_and(|a| !a.is_empty());
                    if !has_agent || !has_action {
                        return Err(WorkflowError::InvalidWorkflow(format!(
                            "Action step '{}' must have both 'agent' and 'action'",
                            step.id
                        )));
                    }
                }
                StepType::Condition => {
                    if step.condition.is_none() {
                        return Err(WorkflowError::InvalidWorkflow(format!(
                            "Condition step '{}' must have a 'condition'",
                            step.id
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Fill step timeouts and retry counts that were left unset.
    ///
    /// Workflow-level values are defaults only: a value set on the step is
    /// kept as is. Steps still without a timeout get `default_timeout_secs`,
    /// and steps still without a retry count get zero.
    pub fn apply_defaults(&mut self, default_timeout_secs: u64) {
        let timeout = self.timeout_secs.unwrap_or(default_timeout_secs);
        let retries = self.retry_count.unwrap_or(0);
        for step in &mut self.steps {
            step.timeout_secs.get_or_insert(timeout);
            step.retry_count.get_or_insert(retries);
        }
    }
}
