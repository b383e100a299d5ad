//! Declarative multi-step workflow engine for agent orchestration.
//!
//! A workflow is a DAG of steps. ACTION steps call an external agent
//! capability through an [`AgentClient`]; CONDITION steps evaluate a rule
//! against the execution context and record the boolean for later gates.
//! The [`WorkflowEngine`] registers definitions and runs executions as tokio
//! tasks, dispatching every ready step concurrently.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  WorkflowEngine                                          │
//! │  - Definition registry (validated, graph cached)         │
//! │  - Execution map, progress, cancel, cleanup              │
//! │                                                          │
//! │    ExecutionScheduler (one task per execution)           │
//! │    - Ready set + skip propagation in topological order   │
//! │                                                          │
//! │      StepDispatcher (one task per running step)          │
//! │      - Gates, conditions, templates                      │
//! │      - Agent call with timeout and retry backoff         │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod condition;
pub mod definition;
mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod execution;
pub mod graph;
pub mod loader;
pub mod retry;
mod scheduler;
pub mod template;

pub use agent::{
    AgentClient, AgentRequest, AgentResponse, MockAgentClient, MockCall, MockReply,
    SharedAgentClient,
};
pub use condition::{ConditionOutcome, Resolved, evaluate, evaluate_detailed, resolve_path};
pub use definition::{
    ConditionOperator, ConditionRule, StepType, WorkflowDefinition, WorkflowFile, WorkflowStep,
};
pub use engine::{EngineConfig, WorkflowEngine};
pub use error::{Result, WorkflowError};
pub use events::{EventBus, WorkflowEvent};
pub use execution::{
    ExecutionProgress, ExecutionStatus, StepExecution, StepProgress, StepStatus, WorkflowExecution,
};
pub use graph::DependencyGraph;
pub use loader::{LoadedFile, load_workflow_dir, load_workflow_file};
pub use retry::RetryPolicy;
pub use template::{resolve_parameters, resolve_value};
