//! Error types for the workflow engine.

use thiserror::Error;

/// Result type for workflow operations.
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Errors surfaced synchronously by the workflow engine.
///
/// Step failures are not errors at this level: they are recorded on the
/// `StepExecution` and, when unrecoverable, on the owning execution.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The definition failed validation (unknown dependency, cycle, missing fields).
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// A workflow with the same id is already registered.
    #[error("Workflow already registered: {0}")]
    DuplicateWorkflow(String),

    /// Workflow not found.
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Execution not found.
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    /// The agent collaborator failed to deliver a response.
    #[error("Agent error: {0}")]
    Agent(String),

    /// A parameter template could not be resolved against the context.
    #[error("Template error: {0}")]
    Template(String),

    /// Failed to read a workflow file.
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    /// Failed to parse a workflow file.
    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<toml::de::Error> for WorkflowError {
    fn from(err: toml::de::Error) -> Self {
        WorkflowError::Parse(err.to_string())
    }
}
