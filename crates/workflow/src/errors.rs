use thiserror::Error;

use leadflow_agent::RuntimeError;
use leadflow_core::domain::workflow::WorkflowExecutionId;
use leadflow_core::errors::{DomainError, ValidationError};
use leadflow_db::repositories::RepositoryError;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("workflow cannot start: {0}")]
    Startup(#[from] ValidationError),
    #[error("workflow execution `{execution_id}` cannot change: {reason}")]
    InvalidState { execution_id: WorkflowExecutionId, reason: String },
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("workflow persistence failed: {0}")]
    Repository(#[from] RepositoryError),
}

impl WorkflowError {
    pub(crate) fn invalid_state(execution_id: &WorkflowExecutionId, reason: impl Into<String>) -> Self {
        Self::InvalidState { execution_id: execution_id.clone(), reason: reason.into() }
    }
}

/// A node failed. Only the message is kept; it becomes the step and execution error.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct NodeError {
    pub message: String,
}

impl NodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl From<RepositoryError> for NodeError {
    fn from(error: RepositoryError) -> Self {
        Self::new(error.to_string())
    }
}

impl From<AgentInvocationError> for NodeError {
    fn from(error: AgentInvocationError) -> Self {
        Self::new(error.to_string())
    }
}

#[derive(Debug, Error)]
pub enum AgentInvocationError {
    #[error("ai_agent node requires an agentId to run an installed agent")]
    MissingAgentId,
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("agent execution {status}: {message}")]
    ExecutionFailed { status: String, message: String },
    #[error("language model call failed: {0}")]
    Llm(String),
}
