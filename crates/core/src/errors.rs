use thiserror::Error;

use crate::domain::agent::AgentExecutionStatus;
use crate::domain::workflow::WorkflowExecutionStatus;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid agent execution transition from {from:?} to {to:?}")]
    InvalidAgentTransition { from: AgentExecutionStatus, to: AgentExecutionStatus },
    #[error("invalid workflow execution transition from {from:?} to {to:?}")]
    InvalidWorkflowTransition { from: WorkflowExecutionStatus, to: WorkflowExecutionStatus },
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

/// Rejections raised while loading manifests and workflow definitions.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unknown permission `{0}`")]
    UnknownPermission(String),
    #[error("{field} = {value} exceeds the platform ceiling of {ceiling}")]
    LimitExceeded { field: &'static str, value: u64, ceiling: u64 },
    #[error("node `{node_id}` has an invalid config: {message}")]
    InvalidNodeConfig { node_id: String, message: String },
    #[error("duplicate node id `{0}`")]
    DuplicateNode(String),
    #[error("node `{node_id}` connects to unknown node `{target}`")]
    DanglingConnection { node_id: String, target: String },
    #[error("workflow has no trigger node")]
    MissingTrigger,
    #[error("workflow has more than one trigger node")]
    MultipleTriggers,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        match value {
            ApplicationError::Domain(error) => Self::BadRequest {
                message: error.to_string(),
                correlation_id: "unassigned".to_owned(),
            },
            ApplicationError::Validation(error) => Self::BadRequest {
                message: error.to_string(),
                correlation_id: "unassigned".to_owned(),
            },
            ApplicationError::Persistence(message) | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id: "unassigned".to_owned() }
            }
            ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: "unassigned".to_owned() }
            }
        }
    }
}
