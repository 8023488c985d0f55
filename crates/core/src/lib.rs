pub mod config;
pub mod domain;
pub mod errors;
pub mod events;
pub mod expression;
pub mod template;

pub use domain::agent::{
    AgentExecution, AgentExecutionId, AgentExecutionStatus, AgentId, AgentManifest,
    ResourceLimits, ResourceUsage,
};
pub use domain::lead::{Lead, LeadId, LeadUpdate, Message, MessageId};
pub use domain::workflow::{
    Context, ExecutionStep, ExecutionStepId, NodeConnections, NodeKind, NodeType, StepStatus,
    WorkflowDefinition, WorkflowExecution, WorkflowExecutionId, WorkflowExecutionStatus,
    WorkflowId, WorkflowNode,
};
pub use errors::{ApplicationError, DomainError, InterfaceError, ValidationError};
pub use events::{DomainEvent, EventSink, EventType, InMemoryEventSink, NoopEventSink};
pub use expression::{Expression, ExpressionError};
