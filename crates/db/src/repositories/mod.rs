use async_trait::async_trait;
use thiserror::Error;

use leadflow_core::domain::agent::{AgentExecution, AgentExecutionId, AgentId};
use leadflow_core::domain::lead::{Lead, LeadId, LeadUpdate, Message};
use leadflow_core::domain::workflow::{
    ExecutionStep, WorkflowDefinition, WorkflowExecution, WorkflowExecutionId,
    WorkflowExecutionStatus, WorkflowId,
};

pub mod agent_execution;
mod decode;
pub mod lead;
pub mod memory;
pub mod workflow;

pub use agent_execution::SqlAgentExecutionRepository;
pub use lead::SqlLeadStore;
pub use memory::{
    InMemoryAgentExecutionRepository, InMemoryLeadStore, InMemoryWorkflowDefinitionRepository,
    InMemoryWorkflowExecutionRepository,
};
pub use workflow::{SqlWorkflowDefinitionRepository, SqlWorkflowExecutionRepository};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("integration failure: {0}")]
    Integration(String),
}

#[async_trait]
pub trait AgentExecutionRepository: Send + Sync {
    async fn find_by_id(
        &self,
        id: &AgentExecutionId,
    ) -> Result<Option<AgentExecution>, RepositoryError>;
    async fn save(&self, execution: AgentExecution) -> Result<(), RepositoryError>;
    async fn list_for_agent(
        &self,
        agent_id: &AgentId,
    ) -> Result<Vec<AgentExecution>, RepositoryError>;
}

#[async_trait]
pub trait WorkflowDefinitionRepository: Send + Sync {
    async fn find_by_id(
        &self,
        id: &WorkflowId,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError>;
    async fn save(&self, definition: WorkflowDefinition) -> Result<(), RepositoryError>;
}

/// Executions and their append-only step trail.
#[async_trait]
pub trait WorkflowExecutionRepository: Send + Sync {
    async fn find_execution(
        &self,
        id: &WorkflowExecutionId,
    ) -> Result<Option<WorkflowExecution>, RepositoryError>;

    async fn save_execution(&self, execution: WorkflowExecution) -> Result<(), RepositoryError>;

    async fn list_executions(
        &self,
        status: Option<WorkflowExecutionStatus>,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError>;

    /// Inserts or updates a step. A step's input is written once and never overwritten.
    async fn save_step(&self, step: ExecutionStep) -> Result<(), RepositoryError>;

    async fn list_steps(
        &self,
        execution_id: &WorkflowExecutionId,
    ) -> Result<Vec<ExecutionStep>, RepositoryError>;
}

#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn find_lead(&self, id: &LeadId) -> Result<Option<Lead>, RepositoryError>;
    async fn update_lead(&self, id: &LeadId, update: &LeadUpdate) -> Result<Lead, RepositoryError>;
    async fn send_message(&self, message: Message) -> Result<Message, RepositoryError>;
}
