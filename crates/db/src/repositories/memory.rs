use std::collections::HashMap;

use tokio::sync::RwLock;

use leadflow_core::domain::agent::{AgentExecution, AgentExecutionId, AgentId};
use leadflow_core::domain::lead::{Lead, LeadId, LeadUpdate, Message};
use leadflow_core::domain::workflow::{
    ExecutionStep, WorkflowDefinition, WorkflowExecution, WorkflowExecutionId,
    WorkflowExecutionStatus, WorkflowId,
};

use super::{
    AgentExecutionRepository, LeadStore, RepositoryError, WorkflowDefinitionRepository,
    WorkflowExecutionRepository,
};

#[derive(Default)]
pub struct InMemoryAgentExecutionRepository {
    executions: RwLock<HashMap<String, AgentExecution>>,
}

#[async_trait::async_trait]
impl AgentExecutionRepository for InMemoryAgentExecutionRepository {
    async fn find_by_id(
        &self,
        id: &AgentExecutionId,
    ) -> Result<Option<AgentExecution>, RepositoryError> {
        let executions = self.executions.read().await;
        Ok(executions.get(&id.0).cloned())
    }

    async fn save(&self, execution: AgentExecution) -> Result<(), RepositoryError> {
        let mut executions = self.executions.write().await;
        executions.insert(execution.id.0.clone(), execution);
        Ok(())
    }

    async fn list_for_agent(
        &self,
        agent_id: &AgentId,
    ) -> Result<Vec<AgentExecution>, RepositoryError> {
        let executions = self.executions.read().await;
        let mut matching: Vec<AgentExecution> =
            executions.values().filter(|execution| &execution.agent_id == agent_id).cloned().collect();
        matching.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.0.cmp(&b.id.0)));
        Ok(matching)
    }
}

#[derive(Default)]
pub struct InMemoryWorkflowDefinitionRepository {
    definitions: RwLock<HashMap<String, WorkflowDefinition>>,
}

#[async_trait::async_trait]
impl WorkflowDefinitionRepository for InMemoryWorkflowDefinitionRepository {
    async fn find_by_id(
        &self,
        id: &WorkflowId,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let definitions = self.definitions.read().await;
        Ok(definitions.get(&id.0).cloned())
    }

    async fn save(&self, definition: WorkflowDefinition) -> Result<(), RepositoryError> {
        let mut definitions = self.definitions.write().await;
        definitions.insert(definition.id.0.clone(), definition);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryWorkflowExecutionRepository {
    executions: RwLock<HashMap<String, WorkflowExecution>>,
    steps: RwLock<HashMap<String, Vec<ExecutionStep>>>,
}

#[async_trait::async_trait]
impl WorkflowExecutionRepository for InMemoryWorkflowExecutionRepository {
    async fn find_execution(
        &self,
        id: &WorkflowExecutionId,
    ) -> Result<Option<WorkflowExecution>, RepositoryError> {
        let executions = self.executions.read().await;
        Ok(executions.get(&id.0).cloned())
    }

    async fn save_execution(&self, execution: WorkflowExecution) -> Result<(), RepositoryError> {
        let mut executions = self.executions.write().await;
        executions.insert(execution.id.0.clone(), execution);
        Ok(())
    }

    async fn list_executions(
        &self,
        status: Option<WorkflowExecutionStatus>,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let executions = self.executions.read().await;
        let mut matching: Vec<WorkflowExecution> = executions
            .values()
            .filter(|execution| status.map(|status| execution.status == status).unwrap_or(true))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.0.cmp(&b.id.0)));
        Ok(matching)
    }

    async fn save_step(&self, step: ExecutionStep) -> Result<(), RepositoryError> {
        let mut steps = self.steps.write().await;
        let trail = steps.entry(step.execution_id.0.clone()).or_default();

        match trail.iter_mut().find(|existing| existing.id == step.id) {
            Some(existing) => {
                existing.status = step.status;
                existing.output = step.output;
                existing.error = step.error;
                existing.completed_at = step.completed_at;
            }
            None => trail.push(step),
        }
        Ok(())
    }

    async fn list_steps(
        &self,
        execution_id: &WorkflowExecutionId,
    ) -> Result<Vec<ExecutionStep>, RepositoryError> {
        let steps = self.steps.read().await;
        Ok(steps.get(&execution_id.0).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryLeadStore {
    leads: RwLock<HashMap<String, Lead>>,
    messages: RwLock<Vec<Message>>,
}

impl InMemoryLeadStore {
    pub async fn insert(&self, lead: Lead) {
        let mut leads = self.leads.write().await;
        leads.insert(lead.id.0.clone(), lead);
    }

    pub async fn messages_for(&self, lead_id: &LeadId) -> Vec<Message> {
        let messages = self.messages.read().await;
        messages.iter().filter(|message| &message.lead_id == lead_id).cloned().collect()
    }
}

#[async_trait::async_trait]
impl LeadStore for InMemoryLeadStore {
    async fn find_lead(&self, id: &LeadId) -> Result<Option<Lead>, RepositoryError> {
        let leads = self.leads.read().await;
        Ok(leads.get(&id.0).cloned())
    }

    async fn update_lead(&self, id: &LeadId, update: &LeadUpdate) -> Result<Lead, RepositoryError> {
        let mut leads = self.leads.write().await;
        let lead = leads
            .get_mut(&id.0)
            .ok_or_else(|| RepositoryError::NotFound(format!("lead `{}`", id.0)))?;
        lead.apply(update);
        Ok(lead.clone())
    }

    async fn send_message(&self, message: Message) -> Result<Message, RepositoryError> {
        if !self.leads.read().await.contains_key(&message.lead_id.0) {
            return Err(RepositoryError::NotFound(format!("lead `{}`", message.lead_id.0)));
        }

        let mut messages = self.messages.write().await;
        messages.push(message.clone());
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use leadflow_core::domain::agent::{AgentExecution, AgentExecutionStatus, AgentId};
    use leadflow_core::domain::lead::{Lead, LeadId, LeadUpdate, Message};
    use leadflow_core::domain::workflow::{
        ExecutionStep, StepStatus, WorkflowDefinition, WorkflowExecution, WorkflowId,
    };

    use crate::repositories::{
        AgentExecutionRepository, InMemoryAgentExecutionRepository, InMemoryLeadStore,
        InMemoryWorkflowExecutionRepository, LeadStore, RepositoryError,
        WorkflowExecutionRepository,
    };

    #[tokio::test]
    async fn in_memory_agent_execution_repo_round_trip() {
        let repo = InMemoryAgentExecutionRepository::default();
        let mut execution =
            AgentExecution::pending(AgentId("scorer".to_string()), "u-1", "s-1", json!({}));
        repo.save(execution.clone()).await.expect("save");

        execution.transition_to(AgentExecutionStatus::Running).expect("start");
        repo.save(execution.clone()).await.expect("update");

        assert_eq!(repo.find_by_id(&execution.id).await.expect("find"), Some(execution.clone()));
        assert_eq!(
            repo.list_for_agent(&AgentId("scorer".to_string())).await.expect("list"),
            vec![execution]
        );
    }

    #[tokio::test]
    async fn in_memory_step_updates_never_replace_the_input_snapshot() {
        let repo = InMemoryWorkflowExecutionRepository::default();
        let workflow: WorkflowDefinition = serde_json::from_value(json!({
            "id": "wf",
            "name": "wf",
            "nodes": [{ "id": "start", "type": "trigger" }]
        }))
        .expect("workflow");

        let mut context = Map::new();
        context.insert("stage".to_string(), json!("initial"));
        let execution = WorkflowExecution::start(WorkflowId("wf".to_string()), None, context.clone());
        let step = ExecutionStep::start(
            execution.id.clone(),
            workflow.node("start").expect("node"),
            &context,
        );
        repo.save_step(step.clone()).await.expect("insert");

        context.insert("stage".to_string(), json!("mutated"));
        let mut rewritten = ExecutionStep::start(
            execution.id.clone(),
            workflow.node("start").expect("node"),
            &context,
        );
        rewritten.id = step.id.clone();
        rewritten.complete(json!({ "triggered": true }));
        repo.save_step(rewritten).await.expect("update");

        let steps = repo.list_steps(&execution.id).await.expect("list");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert_eq!(steps[0].input()["stage"], "initial");
    }

    #[tokio::test]
    async fn in_memory_lead_store_rejects_unknown_leads() {
        let store = InMemoryLeadStore::default();
        store.insert(Lead::new(LeadId("lead-1".to_string()), "Ada")).await;

        let update = LeadUpdate { priority: Some("HIGH".to_string()), ..LeadUpdate::default() };
        let updated = store.update_lead(&LeadId("lead-1".to_string()), &update).await.expect("update");
        assert_eq!(updated.priority.as_deref(), Some("HIGH"));

        let error = store
            .send_message(Message::outbound(LeadId("nobody".to_string()), "hi", "TEXT"))
            .await
            .expect_err("unknown lead");
        assert!(matches!(error, RepositoryError::NotFound(_)));
        assert!(store.messages_for(&LeadId("nobody".to_string())).await.is_empty());
    }
}
