use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use leadflow_core::domain::workflow::{
    Context, ExecutionStep, StepStatus, WorkflowDefinition, WorkflowExecution,
    WorkflowExecutionId, WorkflowExecutionStatus, WorkflowId,
};
use leadflow_core::events::{DomainEvent, EventSink, EventType};
use leadflow_db::repositories::{
    LeadStore, WorkflowDefinitionRepository, WorkflowExecutionRepository,
};

use crate::errors::{NodeError, WorkflowError};
use crate::invoker::AgentInvoker;
use crate::nodes::{NodeExecutors, NodeInput};
use crate::registry::{Advance, ExecutionRegistry};

struct EngineInner {
    definitions: Arc<dyn WorkflowDefinitionRepository>,
    executions: Arc<dyn WorkflowExecutionRepository>,
    nodes: NodeExecutors,
    events: Arc<dyn EventSink>,
    registry: ExecutionRegistry,
}

/// Runs workflow definitions node by node against a shared context.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn new(
        definitions: Arc<dyn WorkflowDefinitionRepository>,
        executions: Arc<dyn WorkflowExecutionRepository>,
        agents: Arc<dyn AgentInvoker>,
        leads: Arc<dyn LeadStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                definitions,
                registry: ExecutionRegistry::new(Arc::clone(&executions)),
                executions,
                nodes: NodeExecutors::new(agents, leads, Arc::clone(&events)),
                events,
            }),
        }
    }

    /// Validates the graph and stores the definition.
    pub async fn save_workflow(&self, definition: WorkflowDefinition) -> Result<(), WorkflowError> {
        definition.entry_node()?;
        self.inner.definitions.save(definition).await?;
        Ok(())
    }

    pub async fn execute_workflow(
        &self,
        workflow_id: &WorkflowId,
        trigger_data: Value,
        lead_id: Option<String>,
    ) -> Result<WorkflowExecutionId, WorkflowError> {
        let definition = self
            .inner
            .definitions
            .find_by_id(workflow_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("workflow `{workflow_id}`")))?;
        let entry_node = definition.entry_node()?.id.clone();

        let mut context = Context::new();
        if let Value::Object(entries) = &trigger_data {
            context.extend(entries.clone());
        }
        context.insert("trigger".to_string(), trigger_data);
        if let Some(lead_id) = &lead_id {
            context.insert("leadId".to_string(), Value::String(lead_id.clone()));
        }

        let execution = WorkflowExecution::start(workflow_id.clone(), lead_id, context);
        let execution_id = execution.id.clone();
        self.inner.executions.save_execution(execution.clone()).await?;
        self.inner.registry.register(execution.clone(), Arc::new(definition)).await;

        info!(
            event_name = "workflow.execution.started",
            execution_id = %execution_id,
            workflow_id = %workflow_id,
            "workflow execution started"
        );
        self.emit(
            EventType::WorkflowStarted,
            &execution_id,
            json!({
                "executionId": execution_id.0,
                "workflowId": workflow_id.0,
                "leadId": execution.lead_id,
            }),
        );

        self.spawn_segment(execution_id.clone(), entry_node);
        Ok(execution_id)
    }

    fn spawn_segment(&self, execution_id: WorkflowExecutionId, node_id: String) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.drive(execution_id, node_id).await;
        });
    }

    /// Walks the graph from `node_id` until the execution finishes, suspends or is stopped.
    async fn drive(&self, execution_id: WorkflowExecutionId, mut node_id: String) {
        loop {
            let ticket = match self.inner.registry.begin_step(&execution_id, &node_id).await {
                Ok(Some(ticket)) => ticket,
                Ok(None) => return,
                Err(error) => {
                    self.abort(&execution_id, error).await;
                    return;
                }
            };

            debug!(
                event_name = "workflow.node.started",
                execution_id = %execution_id,
                node_id = %ticket.node.id,
                node_type = ticket.node.node_type().as_str(),
                "workflow node started"
            );

            let input = NodeInput {
                execution_id: &execution_id,
                lead_id: ticket.lead_id.as_deref(),
                context: &ticket.context,
            };
            let outcome = tokio::select! {
                outcome = self.inner.nodes.run(&ticket.node, input) => outcome,
                _ = ticket.cancel.cancelled() => Err(NodeError::new("cancelled")),
            };

            let advance = self
                .inner
                .registry
                .apply_output(&execution_id, ticket.step, &ticket.node, outcome)
                .await;
            match advance {
                Ok(Advance::Next(next)) => node_id = next,
                Ok(Advance::Suspended(notice)) => {
                    info!(
                        event_name = "workflow.approval.required",
                        execution_id = %execution_id,
                        node_id = %ticket.node.id,
                        "workflow suspended for approval"
                    );
                    self.emit(EventType::ApprovalRequired, &execution_id, notice);
                    return;
                }
                Ok(Advance::Finished(execution)) => {
                    self.announce_completion(&execution);
                    return;
                }
                Ok(Advance::Halted) => {
                    debug!(
                        event_name = "workflow.node.discarded",
                        execution_id = %execution_id,
                        node_id = %ticket.node.id,
                        "node result discarded for a stopped execution"
                    );
                    return;
                }
                Err(error) => {
                    self.abort(&execution_id, error).await;
                    return;
                }
            }
        }
    }

    async fn abort(&self, execution_id: &WorkflowExecutionId, cause: WorkflowError) {
        error!(
            event_name = "workflow.execution.aborted",
            execution_id = %execution_id,
            error = %cause,
            "workflow execution aborted"
        );
        if let Some(failed) = self.inner.registry.abort(execution_id, cause.to_string()).await {
            self.announce_completion(&failed);
        }
    }

    fn announce_completion(&self, execution: &WorkflowExecution) {
        match execution.status {
            WorkflowExecutionStatus::Completed => info!(
                event_name = "workflow.execution.completed",
                execution_id = %execution.id,
                workflow_id = %execution.workflow_id,
                "workflow execution completed"
            ),
            status => warn!(
                event_name = "workflow.execution.ended",
                execution_id = %execution.id,
                workflow_id = %execution.workflow_id,
                status = status.as_str(),
                error = execution.error.as_deref().unwrap_or_default(),
                "workflow execution ended without completing"
            ),
        }

        self.emit(
            EventType::WorkflowCompleted,
            &execution.id,
            json!({
                "executionId": execution.id.0,
                "workflowId": execution.workflow_id.0,
                "leadId": execution.lead_id,
                "status": execution.status.as_str(),
                "error": execution.error,
            }),
        );
    }

    /// Resumes or cancels an execution suspended at `node_id`.
    pub async fn approve_workflow_step(
        &self,
        execution_id: &WorkflowExecutionId,
        node_id: &str,
        approved: bool,
        modified_data: Option<Value>,
    ) -> Result<WorkflowExecution, WorkflowError> {
        self.rehydrate(execution_id, node_id).await?;

        let advance = self
            .inner
            .registry
            .resolve_approval(execution_id, node_id, approved, modified_data)
            .await?;

        info!(
            event_name = "workflow.approval.resolved",
            execution_id = %execution_id,
            node_id,
            approved,
            "workflow approval resolved"
        );
        self.emit(
            EventType::ApprovalResolved,
            execution_id,
            json!({ "executionId": execution_id.0, "nodeId": node_id, "approved": approved }),
        );

        match advance {
            Advance::Next(next) => {
                let snapshot = self.get_execution(execution_id).await?;
                self.spawn_segment(execution_id.clone(), next);
                Ok(snapshot)
            }
            Advance::Finished(execution) => {
                self.announce_completion(&execution);
                Ok(execution)
            }
            Advance::Suspended(_) | Advance::Halted => self.get_execution(execution_id).await,
        }
    }

    /// Loads a suspended execution that is not live, e.g. after a restart.
    async fn rehydrate(
        &self,
        execution_id: &WorkflowExecutionId,
        node_id: &str,
    ) -> Result<(), WorkflowError> {
        if self.inner.registry.contains(execution_id).await {
            return Ok(());
        }

        let execution = self.persisted(execution_id).await?;
        if !execution.is_running() {
            return Err(WorkflowError::invalid_state(
                execution_id,
                format!("execution is {}", execution.status.as_str()),
            ));
        }

        let pending = self.last_pending_step(execution_id).await?.filter(|step| step.node_id == node_id);
        let Some(pending) = pending else {
            return Err(WorkflowError::invalid_state(
                execution_id,
                format!("execution is not awaiting approval at `{node_id}`"),
            ));
        };

        let definition = self
            .inner
            .definitions
            .find_by_id(&execution.workflow_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("workflow `{}`", execution.workflow_id)))?;

        debug!(
            event_name = "workflow.execution.rehydrated",
            execution_id = %execution_id,
            node_id,
            "restored suspended workflow execution"
        );
        self.inner.registry.restore_suspended(execution, Arc::new(definition), pending).await;
        Ok(())
    }

    async fn last_pending_step(
        &self,
        execution_id: &WorkflowExecutionId,
    ) -> Result<Option<ExecutionStep>, WorkflowError> {
        let steps = self.inner.executions.list_steps(execution_id).await?;
        Ok(steps.into_iter().last().filter(|step| step.status == StepStatus::Pending))
    }

    /// The last step when it never reached a terminal status: a suspended approval, or a node
    /// that was mid-visit when the previous process went away.
    async fn last_unfinished_step(
        &self,
        execution_id: &WorkflowExecutionId,
    ) -> Result<Option<ExecutionStep>, WorkflowError> {
        let steps = self.inner.executions.list_steps(execution_id).await?;
        Ok(steps
            .into_iter()
            .last()
            .filter(|step| matches!(step.status, StepStatus::Pending | StepStatus::Running)))
    }

    /// Cancels a RUNNING execution wherever it is, including while suspended or delayed.
    pub async fn stop_execution(
        &self,
        execution_id: &WorkflowExecutionId,
    ) -> Result<WorkflowExecution, WorkflowError> {
        let cancelled = match self.inner.registry.stop(execution_id).await? {
            Some(cancelled) => cancelled,
            None => self.stop_persisted(execution_id).await?,
        };

        info!(
            event_name = "workflow.execution.stopped",
            execution_id = %execution_id,
            "workflow execution stopped"
        );
        self.announce_completion(&cancelled);
        Ok(cancelled)
    }

    async fn stop_persisted(
        &self,
        execution_id: &WorkflowExecutionId,
    ) -> Result<WorkflowExecution, WorkflowError> {
        let mut execution = self.persisted(execution_id).await?;
        if !execution.is_running() {
            return Err(WorkflowError::invalid_state(
                execution_id,
                format!("execution is {}", execution.status.as_str()),
            ));
        }

        if let Some(mut step) = self.last_unfinished_step(execution_id).await? {
            step.skip(json!({ "status": "cancelled" }));
            self.inner.executions.save_step(step).await?;
        }
        execution.finish(WorkflowExecutionStatus::Cancelled, None)?;
        self.inner.executions.save_execution(execution.clone()).await?;
        Ok(execution)
    }

    pub async fn get_execution(
        &self,
        execution_id: &WorkflowExecutionId,
    ) -> Result<WorkflowExecution, WorkflowError> {
        match self.inner.registry.snapshot(execution_id).await {
            Some(execution) => Ok(execution),
            None => self.persisted(execution_id).await,
        }
    }

    /// Live RUNNING executions, including those suspended at an approval.
    pub async fn list_active(&self) -> Vec<WorkflowExecution> {
        self.inner.registry.active().await
    }

    pub async fn list_steps(
        &self,
        execution_id: &WorkflowExecutionId,
    ) -> Result<Vec<ExecutionStep>, WorkflowError> {
        Ok(self.inner.executions.list_steps(execution_id).await?)
    }

    async fn persisted(
        &self,
        execution_id: &WorkflowExecutionId,
    ) -> Result<WorkflowExecution, WorkflowError> {
        self.inner
            .executions
            .find_execution(execution_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("workflow execution `{execution_id}`")))
    }

    fn emit(&self, event_type: EventType, execution_id: &WorkflowExecutionId, payload: Value) {
        self.inner.events.emit(DomainEvent::new(event_type, execution_id.0.clone(), payload));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use leadflow_core::domain::lead::{Lead, LeadId};
    use leadflow_core::domain::workflow::{
        ExecutionStep, NodeType, StepStatus, WorkflowDefinition, WorkflowExecution,
        WorkflowExecutionId, WorkflowExecutionStatus, WorkflowId,
    };
    use leadflow_core::events::{EventType, InMemoryEventSink};
    use leadflow_db::repositories::{
        InMemoryLeadStore, InMemoryWorkflowDefinitionRepository,
        InMemoryWorkflowExecutionRepository, LeadStore, WorkflowDefinitionRepository,
        WorkflowExecutionRepository,
    };

    use super::WorkflowEngine;
    use crate::errors::{AgentInvocationError, WorkflowError};
    use crate::invoker::{AgentInvocation, AgentInvoker};

    struct ScriptedAgent {
        reply: Result<Value, String>,
    }

    #[async_trait]
    impl AgentInvoker for ScriptedAgent {
        async fn invoke(&self, _invocation: AgentInvocation) -> Result<Value, AgentInvocationError> {
            self.reply.clone().map_err(AgentInvocationError::Llm)
        }
    }

    struct Harness {
        engine: WorkflowEngine,
        definitions: Arc<InMemoryWorkflowDefinitionRepository>,
        executions: Arc<InMemoryWorkflowExecutionRepository>,
        leads: Arc<InMemoryLeadStore>,
        events: InMemoryEventSink,
    }

    impl Harness {
        async fn new(reply: Result<Value, String>) -> Self {
            let definitions = Arc::new(InMemoryWorkflowDefinitionRepository::default());
            let executions = Arc::new(InMemoryWorkflowExecutionRepository::default());
            let leads = Arc::new(InMemoryLeadStore::default());
            leads.insert(Lead::new(LeadId("lead-1".to_string()), "Ada Lovelace")).await;
            let events = InMemoryEventSink::default();
            let engine = WorkflowEngine::new(
                definitions.clone(),
                executions.clone(),
                Arc::new(ScriptedAgent { reply }),
                leads.clone(),
                Arc::new(events.clone()),
            );
            Self { engine, definitions, executions, leads, events }
        }

        /// A second engine over the same storage, as after a process restart.
        fn restarted(&self) -> WorkflowEngine {
            WorkflowEngine::new(
                self.definitions.clone(),
                self.executions.clone(),
                Arc::new(ScriptedAgent { reply: Ok(json!({})) }),
                self.leads.clone(),
                Arc::new(self.events.clone()),
            )
        }

        async fn install(&self, workflow: Value) -> WorkflowId {
            let definition: WorkflowDefinition = serde_json::from_value(workflow).expect("definition");
            let id = definition.id.clone();
            self.definitions.save(definition).await.expect("save definition");
            id
        }

        async fn start(&self, workflow: &WorkflowId) -> WorkflowExecutionId {
            self.engine
                .execute_workflow(workflow, json!({ "source": "webform" }), Some("lead-1".to_string()))
                .await
                .expect("start workflow")
        }

        async fn settle(&self, id: &WorkflowExecutionId) -> WorkflowExecution {
            for _ in 0..500 {
                let execution = self.engine.get_execution(id).await.expect("execution");
                if execution.status.is_terminal() {
                    return execution;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("workflow execution {id} did not finish");
        }

        async fn wait_for_step(&self, id: &WorkflowExecutionId, node_id: &str, status: StepStatus) {
            for _ in 0..500 {
                let steps = self.engine.list_steps(id).await.expect("steps");
                if steps.iter().any(|step| step.node_id == node_id && step.status == status) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("step {node_id} never reached {status:?}");
        }

        async fn lead(&self) -> Lead {
            self.leads.find_lead(&LeadId("lead-1".to_string())).await.expect("find").expect("lead")
        }
    }

    fn scoring_workflow() -> Value {
        json!({
            "id": "qualify",
            "name": "Qualify inbound lead",
            "nodes": [
                { "id": "start", "type": "trigger", "connections": { "next": "analyze" } },
                {
                    "id": "analyze",
                    "type": "ai_agent",
                    "config": { "prompt": "Score {leadId}" },
                    "connections": { "next": "check" }
                },
                {
                    "id": "check",
                    "type": "condition",
                    "config": { "condition": "{analyze.confidence} > 0.8" },
                    "connections": { "true": "hot", "false": "cold" }
                },
                { "id": "hot", "type": "update_lead", "config": { "priority": "HIGH" } },
                { "id": "cold", "type": "update_lead", "config": { "priority": "LOW" } }
            ]
        })
    }

    fn approval_workflow() -> Value {
        json!({
            "id": "review",
            "name": "Manual review",
            "nodes": [
                { "id": "start", "type": "trigger", "connections": { "next": "gate" } },
                {
                    "id": "gate",
                    "type": "human_approval",
                    "config": { "message": "Contact {leadId}?", "approvers": ["sales-lead"] },
                    "connections": { "next": "welcome" }
                },
                {
                    "id": "welcome",
                    "type": "send_message",
                    "config": { "message": "Hello {note}" }
                }
            ]
        })
    }

    #[tokio::test]
    async fn condition_routes_on_agent_confidence() {
        let harness = Harness::new(Ok(json!({ "response": "hot lead", "confidence": 0.95 }))).await;
        let workflow = harness.install(scoring_workflow()).await;

        let id = harness.start(&workflow).await;
        let finished = harness.settle(&id).await;

        assert_eq!(finished.status, WorkflowExecutionStatus::Completed);
        assert_eq!(finished.context["source"], "webform");
        assert_eq!(finished.context["trigger"], json!({ "source": "webform" }));
        assert_eq!(finished.context["check"], json!({ "conditionResult": true }));
        assert_eq!(harness.lead().await.priority.as_deref(), Some("HIGH"));

        let steps = harness.engine.list_steps(&id).await.expect("steps");
        let visited: Vec<&str> = steps.iter().map(|step| step.node_id.as_str()).collect();
        assert_eq!(visited, vec!["start", "analyze", "check", "hot"]);
        assert!(steps.iter().all(|step| step.status == StepStatus::Completed));
        assert_eq!(steps[2].input()["analyze"]["response"], "hot lead");

        assert_eq!(harness.events.of_type(EventType::WorkflowStarted).len(), 1);
        assert_eq!(harness.events.of_type(EventType::WorkflowCompleted).len(), 1);
        assert_eq!(harness.events.of_type(EventType::LeadUpdated).len(), 1);
    }

    #[tokio::test]
    async fn low_confidence_takes_the_false_branch() {
        let harness = Harness::new(Ok(json!({ "response": "meh", "confidence": 0.2 }))).await;
        let workflow = harness.install(scoring_workflow()).await;

        let id = harness.start(&workflow).await;
        harness.settle(&id).await;

        assert_eq!(harness.lead().await.priority.as_deref(), Some("LOW"));
    }

    #[tokio::test]
    async fn failing_node_fails_the_execution_without_retry() {
        let harness = Harness::new(Err("model unavailable".to_string())).await;
        let workflow = harness.install(scoring_workflow()).await;

        let id = harness.start(&workflow).await;
        let finished = harness.settle(&id).await;

        assert_eq!(finished.status, WorkflowExecutionStatus::Failed);
        assert_eq!(finished.error.as_deref(), Some("language model call failed: model unavailable"));

        let steps = harness.engine.list_steps(&id).await.expect("steps");
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert_eq!(steps[1].status, StepStatus::Failed);
        assert_eq!(steps[1].node_type, NodeType::AiAgent);

        let completed = harness.events.of_type(EventType::WorkflowCompleted);
        assert_eq!(completed[0].payload["status"], "FAILED");
    }

    #[tokio::test]
    async fn invalid_graphs_are_rejected_before_any_row_exists() {
        let harness = Harness::new(Ok(json!({}))).await;
        let two_triggers = harness
            .install(json!({
                "id": "twins",
                "name": "Two triggers",
                "nodes": [
                    { "id": "a", "type": "trigger" },
                    { "id": "b", "type": "trigger" }
                ]
            }))
            .await;
        let dangling = harness
            .install(json!({
                "id": "dangling",
                "name": "Dangling edge",
                "nodes": [{ "id": "a", "type": "trigger", "connections": { "next": "nowhere" } }]
            }))
            .await;

        for workflow in [&two_triggers, &dangling] {
            let error = harness
                .engine
                .execute_workflow(workflow, json!({}), None)
                .await
                .expect_err("startup error");
            assert!(matches!(error, WorkflowError::Startup(_)), "{error}");
        }

        let missing = harness
            .engine
            .execute_workflow(&WorkflowId("nope".to_string()), json!({}), None)
            .await
            .expect_err("unknown workflow");
        assert!(matches!(missing, WorkflowError::NotFound(_)));
        assert!(harness.executions.list_executions(None).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn approval_merges_modified_data_and_resumes() {
        let harness = Harness::new(Ok(json!({}))).await;
        let workflow = harness.install(approval_workflow()).await;
        let id = harness.start(&workflow).await;
        harness.wait_for_step(&id, "gate", StepStatus::Pending).await;

        let required = harness.events.of_type(EventType::ApprovalRequired);
        assert_eq!(required[0].payload["message"], "Contact lead-1?");
        assert_eq!(harness.engine.list_active().await.len(), 1);

        harness
            .engine
            .approve_workflow_step(&id, "gate", true, Some(json!({ "note": "from sales" })))
            .await
            .expect("approve");
        let finished = harness.settle(&id).await;

        assert_eq!(finished.status, WorkflowExecutionStatus::Completed);
        assert_eq!(finished.context["gate_approved"], true);
        let messages = harness.leads.messages_for(&LeadId("lead-1".to_string())).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "Hello from sales");
        assert_eq!(harness.events.of_type(EventType::ApprovalResolved).len(), 1);
        assert!(harness.engine.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn approval_with_non_object_data_is_refused_and_stays_pending() {
        let harness = Harness::new(Ok(json!({}))).await;
        let workflow = harness.install(approval_workflow()).await;
        let id = harness.start(&workflow).await;
        harness.wait_for_step(&id, "gate", StepStatus::Pending).await;

        let error = harness
            .engine
            .approve_workflow_step(&id, "gate", true, Some(json!(["from sales"])))
            .await
            .expect_err("array payload");
        assert!(matches!(error, WorkflowError::InvalidState { ref reason, .. }
            if reason == "modified data must be a JSON object"));
        let suspended = harness.engine.get_execution(&id).await.expect("execution");
        assert!(!suspended.context.contains_key("gate_approved"));

        harness
            .engine
            .approve_workflow_step(&id, "gate", true, Some(json!({ "note": "on retry" })))
            .await
            .expect("approve with an object");
        let finished = harness.settle(&id).await;
        assert_eq!(finished.status, WorkflowExecutionStatus::Completed);
        let messages = harness.leads.messages_for(&LeadId("lead-1".to_string())).await;
        assert_eq!(messages[0].content, "Hello on retry");
    }

    #[tokio::test]
    async fn rejection_cancels_and_runs_nothing_further() {
        let harness = Harness::new(Ok(json!({}))).await;
        let workflow = harness.install(approval_workflow()).await;
        let id = harness.start(&workflow).await;
        harness.wait_for_step(&id, "gate", StepStatus::Pending).await;

        let rejected =
            harness.engine.approve_workflow_step(&id, "gate", false, None).await.expect("reject");

        assert_eq!(rejected.status, WorkflowExecutionStatus::Cancelled);
        assert_eq!(rejected.context["gate_approved"], false);
        let steps = harness.engine.list_steps(&id).await.expect("steps");
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].status, StepStatus::Completed);
        assert!(harness.leads.messages_for(&LeadId("lead-1".to_string())).await.is_empty());
    }

    #[tokio::test]
    async fn approval_at_the_wrong_node_or_after_stop_is_invalid() {
        let harness = Harness::new(Ok(json!({}))).await;
        let workflow = harness.install(approval_workflow()).await;
        let id = harness.start(&workflow).await;
        harness.wait_for_step(&id, "gate", StepStatus::Pending).await;

        let wrong_node = harness
            .engine
            .approve_workflow_step(&id, "welcome", true, None)
            .await
            .expect_err("not suspended there");
        assert!(matches!(wrong_node, WorkflowError::InvalidState { .. }));

        let stopped = harness.engine.stop_execution(&id).await.expect("stop");
        assert_eq!(stopped.status, WorkflowExecutionStatus::Cancelled);

        let late = harness
            .engine
            .approve_workflow_step(&id, "gate", true, None)
            .await
            .expect_err("stopped first");
        assert!(matches!(late, WorkflowError::InvalidState { .. }));

        let again = harness.engine.stop_execution(&id).await.expect_err("already cancelled");
        assert!(matches!(again, WorkflowError::InvalidState { .. }));

        let steps = harness.engine.list_steps(&id).await.expect("steps");
        assert_eq!(steps[1].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn stop_interrupts_a_long_delay() {
        let harness = Harness::new(Ok(json!({}))).await;
        let workflow = harness
            .install(json!({
                "id": "nurture",
                "name": "Slow nurture",
                "nodes": [
                    { "id": "start", "type": "trigger", "connections": { "next": "wait" } },
                    {
                        "id": "wait",
                        "type": "delay",
                        "config": { "delay": 10, "unit": "minutes" },
                        "connections": { "next": "tag" }
                    },
                    { "id": "tag", "type": "update_lead", "config": { "status": "NURTURED" } }
                ]
            }))
            .await;
        let id = harness.start(&workflow).await;
        harness.wait_for_step(&id, "wait", StepStatus::Running).await;

        let stopped = tokio::time::timeout(Duration::from_secs(2), harness.engine.stop_execution(&id))
            .await
            .expect("stop returns promptly")
            .expect("stop");
        assert_eq!(stopped.status, WorkflowExecutionStatus::Cancelled);

        harness.wait_for_step(&id, "wait", StepStatus::Skipped).await;
        let persisted = harness.executions.find_execution(&id).await.expect("find").expect("row");
        assert_eq!(persisted.status, WorkflowExecutionStatus::Cancelled);
        assert_eq!(harness.lead().await.status, "NEW");

        let completed = harness.events.of_type(EventType::WorkflowCompleted);
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].payload["status"], "CANCELLED");
    }

    #[tokio::test]
    async fn suspended_execution_can_be_approved_after_restart() {
        let harness = Harness::new(Ok(json!({}))).await;
        let workflow = harness.install(approval_workflow()).await;
        let id = harness.start(&workflow).await;
        harness.wait_for_step(&id, "gate", StepStatus::Pending).await;

        let restarted = harness.restarted();
        assert!(restarted.list_active().await.is_empty());

        restarted
            .approve_workflow_step(&id, "gate", true, Some(json!({ "note": "after restart" })))
            .await
            .expect("approve on restarted engine");

        let mut finished = None;
        for _ in 0..500 {
            let execution = restarted.get_execution(&id).await.expect("execution");
            if execution.status.is_terminal() {
                finished = Some(execution);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let finished = finished.expect("finished");
        assert_eq!(finished.status, WorkflowExecutionStatus::Completed);
        let messages = harness.leads.messages_for(&LeadId("lead-1".to_string())).await;
        assert_eq!(messages[0].content, "Hello after restart");
    }

    #[tokio::test]
    async fn stopping_after_restart_skips_a_step_left_running() {
        let harness = Harness::new(Ok(json!({}))).await;
        let workflow = harness
            .install(json!({
                "id": "nurture",
                "name": "Slow nurture",
                "nodes": [
                    { "id": "start", "type": "trigger", "connections": { "next": "wait" } },
                    { "id": "wait", "type": "delay", "config": { "delay": 1, "unit": "hours" } }
                ]
            }))
            .await;
        let definition = harness
            .definitions
            .find_by_id(&workflow)
            .await
            .expect("find")
            .expect("definition");
        let wait = definition.node("wait").expect("wait node");

        let execution = WorkflowExecution::start(workflow.clone(), None, Default::default());
        let id = execution.id.clone();
        harness.executions.save_execution(execution.clone()).await.expect("save execution");
        let interrupted = ExecutionStep::start(id.clone(), wait, &execution.context);
        harness.executions.save_step(interrupted).await.expect("save step");

        let restarted = harness.restarted();
        let stopped = restarted.stop_execution(&id).await.expect("stop persisted execution");

        assert_eq!(stopped.status, WorkflowExecutionStatus::Cancelled);
        let steps = restarted.list_steps(&id).await.expect("steps");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Skipped);
        assert_eq!(steps[0].output, Some(json!({ "status": "cancelled" })));
        assert!(steps[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn lead_nodes_without_a_lead_fail_the_run() {
        let harness = Harness::new(Ok(json!({}))).await;
        let workflow = harness
            .install(json!({
                "id": "orphan",
                "name": "No lead",
                "nodes": [
                    { "id": "start", "type": "trigger", "connections": { "next": "ping" } },
                    { "id": "ping", "type": "send_message", "config": { "message": "hi" } }
                ]
            }))
            .await;

        let id = harness.engine.execute_workflow(&workflow, json!({}), None).await.expect("start");
        let finished = harness.settle(&id).await;

        assert_eq!(finished.status, WorkflowExecutionStatus::Failed);
        assert!(!finished.context.contains_key("leadId"));
        assert_eq!(finished.error.as_deref(), Some("send_message node `ping` requires a lead id"));
    }

    #[tokio::test]
    async fn save_workflow_validates_the_graph() {
        let harness = Harness::new(Ok(json!({}))).await;
        let definition: WorkflowDefinition = serde_json::from_value(json!({
            "id": "empty",
            "name": "No trigger",
            "nodes": [{ "id": "solo", "type": "delay" }]
        }))
        .expect("definition");

        let error = harness.engine.save_workflow(definition).await.expect_err("no trigger");
        assert!(matches!(error, WorkflowError::Startup(_)));
        assert!(harness
            .definitions
            .find_by_id(&WorkflowId("empty".to_string()))
            .await
            .expect("find")
            .is_none());
    }
}
