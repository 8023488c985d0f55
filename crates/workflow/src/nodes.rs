use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::debug;

use leadflow_core::domain::lead::{LeadId, LeadUpdate, Message};
use leadflow_core::domain::workflow::{
    AiAgentConfig, Context, DelayConfig, HumanApprovalConfig, NodeKind, SendMessageConfig,
    UpdateLeadConfig, WorkflowExecutionId, WorkflowNode,
};
use leadflow_core::events::{DomainEvent, EventSink, EventType};
use leadflow_core::template;
use leadflow_db::repositories::LeadStore;

use crate::errors::NodeError;
use crate::invoker::{AgentInvocation, AgentInvoker};

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum NodeOutcome {
    Completed(Value),
    /// `notice` is published as `approval:required` once the suspension is recorded.
    Suspended { output: Value, notice: Value },
}

pub(crate) struct NodeInput<'a> {
    pub execution_id: &'a WorkflowExecutionId,
    pub lead_id: Option<&'a str>,
    pub context: &'a Context,
}

/// Per-kind behaviour of workflow nodes.
pub(crate) struct NodeExecutors {
    agents: Arc<dyn AgentInvoker>,
    leads: Arc<dyn LeadStore>,
    events: Arc<dyn EventSink>,
}

impl NodeExecutors {
    pub(crate) fn new(
        agents: Arc<dyn AgentInvoker>,
        leads: Arc<dyn LeadStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self { agents, leads, events }
    }

    pub(crate) async fn run(
        &self,
        node: &WorkflowNode,
        input: NodeInput<'_>,
    ) -> Result<NodeOutcome, NodeError> {
        match &node.kind {
            NodeKind::Trigger(_) => Ok(NodeOutcome::Completed(json!({ "triggered": true }))),
            NodeKind::AiAgent(config) => self.ai_agent(node, config, input).await,
            NodeKind::Condition(config) => {
                let result = config.expression.evaluate(input.context);
                debug!(
                    event_name = "workflow.condition.evaluated",
                    node_id = %node.id,
                    condition = %config.source,
                    result,
                    "condition evaluated"
                );
                Ok(NodeOutcome::Completed(json!({ "conditionResult": result })))
            }
            NodeKind::Delay(config) => delay(config).await,
            NodeKind::HumanApproval(config) => Ok(approval(node, config, input)),
            NodeKind::SendMessage(config) => self.send_message(node, config, input).await,
            NodeKind::UpdateLead(config) => self.update_lead(node, config, input).await,
        }
    }

    async fn ai_agent(
        &self,
        node: &WorkflowNode,
        config: &AiAgentConfig,
        input: NodeInput<'_>,
    ) -> Result<NodeOutcome, NodeError> {
        let invocation = AgentInvocation {
            execution_id: input.execution_id.clone(),
            node_id: node.id.clone(),
            lead_id: input.lead_id.map(str::to_string),
            agent_type: config.agent_type.clone(),
            agent_id: config.agent_id.clone(),
            prompt: template::render(&config.prompt, input.context),
            variables: input.context.clone(),
            settings: config.settings.clone(),
        };

        let output = self.agents.invoke(invocation).await?;
        Ok(NodeOutcome::Completed(output))
    }

    async fn send_message(
        &self,
        node: &WorkflowNode,
        config: &SendMessageConfig,
        input: NodeInput<'_>,
    ) -> Result<NodeOutcome, NodeError> {
        let lead_id = require_lead(node, input.lead_id)?;
        let content = template::render(&config.message, input.context);

        let message = Message::outbound(LeadId(lead_id.to_string()), content, &config.message_type);
        let sent = self.leads.send_message(message).await?;

        self.events.emit(DomainEvent::new(
            EventType::MessageSend,
            lead_id,
            json!({
                "executionId": input.execution_id.0,
                "nodeId": node.id,
                "leadId": lead_id,
                "messageId": sent.id.0,
                "content": sent.content,
                "messageType": sent.message_type,
            }),
        ));

        Ok(NodeOutcome::Completed(json!({
            "messageSent": true,
            "messageId": sent.id.0,
            "content": sent.content,
        })))
    }

    async fn update_lead(
        &self,
        node: &WorkflowNode,
        config: &UpdateLeadConfig,
        input: NodeInput<'_>,
    ) -> Result<NodeOutcome, NodeError> {
        let lead_id = require_lead(node, input.lead_id)?;
        let render = |value: &String| template::render(value, input.context);

        let update = LeadUpdate {
            status: config.status.as_ref().map(render),
            priority: config.priority.as_ref().map(render),
            ai_score: config.ai_score,
            fields: config
                .fields
                .iter()
                .map(|(key, value)| {
                    let rendered = match value {
                        Value::String(text) => Value::String(render(text)),
                        other => other.clone(),
                    };
                    (key.clone(), rendered)
                })
                .collect(),
        };

        self.leads.update_lead(&LeadId(lead_id.to_string()), &update).await?;
        let updates = serde_json::to_value(&update)
            .map_err(|error| NodeError::new(format!("lead update is not serializable: {error}")))?;

        self.events.emit(DomainEvent::new(
            EventType::LeadUpdated,
            lead_id,
            json!({
                "executionId": input.execution_id.0,
                "nodeId": node.id,
                "leadId": lead_id,
                "updates": updates,
            }),
        ));

        Ok(NodeOutcome::Completed(json!({ "leadUpdated": true, "updates": updates })))
    }
}

async fn delay(config: &DelayConfig) -> Result<NodeOutcome, NodeError> {
    let duration = config.duration();
    tokio::time::sleep(duration).await;
    let applied = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    Ok(NodeOutcome::Completed(json!({ "delayApplied": applied })))
}

fn approval(node: &WorkflowNode, config: &HumanApprovalConfig, input: NodeInput<'_>) -> NodeOutcome {
    let expires_at = config.expires_in_secs.map(|seconds| {
        let seconds = i64::try_from(seconds).unwrap_or(i64::MAX);
        (Utc::now() + chrono::Duration::seconds(seconds)).to_rfc3339()
    });

    NodeOutcome::Suspended {
        output: json!({ "status": "pending" }),
        notice: json!({
            "executionId": input.execution_id.0,
            "nodeId": node.id,
            "message": template::render(&config.message, input.context),
            "context": input.context,
            "leadId": input.lead_id,
            "approvers": config.approvers,
            "expiresAt": expires_at,
        }),
    }
}

fn require_lead<'a>(node: &WorkflowNode, lead_id: Option<&'a str>) -> Result<&'a str, NodeError> {
    lead_id.ok_or_else(|| {
        NodeError::new(format!("{} node `{}` requires a lead id", node.node_type().as_str(), node.id))
    })
}
