use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{DomainError, ValidationError};
use crate::expression::Expression;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowExecutionId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionStepId(pub String);

impl WorkflowExecutionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl ExecutionStepId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for WorkflowExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub type Context = Map<String, Value>;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConnections {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, rename = "true", skip_serializing_if = "Option::is_none")]
    pub on_true: Option<String>,
    #[serde(default, rename = "false", skip_serializing_if = "Option::is_none")]
    pub on_false: Option<String>,
}

impl NodeConnections {
    fn targets(&self) -> impl Iterator<Item = &str> {
        [&self.next, &self.on_true, &self.on_false].into_iter().flatten().map(String::as_str)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Trigger,
    AiAgent,
    Condition,
    Delay,
    HumanApproval,
    SendMessage,
    UpdateLead,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::AiAgent => "ai_agent",
            Self::Condition => "condition",
            Self::Delay => "delay",
            Self::HumanApproval => "human_approval",
            Self::SendMessage => "send_message",
            Self::UpdateLead => "update_lead",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "trigger" => Some(Self::Trigger),
            "ai_agent" => Some(Self::AiAgent),
            "condition" => Some(Self::Condition),
            "delay" => Some(Self::Delay),
            "human_approval" => Some(Self::HumanApproval),
            "send_message" => Some(Self::SendMessage),
            "update_lead" => Some(Self::UpdateLead),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiAgentConfig {
    #[serde(default = "default_agent_type")]
    pub agent_type: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub settings: Value,
}

fn default_agent_type() -> String {
    "general".to_string()
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConditionConfig {
    pub source: String,
    pub expression: Expression,
}

#[derive(Debug, Deserialize, Serialize)]
struct RawConditionConfig {
    #[serde(default = "default_condition")]
    condition: String,
}

fn default_condition() -> String {
    "true".to_string()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
    #[serde(alias = "ms")]
    Milliseconds,
    #[default]
    Seconds,
    Minutes,
    Hours,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayConfig {
    #[serde(default = "default_delay")]
    pub delay: u64,
    #[serde(default)]
    pub unit: DelayUnit,
}

fn default_delay() -> u64 {
    1
}

impl DelayConfig {
    pub fn duration(&self) -> Duration {
        match self.unit {
            DelayUnit::Milliseconds => Duration::from_millis(self.delay),
            DelayUnit::Seconds => Duration::from_secs(self.delay),
            DelayUnit::Minutes => Duration::from_secs(self.delay.saturating_mul(60)),
            DelayUnit::Hours => Duration::from_secs(self.delay.saturating_mul(3600)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HumanApprovalConfig {
    #[serde(default = "default_approval_message")]
    pub message: String,
    #[serde(default)]
    pub approvers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in_secs: Option<u64>,
}

fn default_approval_message() -> String {
    "Approval required".to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageConfig {
    #[serde(default)]
    pub message: String,
    #[serde(default = "default_message_type")]
    pub message_type: String,
}

fn default_message_type() -> String {
    "TEXT".to_string()
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateLeadConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_score: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Value>,
}

impl UpdateLeadConfig {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.priority.is_none()
            && self.ai_score.is_none()
            && self.fields.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum NodeKind {
    Trigger(TriggerConfig),
    AiAgent(AiAgentConfig),
    Condition(ConditionConfig),
    Delay(DelayConfig),
    HumanApproval(HumanApprovalConfig),
    SendMessage(SendMessageConfig),
    UpdateLead(UpdateLeadConfig),
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            Self::Trigger(_) => NodeType::Trigger,
            Self::AiAgent(_) => NodeType::AiAgent,
            Self::Condition(_) => NodeType::Condition,
            Self::Delay(_) => NodeType::Delay,
            Self::HumanApproval(_) => NodeType::HumanApproval,
            Self::SendMessage(_) => NodeType::SendMessage,
            Self::UpdateLead(_) => NodeType::UpdateLead,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawWorkflowNode", into = "RawWorkflowNode")]
pub struct WorkflowNode {
    pub id: String,
    pub kind: NodeKind,
    pub connections: NodeConnections,
}

impl WorkflowNode {
    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RawWorkflowNode {
    id: String,
    #[serde(rename = "type")]
    node_type: NodeType,
    #[serde(default)]
    config: Value,
    #[serde(default)]
    connections: NodeConnections,
}

fn typed_config<T>(node_id: &str, config: Value) -> Result<T, ValidationError>
where
    T: serde::de::DeserializeOwned,
{
    let config = if config.is_null() { Value::Object(Map::new()) } else { config };
    serde_json::from_value(config).map_err(|error| ValidationError::InvalidNodeConfig {
        node_id: node_id.to_string(),
        message: error.to_string(),
    })
}

impl TryFrom<RawWorkflowNode> for WorkflowNode {
    type Error = ValidationError;

    fn try_from(raw: RawWorkflowNode) -> Result<Self, Self::Error> {
        let id = raw.id;
        if id.trim().is_empty() {
            return Err(ValidationError::MissingField("nodes[].id"));
        }

        let kind = match raw.node_type {
            NodeType::Trigger => NodeKind::Trigger(typed_config(&id, raw.config)?),
            NodeType::AiAgent => NodeKind::AiAgent(typed_config(&id, raw.config)?),
            NodeType::Condition => {
                let RawConditionConfig { condition } = typed_config(&id, raw.config)?;
                let expression = Expression::parse(&condition).map_err(|error| {
                    ValidationError::InvalidNodeConfig {
                        node_id: id.clone(),
                        message: error.to_string(),
                    }
                })?;
                NodeKind::Condition(ConditionConfig { source: condition, expression })
            }
            NodeType::Delay => NodeKind::Delay(typed_config(&id, raw.config)?),
            NodeType::HumanApproval => NodeKind::HumanApproval(typed_config(&id, raw.config)?),
            NodeType::SendMessage => NodeKind::SendMessage(typed_config(&id, raw.config)?),
            NodeType::UpdateLead => {
                let config: UpdateLeadConfig = typed_config(&id, raw.config)?;
                if config.is_empty() {
                    return Err(ValidationError::InvalidNodeConfig {
                        node_id: id,
                        message: "update_lead requires at least one field to update".to_string(),
                    });
                }
                NodeKind::UpdateLead(config)
            }
        };

        Ok(Self { id, kind, connections: raw.connections })
    }
}

impl From<WorkflowNode> for RawWorkflowNode {
    fn from(node: WorkflowNode) -> Self {
        let node_type = node.node_type();
        let config = match node.kind {
            NodeKind::Trigger(config) => serde_json::to_value(config),
            NodeKind::AiAgent(config) => serde_json::to_value(config),
            NodeKind::Condition(config) => {
                serde_json::to_value(RawConditionConfig { condition: config.source })
            }
            NodeKind::Delay(config) => serde_json::to_value(config),
            NodeKind::HumanApproval(config) => serde_json::to_value(config),
            NodeKind::SendMessage(config) => serde_json::to_value(config),
            NodeKind::UpdateLead(config) => serde_json::to_value(config),
        }
        .unwrap_or(Value::Null);

        Self { id: node.id, node_type, config, connections: node.connections }
    }
}

/// Static workflow graph. Read-only while executions run against it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub name: String,
    pub nodes: Vec<WorkflowNode>,
}

impl WorkflowDefinition {
    pub fn node(&self, node_id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|node| node.id == node_id)
    }

    /// Checks the graph and returns its single trigger node.
    pub fn entry_node(&self) -> Result<&WorkflowNode, ValidationError> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(ValidationError::DuplicateNode(node.id.clone()));
            }
        }

        for node in &self.nodes {
            if let Some(target) = node.connections.targets().find(|target| !seen.contains(target)) {
                return Err(ValidationError::DanglingConnection {
                    node_id: node.id.clone(),
                    target: target.to_string(),
                });
            }
        }

        let mut triggers = self.nodes.iter().filter(|node| node.node_type() == NodeType::Trigger);
        match (triggers.next(), triggers.next()) {
            (Some(trigger), None) => Ok(trigger),
            (None, _) => Err(ValidationError::MissingTrigger),
            (Some(_), Some(_)) => Err(ValidationError::MultipleTriggers),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Aggregate root for one run of a workflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub id: WorkflowExecutionId,
    pub workflow_id: WorkflowId,
    pub lead_id: Option<String>,
    pub status: WorkflowExecutionStatus,
    pub context: Context,
    pub current_node: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    pub fn start(workflow_id: WorkflowId, lead_id: Option<String>, context: Context) -> Self {
        Self {
            id: WorkflowExecutionId::generate(),
            workflow_id,
            lead_id,
            status: WorkflowExecutionStatus::Running,
            context,
            current_node: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == WorkflowExecutionStatus::Running
    }

    pub fn finish(
        &mut self,
        status: WorkflowExecutionStatus,
        error: Option<String>,
    ) -> Result<(), DomainError> {
        if !self.is_running() || !status.is_terminal() {
            return Err(DomainError::InvalidWorkflowTransition { from: self.status, to: status });
        }

        self.status = status;
        self.error = error;
        self.completed_at = Some(Utc::now());
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "SKIPPED" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// Append-only audit record of one node visit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStep {
    pub id: ExecutionStepId,
    pub execution_id: WorkflowExecutionId,
    pub node_id: String,
    pub node_type: NodeType,
    pub status: StepStatus,
    input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionStep {
    pub fn start(execution_id: WorkflowExecutionId, node: &WorkflowNode, context: &Context) -> Self {
        Self {
            id: ExecutionStepId::generate(),
            execution_id,
            node_id: node.id.clone(),
            node_type: node.node_type(),
            status: StepStatus::Running,
            input: Value::Object(context.clone()),
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Rebuilds a step read back from storage.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: ExecutionStepId,
        execution_id: WorkflowExecutionId,
        node_id: String,
        node_type: NodeType,
        status: StepStatus,
        input: Value,
        output: Option<Value>,
        error: Option<String>,
        started_at: DateTime<Utc>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            execution_id,
            node_id,
            node_type,
            status,
            input,
            output,
            error,
            started_at,
            completed_at,
        }
    }

    /// Context snapshot taken when the node started.
    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn complete(&mut self, output: Value) {
        self.finish(StepStatus::Completed, Some(output), None);
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.finish(StepStatus::Failed, None, Some(error.into()));
    }

    pub fn skip(&mut self, output: Value) {
        self.finish(StepStatus::Skipped, Some(output), None);
    }

    pub fn await_decision(&mut self, output: Value) {
        self.status = StepStatus::Pending;
        self.output = Some(output);
    }

    fn finish(&mut self, status: StepStatus, output: Option<Value>, error: Option<String>) {
        self.status = status;
        self.output = output;
        self.error = error;
        self.completed_at = Some(Utc::now());
    }
}
