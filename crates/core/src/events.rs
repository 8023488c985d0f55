use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "workflow:started")]
    WorkflowStarted,
    #[serde(rename = "workflow:completed")]
    WorkflowCompleted,
    #[serde(rename = "approval:required")]
    ApprovalRequired,
    #[serde(rename = "approval:resolved")]
    ApprovalResolved,
    #[serde(rename = "message:send")]
    MessageSend,
    #[serde(rename = "lead:updated")]
    LeadUpdated,
    #[serde(rename = "agentInstalled")]
    AgentInstalled,
    #[serde(rename = "executionStarted")]
    ExecutionStarted,
    #[serde(rename = "executionCompleted")]
    ExecutionCompleted,
    #[serde(rename = "executionFailed")]
    ExecutionFailed,
    #[serde(rename = "agent:apiCall")]
    AgentApiCall,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowStarted => "workflow:started",
            Self::WorkflowCompleted => "workflow:completed",
            Self::ApprovalRequired => "approval:required",
            Self::ApprovalResolved => "approval:resolved",
            Self::MessageSend => "message:send",
            Self::LeadUpdated => "lead:updated",
            Self::AgentInstalled => "agentInstalled",
            Self::ExecutionStarted => "executionStarted",
            Self::ExecutionCompleted => "executionCompleted",
            Self::ExecutionFailed => "executionFailed",
            Self::AgentApiCall => "agent:apiCall",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened to a workflow run, an agent execution or an agent install.
/// `subject_id` is the id of whichever of those the event is about.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: String,
    pub event_type: EventType,
    pub subject_id: String,
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(event_type: EventType, subject_id: impl Into<String>, payload: Value) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type,
            subject_id: subject_id.into(),
            payload,
            occurred_at: Utc::now(),
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: DomainEvent);
}

#[derive(Clone, Default)]
pub struct InMemoryEventSink {
    events: Arc<Mutex<Vec<DomainEvent>>>,
}

impl InMemoryEventSink {
    pub fn events(&self) -> Vec<DomainEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn of_type(&self, event_type: EventType) -> Vec<DomainEvent> {
        self.events().into_iter().filter(|event| event.event_type == event_type).collect()
    }
}

impl EventSink for InMemoryEventSink {
    fn emit(&self, event: DomainEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Drops every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: DomainEvent) {}
}
