use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{DomainError, ValidationError};

/// Hard platform ceilings. Limits above these are rejected at install time.
pub const MAX_TIMEOUT_MS: u64 = 5 * 60 * 1000;
pub const MAX_MEMORY_MB: u64 = 256;
pub const MAX_API_CALLS: u32 = 100;

pub const PERMISSION_API_CALL: &str = "api.call";
pub const PERMISSION_API_ON: &str = "api.on";
pub const PERMISSION_TIMERS: &str = "timers";

const KNOWN_PERMISSIONS: &[&str] = &[PERMISSION_API_CALL, PERMISSION_API_ON, PERMISSION_TIMERS];

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentExecutionId(pub String);

impl AgentExecutionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for AgentExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub timeout_ms: u64,
    pub memory_mb: u64,
    pub max_api_calls: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self { timeout_ms: 30_000, memory_mb: 64, max_api_calls: 10 }
    }
}

impl ResourceLimits {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.timeout_ms == 0 || self.timeout_ms > MAX_TIMEOUT_MS {
            return Err(ValidationError::LimitExceeded {
                field: "resourceLimits.timeoutMs",
                value: self.timeout_ms,
                ceiling: MAX_TIMEOUT_MS,
            });
        }
        if self.memory_mb == 0 || self.memory_mb > MAX_MEMORY_MB {
            return Err(ValidationError::LimitExceeded {
                field: "resourceLimits.memoryMb",
                value: self.memory_mb,
                ceiling: MAX_MEMORY_MB,
            });
        }
        if self.max_api_calls > MAX_API_CALLS {
            return Err(ValidationError::LimitExceeded {
                field: "resourceLimits.maxApiCalls",
                value: u64::from(self.max_api_calls),
                ceiling: u64::from(MAX_API_CALLS),
            });
        }
        Ok(())
    }

    pub fn memory_bytes(&self) -> usize {
        usize::try_from(self.memory_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }
}

/// Immutable descriptor of an installable agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentManifest {
    pub id: AgentId,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    pub code: String,
    #[serde(default)]
    pub triggers: Vec<String>,
}

impl AgentManifest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let required = [
            ("id", self.id.0.as_str()),
            ("name", self.name.as_str()),
            ("version", self.version.as_str()),
            ("code", self.code.as_str()),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ValidationError::MissingField(field));
            }
        }

        if let Some(unknown) =
            self.permissions.iter().find(|permission| !KNOWN_PERMISSIONS.contains(&permission.as_str()))
        {
            return Err(ValidationError::UnknownPermission(unknown.clone()));
        }

        self.resource_limits.validate()
    }

    pub fn allows(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl AgentExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub execution_time_ms: u64,
    pub memory_used_bytes: u64,
    pub api_calls_made: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentExecution {
    pub id: AgentExecutionId,
    pub agent_id: AgentId,
    pub user_id: String,
    pub session_id: String,
    pub status: AgentExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub resource_usage: ResourceUsage,
}

impl AgentExecution {
    pub fn pending(
        agent_id: AgentId,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        input: Value,
    ) -> Self {
        Self {
            id: AgentExecutionId::generate(),
            agent_id,
            user_id: user_id.into(),
            session_id: session_id.into(),
            status: AgentExecutionStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            input,
            output: None,
            error: None,
            resource_usage: ResourceUsage::default(),
        }
    }

    pub fn can_transition_to(&self, next: AgentExecutionStatus) -> bool {
        use AgentExecutionStatus::{Completed, Failed, Pending, Running, Timeout};

        matches!(
            (self.status, next),
            (Pending, Running) | (Pending, Failed) | (Running, Completed | Failed | Timeout)
        )
    }

    pub fn transition_to(&mut self, next: AgentExecutionStatus) -> Result<(), DomainError> {
        if !self.can_transition_to(next) {
            return Err(DomainError::InvalidAgentTransition { from: self.status, to: next });
        }

        self.status = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }
}
