use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeadId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for LeadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The slice of a CRM lead that workflow nodes read and write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    pub id: LeadId,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    pub status: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub ai_score: Option<f64>,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(id: LeadId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            email: None,
            phone: None,
            status: "NEW".to_string(),
            priority: None,
            ai_score: None,
            fields: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn apply(&mut self, update: &LeadUpdate) {
        if let Some(status) = &update.status {
            self.status = status.clone();
        }
        if let Some(priority) = &update.priority {
            self.priority = Some(priority.clone());
        }
        if let Some(score) = update.ai_score {
            self.ai_score = Some(score);
        }
        for (key, value) in &update.fields {
            self.fields.insert(key.clone(), value.clone());
        }
        self.updated_at = Utc::now();
    }
}

/// Partial update applied by `update_lead` nodes. Absent fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_score: Option<f64>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub lead_id: LeadId,
    pub content: String,
    pub message_type: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn outbound(
        lead_id: LeadId,
        content: impl Into<String>,
        message_type: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            lead_id,
            content: content.into(),
            message_type: message_type.into(),
            created_at: Utc::now(),
        }
    }
}
