use std::collections::BTreeMap;

use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row};

use leadflow_core::domain::lead::{Lead, LeadId, LeadUpdate, Message, MessageId};

use super::decode::{encode_json, parse_json, parse_timestamp};
use super::{LeadStore, RepositoryError};
use crate::DbPool;

pub struct SqlLeadStore {
    pool: DbPool,
}

impl SqlLeadStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn save_lead(&self, lead: &Lead) -> Result<(), RepositoryError> {
        let fields_json = encode_json("fields_json", &lead.fields)?;

        sqlx::query(
            "INSERT INTO lead (
                id,
                name,
                email,
                phone,
                status,
                priority,
                ai_score,
                fields_json,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                email = excluded.email,
                phone = excluded.phone,
                status = excluded.status,
                priority = excluded.priority,
                ai_score = excluded.ai_score,
                fields_json = excluded.fields_json,
                updated_at = excluded.updated_at",
        )
        .bind(&lead.id.0)
        .bind(&lead.name)
        .bind(lead.email.as_deref())
        .bind(lead.phone.as_deref())
        .bind(&lead.status)
        .bind(lead.priority.as_deref())
        .bind(lead.ai_score)
        .bind(fields_json)
        .bind(lead.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_messages(&self, lead_id: &LeadId) -> Result<Vec<Message>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, lead_id, content, message_type, created_at
             FROM lead_message
             WHERE lead_id = ?
             ORDER BY created_at ASC, rowid ASC",
        )
        .bind(&lead_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(message_from_row).collect()
    }
}

#[async_trait::async_trait]
impl LeadStore for SqlLeadStore {
    async fn find_lead(&self, id: &LeadId) -> Result<Option<Lead>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                id,
                name,
                email,
                phone,
                status,
                priority,
                ai_score,
                fields_json,
                updated_at
             FROM lead
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(lead_from_row).transpose()
    }

    async fn update_lead(&self, id: &LeadId, update: &LeadUpdate) -> Result<Lead, RepositoryError> {
        let mut lead = self
            .find_lead(id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("lead `{}`", id.0)))?;

        lead.apply(update);
        self.save_lead(&lead).await?;
        Ok(lead)
    }

    async fn send_message(&self, message: Message) -> Result<Message, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO lead_message (id, lead_id, content, message_type, created_at)
             SELECT ?, id, ?, ?, ? FROM lead WHERE id = ?",
        )
        .bind(&message.id.0)
        .bind(&message.content)
        .bind(&message.message_type)
        .bind(message.created_at.to_rfc3339())
        .bind(&message.lead_id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("lead `{}`", message.lead_id.0)));
        }

        Ok(message)
    }
}

fn lead_from_row(row: SqliteRow) -> Result<Lead, RepositoryError> {
    let fields: BTreeMap<String, Value> =
        parse_json("fields_json", &row.try_get::<String, _>("fields_json")?)?;

    Ok(Lead {
        id: LeadId(row.try_get("id")?),
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        status: row.try_get("status")?,
        priority: row.try_get("priority")?,
        ai_score: row.try_get("ai_score")?,
        fields,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn message_from_row(row: SqliteRow) -> Result<Message, RepositoryError> {
    Ok(Message {
        id: MessageId(row.try_get("id")?),
        lead_id: LeadId(row.try_get("lead_id")?),
        content: row.try_get("content")?,
        message_type: row.try_get("message_type")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}
