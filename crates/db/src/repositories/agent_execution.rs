use sqlx::{sqlite::SqliteRow, Row};

use leadflow_core::domain::agent::{
    AgentExecution, AgentExecutionId, AgentExecutionStatus, AgentId, ResourceUsage,
};

use super::decode::{
    encode_json, parse_json, parse_optional_json, parse_optional_timestamp, parse_timestamp,
    parse_u32, parse_u64, to_i64,
};
use super::{AgentExecutionRepository, RepositoryError};
use crate::DbPool;

const SELECT_COLUMNS: &str = "SELECT
        id,
        agent_id,
        user_id,
        session_id,
        status,
        input_json,
        output_json,
        error,
        execution_time_ms,
        memory_used_bytes,
        api_calls_made,
        started_at,
        ended_at
     FROM agent_execution";

pub struct SqlAgentExecutionRepository {
    pool: DbPool,
}

impl SqlAgentExecutionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl AgentExecutionRepository for SqlAgentExecutionRepository {
    async fn find_by_id(
        &self,
        id: &AgentExecutionId,
    ) -> Result<Option<AgentExecution>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(execution_from_row).transpose()
    }

    async fn save(&self, execution: AgentExecution) -> Result<(), RepositoryError> {
        let input_json = encode_json("input_json", &execution.input)?;
        let output_json =
            execution.output.as_ref().map(|output| encode_json("output_json", output)).transpose()?;

        sqlx::query(
            "INSERT INTO agent_execution (
                id,
                agent_id,
                user_id,
                session_id,
                status,
                input_json,
                output_json,
                error,
                execution_time_ms,
                memory_used_bytes,
                api_calls_made,
                started_at,
                ended_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                output_json = excluded.output_json,
                error = excluded.error,
                execution_time_ms = excluded.execution_time_ms,
                memory_used_bytes = excluded.memory_used_bytes,
                api_calls_made = excluded.api_calls_made,
                ended_at = excluded.ended_at",
        )
        .bind(&execution.id.0)
        .bind(&execution.agent_id.0)
        .bind(&execution.user_id)
        .bind(&execution.session_id)
        .bind(execution.status.as_str())
        .bind(input_json)
        .bind(output_json)
        .bind(execution.error.as_deref())
        .bind(to_i64(execution.resource_usage.execution_time_ms))
        .bind(to_i64(execution.resource_usage.memory_used_bytes))
        .bind(i64::from(execution.resource_usage.api_calls_made))
        .bind(execution.started_at.to_rfc3339())
        .bind(execution.ended_at.map(|value| value.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_for_agent(
        &self,
        agent_id: &AgentId,
    ) -> Result<Vec<AgentExecution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE agent_id = ? ORDER BY started_at ASC, id ASC"
        ))
        .bind(&agent_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(execution_from_row).collect()
    }
}

fn execution_from_row(row: SqliteRow) -> Result<AgentExecution, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = AgentExecutionStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown agent execution status `{status_raw}`"))
    })?;

    Ok(AgentExecution {
        id: AgentExecutionId(row.try_get("id")?),
        agent_id: AgentId(row.try_get("agent_id")?),
        user_id: row.try_get("user_id")?,
        session_id: row.try_get("session_id")?,
        status,
        started_at: parse_timestamp("started_at", row.try_get("started_at")?)?,
        ended_at: parse_optional_timestamp("ended_at", row.try_get("ended_at")?)?,
        input: parse_json("input_json", &row.try_get::<String, _>("input_json")?)?,
        output: parse_optional_json("output_json", row.try_get("output_json")?)?,
        error: row.try_get("error")?,
        resource_usage: ResourceUsage {
            execution_time_ms: parse_u64("execution_time_ms", row.try_get("execution_time_ms")?)?,
            memory_used_bytes: parse_u64("memory_used_bytes", row.try_get("memory_used_bytes")?)?,
            api_calls_made: parse_u32("api_calls_made", row.try_get("api_calls_made")?)?,
        },
    })
}
