use chrono::Utc;
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row};

use leadflow_core::domain::workflow::{
    Context, ExecutionStep, ExecutionStepId, NodeType, StepStatus, WorkflowDefinition,
    WorkflowExecution, WorkflowExecutionId, WorkflowExecutionStatus, WorkflowId, WorkflowNode,
};

use super::decode::{
    encode_json, parse_json, parse_optional_json, parse_optional_timestamp, parse_timestamp,
};
use super::{RepositoryError, WorkflowDefinitionRepository, WorkflowExecutionRepository};
use crate::DbPool;

pub struct SqlWorkflowDefinitionRepository {
    pool: DbPool,
}

impl SqlWorkflowDefinitionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl WorkflowDefinitionRepository for SqlWorkflowDefinitionRepository {
    async fn find_by_id(
        &self,
        id: &WorkflowId,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT id, name, nodes_json FROM workflow_definition WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(definition_from_row).transpose()
    }

    async fn save(&self, definition: WorkflowDefinition) -> Result<(), RepositoryError> {
        let nodes_json = encode_json("nodes_json", &definition.nodes)?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO workflow_definition (id, name, nodes_json, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                nodes_json = excluded.nodes_json,
                updated_at = excluded.updated_at",
        )
        .bind(&definition.id.0)
        .bind(&definition.name)
        .bind(nodes_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

pub struct SqlWorkflowExecutionRepository {
    pool: DbPool,
}

impl SqlWorkflowExecutionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl WorkflowExecutionRepository for SqlWorkflowExecutionRepository {
    async fn find_execution(
        &self,
        id: &WorkflowExecutionId,
    ) -> Result<Option<WorkflowExecution>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                id,
                workflow_id,
                lead_id,
                status,
                context_json,
                current_node,
                error,
                started_at,
                completed_at
             FROM workflow_execution
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(execution_from_row).transpose()
    }

    async fn save_execution(&self, execution: WorkflowExecution) -> Result<(), RepositoryError> {
        let context_json = encode_json("context_json", &execution.context)?;

        sqlx::query(
            "INSERT INTO workflow_execution (
                id,
                workflow_id,
                lead_id,
                status,
                context_json,
                current_node,
                error,
                started_at,
                completed_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                context_json = excluded.context_json,
                current_node = excluded.current_node,
                error = excluded.error,
                completed_at = excluded.completed_at",
        )
        .bind(&execution.id.0)
        .bind(&execution.workflow_id.0)
        .bind(execution.lead_id.as_deref())
        .bind(execution.status.as_str())
        .bind(context_json)
        .bind(execution.current_node.as_deref())
        .bind(execution.error.as_deref())
        .bind(execution.started_at.to_rfc3339())
        .bind(execution.completed_at.map(|value| value.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_executions(
        &self,
        status: Option<WorkflowExecutionStatus>,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let rows = if let Some(status) = status {
            sqlx::query(
                "SELECT
                    id,
                    workflow_id,
                    lead_id,
                    status,
                    context_json,
                    current_node,
                    error,
                    started_at,
                    completed_at
                 FROM workflow_execution
                 WHERE status = ?
                 ORDER BY started_at ASC, id ASC",
            )
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT
                    id,
                    workflow_id,
                    lead_id,
                    status,
                    context_json,
                    current_node,
                    error,
                    started_at,
                    completed_at
                 FROM workflow_execution
                 ORDER BY started_at ASC, id ASC",
            )
            .fetch_all(&self.pool)
            .await?
        };

        rows.into_iter().map(execution_from_row).collect()
    }

    async fn save_step(&self, step: ExecutionStep) -> Result<(), RepositoryError> {
        let input_json = encode_json("input_json", step.input())?;
        let output_json =
            step.output.as_ref().map(|output| encode_json("output_json", output)).transpose()?;

        sqlx::query(
            "INSERT INTO workflow_execution_step (
                id,
                execution_id,
                node_id,
                node_type,
                status,
                input_json,
                output_json,
                error,
                started_at,
                completed_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                output_json = excluded.output_json,
                error = excluded.error,
                completed_at = excluded.completed_at",
        )
        .bind(&step.id.0)
        .bind(&step.execution_id.0)
        .bind(&step.node_id)
        .bind(step.node_type.as_str())
        .bind(step.status.as_str())
        .bind(input_json)
        .bind(output_json)
        .bind(step.error.as_deref())
        .bind(step.started_at.to_rfc3339())
        .bind(step.completed_at.map(|value| value.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_steps(
        &self,
        execution_id: &WorkflowExecutionId,
    ) -> Result<Vec<ExecutionStep>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                execution_id,
                node_id,
                node_type,
                status,
                input_json,
                output_json,
                error,
                started_at,
                completed_at
             FROM workflow_execution_step
             WHERE execution_id = ?
             ORDER BY started_at ASC, rowid ASC",
        )
        .bind(&execution_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(step_from_row).collect()
    }
}

fn definition_from_row(row: SqliteRow) -> Result<WorkflowDefinition, RepositoryError> {
    let nodes: Vec<WorkflowNode> =
        parse_json("nodes_json", &row.try_get::<String, _>("nodes_json")?)?;

    Ok(WorkflowDefinition {
        id: WorkflowId(row.try_get("id")?),
        name: row.try_get("name")?,
        nodes,
    })
}

fn execution_from_row(row: SqliteRow) -> Result<WorkflowExecution, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = WorkflowExecutionStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown workflow execution status `{status_raw}`"))
    })?;
    let context: Context = parse_json("context_json", &row.try_get::<String, _>("context_json")?)?;

    Ok(WorkflowExecution {
        id: WorkflowExecutionId(row.try_get("id")?),
        workflow_id: WorkflowId(row.try_get("workflow_id")?),
        lead_id: row.try_get("lead_id")?,
        status,
        context,
        current_node: row.try_get("current_node")?,
        error: row.try_get("error")?,
        started_at: parse_timestamp("started_at", row.try_get("started_at")?)?,
        completed_at: parse_optional_timestamp("completed_at", row.try_get("completed_at")?)?,
    })
}

fn step_from_row(row: SqliteRow) -> Result<ExecutionStep, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = StepStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown step status `{status_raw}`")))?;
    let node_type_raw = row.try_get::<String, _>("node_type")?;
    let node_type = NodeType::parse(&node_type_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown node type `{node_type_raw}`")))?;
    let input: Value = parse_json("input_json", &row.try_get::<String, _>("input_json")?)?;

    Ok(ExecutionStep::restore(
        ExecutionStepId(row.try_get("id")?),
        WorkflowExecutionId(row.try_get("execution_id")?),
        row.try_get("node_id")?,
        node_type,
        status,
        input,
        parse_optional_json("output_json", row.try_get("output_json")?)?,
        row.try_get("error")?,
        parse_timestamp("started_at", row.try_get("started_at")?)?,
        parse_optional_timestamp("completed_at", row.try_get("completed_at")?)?,
    ))
}
