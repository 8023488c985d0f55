use std::sync::Arc;

use leadflow_agent::{AgentRuntime, RuntimeConfig};
use leadflow_core::config::{AppConfig, ConfigError, LlmProvider, LoadOptions};
use leadflow_db::repositories::{
    LeadStore, RepositoryError, SqlAgentExecutionRepository, SqlLeadStore,
    SqlWorkflowDefinitionRepository, SqlWorkflowExecutionRepository,
};
use leadflow_db::{connect_with_settings, migrations, DbPool};
use leadflow_workflow::{LlmAgentInvoker, RoutingAgentInvoker, RuntimeAgentInvoker, WorkflowEngine};
use thiserror::Error;
use tracing::info;

use crate::crm::HttpCrmGateway;
use crate::events::TracingEventSink;
use crate::llm::OllamaClient;

/// User id recorded on agent executions started by workflow nodes.
const WORKFLOW_USER_ID: &str = "workflow-engine";

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub agent_runtime: AgentRuntime,
    pub workflow_engine: WorkflowEngine,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("crm gateway setup failed: {0}")]
    Crm(#[source] RepositoryError),
    #[error("llm provider `{0:?}` has no client in this build; use `ollama`")]
    UnsupportedLlmProvider(LlmProvider),
    #[error("llm client setup failed: {0}")]
    Llm(String),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let events = Arc::new(TracingEventSink);
    let agent_runtime = AgentRuntime::new(
        RuntimeConfig::from(&config),
        Arc::new(SqlAgentExecutionRepository::new(db_pool.clone())),
        events.clone(),
    );

    let leads: Arc<dyn LeadStore> =
        match HttpCrmGateway::from_config(&config.crm).map_err(BootstrapError::Crm)? {
            Some(gateway) => Arc::new(gateway),
            None => Arc::new(SqlLeadStore::new(db_pool.clone())),
        };

    let general = match config.llm.provider {
        LlmProvider::Ollama => OllamaClient::from_config(&config.llm)
            .map_err(|error| BootstrapError::Llm(error.to_string()))?,
        other => return Err(BootstrapError::UnsupportedLlmProvider(other)),
    };
    let agents = Arc::new(RoutingAgentInvoker::new(
        Arc::new(RuntimeAgentInvoker::new(agent_runtime.clone(), WORKFLOW_USER_ID)),
        Arc::new(LlmAgentInvoker::new(general).with_leads(leads.clone())),
    ));

    let workflow_engine = WorkflowEngine::new(
        Arc::new(SqlWorkflowDefinitionRepository::new(db_pool.clone())),
        Arc::new(SqlWorkflowExecutionRepository::new(db_pool.clone())),
        agents,
        leads,
        events,
    );
    info!(
        event_name = "system.bootstrap.ready",
        correlation_id = "bootstrap",
        crm_enabled = config.crm.enabled,
        llm_model = %config.llm.model,
        "agent runtime and workflow engine initialized"
    );

    Ok(Application { config, db_pool, agent_runtime, workflow_engine })
}
