use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use leadflow_core::config::AppConfig;
use leadflow_core::domain::agent::{
    AgentExecution, AgentExecutionId, AgentExecutionStatus, AgentId, AgentManifest,
};
use leadflow_core::errors::{DomainError, ValidationError};
use leadflow_core::events::{DomainEvent, EventSink, EventType};
use leadflow_db::repositories::{AgentExecutionRepository, RepositoryError};

use crate::sandbox::{
    Sandbox, SandboxError, SandboxFailureKind, SandboxResult, SandboxScope, SandboxSettings,
};

pub const CANCELLED_ERROR: &str = "cancelled";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid agent manifest: {0}")]
    Validation(#[from] ValidationError),
    #[error("agent `{0}` is not installed")]
    AgentNotFound(AgentId),
    #[error("agent execution `{0}` was not found")]
    ExecutionNotFound(AgentExecutionId),
    #[error("agent execution `{id}` is {status:?}, expected running")]
    InvalidState { id: AgentExecutionId, status: AgentExecutionStatus },
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("agent execution persistence failed: {0}")]
    Repository(#[from] RepositoryError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub execution_retention: Duration,
    pub sweep_interval: Duration,
    pub sandbox: SandboxSettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            execution_retention: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(300),
            sandbox: SandboxSettings::default(),
        }
    }
}

impl From<&AppConfig> for RuntimeConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            execution_retention: config.runtime.execution_retention(),
            sweep_interval: config.runtime.sweep_interval(),
            sandbox: SandboxSettings::from(&config.sandbox),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub session_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub timeout: usize,
    pub active_sandboxes: usize,
    pub installed_agents: usize,
}

struct InstalledAgent {
    manifest: AgentManifest,
    installed_by: String,
}

struct TrackedExecution {
    record: AgentExecution,
    sandbox: Option<Arc<Sandbox>>,
    updates: watch::Sender<AgentExecution>,
}

impl TrackedExecution {
    fn publish(&self) {
        self.updates.send_replace(self.record.clone());
    }
}

struct RuntimeInner {
    config: RuntimeConfig,
    agents: RwLock<HashMap<AgentId, InstalledAgent>>,
    executions: Mutex<HashMap<AgentExecutionId, TrackedExecution>>,
    repository: Arc<dyn AgentExecutionRepository>,
    events: Arc<dyn EventSink>,
}

/// Installs agent manifests and runs each execution in its own sandbox.
#[derive(Clone)]
pub struct AgentRuntime {
    inner: Arc<RuntimeInner>,
}

impl AgentRuntime {
    pub fn new(
        config: RuntimeConfig,
        repository: Arc<dyn AgentExecutionRepository>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                agents: RwLock::new(HashMap::new()),
                executions: Mutex::new(HashMap::new()),
                repository,
                events,
            }),
        }
    }

    pub async fn install_agent(
        &self,
        user_id: &str,
        manifest: AgentManifest,
    ) -> Result<AgentId, RuntimeError> {
        manifest.validate()?;
        let agent_id = manifest.id.clone();
        let payload = json!({
            "agentId": agent_id.0,
            "name": manifest.name,
            "version": manifest.version,
            "installedBy": user_id,
        });

        let replaced = {
            let mut agents = self.inner.agents.write().await;
            agents
                .insert(
                    agent_id.clone(),
                    InstalledAgent { manifest, installed_by: user_id.to_string() },
                )
                .is_some()
        };

        info!(
            event_name = "agent.installed",
            agent_id = %agent_id,
            user_id,
            replaced,
            "agent installed"
        );
        self.emit(EventType::AgentInstalled, &agent_id.0, payload);
        Ok(agent_id)
    }

    pub async fn uninstall_agent(&self, agent_id: &AgentId) -> Result<AgentManifest, RuntimeError> {
        let removed = self.inner.agents.write().await.remove(agent_id);
        let installed = removed.ok_or_else(|| RuntimeError::AgentNotFound(agent_id.clone()))?;
        info!(
            event_name = "agent.uninstalled",
            agent_id = %agent_id,
            installed_by = %installed.installed_by,
            "agent uninstalled"
        );
        Ok(installed.manifest)
    }

    pub async fn installed_agents(&self) -> Vec<AgentManifest> {
        let agents = self.inner.agents.read().await;
        let mut manifests: Vec<AgentManifest> =
            agents.values().map(|installed| installed.manifest.clone()).collect();
        manifests.sort_by(|a, b| a.id.0.cmp(&b.id.0));
        manifests
    }

    /// Records a pending execution and returns its id without waiting for the script.
    pub async fn execute_agent(
        &self,
        user_id: &str,
        agent_id: &AgentId,
        input: Value,
        options: ExecuteOptions,
    ) -> Result<AgentExecutionId, RuntimeError> {
        let manifest = {
            let agents = self.inner.agents.read().await;
            agents.get(agent_id).map(|installed| installed.manifest.clone())
        }
        .ok_or_else(|| RuntimeError::AgentNotFound(agent_id.clone()))?;

        let session_id = options.session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let record = AgentExecution::pending(agent_id.clone(), user_id, session_id, input);
        let execution_id = record.id.clone();

        self.inner.repository.save(record.clone()).await?;
        {
            let (updates, _) = watch::channel(record.clone());
            let mut executions = self.inner.executions.lock().await;
            executions.insert(
                execution_id.clone(),
                TrackedExecution { record, sandbox: None, updates },
            );
        }

        debug!(
            event_name = "agent.execution.queued",
            execution_id = %execution_id,
            agent_id = %agent_id,
            "agent execution queued"
        );

        let runtime = self.clone();
        let dispatched = execution_id.clone();
        tokio::spawn(async move {
            runtime.run_execution(dispatched, manifest).await;
        });

        Ok(execution_id)
    }

    async fn run_execution(&self, execution_id: AgentExecutionId, manifest: AgentManifest) {
        let started = {
            let mut executions = self.inner.executions.lock().await;
            let Some(tracked) = executions.get_mut(&execution_id) else {
                return;
            };
            if tracked.record.transition_to(AgentExecutionStatus::Running).is_err() {
                return;
            }

            let sandbox = Sandbox::new(
                SandboxScope {
                    agent_id: manifest.id.clone(),
                    session_id: tracked.record.session_id.clone(),
                },
                manifest.resource_limits,
                manifest.permissions.clone(),
                Arc::clone(&self.inner.events),
            )
            .with_settings(self.inner.config.sandbox.clone());

            tracked.sandbox = Some(Arc::new(sandbox));
            tracked.publish();
            tracked.record.clone()
        };

        self.persist(&started).await;
        self.emit(
            EventType::ExecutionStarted,
            &execution_id.0,
            json!({
                "executionId": execution_id.0,
                "agentId": started.agent_id.0,
                "sessionId": started.session_id,
            }),
        );

        let sandbox = {
            let executions = self.inner.executions.lock().await;
            executions.get(&execution_id).and_then(|tracked| tracked.sandbox.clone())
        };
        let result = match &sandbox {
            Some(sandbox) => sandbox.execute(&manifest.code, started.input.clone()).await,
            None => {
                debug!(
                    event_name = "agent.execution.stopped_before_run",
                    execution_id = %execution_id,
                    "execution stopped before its sandbox ran"
                );
                return;
            }
        };

        if let Some(sandbox) = sandbox {
            if let Err(SandboxError::AlreadyDestroyed) = sandbox.destroy() {
                debug!(
                    event_name = "agent.sandbox.already_destroyed",
                    execution_id = %execution_id,
                    "sandbox was destroyed by a stop request"
                );
            }
        }

        self.finish(&execution_id, result).await;
    }

    async fn finish(&self, execution_id: &AgentExecutionId, result: SandboxResult) {
        let finished = {
            let mut executions = self.inner.executions.lock().await;
            let Some(tracked) = executions.get_mut(execution_id) else {
                return;
            };
            tracked.sandbox = None;

            if tracked.record.status != AgentExecutionStatus::Running {
                debug!(
                    event_name = "agent.execution.result_discarded",
                    execution_id = %execution_id,
                    status = tracked.record.status.as_str(),
                    "discarding sandbox result for a stopped execution"
                );
                return;
            }

            tracked.record.resource_usage = result.resource_usage;
            let next = match &result.error {
                None => {
                    tracked.record.output = result.result;
                    AgentExecutionStatus::Completed
                }
                Some(failure) => {
                    tracked.record.error = Some(failure.message.clone());
                    if failure.kind == SandboxFailureKind::Timeout {
                        AgentExecutionStatus::Timeout
                    } else {
                        AgentExecutionStatus::Failed
                    }
                }
            };

            if let Err(error) = tracked.record.transition_to(next) {
                warn!(
                    event_name = "agent.execution.transition_rejected",
                    execution_id = %execution_id,
                    error = %error,
                    "execution could not reach its terminal status"
                );
                return;
            }
            tracked.publish();
            tracked.record.clone()
        };

        self.persist(&finished).await;

        let payload = json!({
            "executionId": finished.id.0,
            "agentId": finished.agent_id.0,
            "status": finished.status.as_str(),
            "output": finished.output,
            "error": finished.error,
            "resourceUsage": finished.resource_usage,
        });
        if finished.status == AgentExecutionStatus::Completed {
            info!(
                event_name = "agent.execution.completed",
                execution_id = %finished.id,
                agent_id = %finished.agent_id,
                execution_time_ms = finished.resource_usage.execution_time_ms,
                "agent execution completed"
            );
            self.emit(EventType::ExecutionCompleted, &finished.id.0, payload);
        } else {
            warn!(
                event_name = "agent.execution.failed",
                execution_id = %finished.id,
                agent_id = %finished.agent_id,
                status = finished.status.as_str(),
                error = finished.error.as_deref().unwrap_or_default(),
                "agent execution failed"
            );
            self.emit(EventType::ExecutionFailed, &finished.id.0, payload);
        }
    }

    /// Aborts a running execution. The record becomes `failed` with error "cancelled".
    pub async fn stop_execution(
        &self,
        execution_id: &AgentExecutionId,
    ) -> Result<AgentExecution, RuntimeError> {
        let (stopped, sandbox) = {
            let mut executions = self.inner.executions.lock().await;
            let tracked = executions
                .get_mut(execution_id)
                .ok_or_else(|| RuntimeError::ExecutionNotFound(execution_id.clone()))?;
            if tracked.record.status != AgentExecutionStatus::Running {
                return Err(RuntimeError::InvalidState {
                    id: execution_id.clone(),
                    status: tracked.record.status,
                });
            }

            tracked.record.error = Some(CANCELLED_ERROR.to_string());
            tracked.record.transition_to(AgentExecutionStatus::Failed)?;
            tracked.publish();
            (tracked.record.clone(), tracked.sandbox.take())
        };

        if let Some(sandbox) = sandbox {
            match sandbox.destroy() {
                Ok(()) => {}
                Err(SandboxError::AlreadyDestroyed) => debug!(
                    event_name = "agent.sandbox.already_destroyed",
                    execution_id = %execution_id,
                    "sandbox was released before the stop request"
                ),
            }
        }

        self.persist(&stopped).await;
        info!(
            event_name = "agent.execution.stopped",
            execution_id = %execution_id,
            agent_id = %stopped.agent_id,
            "agent execution stopped"
        );
        self.emit(
            EventType::ExecutionFailed,
            &execution_id.0,
            json!({
                "executionId": execution_id.0,
                "agentId": stopped.agent_id.0,
                "status": stopped.status.as_str(),
                "error": CANCELLED_ERROR,
            }),
        );
        Ok(stopped)
    }

    /// Reads the live index first and falls back to durable history.
    pub async fn get_execution(
        &self,
        execution_id: &AgentExecutionId,
    ) -> Result<AgentExecution, RuntimeError> {
        {
            let executions = self.inner.executions.lock().await;
            if let Some(tracked) = executions.get(execution_id) {
                return Ok(tracked.record.clone());
            }
        }
        self.persisted(execution_id).await
    }

    pub async fn wait_for_completion(
        &self,
        execution_id: &AgentExecutionId,
    ) -> Result<AgentExecution, RuntimeError> {
        let mut receiver = {
            let executions = self.inner.executions.lock().await;
            match executions.get(execution_id) {
                Some(tracked) => tracked.updates.subscribe(),
                None => return self.persisted(execution_id).await,
            }
        };

        let terminal = receiver
            .wait_for(|record| record.status.is_terminal())
            .await
            .map(|record| record.clone());
        match terminal {
            Ok(record) => Ok(record),
            Err(_) => self.persisted(execution_id).await,
        }
    }

    async fn persisted(
        &self,
        execution_id: &AgentExecutionId,
    ) -> Result<AgentExecution, RuntimeError> {
        self.inner
            .repository
            .find_by_id(execution_id)
            .await?
            .ok_or_else(|| RuntimeError::ExecutionNotFound(execution_id.clone()))
    }

    pub async fn get_stats(&self) -> RuntimeStats {
        let installed_agents = self.inner.agents.read().await.len();
        let executions = self.inner.executions.lock().await;

        let mut stats = RuntimeStats { installed_agents, ..RuntimeStats::default() };
        for tracked in executions.values() {
            stats.total += 1;
            match tracked.record.status {
                AgentExecutionStatus::Pending => stats.pending += 1,
                AgentExecutionStatus::Running => stats.running += 1,
                AgentExecutionStatus::Completed => stats.completed += 1,
                AgentExecutionStatus::Failed => stats.failed += 1,
                AgentExecutionStatus::Timeout => stats.timeout += 1,
            }
            if tracked.sandbox.is_some() {
                stats.active_sandboxes += 1;
            }
        }
        stats
    }

    /// Evicts terminal executions that ended before the retention window. Returns the count.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let retention = self.inner.config.execution_retention;
        let mut executions = self.inner.executions.lock().await;
        let before = executions.len();

        executions.retain(|_, tracked| {
            let record = &tracked.record;
            let expired = match (record.status.is_terminal(), record.ended_at) {
                (true, Some(ended_at)) => {
                    (now - ended_at).to_std().map(|age| age > retention).unwrap_or(false)
                }
                _ => false,
            };
            !expired
        });

        before - executions.len()
    }

    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let runtime = self.clone();
        let period = self.inner.config.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let evicted = runtime.sweep(Utc::now()).await;
                if evicted > 0 {
                    debug!(
                        event_name = "agent.execution.swept",
                        evicted,
                        "evicted expired agent executions"
                    );
                }
            }
        })
    }

    async fn persist(&self, record: &AgentExecution) {
        if let Err(error) = self.inner.repository.save(record.clone()).await {
            warn!(
                event_name = "agent.execution.persist_failed",
                execution_id = %record.id,
                status = record.status.as_str(),
                error = %error,
                "failed to persist agent execution"
            );
        }
    }

    fn emit(&self, event_type: EventType, subject_id: &str, payload: Value) {
        self.inner.events.emit(DomainEvent::new(event_type, subject_id, payload));
    }
}
