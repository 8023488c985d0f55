//! Live state of running workflow executions.
//!
//! Every status change for one execution happens under that execution's lock, and the row is
//! persisted before the lock is released. A stop and an approval racing on the same id are
//! therefore applied in lock order, and a node output arriving after a stop is never merged.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use leadflow_core::domain::workflow::{
    Context, ExecutionStep, NodeKind, WorkflowDefinition, WorkflowExecution, WorkflowExecutionId,
    WorkflowExecutionStatus, WorkflowNode,
};
use leadflow_db::repositories::WorkflowExecutionRepository;

use crate::errors::{NodeError, WorkflowError};
use crate::nodes::NodeOutcome;

struct LiveExecution {
    execution: WorkflowExecution,
    definition: Arc<WorkflowDefinition>,
    cancel: CancellationToken,
    awaiting_approval: Option<ExecutionStep>,
}

type Entry = Arc<Mutex<LiveExecution>>;

/// A node that has been recorded as RUNNING and may now be dispatched.
pub(crate) struct StepTicket {
    pub step: ExecutionStep,
    pub node: WorkflowNode,
    pub context: Context,
    pub lead_id: Option<String>,
    pub cancel: CancellationToken,
}

#[derive(Debug)]
pub(crate) enum Advance {
    Next(String),
    Suspended(Value),
    Finished(WorkflowExecution),
    Halted,
}

pub(crate) struct ExecutionRegistry {
    entries: RwLock<HashMap<WorkflowExecutionId, Entry>>,
    repository: Arc<dyn WorkflowExecutionRepository>,
}

impl ExecutionRegistry {
    pub(crate) fn new(repository: Arc<dyn WorkflowExecutionRepository>) -> Self {
        Self { entries: RwLock::new(HashMap::new()), repository }
    }

    pub(crate) async fn register(
        &self,
        execution: WorkflowExecution,
        definition: Arc<WorkflowDefinition>,
    ) {
        self.insert(execution, definition, None).await;
    }

    /// Re-registers a suspended execution loaded from storage. An existing live entry wins.
    pub(crate) async fn restore_suspended(
        &self,
        execution: WorkflowExecution,
        definition: Arc<WorkflowDefinition>,
        step: ExecutionStep,
    ) {
        self.insert(execution, definition, Some(step)).await;
    }

    async fn insert(
        &self,
        execution: WorkflowExecution,
        definition: Arc<WorkflowDefinition>,
        awaiting_approval: Option<ExecutionStep>,
    ) {
        let mut entries = self.entries.write().await;
        entries.entry(execution.id.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(LiveExecution {
                execution,
                definition,
                cancel: CancellationToken::new(),
                awaiting_approval,
            }))
        });
    }

    pub(crate) async fn contains(&self, id: &WorkflowExecutionId) -> bool {
        self.entries.read().await.contains_key(id)
    }

    async fn entry(&self, id: &WorkflowExecutionId) -> Option<Entry> {
        self.entries.read().await.get(id).cloned()
    }

    async fn release(&self, id: &WorkflowExecutionId) {
        self.entries.write().await.remove(id);
    }

    pub(crate) async fn snapshot(&self, id: &WorkflowExecutionId) -> Option<WorkflowExecution> {
        let entry = self.entry(id).await?;
        let live = entry.lock().await;
        Some(live.execution.clone())
    }

    pub(crate) async fn active(&self) -> Vec<WorkflowExecution> {
        let entries: Vec<Entry> = self.entries.read().await.values().cloned().collect();
        let mut running = Vec::with_capacity(entries.len());
        for entry in entries {
            let live = entry.lock().await;
            if live.execution.is_running() {
                running.push(live.execution.clone());
            }
        }
        running.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.0.cmp(&b.id.0)));
        running
    }

    /// Records `node_id` as the current node and appends its RUNNING step.
    /// Returns `None` once the execution has left RUNNING.
    pub(crate) async fn begin_step(
        &self,
        id: &WorkflowExecutionId,
        node_id: &str,
    ) -> Result<Option<StepTicket>, WorkflowError> {
        let Some(entry) = self.entry(id).await else {
            return Ok(None);
        };
        let mut live = entry.lock().await;
        if !live.execution.is_running() {
            return Ok(None);
        }

        let node = live.definition.node(node_id).cloned().ok_or_else(|| {
            WorkflowError::invalid_state(id, format!("node `{node_id}` is not part of the workflow"))
        })?;

        live.execution.current_node = Some(node.id.clone());
        let step = ExecutionStep::start(live.execution.id.clone(), &node, &live.execution.context);
        self.repository.save_execution(live.execution.clone()).await?;
        self.repository.save_step(step.clone()).await?;

        Ok(Some(StepTicket {
            step,
            node,
            context: live.execution.context.clone(),
            lead_id: live.execution.lead_id.clone(),
            cancel: live.cancel.clone(),
        }))
    }

    /// Applies a node's result. Results for an execution that is no longer RUNNING only mark
    /// their step SKIPPED.
    pub(crate) async fn apply_output(
        &self,
        id: &WorkflowExecutionId,
        mut step: ExecutionStep,
        node: &WorkflowNode,
        outcome: Result<NodeOutcome, NodeError>,
    ) -> Result<Advance, WorkflowError> {
        let Some(entry) = self.entry(id).await else {
            step.skip(discarded_output(&outcome));
            self.repository.save_step(step).await?;
            return Ok(Advance::Halted);
        };
        let mut live = entry.lock().await;
        if !live.execution.is_running() {
            step.skip(discarded_output(&outcome));
            self.repository.save_step(step).await?;
            return Ok(Advance::Halted);
        }

        match outcome {
            Ok(NodeOutcome::Completed(output)) => {
                let next = next_node(node, &output);
                live.execution.context.insert(node.id.clone(), output.clone());
                step.complete(output);
                self.repository.save_step(step).await?;

                match next {
                    Some(next) => {
                        self.repository.save_execution(live.execution.clone()).await?;
                        Ok(Advance::Next(next))
                    }
                    None => {
                        live.execution.finish(WorkflowExecutionStatus::Completed, None)?;
                        let finished = live.execution.clone();
                        self.repository.save_execution(finished.clone()).await?;
                        drop(live);
                        self.release(id).await;
                        Ok(Advance::Finished(finished))
                    }
                }
            }
            Ok(NodeOutcome::Suspended { output, notice }) => {
                step.await_decision(output);
                self.repository.save_step(step.clone()).await?;
                live.awaiting_approval = Some(step);
                self.repository.save_execution(live.execution.clone()).await?;
                Ok(Advance::Suspended(notice))
            }
            Err(error) => {
                step.fail(error.message.clone());
                self.repository.save_step(step).await?;
                live.execution.finish(WorkflowExecutionStatus::Failed, Some(error.message))?;
                let failed = live.execution.clone();
                self.repository.save_execution(failed.clone()).await?;
                drop(live);
                self.release(id).await;
                Ok(Advance::Finished(failed))
            }
        }
    }

    /// Resolves the approval the execution is suspended on.
    pub(crate) async fn resolve_approval(
        &self,
        id: &WorkflowExecutionId,
        node_id: &str,
        approved: bool,
        modified_data: Option<Value>,
    ) -> Result<Advance, WorkflowError> {
        let entry = self
            .entry(id)
            .await
            .ok_or_else(|| WorkflowError::NotFound(format!("workflow execution `{id}`")))?;
        let mut live = entry.lock().await;
        if !live.execution.is_running() {
            return Err(WorkflowError::invalid_state(
                id,
                format!("execution is {}", live.execution.status.as_str()),
            ));
        }

        if matches!(&modified_data, Some(data) if !data.is_object() && !data.is_null()) {
            return Err(WorkflowError::invalid_state(id, "modified data must be a JSON object"));
        }

        let awaiting_here =
            live.awaiting_approval.as_ref().map(|step| step.node_id == node_id).unwrap_or(false);
        let Some(mut step) = live.awaiting_approval.take().filter(|_| awaiting_here) else {
            return Err(WorkflowError::invalid_state(
                id,
                format!("execution is not awaiting approval at `{node_id}`"),
            ));
        };

        live.execution.context.insert(format!("{node_id}_approved"), Value::Bool(approved));
        if !approved {
            step.complete(json!({ "status": "rejected", "approved": false }));
            self.repository.save_step(step).await?;
            live.execution.finish(WorkflowExecutionStatus::Cancelled, None)?;
            let cancelled = live.execution.clone();
            self.repository.save_execution(cancelled.clone()).await?;
            drop(live);
            self.release(id).await;
            return Ok(Advance::Finished(cancelled));
        }

        if let Some(Value::Object(entries)) = modified_data {
            live.execution.context.extend(entries);
        }
        step.complete(json!({ "status": "approved", "approved": true }));
        self.repository.save_step(step).await?;

        let next = live.definition.node(node_id).and_then(|node| node.connections.next.clone());
        match next {
            Some(next) => {
                self.repository.save_execution(live.execution.clone()).await?;
                Ok(Advance::Next(next))
            }
            None => {
                live.execution.finish(WorkflowExecutionStatus::Completed, None)?;
                let finished = live.execution.clone();
                self.repository.save_execution(finished.clone()).await?;
                drop(live);
                self.release(id).await;
                Ok(Advance::Finished(finished))
            }
        }
    }

    /// Cancels a live execution. `Ok(None)` means the id is not live.
    pub(crate) async fn stop(
        &self,
        id: &WorkflowExecutionId,
    ) -> Result<Option<WorkflowExecution>, WorkflowError> {
        let Some(entry) = self.entry(id).await else {
            return Ok(None);
        };
        let mut live = entry.lock().await;
        if !live.execution.is_running() {
            return Err(WorkflowError::invalid_state(
                id,
                format!("execution is {}", live.execution.status.as_str()),
            ));
        }

        live.execution.finish(WorkflowExecutionStatus::Cancelled, None)?;
        live.cancel.cancel();
        if let Some(mut step) = live.awaiting_approval.take() {
            step.skip(json!({ "status": "cancelled" }));
            self.repository.save_step(step).await?;
        }

        let cancelled = live.execution.clone();
        self.repository.save_execution(cancelled.clone()).await?;
        drop(live);
        self.release(id).await;
        Ok(Some(cancelled))
    }

    /// Fails the execution after an infrastructure error. Returns the failed execution when
    /// this call moved it out of RUNNING.
    pub(crate) async fn abort(
        &self,
        id: &WorkflowExecutionId,
        message: String,
    ) -> Option<WorkflowExecution> {
        let entry = self.entry(id).await?;
        let mut live = entry.lock().await;
        if live.execution.finish(WorkflowExecutionStatus::Failed, Some(message)).is_err() {
            return None;
        }
        live.cancel.cancel();
        let failed = live.execution.clone();
        if let Err(error) = self.repository.save_execution(failed.clone()).await {
            warn!(
                event_name = "workflow.execution.persist_failed",
                execution_id = %id,
                error = %error,
                "failed to persist aborted workflow execution"
            );
        }
        drop(live);
        self.release(id).await;
        Some(failed)
    }
}

fn next_node(node: &WorkflowNode, output: &Value) -> Option<String> {
    match node.kind {
        NodeKind::Condition(_) => {
            if output.get("conditionResult").and_then(Value::as_bool).unwrap_or(false) {
                node.connections.on_true.clone()
            } else {
                node.connections.on_false.clone()
            }
        }
        _ => node.connections.next.clone(),
    }
}

fn discarded_output(outcome: &Result<NodeOutcome, NodeError>) -> Value {
    match outcome {
        Ok(NodeOutcome::Completed(output)) => output.clone(),
        Ok(NodeOutcome::Suspended { output, .. }) => output.clone(),
        Err(error) => json!({ "error": error.message }),
    }
}
