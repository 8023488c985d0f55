//! Workflow engine - lead automation graphs
//!
//! A workflow is a graph of typed nodes (`trigger`, `ai_agent`, `condition`, `delay`,
//! `human_approval`, `send_message`, `update_lead`). One execution walks the graph from its
//! trigger, threading a shared context through every node and recording a step per node.
//!
//! # Key Types
//!
//! - `WorkflowEngine` - start, approve, stop and inspect executions (see `engine`)
//! - `AgentInvoker` - seam between `ai_agent` nodes and the agent runtime or an LLM
//!
//! Executions suspend at `human_approval` nodes and resume through
//! `WorkflowEngine::approve_workflow_step`, also after a restart.

pub mod engine;
pub mod errors;
pub mod invoker;
mod nodes;
mod registry;

pub use engine::WorkflowEngine;
pub use errors::{AgentInvocationError, NodeError, WorkflowError};
pub use invoker::{
    AgentInvocation, AgentInvoker, AgentType, LlmAgentInvoker, RoutingAgentInvoker,
    RuntimeAgentInvoker,
};
