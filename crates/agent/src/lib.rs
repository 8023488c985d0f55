//! Agent runtime - sandboxed execution of third-party agent scripts
//!
//! This crate hosts untrusted agent code for the CRM:
//! - Installs validated agent manifests
//! - Runs each execution in a fresh, resource-bounded sandbox
//! - Tracks execution records and persists their lifecycle
//!
//! # Architecture
//!
//! 1. **Sandbox** (`sandbox`) - rhai VM with a deadline, memory caps and an API call quota
//! 2. **Runtime** (`runtime`) - manifest registry, execution index, stop and sweep
//! 3. **LLM** (`llm`) - pluggable completion client used by workflow `ai_agent` nodes
//!
//! # Key Types
//!
//! - `AgentRuntime` - main orchestrator (see `runtime` module)
//! - `Sandbox` - one isolated VM context per execution
//! - `LlmClient` - trait for OpenAI/Anthropic/Ollama backends
//!
//! # Safety Principle
//!
//! Agent code only reaches the host through the capabilities its manifest grants. A failing,
//! runaway or cancelled script never takes the host down; it only fails its own execution.

pub mod llm;
pub mod runtime;
pub mod sandbox;

pub use llm::LlmClient;
pub use runtime::{AgentRuntime, ExecuteOptions, RuntimeConfig, RuntimeError, RuntimeStats};
pub use sandbox::{
    ConsoleLevel, ConsoleLine, Sandbox, SandboxError, SandboxFailure, SandboxFailureKind,
    SandboxResult, SandboxScope, SandboxSettings,
};
