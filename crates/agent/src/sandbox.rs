//! Resource-bounded execution of untrusted agent scripts.
//!
//! Scripts run in an embedded rhai VM on a blocking worker thread. The VM only sees the
//! capabilities registered here: `console.log/warn/error`, `input`, `uuid()` and, when the
//! manifest grants them, `api.request`, `api.on` and `setTimeout`. rhai reserves `.call` for
//! function pointers, so the `api.call` permission surfaces as `api.request`.
//!
//! Every failure collapses into a [`SandboxResult`] with `success: false`.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rhai::module_resolvers::DummyModuleResolver;
use rhai::{Dynamic, Engine, EvalAltResult, FnPtr, Scope, AST, INT};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use leadflow_core::config::SandboxConfig;
use leadflow_core::domain::agent::{
    AgentId, ResourceLimits, ResourceUsage, PERMISSION_API_CALL, PERMISSION_API_ON,
    PERMISSION_TIMERS,
};
use leadflow_core::events::{DomainEvent, EventSink, EventType};

const MAX_LOG_LINES: usize = 1_000;
const DEADLINE_CHECK_INTERVAL: u64 = 64;
const TIMER_POLL: Duration = Duration::from_millis(5);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxScope {
    pub agent_id: AgentId,
    pub session_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxSettings {
    pub grace: Duration,
    pub max_operations: u64,
    pub max_call_levels: usize,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self { grace: Duration::from_millis(250), max_operations: 5_000_000, max_call_levels: 64 }
    }
}

impl From<&SandboxConfig> for SandboxSettings {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            grace: config.grace(),
            max_operations: config.max_operations,
            max_call_levels: config.max_call_levels,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxFailureKind {
    Timeout,
    ApiQuotaExceeded,
    MemoryLimit,
    ScriptError,
    CompileError,
    Busy,
    Destroyed,
}

impl SandboxFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ApiQuotaExceeded => "api_quota_exceeded",
            Self::MemoryLimit => "memory_limit",
            Self::ScriptError => "script_error",
            Self::CompileError => "compile_error",
            Self::Busy => "busy",
            Self::Destroyed => "destroyed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxFailure {
    pub kind: SandboxFailureKind,
    pub message: String,
}

impl SandboxFailure {
    fn new(kind: SandboxFailureKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Warn,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleLine {
    pub level: ConsoleLevel,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxResult {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<SandboxFailure>,
    pub resource_usage: ResourceUsage,
    pub logs: Vec<ConsoleLine>,
    pub listeners: Vec<String>,
}

impl SandboxResult {
    fn rejected(kind: SandboxFailureKind, message: &str) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(SandboxFailure::new(kind, message)),
            resource_usage: ResourceUsage::default(),
            logs: Vec::new(),
            listeners: Vec::new(),
        }
    }

    pub fn failure_kind(&self) -> Option<SandboxFailureKind> {
        self.error.as_ref().map(|failure| failure.kind)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SandboxError {
    #[error("sandbox has already been destroyed")]
    AlreadyDestroyed,
}

#[derive(Default)]
struct SharedState {
    destroyed: AtomicBool,
    busy: AtomicBool,
    api_calls: AtomicU32,
    listeners: Mutex<Vec<String>>,
    active_run: Mutex<Option<Arc<RunState>>>,
}

#[derive(Default)]
struct RunState {
    logs: Mutex<Vec<ConsoleLine>>,
    timers: Mutex<Vec<Timer>>,
    timer_seq: AtomicU64,
    timed_out: AtomicBool,
    quota_exceeded: AtomicBool,
    cancelled: AtomicBool,
}

struct Timer {
    due: Instant,
    seq: u64,
    callback: FnPtr,
}

#[derive(Clone)]
struct Console;

/// The script-facing `api` object.
///
/// `api.request(endpoint, data)` is the call granted by the `api.call` permission; rhai treats
/// `.call(..)` as a function-pointer invocation, so the method cannot carry that name. It counts
/// against `max_api_calls` and returns a receipt `#{ id, endpoint, queued }`.
/// `api.on(event, callback)` needs `api.on` and records a listener until the sandbox is destroyed.
#[derive(Clone)]
struct Api;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn push_log(run: &RunState, level: ConsoleLevel, message: String) {
    let mut logs = lock(&run.logs);
    if logs.len() < MAX_LOG_LINES {
        logs.push(ConsoleLine { level, message });
    }
}

fn render_message(message: &Dynamic) -> String {
    if message.is_string() {
        return message.to_string();
    }
    rhai::serde::from_dynamic::<Value>(message)
        .map(|value| value.to_string())
        .unwrap_or_else(|_| message.to_string())
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One isolated VM context. Never shared between executions.
pub struct Sandbox {
    scope: SandboxScope,
    limits: ResourceLimits,
    permissions: BTreeSet<String>,
    settings: SandboxSettings,
    events: Arc<dyn EventSink>,
    shared: Arc<SharedState>,
}

impl Sandbox {
    pub fn new(
        scope: SandboxScope,
        limits: ResourceLimits,
        permissions: BTreeSet<String>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            scope,
            limits,
            permissions,
            settings: SandboxSettings::default(),
            events,
            shared: Arc::new(SharedState::default()),
        }
    }

    pub fn with_settings(mut self, settings: SandboxSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn scope(&self) -> &SandboxScope {
        &self.scope
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    pub fn listeners(&self) -> Vec<String> {
        lock(&self.shared.listeners).clone()
    }

    pub async fn execute(&self, code: &str, input: Value) -> SandboxResult {
        if self.is_destroyed() {
            return SandboxResult::rejected(SandboxFailureKind::Destroyed, "sandbox has been destroyed");
        }
        if self
            .shared
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return SandboxResult::rejected(SandboxFailureKind::Busy, "already executing");
        }
        let _busy = BusyGuard(&self.shared.busy);

        let started = Instant::now();
        let timeout = Duration::from_millis(self.limits.timeout_ms);
        let run = Arc::new(RunState::default());
        *lock(&self.shared.active_run) = Some(Arc::clone(&run));

        let job = Job {
            code: code.to_owned(),
            input: input.clone(),
            deadline: started + timeout,
            scope: self.scope.clone(),
            limits: self.limits,
            permissions: self.permissions.clone(),
            settings: self.settings.clone(),
            events: Arc::clone(&self.events),
            shared: Arc::clone(&self.shared),
            run: Arc::clone(&run),
        };

        let worker = tokio::task::spawn_blocking(move || job.run());
        let outcome = match tokio::time::timeout(timeout + self.settings.grace, worker).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_error)) => Err(SandboxFailure::new(
                SandboxFailureKind::ScriptError,
                format!("sandbox worker stopped unexpectedly: {join_error}"),
            )),
            Err(_) => {
                run.cancelled.store(true, Ordering::SeqCst);
                run.timed_out.store(true, Ordering::SeqCst);
                Err(SandboxFailure::new(
                    SandboxFailureKind::Timeout,
                    format!("execution exceeded {}ms", self.limits.timeout_ms),
                ))
            }
        };
        *lock(&self.shared.active_run) = None;

        let logs = lock(&run.logs).clone();
        let accepted_calls =
            self.shared.api_calls.load(Ordering::SeqCst).min(self.limits.max_api_calls);
        let result_bytes = match &outcome {
            Ok(value) => serde_json::to_vec(value).map(|bytes| bytes.len()).unwrap_or(0),
            Err(_) => 0,
        };
        let input_bytes = serde_json::to_vec(&input).map(|bytes| bytes.len()).unwrap_or(0);
        let log_bytes: usize = logs.iter().map(|line| line.message.len()).sum();

        let resource_usage = ResourceUsage {
            execution_time_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            memory_used_bytes: u64::try_from(input_bytes + result_bytes + log_bytes)
                .unwrap_or(u64::MAX),
            api_calls_made: accepted_calls,
        };

        let (success, result, error) = match outcome {
            Ok(value) => (true, Some(value), None),
            Err(failure) => {
                debug!(
                    event_name = "agent.sandbox.failed",
                    agent_id = %self.scope.agent_id,
                    session_id = %self.scope.session_id,
                    kind = failure.kind.as_str(),
                    "sandbox run failed"
                );
                (false, None, Some(failure))
            }
        };

        SandboxResult {
            success,
            result,
            error,
            resource_usage,
            logs,
            listeners: self.listeners(),
        }
    }

    /// Aborts any in-flight run and releases listeners and timers. Succeeds exactly once.
    pub fn destroy(&self) -> Result<(), SandboxError> {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return Err(SandboxError::AlreadyDestroyed);
        }
        self.release();
        debug!(
            event_name = "agent.sandbox.destroyed",
            agent_id = %self.scope.agent_id,
            session_id = %self.scope.session_id,
            "sandbox destroyed"
        );
        Ok(())
    }

    fn release(&self) {
        lock(&self.shared.listeners).clear();
        if let Some(run) = lock(&self.shared.active_run).take() {
            run.cancelled.store(true, Ordering::SeqCst);
            lock(&run.timers).clear();
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if !self.shared.destroyed.swap(true, Ordering::SeqCst) {
            self.release();
        }
    }
}

/// Everything the blocking worker needs, moved onto its thread.
struct Job {
    code: String,
    input: Value,
    deadline: Instant,
    scope: SandboxScope,
    limits: ResourceLimits,
    permissions: BTreeSet<String>,
    settings: SandboxSettings,
    events: Arc<dyn EventSink>,
    shared: Arc<SharedState>,
    run: Arc<RunState>,
}

impl Job {
    fn run(self) -> Result<Value, SandboxFailure> {
        let engine = self.build_engine();
        let ast = engine
            .compile(&self.code)
            .map_err(|error| SandboxFailure::new(SandboxFailureKind::CompileError, error.to_string()))?;

        let input = rhai::serde::to_dynamic(&self.input).map_err(|error| {
            SandboxFailure::new(SandboxFailureKind::ScriptError, format!("input rejected: {error}"))
        })?;

        let mut scope = Scope::new();
        scope.push_constant("input", input);
        scope.push("console", Console);
        scope.push("api", Api);

        let value = engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
            .map_err(|error| self.classify(&error))?;
        self.check_flags()?;

        self.drain_timers(&engine, &ast)?;
        self.check_flags()?;

        rhai::serde::from_dynamic::<Value>(&value).map_err(|error| {
            SandboxFailure::new(
                SandboxFailureKind::ScriptError,
                format!("script result is not serializable: {error}"),
            )
        })
    }

    fn build_engine(&self) -> Engine {
        let mut engine = Engine::new();
        let memory = self.limits.memory_bytes();

        engine.set_max_operations(self.settings.max_operations);
        engine.set_max_call_levels(self.settings.max_call_levels);
        engine.set_max_expr_depths(64, 32);
        engine.set_max_string_size(memory / 2);
        engine.set_max_array_size(memory / 64);
        engine.set_max_map_size(memory / 64);
        engine.set_module_resolver(DummyModuleResolver::new());
        engine.disable_symbol("eval");

        let shared = Arc::clone(&self.shared);
        let run = Arc::clone(&self.run);
        let deadline = self.deadline;
        engine.on_progress(move |operations| {
            if shared.destroyed.load(Ordering::SeqCst) || run.cancelled.load(Ordering::SeqCst) {
                return Some(Dynamic::UNIT);
            }
            if run.quota_exceeded.load(Ordering::SeqCst) {
                return Some(Dynamic::UNIT);
            }
            if operations % DEADLINE_CHECK_INTERVAL == 0 && Instant::now() >= deadline {
                run.timed_out.store(true, Ordering::SeqCst);
                return Some(Dynamic::UNIT);
            }
            None
        });

        let run = Arc::clone(&self.run);
        engine.on_print(move |text| push_log(&run, ConsoleLevel::Log, text.to_string()));
        let run = Arc::clone(&self.run);
        engine.on_debug(move |text, _source, _position| {
            push_log(&run, ConsoleLevel::Log, text.to_string())
        });

        self.register_console(&mut engine);
        self.register_api(&mut engine);
        self.register_timers(&mut engine);
        engine.register_fn("uuid", || uuid::Uuid::new_v4().to_string());

        engine
    }

    fn register_console(&self, engine: &mut Engine) {
        engine.register_type_with_name::<Console>("Console");
        for (name, level) in
            [("log", ConsoleLevel::Log), ("warn", ConsoleLevel::Warn), ("error", ConsoleLevel::Error)]
        {
            let run = Arc::clone(&self.run);
            engine.register_fn(name, move |_: &mut Console, message: Dynamic| {
                push_log(&run, level, render_message(&message))
            });
        }
    }

    /// Registers only the `api` methods the manifest grants. See [`Api`].
    fn register_api(&self, engine: &mut Engine) {
        engine.register_type_with_name::<Api>("Api");

        if self.permissions.contains(PERMISSION_API_CALL) {
            let shared = Arc::clone(&self.shared);
            let run = Arc::clone(&self.run);
            let events = Arc::clone(&self.events);
            let scope = self.scope.clone();
            let max_calls = self.limits.max_api_calls;

            engine.register_fn(
                "request",
                move |_: &mut Api,
                      endpoint: &str,
                      data: Dynamic|
                      -> Result<rhai::Map, Box<EvalAltResult>> {
                    let made = shared.api_calls.fetch_add(1, Ordering::SeqCst).saturating_add(1);
                    if made > max_calls {
                        run.quota_exceeded.store(true, Ordering::SeqCst);
                        return Err(format!("api call quota of {max_calls} exceeded").into());
                    }

                    let call_id = uuid::Uuid::new_v4().to_string();
                    let payload = rhai::serde::from_dynamic::<Value>(&data).unwrap_or(Value::Null);
                    events.emit(DomainEvent::new(
                        EventType::AgentApiCall,
                        scope.agent_id.0.clone(),
                        json!({
                            "callId": call_id,
                            "agentId": scope.agent_id.0,
                            "sessionId": scope.session_id,
                            "endpoint": endpoint,
                            "data": payload,
                        }),
                    ));

                    let mut receipt = rhai::Map::new();
                    receipt.insert("id".into(), Dynamic::from(call_id));
                    receipt.insert("endpoint".into(), Dynamic::from(endpoint.to_string()));
                    receipt.insert("queued".into(), Dynamic::from(true));
                    Ok(receipt)
                },
            );
        }

        if self.permissions.contains(PERMISSION_API_ON) {
            let shared = Arc::clone(&self.shared);
            engine.register_fn("on", move |_: &mut Api, event: &str, _callback: FnPtr| {
                lock(&shared.listeners).push(event.to_string());
            });
        }
    }

    fn register_timers(&self, engine: &mut Engine) {
        if !self.permissions.contains(PERMISSION_TIMERS) {
            return;
        }

        let run = Arc::clone(&self.run);
        engine.register_fn("setTimeout", move |callback: FnPtr, delay_ms: INT| -> INT {
            let seq = run.timer_seq.fetch_add(1, Ordering::SeqCst);
            let delay = Duration::from_millis(u64::try_from(delay_ms).unwrap_or(0));
            lock(&run.timers).push(Timer { due: Instant::now() + delay, seq, callback });
            INT::try_from(seq).unwrap_or(INT::MAX)
        });
    }

    /// Runs queued timers in due order. Callbacks may queue further timers.
    fn drain_timers(&self, engine: &Engine, ast: &AST) -> Result<(), SandboxFailure> {
        loop {
            let next = {
                let mut timers = lock(&self.run.timers);
                timers
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, timer)| (timer.due, timer.seq))
                    .map(|(index, _)| index)
                    .map(|index| timers.remove(index))
            };
            let Some(timer) = next else {
                return Ok(());
            };

            if timer.due > self.deadline {
                self.run.timed_out.store(true, Ordering::SeqCst);
                return Err(SandboxFailure::new(
                    SandboxFailureKind::Timeout,
                    format!("timer due after the {}ms execution deadline", self.limits.timeout_ms),
                ));
            }

            self.wait_until(timer.due)?;
            timer
                .callback
                .call::<Dynamic>(engine, ast, ())
                .map(drop)
                .map_err(|error| self.classify(&error))?;
            self.check_flags()?;
        }
    }

    fn wait_until(&self, due: Instant) -> Result<(), SandboxFailure> {
        loop {
            if self.aborted() {
                return Err(SandboxFailure::new(SandboxFailureKind::Destroyed, "execution aborted"));
            }
            let now = Instant::now();
            if now >= due {
                return Ok(());
            }
            std::thread::sleep(TIMER_POLL.min(due - now));
        }
    }

    fn aborted(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst) || self.run.cancelled.load(Ordering::SeqCst)
    }

    fn check_flags(&self) -> Result<(), SandboxFailure> {
        if self.run.quota_exceeded.load(Ordering::SeqCst) {
            return Err(self.quota_failure());
        }
        if self.run.timed_out.load(Ordering::SeqCst) {
            return Err(self.timeout_failure());
        }
        if self.aborted() {
            return Err(SandboxFailure::new(SandboxFailureKind::Destroyed, "execution aborted"));
        }
        Ok(())
    }

    fn classify(&self, error: &EvalAltResult) -> SandboxFailure {
        if let Err(failure) = self.check_flags() {
            return failure;
        }

        match root_cause(error) {
            EvalAltResult::ErrorTooManyOperations(_) => SandboxFailure::new(
                SandboxFailureKind::Timeout,
                format!("operation budget of {} exhausted", self.settings.max_operations),
            ),
            EvalAltResult::ErrorDataTooLarge(what, _) => SandboxFailure::new(
                SandboxFailureKind::MemoryLimit,
                format!("{what} exceeds the {}MB memory limit", self.limits.memory_mb),
            ),
            EvalAltResult::ErrorStackOverflow(_) => SandboxFailure::new(
                SandboxFailureKind::ScriptError,
                "call depth limit exceeded".to_string(),
            ),
            other => SandboxFailure::new(SandboxFailureKind::ScriptError, other.to_string()),
        }
    }

    fn quota_failure(&self) -> SandboxFailure {
        SandboxFailure::new(
            SandboxFailureKind::ApiQuotaExceeded,
            format!("api call quota of {} exceeded", self.limits.max_api_calls),
        )
    }

    fn timeout_failure(&self) -> SandboxFailure {
        SandboxFailure::new(
            SandboxFailureKind::Timeout,
            format!("execution exceeded {}ms", self.limits.timeout_ms),
        )
    }
}

fn root_cause(error: &EvalAltResult) -> &EvalAltResult {
    match error {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => root_cause(inner),
        other => other,
    }
}
