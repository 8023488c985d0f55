use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub sandbox: SandboxConfig,
    pub runtime: RuntimeConfig,
    pub llm: LlmConfig,
    pub crm: CrmConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

/// Engine-wide VM settings. Per-agent limits live on the manifest.
#[derive(Clone, Debug)]
pub struct SandboxConfig {
    pub grace_ms: u64,
    pub max_operations: u64,
    pub max_call_levels: usize,
}

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub execution_retention_hours: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct CrmConfig {
    pub enabled: bool,
    pub base_url: Option<String>,
    pub api_key: Option<SecretString>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub crm_enabled: Option<bool>,
    pub crm_base_url: Option<String>,
    pub crm_api_key: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://leadflow.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            sandbox: SandboxConfig { grace_ms: 250, max_operations: 5_000_000, max_call_levels: 64 },
            runtime: RuntimeConfig { execution_retention_hours: 24, sweep_interval_secs: 300 },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 30,
            },
            crm: CrmConfig { enabled: false, base_url: None, api_key: None, timeout_secs: 10 },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                health_check_port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl SandboxConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

impl RuntimeConfig {
    pub fn execution_retention(&self) -> Duration {
        Duration::from_secs(self.execution_retention_hours.saturating_mul(3600))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|anthropic|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("leadflow.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(sandbox) = patch.sandbox {
            if let Some(grace_ms) = sandbox.grace_ms {
                self.sandbox.grace_ms = grace_ms;
            }
            if let Some(max_operations) = sandbox.max_operations {
                self.sandbox.max_operations = max_operations;
            }
            if let Some(max_call_levels) = sandbox.max_call_levels {
                self.sandbox.max_call_levels = max_call_levels;
            }
        }

        if let Some(runtime) = patch.runtime {
            if let Some(hours) = runtime.execution_retention_hours {
                self.runtime.execution_retention_hours = hours;
            }
            if let Some(secs) = runtime.sweep_interval_secs {
                self.runtime.sweep_interval_secs = secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
        }

        if let Some(crm) = patch.crm {
            if let Some(enabled) = crm.enabled {
                self.crm.enabled = enabled;
            }
            if let Some(base_url) = crm.base_url {
                self.crm.base_url = Some(base_url);
            }
            if let Some(crm_api_key_value) = crm.api_key {
                self.crm.api_key = Some(secret_value(crm_api_key_value));
            }
            if let Some(timeout_secs) = crm.timeout_secs {
                self.crm.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("LEADFLOW_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("LEADFLOW_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("LEADFLOW_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("LEADFLOW_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("LEADFLOW_SANDBOX_GRACE_MS") {
            self.sandbox.grace_ms = parse_u64("LEADFLOW_SANDBOX_GRACE_MS", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_SANDBOX_MAX_OPERATIONS") {
            self.sandbox.max_operations = parse_u64("LEADFLOW_SANDBOX_MAX_OPERATIONS", &value)?;
        }

        if let Some(value) = read_env("LEADFLOW_RUNTIME_EXECUTION_RETENTION_HOURS") {
            self.runtime.execution_retention_hours =
                parse_u64("LEADFLOW_RUNTIME_EXECUTION_RETENTION_HOURS", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_RUNTIME_SWEEP_INTERVAL_SECS") {
            self.runtime.sweep_interval_secs =
                parse_u64("LEADFLOW_RUNTIME_SWEEP_INTERVAL_SECS", &value)?;
        }

        if let Some(value) = read_env("LEADFLOW_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("LEADFLOW_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("LEADFLOW_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("LEADFLOW_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("LEADFLOW_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("LEADFLOW_LLM_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("LEADFLOW_CRM_ENABLED") {
            self.crm.enabled = parse_bool("LEADFLOW_CRM_ENABLED", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_CRM_BASE_URL") {
            self.crm.base_url = Some(value);
        }
        if let Some(value) = read_env("LEADFLOW_CRM_API_KEY") {
            self.crm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("LEADFLOW_CRM_TIMEOUT_SECS") {
            self.crm.timeout_secs = parse_u64("LEADFLOW_CRM_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("LEADFLOW_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("LEADFLOW_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                parse_u16("LEADFLOW_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("LEADFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("LEADFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("LEADFLOW_LOGGING_LEVEL").or_else(|| read_env("LEADFLOW_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("LEADFLOW_LOGGING_FORMAT").or_else(|| read_env("LEADFLOW_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(enabled) = overrides.crm_enabled {
            self.crm.enabled = enabled;
        }
        if let Some(base_url) = overrides.crm_base_url {
            self.crm.base_url = Some(base_url);
        }
        if let Some(crm_api_key) = overrides.crm_api_key {
            self.crm.api_key = Some(secret_value(crm_api_key));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_sandbox(&self.sandbox)?;
        validate_runtime(&self.runtime)?;
        validate_llm(&self.llm)?;
        validate_crm(&self.crm)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("leadflow.toml"), PathBuf::from("config/leadflow.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_sandbox(sandbox: &SandboxConfig) -> Result<(), ConfigError> {
    if sandbox.grace_ms == 0 || sandbox.grace_ms > 10_000 {
        return Err(ConfigError::Validation(
            "sandbox.grace_ms must be in range 1..=10000".to_string(),
        ));
    }

    if sandbox.max_operations == 0 {
        return Err(ConfigError::Validation(
            "sandbox.max_operations must be greater than zero".to_string(),
        ));
    }

    if sandbox.max_call_levels == 0 {
        return Err(ConfigError::Validation(
            "sandbox.max_call_levels must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_runtime(runtime: &RuntimeConfig) -> Result<(), ConfigError> {
    if runtime.execution_retention_hours == 0 {
        return Err(ConfigError::Validation(
            "runtime.execution_retention_hours must be greater than zero".to_string(),
        ));
    }

    if runtime.sweep_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "runtime.sweep_interval_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    match llm.provider {
        LlmProvider::OpenAi | LlmProvider::Anthropic => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for openai/anthropic providers".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn validate_crm(crm: &CrmConfig) -> Result<(), ConfigError> {
    if crm.enabled && crm.base_url.is_none() {
        return Err(ConfigError::Validation(
            "crm.enabled is true but crm.base_url is not configured".to_string(),
        ));
    }

    if let Some(base_url) = &crm.base_url {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "crm.base_url must start with http:// or https://".to_string(),
            ));
        }
    }

    if crm.timeout_secs == 0 || crm.timeout_secs > 120 {
        return Err(ConfigError::Validation(
            "crm.timeout_secs must be in range 1..=120".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    sandbox: Option<SandboxPatch>,
    runtime: Option<RuntimePatch>,
    llm: Option<LlmPatch>,
    crm: Option<CrmPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct SandboxPatch {
    grace_ms: Option<u64>,
    max_operations: Option<u64>,
    max_call_levels: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RuntimePatch {
    execution_retention_hours: Option<u64>,
    sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CrmPatch {
    enabled: Option<bool>,
    base_url: Option<String>,
    api_key: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_CRM_BASE_URL", "https://crm.internal");
        env::set_var("TEST_CRM_API_KEY", "crm-key-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("leadflow.toml");
            fs::write(
                &path,
                r#"
[crm]
enabled = true
base_url = "${TEST_CRM_BASE_URL}"
api_key = "${TEST_CRM_API_KEY}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.crm.base_url.as_deref() == Some("https://crm.internal"),
                "crm base url should be interpolated from environment",
            )?;
            ensure(
                config.crm.api_key.as_ref().map(|key| key.expose_secret() == "crm-key-from-env")
                    == Some(true),
                "crm api key should be interpolated from environment",
            )?;
            Ok(())
        })();

        clear_vars(&["TEST_CRM_BASE_URL", "TEST_CRM_API_KEY"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LEADFLOW_LOG_LEVEL", "warn");
        env::set_var("LEADFLOW_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["LEADFLOW_LOG_LEVEL", "LEADFLOW_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LEADFLOW_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("LEADFLOW_RUNTIME_SWEEP_INTERVAL_SECS", "60");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("leadflow.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[runtime]
execution_retention_hours = 48
sweep_interval_secs = 900

[sandbox]
grace_ms = 500

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.runtime.sweep_interval_secs == 60,
                "env sweep interval should win over file",
            )?;
            ensure(
                config.runtime.execution_retention_hours == 48,
                "file retention should win over defaults",
            )?;
            ensure(config.sandbox.grace_ms == 500, "file grace should win over defaults")?;
            ensure(config.sandbox.max_operations == 5_000_000, "defaults should fill the rest")?;
            Ok(())
        })();

        clear_vars(&["LEADFLOW_DATABASE_URL", "LEADFLOW_RUNTIME_SWEEP_INTERVAL_SECS"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LEADFLOW_CRM_ENABLED", "true");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("crm.base_url")
            );
            ensure(has_message, "validation failure should mention crm.base_url")
        })();

        clear_vars(&["LEADFLOW_CRM_ENABLED"]);
        result
    }

    #[test]
    fn invalid_numeric_env_override_is_reported_with_its_key() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LEADFLOW_SANDBOX_GRACE_MS", "soon");

        let result = match AppConfig::load(LoadOptions::default()) {
            Err(ConfigError::InvalidEnvOverride { key, .. }) => {
                ensure(key == "LEADFLOW_SANDBOX_GRACE_MS", "error should name the env key")
            }
            _ => Err("expected an invalid env override error".to_string()),
        };

        clear_vars(&["LEADFLOW_SANDBOX_GRACE_MS"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LEADFLOW_CRM_API_KEY", "crm-secret-value");
        env::set_var("LEADFLOW_LLM_API_KEY", "llm-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("crm-secret-value"), "debug output should not contain crm key")?;
            ensure(!debug.contains("llm-secret-value"), "debug output should not contain llm key")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&["LEADFLOW_CRM_API_KEY", "LEADFLOW_LLM_API_KEY"]);
        result
    }
}
