use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use leadflow_core::config::{AppConfig, LoadOptions};
use secrecy::{ExposeSecret, SecretString};
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key_path: &str| {
        field_source(key_path, config_file_doc.as_ref(), config_file_path.as_deref())
    };

    let entries: Vec<(&str, String)> = vec![
        ("database.url", config.database.url.clone()),
        ("database.max_connections", config.database.max_connections.to_string()),
        ("database.timeout_secs", config.database.timeout_secs.to_string()),
        ("sandbox.grace_ms", config.sandbox.grace_ms.to_string()),
        ("sandbox.max_operations", config.sandbox.max_operations.to_string()),
        ("sandbox.max_call_levels", config.sandbox.max_call_levels.to_string()),
        (
            "runtime.execution_retention_hours",
            config.runtime.execution_retention_hours.to_string(),
        ),
        ("runtime.sweep_interval_secs", config.runtime.sweep_interval_secs.to_string()),
        ("llm.provider", format!("{:?}", config.llm.provider)),
        ("llm.model", config.llm.model.clone()),
        ("llm.base_url", config.llm.base_url.clone().unwrap_or_else(|| "<unset>".to_string())),
        ("llm.api_key", redact_secret(config.llm.api_key.as_ref())),
        ("llm.timeout_secs", config.llm.timeout_secs.to_string()),
        ("crm.enabled", config.crm.enabled.to_string()),
        ("crm.base_url", config.crm.base_url.clone().unwrap_or_else(|| "<unset>".to_string())),
        ("crm.api_key", redact_secret(config.crm.api_key.as_ref())),
        ("crm.timeout_secs", config.crm.timeout_secs.to_string()),
        ("server.bind_address", config.server.bind_address.clone()),
        ("server.health_check_port", config.server.health_check_port.to_string()),
        ("server.graceful_shutdown_secs", config.server.graceful_shutdown_secs.to_string()),
        ("logging.level", config.logging.level.clone()),
        ("logging.format", format!("{:?}", config.logging.format)),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    lines.extend(entries.iter().map(|(key, value)| render_line(key, value, source(key))));
    lines.join("\n")
}

/// `database.url` maps to `LEADFLOW_DATABASE_URL`.
fn env_key(key_path: &str) -> String {
    format!("LEADFLOW_{}", key_path.replace('.', "_").to_ascii_uppercase())
}

fn detect_config_path() -> Option<PathBuf> {
    let root = PathBuf::from("leadflow.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/leadflow.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    let env_key = env_key(key_path);
    if env::var_os(&env_key).is_some() {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact_secret(secret: Option<&SecretString>) -> String {
    match secret.map(|value| value.expose_secret().trim()) {
        None => "<unset>".to_string(),
        Some("") => "<empty>".to_string(),
        Some(_) => "<redacted>".to_string(),
    }
}
