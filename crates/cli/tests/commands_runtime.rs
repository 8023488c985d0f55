use std::env;
use std::fs;
use std::sync::{Mutex, OnceLock};

use leadflow_cli::commands::{config, doctor, migrate, validate};
use serde_json::{json, Value};

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(&[("LEADFLOW_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
        assert!(payload["message"].as_str().unwrap_or_default().contains("3 migration(s)"));
    });
}

#[test]
fn migrate_returns_config_failure_for_bad_override() {
    with_env(&[("LEADFLOW_SANDBOX_GRACE_MS", "soon")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn doctor_passes_with_local_defaults() {
    with_env(&[("LEADFLOW_DATABASE_URL", "sqlite::memory:")], || {
        let result = doctor::run(true);
        assert_eq!(result.exit_code, 0, "expected all doctor checks to pass");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["overall_status"], "pass");
        let names: Vec<&str> = payload["checks"]
            .as_array()
            .expect("checks")
            .iter()
            .filter_map(|check| check["name"].as_str())
            .collect();
        assert_eq!(
            names,
            vec!["config_validation", "llm_provider", "crm_gateway", "database_connectivity"]
        );
    });
}

#[test]
fn doctor_flags_providers_without_a_client() {
    with_env(
        &[
            ("LEADFLOW_DATABASE_URL", "sqlite::memory:"),
            ("LEADFLOW_LLM_PROVIDER", "anthropic"),
            ("LEADFLOW_LLM_API_KEY", "sk-ant-test"),
        ],
        || {
            let result = doctor::run(true);
            assert_eq!(result.exit_code, 6);

            let payload = parse_payload(&result.output);
            assert_eq!(payload["overall_status"], "fail");
            assert_eq!(payload["checks"][1]["name"], "llm_provider");
            assert_eq!(payload["checks"][1]["status"], "fail");
        },
    );
}

#[test]
fn doctor_skips_checks_when_config_is_invalid() {
    with_env(&[("LEADFLOW_CRM_ENABLED", "true")], || {
        let result = doctor::run(false);
        assert_eq!(result.exit_code, 6);
        assert!(result.output.starts_with("doctor: one or more readiness checks failed"));
        assert!(result.output.contains("- [fail] config_validation"));
        assert!(result.output.contains("- [skip] database_connectivity"));
    });
}

#[test]
fn config_redacts_secrets_and_names_their_source() {
    with_env(&[("LEADFLOW_CRM_API_KEY", "crm-super-secret")], || {
        let output = config::run();

        assert!(output.contains(
            "- crm.api_key = <redacted> (source: env (LEADFLOW_CRM_API_KEY))"
        ));
        assert!(output.contains("- llm.api_key = <unset> (source: default)"));
        assert!(!output.contains("crm-super-secret"));
    });
}

#[test]
fn validate_workflow_accepts_a_connected_graph() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("qualify.json");
    write_workflow(
        &path,
        json!([
            { "id": "start", "type": "trigger", "connections": { "next": "check" } },
            {
                "id": "check",
                "type": "condition",
                "config": { "condition": "{trigger.score} > 50" },
                "connections": { "true": "hot" }
            },
            { "id": "hot", "type": "update_lead", "config": { "priority": "HIGH" } }
        ]),
    );

    let result = validate::run(&path);
    assert_eq!(result.exit_code, 0);

    let payload = parse_payload(&result.output);
    assert_eq!(payload["command"], "validate-workflow");
    assert_eq!(payload["message"], "workflow `qualify` is valid: 3 node(s), entry `start`");
}

#[test]
fn validate_workflow_rejects_dangling_connections() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("broken.json");
    write_workflow(
        &path,
        json!([
            { "id": "start", "type": "trigger", "connections": { "next": "missing" } }
        ]),
    );

    let result = validate::run(&path);
    assert_eq!(result.exit_code, 3);

    let payload = parse_payload(&result.output);
    assert_eq!(payload["status"], "error");
    assert_eq!(payload["error_class"], "workflow_validation");
}

#[test]
fn validate_workflow_reports_unreadable_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("absent.json");

    let result = validate::run(&path);
    assert_eq!(result.exit_code, 2);

    let payload = parse_payload(&result.output);
    assert_eq!(payload["error_class"], "workflow_parse");
    assert!(payload["message"].as_str().unwrap_or_default().contains("absent.json"));
}

fn write_workflow(path: &std::path::Path, nodes: Value) {
    let definition = json!({ "id": "qualify", "name": "Qualify inbound lead", "nodes": nodes });
    fs::write(path, definition.to_string()).expect("write workflow");
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "LEADFLOW_DATABASE_URL",
        "LEADFLOW_DATABASE_MAX_CONNECTIONS",
        "LEADFLOW_DATABASE_TIMEOUT_SECS",
        "LEADFLOW_SANDBOX_GRACE_MS",
        "LEADFLOW_SANDBOX_MAX_OPERATIONS",
        "LEADFLOW_RUNTIME_EXECUTION_RETENTION_HOURS",
        "LEADFLOW_RUNTIME_SWEEP_INTERVAL_SECS",
        "LEADFLOW_LLM_PROVIDER",
        "LEADFLOW_LLM_API_KEY",
        "LEADFLOW_LLM_BASE_URL",
        "LEADFLOW_LLM_MODEL",
        "LEADFLOW_LLM_TIMEOUT_SECS",
        "LEADFLOW_CRM_ENABLED",
        "LEADFLOW_CRM_BASE_URL",
        "LEADFLOW_CRM_API_KEY",
        "LEADFLOW_CRM_TIMEOUT_SECS",
        "LEADFLOW_SERVER_BIND_ADDRESS",
        "LEADFLOW_SERVER_HEALTH_CHECK_PORT",
        "LEADFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS",
        "LEADFLOW_LOGGING_LEVEL",
        "LEADFLOW_LOGGING_FORMAT",
        "LEADFLOW_LOG_LEVEL",
        "LEADFLOW_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
