use leadflow_core::config::{AppConfig, LlmProvider, LoadOptions};
use leadflow_db::{connect_with_settings, migrations, ping};
use serde::Serialize;

use crate::commands::CommandResult;

const DOCTOR_FAILURE_EXIT_CODE: u8 = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code =
        if report.overall_status == CheckStatus::Pass { 0 } else { DOCTOR_FAILURE_EXIT_CODE };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult::report(exit_code, output)
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_llm_provider(&config));
            checks.push(check_crm_gateway(&config));
            checks.push(check_database(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["llm_provider", "crm_gateway", "database_connectivity"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_llm_provider(config: &AppConfig) -> DoctorCheck {
    match config.llm.provider {
        LlmProvider::Ollama => DoctorCheck {
            name: "llm_provider",
            status: CheckStatus::Pass,
            details: format!(
                "ollama model `{}` at {}",
                config.llm.model,
                config.llm.base_url.as_deref().unwrap_or("<unset>")
            ),
        },
        other => DoctorCheck {
            name: "llm_provider",
            status: CheckStatus::Fail,
            details: format!("provider `{other:?}` has no client; the server supports `ollama`"),
        },
    }
}

fn check_crm_gateway(config: &AppConfig) -> DoctorCheck {
    if !config.crm.enabled {
        return DoctorCheck {
            name: "crm_gateway",
            status: CheckStatus::Pass,
            details: "crm disabled; leads are read from the local database".to_string(),
        };
    }

    let details = match (&config.crm.base_url, &config.crm.api_key) {
        (Some(base_url), Some(_)) => format!("crm gateway at {base_url} with api key"),
        (Some(base_url), None) => format!("crm gateway at {base_url} without api key"),
        (None, _) => "crm enabled without base_url".to_string(),
    };
    let status = if config.crm.base_url.is_some() { CheckStatus::Pass } else { CheckStatus::Fail };
    DoctorCheck { name: "crm_gateway", status, details }
}

fn check_database(config: &AppConfig) -> DoctorCheck {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            };
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| format!("failed to connect to database: {error}"))?;

        ping(&pool).await.map_err(|error| format!("database query failed: {error}"))?;
        // Before the first `leadflow migrate` the bookkeeping table does not exist yet.
        let applied = migrations::applied_versions(&pool).await.unwrap_or_default();

        pool.close().await;
        Ok::<usize, String>(applied.len())
    });

    match result {
        Ok(applied) => DoctorCheck {
            name: "database_connectivity",
            status: CheckStatus::Pass,
            details: format!(
                "connected using `{}`; {applied} migration(s) applied",
                config.database.url
            ),
        },
        Err(error) => {
            DoctorCheck { name: "database_connectivity", status: CheckStatus::Fail, details: error }
        }
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
