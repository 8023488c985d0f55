pub mod config;
pub mod doctor;
pub mod migrate;
pub mod validate;

use serde_json::json;

/// Why a command failed. The class is printed as `error_class` and fixes the exit code, so
/// scripts can branch on either.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    ConfigValidation,
    RuntimeInit,
    DbConnectivity,
    Migration,
    WorkflowParse,
    WorkflowValidation,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfigValidation => "config_validation",
            Self::RuntimeInit => "runtime_init",
            Self::DbConnectivity => "db_connectivity",
            Self::Migration => "migration",
            Self::WorkflowParse => "workflow_parse",
            Self::WorkflowValidation => "workflow_validation",
        }
    }

    pub fn exit_code(self) -> u8 {
        match self {
            Self::ConfigValidation | Self::WorkflowParse => 2,
            Self::RuntimeInit | Self::WorkflowValidation => 3,
            Self::DbConnectivity => 4,
            Self::Migration => 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        let payload = json!({
            "command": command,
            "status": "ok",
            "error_class": null,
            "message": message.into(),
        });
        Self { exit_code: 0, output: payload.to_string() }
    }

    pub fn failure(command: &str, class: ErrorClass, message: impl Into<String>) -> Self {
        let payload = json!({
            "command": command,
            "status": "error",
            "error_class": class.as_str(),
            "message": message.into(),
        });
        Self { exit_code: class.exit_code(), output: payload.to_string() }
    }

    /// Free-form output, such as the config listing or a doctor report.
    pub fn report(exit_code: u8, output: String) -> Self {
        Self { exit_code, output }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::{CommandResult, ErrorClass};

    #[test]
    fn failures_carry_their_class_and_exit_code() {
        let result = CommandResult::failure(
            "validate-workflow",
            ErrorClass::WorkflowValidation,
            "trigger \"start\" is missing",
        );
        assert_eq!(result.exit_code, 3);

        let payload: Value = serde_json::from_str(&result.output).expect("json");
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "workflow_validation");
        assert_eq!(payload["message"], "trigger \"start\" is missing");
    }

    #[test]
    fn success_has_a_null_error_class() {
        let payload: Value =
            serde_json::from_str(&CommandResult::success("migrate", "done").output).expect("json");
        assert_eq!(payload["status"], "ok");
        assert!(payload["error_class"].is_null());
    }
}
