use std::fs;
use std::path::Path;

use anyhow::Context;
use leadflow_core::domain::workflow::WorkflowDefinition;

use crate::commands::{CommandResult, ErrorClass};

pub fn run(path: &Path) -> CommandResult {
    let definition = match load(path) {
        Ok(definition) => definition,
        Err(error) => {
            return CommandResult::failure(
                "validate-workflow",
                ErrorClass::WorkflowParse,
                format!("{error:#}"),
            );
        }
    };

    match definition.entry_node() {
        Ok(entry) => CommandResult::success(
            "validate-workflow",
            format!(
                "workflow `{}` is valid: {} node(s), entry `{}`",
                definition.id.0,
                definition.nodes.len(),
                entry.id
            ),
        ),
        Err(error) => CommandResult::failure(
            "validate-workflow",
            ErrorClass::WorkflowValidation,
            format!("workflow `{}` is invalid: {error}", definition.id.0),
        ),
    }
}

fn load(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("could not read workflow file `{}`", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("could not parse workflow file `{}`", path.display()))
}
