pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "leadflow",
    about = "Leadflow operator CLI",
    long_about = "Operate Leadflow runtime readiness, migrations, config inspection, and workflow validation.",
    after_help = "Examples:\n  leadflow doctor --json\n  leadflow config\n  leadflow validate-workflow workflows/qualify.json"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, LLM and CRM readiness, and DB connectivity checks")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Check a workflow definition file for a single trigger and valid connections")]
    ValidateWorkflow {
        #[arg(help = "Path to a workflow definition JSON file")]
        path: PathBuf,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => commands::CommandResult::report(0, commands::config::run()),
        Command::Doctor { json } => commands::doctor::run(json),
        Command::ValidateWorkflow { path } => commands::validate::run(&path),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
