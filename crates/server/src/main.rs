mod bootstrap;
mod crm;
mod events;
mod health;
mod llm;

use std::time::Duration;

use anyhow::Result;
use leadflow_core::config::{AppConfig, LoadOptions};

use crate::health::HealthState;

fn init_logging(config: &AppConfig) {
    use leadflow_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Logging comes up before bootstrap so its events are captured
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    health::spawn(
        &app.config.server.bind_address,
        app.config.server.health_check_port,
        HealthState::new(
            app.db_pool.clone(),
            app.agent_runtime.clone(),
            app.workflow_engine.clone(),
        ),
    )
    .await?;

    let sweeper = app.agent_runtime.spawn_sweeper();

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        "leadflow-server started"
    );
    wait_for_shutdown().await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        active_workflows = app.workflow_engine.list_active().await.len(),
        "leadflow-server stopping"
    );

    sweeper.abort();
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    if tokio::time::timeout(grace, app.db_pool.close()).await.is_err() {
        tracing::warn!(
            event_name = "system.server.shutdown_timeout",
            correlation_id = "shutdown",
            "database pool did not close within the shutdown grace period"
        );
    }

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
