use crate::commands::{CommandResult, ErrorClass};
use leadflow_core::config::{AppConfig, LoadOptions};
use leadflow_db::{connect_with_settings, migrations};

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "migrate",
                ErrorClass::ConfigValidation,
                format!("configuration issue: {error}"),
            );
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "migrate",
                ErrorClass::RuntimeInit,
                format!("failed to initialize async runtime: {error}"),
            );
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| (ErrorClass::DbConnectivity, error.to_string()))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| (ErrorClass::Migration, error.to_string()))?;
        let applied = migrations::applied_versions(&pool)
            .await
            .map_err(|error| (ErrorClass::Migration, error.to_string()))?;
        pool.close().await;
        Ok::<Vec<i64>, (ErrorClass, String)>(applied)
    });

    match result {
        Ok(applied) => CommandResult::success(
            "migrate",
            format!("applied pending migrations; schema at {} migration(s)", applied.len()),
        ),
        Err((class, message)) => CommandResult::failure("migrate", class, message),
    }
}
