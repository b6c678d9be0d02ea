use std::path::PathBuf;

use anyhow::Result;
use tracing::info;
use ws_orchestrator::db::{create_pool, run_migrations};
use ws_runner::{build_runner, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = ws_logging::init_subscriber();

    info!("Starting ws-runner...");

    // Config file from the first argument or WS_RUNNER_CONFIG, else the environment
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("WS_RUNNER_CONFIG").ok())
        .map(PathBuf::from);
    let config = match config_path {
        Some(path) => Config::load(&path)?,
        None => Config::from_env(),
    };
    info!(
        "Configuration loaded: runner_id={}, db_path={}, targets={}",
        config.runner_id,
        config.db_path.display(),
        config.targets.len()
    );

    let pool = create_pool(&config.db_path).await?;
    info!("Running database migrations...");
    run_migrations(&pool).await?;
    info!("Migrations complete");

    let runner = build_runner(config, pool);
    let cancel = runner.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            cancel.cancel();
        }
    });

    runner.run().await;

    Ok(())
}
