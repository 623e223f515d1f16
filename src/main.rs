//! Simple Bank service
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────┐    ┌──────────┐
//! │  Config  │───▶│ Postgres │───▶│  Broker  │───▶│ Workers  │
//! │  (YAML)  │    │  (pool)  │    │ (tasks)  │    │ (email)  │
//! └──────────┘    └──────────┘    └──────────┘    └──────────┘
//! ```
//!
//! Usage: `simple_bank [--env <name>]`, reads `config/<name>.yaml`.

use anyhow::Context;

use simple_bank::App;
use simple_bank::config::AppConfig;
use simple_bank::logging::init_logging;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config =
        AppConfig::load(&env).with_context(|| format!("loading configuration for env {env}"))?;
    let _log_guard = init_logging(&config);

    tracing::info!(
        env = %env,
        concurrency = config.worker.concurrency,
        "starting simple bank"
    );

    let mut app = App::connect(&config)
        .await
        .context("initializing application")?;
    app.start();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown signal received");

    app.shutdown().await;
    Ok(())
}
