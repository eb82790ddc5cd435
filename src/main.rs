//! DB Connector - health check entry point.
//!
//! Builds a MySQL pool from the command line / environment, runs the canary
//! health check and prints the report as JSON.

use clap::Parser;
use db_connector::config::Config;
use db_connector::db::{HealthChecker, HealthRegistry, Pool};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr so stdout carries only the report.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    match run(&config).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            error!(error = %e, "Health check could not run");
            ExitCode::from(2)
        }
    }
}

async fn run(config: &Config) -> Result<bool, Box<dyn std::error::Error>> {
    let pool_config = config.pool_config()?;
    info!(
        host = %pool_config.host,
        port = pool_config.port,
        database = ?pool_config.database,
        "Starting DB Connector v{}",
        env!("CARGO_PKG_VERSION")
    );

    let pool = Pool::mysql(pool_config)?;
    let mut registry = HealthRegistry::new();
    registry.register("mysql", Arc::new(HealthChecker::new(pool.clone())));

    let report = registry.check().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    pool.close().await;
    info!(healthy = report.healthy, status = ?pool.status(), "Health check complete");
    Ok(report.healthy)
}
