//! Connection manager probe - Main entry point.
//!
//! Builds a managed pool from a database URL, borrows one connection, and prints
//! the resolved server version with the pool status as JSON.

use clap::Parser;
use db_connection_manager::config::Config;
use db_connection_manager::dialects::AnyConnector;
use db_connection_manager::{AcquireOptions, ConnectionManager};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    // Logs go to stderr so stdout carries only the report.
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

async fn run(config: &Config) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let manager_config = config.manager_config()?;
    let dialect = manager_config.dialect;
    let connector = AnyConnector::for_dialect(dialect)?;
    let manager = ConnectionManager::new(connector, manager_config)?;

    let options = AcquireOptions {
        query_type: config.query_type,
        use_master: config.use_master,
    };

    let outcome = match manager.get_connection(options).await {
        Ok(connection) => {
            info!(connection_id = %connection.id(), role = ?connection.role(), "Borrowed connection");
            let status = manager.pool_status();
            manager.release_connection(connection).await?;
            Ok(serde_json::json!({
                "dialect": dialect.name(),
                "version": manager.database_version().map(|v| v.raw().to_string()),
                "pool": status,
            }))
        }
        Err(e) => Err(e),
    };

    manager.close().await?;
    Ok(outcome?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    info!("Starting db-connection-manager v{}", env!("CARGO_PKG_VERSION"));

    match run(&config).await {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Connection probe failed");
            Err(e)
        }
    }
}
