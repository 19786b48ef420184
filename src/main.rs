//! sqlite-persistence - Main entry point.
//!
//! Registers every configured SQLite instance, then either runs the health
//! checks once or executes a single query and prints the rows as JSON.

use clap::Parser;
use sqlite_persistence::config::{Action, Config, parse_params};
use sqlite_persistence::db::{JsonRow, SqlExecutor};
use sqlite_persistence::health::HealthMonitor;
use sqlite_persistence::models::Command;
use sqlite_persistence::registrar::{ConnectionRegistry, SqliteRegistrar, is_default_key};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
/// Logs go to stderr so query output on stdout stays clean.
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

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling in-flight work");
            token.cancel();
        }
    });
}

async fn run_checks(health: &HealthMonitor, cancel: &CancellationToken) -> Result<bool, Box<dyn std::error::Error>> {
    let reports = health.check_all(cancel).await;
    let mut all_healthy = true;
    for (key, report) in &reports {
        all_healthy &= report.is_healthy();
        println!(
            "{}",
            serde_json::to_string(&serde_json::json!({ "instance": key, "report": report }))?
        );
    }
    Ok(all_healthy)
}

async fn run_query(
    registry: &ConnectionRegistry,
    key: &str,
    params: &[String],
    sql: &str,
    cancel: &CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let factory = if is_default_key(key) {
        registry.resolve_default()?
    } else {
        registry.resolve(key)?
    };
    let command = Command::new(sql)
        .bind_all(parse_params(params)?)
        .cancel_on(cancel.clone());

    let mut conn = factory.create_connection(cancel).await?;
    let result = conn.query::<JsonRow>(&command).await;
    // Close on every path; the query error takes precedence.
    let closed = conn.close().await;
    let rows = result?;
    closed?;

    info!(instance = key, rows = rows.len(), "Query completed");
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    info!("Starting sqlite-persistence v{}", env!("CARGO_PKG_VERSION"));

    let settings = match config.load_settings() {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    if settings.instances.is_empty() {
        eprintln!("Error: At least one SQLite instance must be configured.");
        eprintln!();
        eprintln!("Usage: sqlite-persistence --instance <[key=]sqlite:URL> <check|query>");
        eprintln!("       sqlite-persistence --settings <settings.json> <check|query>");
        eprintln!();
        eprintln!("Examples:");
        eprintln!("  sqlite-persistence --instance sqlite:app.db?mode=rwc check");
        eprintln!("  sqlite-persistence -i sqlite:app.db -i reports=sqlite:reports.db?mode=ro check");
        eprintln!("  sqlite-persistence -i sqlite:app.db query --param id=7 'SELECT * FROM users WHERE id = :id'");
        return ExitCode::FAILURE;
    }

    let mut registry = ConnectionRegistry::new();
    let mut health = HealthMonitor::new();
    if let Err(e) = SqliteRegistrar::register_all(&settings, &mut registry, &mut health) {
        error!(error = %e, "Failed to register SQLite instances");
        return ExitCode::FAILURE;
    }

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    match &config.action {
        Action::Check => match run_checks(&health, &cancel).await {
            Ok(true) => ExitCode::SUCCESS,
            Ok(false) => ExitCode::FAILURE,
            Err(e) => {
                error!(error = %e, "Health check failed");
                ExitCode::FAILURE
            }
        },
        Action::Query { key, params, sql } => {
            match run_query(&registry, key, params, sql, &cancel).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!(error = %e, "Query failed");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
