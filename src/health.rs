//! Health checks.
//!
//! A check opens a fresh session, runs the configured query and reports
//! Healthy or Unhealthy. It never returns an error: every failure becomes an
//! Unhealthy report carrying the failure text.

use crate::db::connection::bounded;
use crate::db::factory::SqliteConnectionFactory;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionOptions, SqliteHealthCheckOptions};
use crate::registrar::HealthCheckRegistry;
use futures_util::future::join_all;
use serde::Serialize;
use sqlx::Connection;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const HEALTHY_DESCRIPTION: &str = "SQLite connection is healthy.";
pub const UNHEALTHY_DESCRIPTION: &str = "SQLite connection failed.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Outcome of one check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl HealthReport {
    fn healthy(elapsed: Duration) -> Self {
        Self {
            status: HealthStatus::Healthy,
            description: HEALTHY_DESCRIPTION.to_string(),
            error: None,
            duration_ms: elapsed.as_millis() as u64,
        }
    }

    fn unhealthy(err: &DbError, elapsed: Duration) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            description: UNHEALTHY_DESCRIPTION.to_string(),
            error: Some(err.to_string()),
            duration_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Liveness check bound to one instance's configuration.
#[derive(Debug)]
pub struct SqliteHealthCheck {
    factory: SqliteConnectionFactory,
    options: SqliteHealthCheckOptions,
}

impl SqliteHealthCheck {
    /// Fails when the connection string is missing or invalid.
    pub fn new(connection: ConnectionOptions, options: SqliteHealthCheckOptions) -> DbResult<Self> {
        Ok(Self {
            factory: SqliteConnectionFactory::new(connection)?,
            options,
        })
    }

    pub fn options(&self) -> &SqliteHealthCheckOptions {
        &self.options
    }

    /// Run the check once. The check timeout bounds open and execute together.
    pub async fn check_health(&self, cancel: &CancellationToken) -> HealthReport {
        let start = Instant::now();
        let limit = self.options.timeout();
        let outcome = bounded("health check", limit, Some(cancel), self.ping(cancel)).await;
        let elapsed = start.elapsed();

        match outcome {
            Ok(()) => {
                debug!(duration_ms = elapsed.as_millis() as u64, "Health check succeeded");
                HealthReport::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, timeout_secs = limit.as_secs(), "Health check failed");
                HealthReport::unhealthy(&e, elapsed)
            }
        }
    }

    async fn ping(&self, cancel: &CancellationToken) -> DbResult<()> {
        // The outer bound applies, so the open itself has no separate limit.
        let mut conn = self.factory.open_session(Duration::ZERO, cancel).await?;
        sqlx::Executor::fetch_optional(&mut conn, self.options.query.as_str()).await?;
        conn.close().await?;
        Ok(())
    }
}

/// In-process health registry: checks keyed by instance.
#[derive(Debug, Default)]
pub struct HealthMonitor {
    checks: Vec<(String, Arc<SqliteHealthCheck>)>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.checks.iter().map(|(key, _)| key.as_str())
    }

    pub fn get(&self, key: &str) -> Option<Arc<SqliteHealthCheck>> {
        self.checks
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, check)| Arc::clone(check))
    }

    /// Run every check concurrently. Reports are returned in registration order.
    pub async fn check_all(&self, cancel: &CancellationToken) -> Vec<(String, HealthReport)> {
        let reports = join_all(self.checks.iter().map(|(_, check)| check.check_health(cancel))).await;
        let results: Vec<(String, HealthReport)> = self
            .checks
            .iter()
            .map(|(key, _)| key.clone())
            .zip(reports)
            .collect();

        let unhealthy = results.iter().filter(|(_, r)| !r.is_healthy()).count();
        info!(checks = results.len(), unhealthy, "Health checks completed");
        results
    }
}

impl HealthCheckRegistry for HealthMonitor {
    fn contains_check(&self, key: &str) -> bool {
        self.checks.iter().any(|(k, _)| k == key)
    }

    fn add_health_check(&mut self, key: &str, check: SqliteHealthCheck) -> DbResult<()> {
        if self.contains_check(key) {
            return Err(DbError::duplicate_instance(key));
        }
        self.checks.push((key.to_string(), Arc::new(check)));
        Ok(())
    }
}
