//! SQLite persistence library.
//!
//! Keyed SQLite connection factories, a uniform query interface over
//! connections and transactions, a multi-result cursor, health checks and an
//! instance registrar that wires them together.

pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod models;
pub mod registrar;

pub use config::Config;
pub use db::{SqlExecutor, SqliteConnection, SqliteConnectionFactory, SqliteTransaction};
pub use error::{DbError, DbResult};
pub use health::{HealthMonitor, HealthReport, HealthStatus, SqliteHealthCheck};
pub use models::{Command, QueryParam};
pub use registrar::{ConnectionRegistry, DEFAULT_INSTANCE_KEY, SqliteRegistrar};
