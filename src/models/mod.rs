//! Data models for SQLite persistence.
//!
//! This module re-exports all model types used throughout the crate.

pub mod query;
pub mod settings;

// Re-export commonly used types
pub use query::{Command, QueryParam};
pub use settings::{
    ConnectionOptions, DEFAULT_COMMAND_TIMEOUT_SECS, DEFAULT_HEALTH_QUERY,
    DEFAULT_HEALTH_TIMEOUT_SECS, SqliteHealthCheckOptions, SqliteInstanceSettings, SqliteSettings,
};
