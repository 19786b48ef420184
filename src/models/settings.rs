//! Instance settings.
//!
//! Settings describe what each named SQLite instance should look like. They are
//! read once at startup, copied into [`ConnectionOptions`], and then discarded.

use crate::db::coercion::TypeCoercions;
use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Default command timeout in seconds.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Default health check query.
pub const DEFAULT_HEALTH_QUERY: &str = "SELECT 1";

/// Default health check timeout in seconds.
pub const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 5;

fn default_command_timeout_secs() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_SECS
}

fn default_health_query() -> String {
    DEFAULT_HEALTH_QUERY.to_string()
}

fn default_enabled() -> bool {
    true
}

/// Health check options for one SQLite instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqliteHealthCheckOptions {
    /// When false, no check is registered for the instance.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// SQL executed by the check. Default is "SELECT 1".
    #[serde(default = "default_health_query")]
    pub query: String,
    /// Check timeout in seconds. Default is 5.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl SqliteHealthCheckOptions {
    /// Effective check timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_HEALTH_TIMEOUT_SECS))
    }
}

impl Default for SqliteHealthCheckOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            query: default_health_query(),
            timeout_secs: None,
        }
    }
}

/// Settings for one named SQLite instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteInstanceSettings {
    /// Instance name. Falls back to the registration key when blank.
    #[serde(default)]
    pub name: String,
    /// Required. Either a `sqlite:` URL or a `Data Source=...` keyword string.
    #[serde(default)]
    pub connection_string: Option<String>,
    /// Default: 30
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Defaults are applied at registration when absent.
    #[serde(default)]
    pub health_options: Option<SqliteHealthCheckOptions>,
    /// How date and time parameters are written.
    #[serde(default)]
    pub coercions: TypeCoercions,
}

impl SqliteInstanceSettings {
    /// Create settings for a named instance with default timeout and health options.
    pub fn new(name: impl Into<String>, connection_string: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection_string: Some(connection_string.into()),
            ..Self::default()
        }
    }

    /// Derive the options owned by a factory or health check.
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            connection_string: self.connection_string.clone(),
            command_timeout_secs: self.command_timeout_secs,
            coercions: self.coercions,
        }
    }

    /// Health options, or the defaults when none were configured.
    pub fn health_options_or_default(&self) -> SqliteHealthCheckOptions {
        self.health_options.clone().unwrap_or_default()
    }
}

impl Default for SqliteInstanceSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            connection_string: None,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            health_options: None,
            coercions: TypeCoercions::default(),
        }
    }
}

/// Root settings: every configured instance keyed by its registration key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SqliteSettings {
    #[serde(default)]
    pub instances: BTreeMap<String, SqliteInstanceSettings>,
}

impl SqliteSettings {
    /// Parse settings from JSON.
    ///
    /// ```text
    /// {
    ///   "instances": {
    ///     "default": { "connection_string": "sqlite:app.db?mode=rwc" },
    ///     "reports": {
    ///       "connection_string": "Data Source=reports.db;Mode=ReadOnly",
    ///       "command_timeout_secs": 60,
    ///       "health_options": { "query": "SELECT count(*) FROM sqlite_master" }
    ///     }
    ///   }
    /// }
    /// ```
    pub fn from_json_str(json: &str) -> DbResult<Self> {
        let mut settings: Self = serde_json::from_str(json)
            .map_err(|e| DbError::configuration(format!("Invalid settings JSON: {}", e)))?;
        settings.apply_default_names();
        Ok(settings)
    }

    /// Read and parse a JSON settings file.
    pub fn from_file(path: &Path) -> DbResult<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            DbError::configuration(format!(
                "Cannot read settings file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json_str(&json)
    }

    /// Add an instance, rejecting keys that are already present.
    pub fn insert(&mut self, key: impl Into<String>, mut settings: SqliteInstanceSettings) -> DbResult<()> {
        let key = key.into();
        if self.instances.contains_key(&key) {
            return Err(DbError::configuration(format!(
                "Instance '{}' is configured more than once",
                key
            )));
        }
        if settings.name.trim().is_empty() {
            settings.name = key.clone();
        }
        self.instances.insert(key, settings);
        Ok(())
    }

    fn apply_default_names(&mut self) {
        for (key, instance) in self.instances.iter_mut() {
            if instance.name.trim().is_empty() {
                instance.name = key.clone();
            }
        }
    }
}

/// Resolved configuration owned by one factory or health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Contains the database location - never log
    pub connection_string: Option<String>,
    pub command_timeout_secs: u64,
    pub coercions: TypeCoercions,
}

impl ConnectionOptions {
    /// Options with the default command timeout and coercions.
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: Some(connection_string.into()),
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            coercions: TypeCoercions::default(),
        }
    }

    /// Set the command timeout.
    pub fn with_command_timeout(mut self, secs: u64) -> Self {
        self.command_timeout_secs = secs;
        self
    }

    /// Set the date/time coercions.
    pub fn with_coercions(mut self, coercions: TypeCoercions) -> Self {
        self.coercions = coercions;
        self
    }
}
