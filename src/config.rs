//! Configuration handling for the sqlite-persistence CLI.
//!
//! Instances come from a JSON settings file, from `--instance` arguments, or
//! both. Each `--instance` is `[key=]sqlite:URL`; instance options ride along
//! as URL query parameters and are stripped before the URL reaches the driver.

use crate::error::{DbError, DbResult};
use crate::models::{QueryParam, SqliteHealthCheckOptions, SqliteInstanceSettings, SqliteSettings};
use crate::registrar::DEFAULT_INSTANCE_KEY;
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use url::Url;

/// Instance option keys extracted from URL query parameters.
const INSTANCE_OPTION_KEYS: &[&str] = &[
    "command_timeout",
    "health_check",
    "health_query",
    "health_timeout",
];

/// One `--instance` argument.
#[derive(Debug, Clone)]
pub struct InstanceArg {
    /// From "key=url", or "default" when no key is given.
    pub key: String,
    pub settings: SqliteInstanceSettings,
}

impl InstanceArg {
    /// Parse an instance from a CLI argument.
    ///
    /// # Format
    ///
    /// - `sqlite:path.db` - the default instance
    /// - `key=sqlite:path.db` - a keyed instance
    /// - `key=sqlite:path.db?command_timeout=10&health_query=SELECT%201` - with options
    /// - `Data Source=path.db;Mode=ReadOnly` - keyword form, default instance, no options
    ///
    /// # Examples
    ///
    /// ```text
    /// sqlite:app.db?mode=rwc
    /// reports=sqlite:reports.db?mode=ro&command_timeout=60
    /// cache=sqlite::memory:?health_check=false
    /// ```
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        let (explicit_key, connection) = match s.split_once('=') {
            Some((key, rest)) if is_instance_key(key) && is_sqlite_url(rest) => (Some(key), rest),
            _ => (None, s),
        };
        if connection.is_empty() {
            return Err("Instance connection string is empty".to_string());
        }

        let key = explicit_key
            .map(String::from)
            .unwrap_or_else(|| DEFAULT_INSTANCE_KEY.to_string());

        let mut settings = SqliteInstanceSettings::new(key.clone(), connection);
        if is_sqlite_url(connection) {
            let mut url = Url::parse(connection).map_err(|e| format!("Invalid URL: {e}"))?;
            let mut opts = Self::extract_options(&mut url, INSTANCE_OPTION_KEYS);
            Self::apply_options(&mut settings, &mut opts)?;
            settings.connection_string = Some(url.to_string());
        }

        Ok(Self { key, settings })
    }

    fn apply_options(
        settings: &mut SqliteInstanceSettings,
        opts: &mut HashMap<String, String>,
    ) -> Result<(), String> {
        if let Some(v) = opts.remove("command_timeout") {
            settings.command_timeout_secs = v
                .parse()
                .map_err(|_| format!("command_timeout must be a whole number of seconds, got '{v}'"))?;
        }

        let mut health = SqliteHealthCheckOptions::default();
        let mut health_set = false;
        if let Some(v) = opts.remove("health_check") {
            health.enabled = if v.eq_ignore_ascii_case("true") {
                true
            } else if v.eq_ignore_ascii_case("false") {
                false
            } else {
                return Err(format!("health_check must be true or false, got '{v}'"));
            };
            health_set = true;
        }
        if let Some(v) = opts.remove("health_query") {
            health.query = v;
            health_set = true;
        }
        if let Some(v) = opts.remove("health_timeout") {
            health.timeout_secs = Some(
                v.parse()
                    .map_err(|_| format!("health_timeout must be a whole number of seconds, got '{v}'"))?,
            );
            health_set = true;
        }
        if health_set {
            settings.health_options = Some(health);
        }
        Ok(())
    }

    /// Extract instance options from URL query params, keeping others for the driver.
    /// Uses proper URL encoding to preserve special characters in remaining params.
    fn extract_options(url: &mut Url, keys: &[&str]) -> HashMap<String, String> {
        let mut opts = HashMap::new();
        let remaining: Vec<(String, String)> = url
            .query_pairs()
            .filter_map(|(k, v)| {
                let key_lower = k.to_ascii_lowercase();
                if keys.contains(&key_lower.as_str()) {
                    opts.insert(key_lower, v.into_owned());
                    None
                } else {
                    Some((k.into_owned(), v.into_owned()))
                }
            })
            .collect();

        if remaining.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(remaining);
        }
        opts
    }
}

fn is_instance_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn is_sqlite_url(s: &str) -> bool {
    s.get(..7)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("sqlite:"))
}

/// Parse `name=value` query parameters. Values are read with
/// [`QueryParam::from_literal`].
pub fn parse_params(params: &[String]) -> Result<Vec<(String, QueryParam)>, String> {
    params
        .iter()
        .map(|p| {
            let (name, value) = p
                .split_once('=')
                .ok_or_else(|| format!("Invalid parameter '{p}': expected name=value"))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(format!("Invalid parameter '{p}': name is empty"));
            }
            Ok((name.to_string(), QueryParam::from_literal(value)))
        })
        .collect()
}

/// What the CLI should do once instances are registered.
#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Action {
    /// Run every health check once; exits non-zero if any instance is unhealthy
    Check,
    /// Run a query against one instance and print the rows as JSON
    Query {
        /// Instance key
        #[arg(short, long, default_value = DEFAULT_INSTANCE_KEY)]
        key: String,
        /// Named parameter, repeatable
        #[arg(short, long = "param", value_name = "NAME=VALUE")]
        params: Vec<String>,
        /// SQL text; named placeholders use :name, @name or $name
        sql: String,
    },
}

/// Configuration for the sqlite-persistence CLI.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "sqlite-persistence",
    about = "Keyed SQLite instances with health checks and a uniform query interface",
    version,
    author
)]
pub struct Config {
    /// SQLite instances.
    /// Format: "sqlite:URL" (the default instance) or "key=sqlite:URL".
    /// Options: command_timeout, health_check, health_query, health_timeout.
    /// Can be specified multiple times.
    #[arg(
        short = 'i',
        long = "instance",
        value_name = "[KEY=]URL",
        env = "SQLITE_INSTANCES",
        value_delimiter = ','
    )]
    pub instances: Vec<String>,

    /// JSON settings file with an "instances" map
    #[arg(short = 's', long = "settings", value_name = "FILE", env = "SQLITE_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "SQLITE_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "SQLITE_JSON_LOGS")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub action: Action,
}

impl Config {
    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            instances: Vec::new(),
            settings: None,
            log_level: "info".to_string(),
            json_logs: false,
            action: Action::Check,
        }
    }

    /// Parse all `--instance` arguments.
    pub fn parse_instances(&self) -> Result<Vec<InstanceArg>, String> {
        self.instances.iter().map(|s| InstanceArg::parse(s)).collect()
    }

    /// Merge the settings file with the `--instance` arguments.
    /// A key configured in both places is an error.
    pub fn load_settings(&self) -> DbResult<SqliteSettings> {
        let mut settings = match &self.settings {
            Some(path) => SqliteSettings::from_file(path)?,
            None => SqliteSettings::default(),
        };
        for instance in self.parse_instances().map_err(DbError::configuration)? {
            settings.insert(instance.key, instance.settings)?;
        }
        Ok(settings)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}
