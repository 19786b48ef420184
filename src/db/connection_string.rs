//! Connection string parsing.
//!
//! Accepts three forms:
//! - `sqlite:` URLs, handled by sqlx (`sqlite:app.db?mode=rwc`, `sqlite::memory:`)
//! - keyword strings (`Data Source=app.db;Mode=ReadOnly;Cache=Shared`)
//! - a bare file path or `:memory:`

use crate::error::{DbError, DbResult};
use sqlx::sqlite::SqliteConnectOptions;
use std::str::FromStr;

const URL_SCHEME: &str = "sqlite:";
const MEMORY: &str = ":memory:";

/// How the database file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    #[default]
    ReadWriteCreate,
    ReadWrite,
    ReadOnly,
    Memory,
}

impl FromStr for OpenMode {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "readwritecreate" => Ok(Self::ReadWriteCreate),
            "readwrite" => Ok(Self::ReadWrite),
            "readonly" => Ok(Self::ReadOnly),
            "memory" => Ok(Self::Memory),
            _ => Err(DbError::configuration(format!(
                "Invalid Mode '{}'. Valid values: ReadWriteCreate, ReadWrite, ReadOnly, Memory",
                s.trim()
            ))),
        }
    }
}

/// Shared-cache setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    #[default]
    Default,
    Private,
    Shared,
}

impl FromStr for CacheMode {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "default" => Ok(Self::Default),
            "private" => Ok(Self::Private),
            "shared" => Ok(Self::Shared),
            _ => Err(DbError::configuration(format!(
                "Invalid Cache '{}'. Valid values: Default, Private, Shared",
                s.trim()
            ))),
        }
    }
}

/// Lowercase and drop all whitespace, so `Data Source` matches `datasource`.
fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

fn parse_bool(key: &str, value: &str) -> DbResult<bool> {
    match normalize(value).as_str() {
        "true" | "yes" => Ok(true),
        "false" | "no" => Ok(false),
        _ => Err(DbError::configuration(format!(
            "Invalid boolean '{}' for '{}'",
            value.trim(),
            key.trim()
        ))),
    }
}

/// Parsed keyword-form connection string.
#[derive(Debug, Default)]
struct KeywordOptions {
    data_source: Option<String>,
    mode: OpenMode,
    cache: CacheMode,
    foreign_keys: Option<bool>,
}

impl KeywordOptions {
    fn parse(input: &str) -> DbResult<Self> {
        let mut options = Self::default();
        for pair in input.split(';').filter(|p| !p.trim().is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                DbError::configuration(format!(
                    "Invalid connection string segment '{}': expected key=value",
                    pair.trim()
                ))
            })?;
            match normalize(key).as_str() {
                "datasource" | "filename" => {
                    options.data_source = Some(value.trim().to_string());
                }
                "mode" => options.mode = value.parse()?,
                "cache" => options.cache = value.parse()?,
                "foreignkeys" => options.foreign_keys = Some(parse_bool(key, value)?),
                // Pooling belongs to the driver
                "pooling" => {
                    parse_bool(key, value)?;
                }
                _ => {
                    return Err(DbError::configuration(format!(
                        "Unsupported connection string keyword '{}'",
                        key.trim()
                    )));
                }
            }
        }
        Ok(options)
    }

    fn into_connect_options(self) -> DbResult<SqliteConnectOptions> {
        let data_source = self.data_source.filter(|s| !s.is_empty());
        let mut options = match (self.mode, data_source.as_deref()) {
            (OpenMode::Memory, None) | (_, Some(MEMORY)) => memory_options(None)?,
            (OpenMode::Memory, Some(name)) => memory_options(Some(name))?,
            (_, None) => {
                return Err(DbError::configuration(
                    "Connection string must specify a Data Source",
                ));
            }
            (mode, Some(path)) => {
                let options = SqliteConnectOptions::new().filename(path);
                match mode {
                    OpenMode::ReadWrite => options.create_if_missing(false),
                    OpenMode::ReadOnly => options.read_only(true),
                    _ => options.create_if_missing(true),
                }
            }
        };
        match self.cache {
            CacheMode::Shared => options = options.shared_cache(true),
            CacheMode::Private => options = options.shared_cache(false),
            CacheMode::Default => {}
        }
        if let Some(on) = self.foreign_keys {
            options = options.foreign_keys(on);
        }
        Ok(options)
    }
}

fn memory_options(name: Option<&str>) -> DbResult<SqliteConnectOptions> {
    let url = match name {
        Some(name) => format!("sqlite:{}?mode=memory", name),
        None => "sqlite::memory:".to_string(),
    };
    from_url(&url)
}

fn from_url(url: &str) -> DbResult<SqliteConnectOptions> {
    SqliteConnectOptions::from_str(url).map_err(|e| {
        DbError::configuration(format!("Invalid SQLite connection string: {}", e))
    })
}

/// Parse a connection string into sqlx connect options.
///
/// Keyword and bare-path forms default to read-write-create; `sqlite:` URLs keep
/// sqlx semantics (add `?mode=rwc` to create a missing file).
pub fn parse_connection_string(input: &str) -> DbResult<SqliteConnectOptions> {
    let input = input.trim();
    if input.is_empty() {
        return Err(DbError::configuration("ConnectionString is required."));
    }

    let is_url = input
        .get(..URL_SCHEME.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(URL_SCHEME));
    if is_url {
        return from_url(&format!("{}{}", URL_SCHEME, &input[URL_SCHEME.len()..]));
    }

    if !input.contains('=') {
        return KeywordOptions {
            data_source: Some(input.to_string()),
            ..KeywordOptions::default()
        }
        .into_connect_options();
    }

    KeywordOptions::parse(input)?.into_connect_options()
}
