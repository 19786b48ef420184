//! Query-related data models.
//!
//! This module defines parameter values and the [`Command`] passed to every
//! query operation.

use crate::db::coercion::{DateOnly, TimeOnly};
use crate::db::params::{normalize_parameter_name, rewrite_named_placeholders};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// A parameter value for parameterized queries.
///
/// Serializes untagged, so JSON output shows the bare value. There is no
/// `Deserialize`: an untagged read could not tell text from bytes or dates.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    Text(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(serialize_with = "base64_bytes::serialize")]
    Bytes(Vec<u8>),
    /// Calendar date, written according to the connection's coercions
    Date(NaiveDate),
    /// Time of day, written according to the connection's coercions
    Time(NaiveTime),
    /// Date and time, written as `YYYY-MM-DD HH:MM:SS[.f]`
    DateTime(NaiveDateTime),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Date(_) => "date",
            Self::Time(_) => "time",
            Self::DateTime(_) => "datetime",
        }
    }

    /// Interpret a command-line literal: `null`, `true`/`false`, integers and
    /// floats map to their types, anything else is text.
    pub fn from_literal(literal: &str) -> Self {
        if literal.eq_ignore_ascii_case("null") {
            return Self::Null;
        }
        if literal.eq_ignore_ascii_case("true") {
            return Self::Bool(true);
        }
        if literal.eq_ignore_ascii_case("false") {
            return Self::Bool(false);
        }
        if let Ok(v) = literal.parse::<i64>() {
            return Self::Int(v);
        }
        if let Ok(v) = literal.parse::<f64>() {
            if v.is_finite() {
                return Self::Float(v);
            }
        }
        Self::Text(literal.to_string())
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }
}

macro_rules! impl_from_param {
    ($($source:ty => $variant:ident),+ $(,)?) => {
        $(
            impl From<$source> for QueryParam {
                fn from(value: $source) -> Self {
                    Self::$variant(value.into())
                }
            }
        )+
    };
}

impl_from_param!(
    bool => Bool,
    i32 => Int,
    i64 => Int,
    u32 => Int,
    f64 => Float,
    String => Text,
    &str => Text,
    Vec<u8> => Bytes,
    NaiveDate => Date,
    NaiveTime => Time,
    NaiveDateTime => DateTime,
);

impl From<DateOnly> for QueryParam {
    fn from(value: DateOnly) -> Self {
        Self::Date(value.0)
    }
}

impl From<TimeOnly> for QueryParam {
    fn from(value: TimeOnly) -> Self {
        Self::Time(value.0)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

/// A command: SQL text, named parameter values and an optional cancellation token.
///
/// Named placeholders (`:name`, `@name`, `$name`) are rewritten to numbered
/// positional placeholders when the command is created, so the same name may be
/// used several times and across statements. Positional placeholders (`?`,
/// `?N`) are not supported and make every operation fail with
/// [`DbError::InvalidInput`](crate::error::DbError::InvalidInput).
///
/// ```ignore
/// let command = Command::new("SELECT id, name FROM users WHERE id = :id")
///     .bind("id", 42);
/// let user: Option<User> = conn.query_single_or_default(&command).await?;
/// ```
#[derive(Debug, Clone)]
pub struct Command {
    sql: String,
    placeholders: Vec<String>,
    positional: Option<String>,
    values: HashMap<String, QueryParam>,
    cancellation: Option<CancellationToken>,
}

impl Command {
    /// Create a command from SQL text.
    pub fn new(sql: impl AsRef<str>) -> Self {
        let rewritten = rewrite_named_placeholders(sql.as_ref());
        Self {
            sql: rewritten.sql,
            placeholders: rewritten.names,
            positional: rewritten.positional,
            values: HashMap::new(),
            cancellation: None,
        }
    }

    /// Bind a value to a named parameter. The leading sigil is optional.
    pub fn bind(mut self, name: &str, value: impl Into<QueryParam>) -> Self {
        self.values
            .insert(normalize_parameter_name(name).to_string(), value.into());
        self
    }

    /// Bind several named values at once.
    pub fn bind_all<K, V, I>(mut self, params: I) -> Self
    where
        K: AsRef<str>,
        V: Into<QueryParam>,
        I: IntoIterator<Item = (K, V)>,
    {
        for (name, value) in params {
            self.values.insert(
                normalize_parameter_name(name.as_ref()).to_string(),
                value.into(),
            );
        }
        self
    }

    /// Abort the operation when `token` is cancelled.
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// The SQL sent to SQLite (placeholders already rewritten).
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Parameter names in positional order.
    pub fn placeholders(&self) -> &[String] {
        &self.placeholders
    }

    /// First positional placeholder in the SQL. Such commands fail when run.
    pub fn positional_placeholder(&self) -> Option<&str> {
        self.positional.as_deref()
    }

    /// The value bound to `name`, if any.
    pub fn value(&self, name: &str) -> Option<&QueryParam> {
        self.values.get(normalize_parameter_name(name))
    }

    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }
}

impl From<&str> for Command {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

impl From<String> for Command {
    fn from(sql: String) -> Self {
        Self::new(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param_types() {
        assert!(QueryParam::Null.is_null());
        assert!(!QueryParam::Bool(true).is_null());
        assert_eq!(QueryParam::Int(42).type_name(), "int");
        assert_eq!(QueryParam::Text("hello".to_string()).type_name(), "text");
    }

    #[test]
    fn test_query_param_from_literal() {
        assert_eq!(QueryParam::from_literal("NULL"), QueryParam::Null);
        assert_eq!(QueryParam::from_literal("true"), QueryParam::Bool(true));
        assert_eq!(QueryParam::from_literal("-7"), QueryParam::Int(-7));
        assert_eq!(QueryParam::from_literal("2.5"), QueryParam::Float(2.5));
        assert_eq!(
            QueryParam::from_literal("2024-02-29"),
            QueryParam::Text("2024-02-29".to_string())
        );
        assert_eq!(
            QueryParam::from_literal("inf"),
            QueryParam::Text("inf".to_string())
        );
    }

    #[test]
    fn test_query_param_from_option() {
        assert_eq!(QueryParam::from(None::<i64>), QueryParam::Null);
        assert_eq!(QueryParam::from(Some("x")), QueryParam::Text("x".into()));
    }

    #[test]
    fn test_command_rewrites_and_binds() {
        let command = Command::new("SELECT * FROM t WHERE a = :a AND b = @b OR a = $a")
            .bind(":a", 1)
            .bind("b", "two");
        assert_eq!(command.sql(), "SELECT * FROM t WHERE a = ?1 AND b = ?2 OR a = ?1");
        assert_eq!(command.placeholders(), &["a".to_string(), "b".to_string()]);
        assert_eq!(command.value("a"), Some(&QueryParam::Int(1)));
        assert_eq!(command.value("@b"), Some(&QueryParam::Text("two".into())));
        assert!(command.cancellation().is_none());
        assert!(command.positional_placeholder().is_none());
    }

    #[test]
    fn test_command_records_positional_placeholder() {
        let command = Command::new("SELECT ?, :a").bind("a", 5);
        assert_eq!(command.positional_placeholder(), Some("?"));
        assert_eq!(command.sql(), "SELECT ?, ?1");
    }

    #[test]
    fn test_command_bind_all() {
        let command = Command::new("SELECT :x, :y").bind_all([("x", 1), ("y", 2)]);
        assert_eq!(command.value("y"), Some(&QueryParam::Int(2)));
    }

    #[test]
    fn test_bytes_serialize_as_base64() {
        let json = serde_json::to_string(&QueryParam::Bytes(b"hi".to_vec())).unwrap();
        assert_eq!(json, "\"aGk=\"");
    }

    #[test]
    fn test_params_serialize_untagged() {
        let params = vec![
            QueryParam::Null,
            QueryParam::Int(3),
            QueryParam::Text("x".into()),
            QueryParam::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()),
        ];
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json, serde_json::json!([null, 3, "x", "2024-02-29"]));
    }
}
