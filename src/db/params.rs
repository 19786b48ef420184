//! Named parameter handling.
//!
//! SQLite binds positionally through sqlx, so named placeholders are rewritten
//! to numbered ones (`?1`, `?2`, ...) and values are bound in that order.
//! Positional placeholders written by the caller would share those slots, so
//! commands containing them are rejected before anything runs.

use crate::db::coercion::{StoredValue, TypeCoercions, format_datetime};
use crate::error::{DbError, DbResult};
use crate::models::{Command, QueryParam};
use sqlx::Arguments;
use sqlx::sqlite::SqliteArguments;
use std::iter::Peekable;
use std::str::Chars;

const PARAMETER_SIGILS: [char; 3] = [':', '@', '$'];

/// Strip a leading `:`, `@` or `$` from a parameter name.
pub fn normalize_parameter_name(name: &str) -> &str {
    name.strip_prefix(PARAMETER_SIGILS).unwrap_or(name)
}

fn is_identifier_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_identifier_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Copy a quoted run up to and including its closing character.
/// A doubled closing character is an escape and does not end the run.
fn copy_quoted(chars: &mut Peekable<Chars<'_>>, out: &mut String, close: char) {
    while let Some(c) = chars.next() {
        out.push(c);
        if c == close {
            if chars.peek() == Some(&close) {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
                continue;
            }
            return;
        }
    }
}

fn copy_line_comment(chars: &mut Peekable<Chars<'_>>, out: &mut String) {
    for c in chars.by_ref() {
        out.push(c);
        if c == '\n' {
            return;
        }
    }
}

fn copy_block_comment(chars: &mut Peekable<Chars<'_>>, out: &mut String) {
    let mut previous = '\0';
    for c in chars.by_ref() {
        out.push(c);
        if previous == '*' && c == '/' {
            return;
        }
        previous = c;
    }
}

/// Result of [`rewrite_named_placeholders`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenSql {
    pub sql: String,
    /// Parameter names in positional order.
    pub names: Vec<String>,
    /// First positional placeholder found (`?`, `?3`, `:1`, ...), if any.
    pub positional: Option<String>,
}

/// Rewrite `:name`, `@name` and `$name` placeholders to `?N`.
///
/// A name used more than once keeps the index of its first appearance.
/// Placeholders inside string literals, quoted identifiers and comments are left
/// alone. Positional placeholders are copied through unchanged and reported in
/// [`RewrittenSql::positional`].
///
/// ```ignore
/// let rewritten = rewrite_named_placeholders("SELECT :a, @b, :a");
/// assert_eq!(rewritten.sql, "SELECT ?1, ?2, ?1");
/// assert_eq!(rewritten.names, vec!["a", "b"]);
/// ```
pub fn rewrite_named_placeholders(sql: &str) -> RewrittenSql {
    let mut out = String::with_capacity(sql.len());
    let mut names: Vec<String> = Vec::new();
    let mut positional: Option<String> = None;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' | '`' => {
                out.push(c);
                copy_quoted(&mut chars, &mut out, c);
            }
            '[' => {
                out.push(c);
                copy_quoted(&mut chars, &mut out, ']');
            }
            '-' if chars.peek() == Some(&'-') => {
                out.push(c);
                copy_line_comment(&mut chars, &mut out);
            }
            '/' if chars.peek() == Some(&'*') => {
                out.push(c);
                if let Some(star) = chars.next() {
                    out.push(star);
                }
                copy_block_comment(&mut chars, &mut out);
            }
            c if PARAMETER_SIGILS.contains(&c)
                && chars.peek().is_some_and(|&next| is_identifier_start(next)) =>
            {
                let mut name = String::new();
                while let Some(&next) = chars.peek() {
                    if !is_identifier_char(next) {
                        break;
                    }
                    name.push(next);
                    chars.next();
                }
                let index = match names.iter().position(|existing| *existing == name) {
                    Some(pos) => pos + 1,
                    None => {
                        names.push(name);
                        names.len()
                    }
                };
                out.push('?');
                out.push_str(&index.to_string());
            }
            c if c == '?'
                || (PARAMETER_SIGILS.contains(&c) && chars.peek().is_some_and(char::is_ascii_digit)) =>
            {
                let mut token = String::from(c);
                while let Some(&next) = chars.peek() {
                    if !next.is_ascii_digit() {
                        break;
                    }
                    token.push(next);
                    chars.next();
                }
                out.push_str(&token);
                positional.get_or_insert(token);
            }
            _ => out.push(c),
        }
    }

    RewrittenSql {
        sql: out,
        names,
        positional,
    }
}

fn add_stored<'q>(args: &mut SqliteArguments<'q>, value: StoredValue) -> Result<(), sqlx::error::BoxDynError> {
    match value {
        StoredValue::Text(v) => args.add(v),
        StoredValue::Integer(v) => args.add(v),
        StoredValue::Real(v) => args.add(v),
    }
}

/// Add one parameter to a SQLite argument buffer.
fn add_sqlite_param<'q>(
    args: &mut SqliteArguments<'q>,
    param: &QueryParam,
    coercions: &TypeCoercions,
) -> Result<(), sqlx::error::BoxDynError> {
    match param {
        QueryParam::Null => args.add(None::<String>),
        QueryParam::Bool(v) => args.add(*v),
        QueryParam::Int(v) => args.add(*v),
        QueryParam::Float(v) => args.add(*v),
        QueryParam::Text(v) => args.add(v.clone()),
        QueryParam::Bytes(v) => args.add(v.clone()),
        QueryParam::Date(v) => add_stored(args, coercions.encode_date(*v)),
        QueryParam::Time(v) => add_stored(args, coercions.encode_time(*v)),
        QueryParam::DateTime(v) => args.add(format_datetime(*v)),
    }
}

/// Build positional arguments for a command.
///
/// Every name the SQL references must have a value, and the SQL must not use
/// positional placeholders.
pub(crate) fn build_arguments<'q>(
    command: &Command,
    coercions: &TypeCoercions,
) -> DbResult<SqliteArguments<'q>> {
    if let Some(token) = command.positional_placeholder() {
        return Err(DbError::invalid_input(format!(
            "Positional placeholder '{}' is not supported; use :name, @name or $name",
            token
        )));
    }
    let mut args = SqliteArguments::default();
    for name in command.placeholders() {
        let param = command.value(name).ok_or_else(|| {
            DbError::invalid_input(format!("No value supplied for parameter '{}'", name))
        })?;
        add_sqlite_param(&mut args, param, coercions).map_err(|e| {
            DbError::invalid_input(format!("Cannot bind parameter '{}': {}", name, e))
        })?;
    }
    Ok(args)
}
