//! Date and time coercion for SQLite.
//!
//! SQLite has no date or time storage class. Values end up as ISO-8601 text,
//! integer Unix seconds or a real Julian day depending on who wrote them. This
//! module provides two read-side newtypes that accept every one of those forms
//! and a per-connection [`TypeCoercions`] table that decides how date and time
//! parameters are written.
//!
//! # Architecture
//!
//! Reading is type-driven: selecting a column into [`DateOnly`] or [`TimeOnly`]
//! parses whatever SQLite holds. Writing is table-driven: the connection's
//! [`TypeCoercions`] turns a date or time parameter into a [`StoredValue`].
//! Nothing here is registered globally.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use sqlx::error::BoxDynError;
use sqlx::sqlite::{SqliteTypeInfo, SqliteValueRef};
use sqlx::{Decode, Sqlite, Type, TypeInfo};
use std::fmt;

/// Julian day number of 1970-01-01T00:00:00Z.
const UNIX_EPOCH_JULIAN_DAY: f64 = 2_440_587.5;

const SECONDS_PER_DAY: f64 = 86_400.0;

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

const TIME_FORMATS: &[&str] = &["%H:%M:%S%.f", "%H:%M"];

// =============================================================================
// Storage policy
// =============================================================================

/// How date parameters are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateStorage {
    /// `YYYY-MM-DD`
    #[default]
    Text,
    /// Integer seconds since 1970-01-01 at midnight UTC.
    UnixEpoch,
    /// Real Julian day, as produced by SQLite's `julianday()`.
    JulianDay,
}

/// How time-of-day parameters are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeStorage {
    /// `HH:MM:SS[.fff]`
    #[default]
    Text,
    /// Seconds since midnight, real when there is a fractional part.
    SecondsOfDay,
}

/// Per-connection coercion table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeCoercions {
    #[serde(default)]
    pub date: DateStorage,
    #[serde(default)]
    pub time: TimeStorage,
}

/// A value in one of SQLite's storage classes.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    Text(String),
    Integer(i64),
    Real(f64),
}

impl TypeCoercions {
    /// Encode a date according to this table.
    pub fn encode_date(&self, date: NaiveDate) -> StoredValue {
        match self.date {
            DateStorage::Text => StoredValue::Text(date.format("%Y-%m-%d").to_string()),
            DateStorage::UnixEpoch => {
                StoredValue::Integer(date.and_time(NaiveTime::MIN).and_utc().timestamp())
            }
            DateStorage::JulianDay => {
                let secs = date.and_time(NaiveTime::MIN).and_utc().timestamp() as f64;
                StoredValue::Real(secs / SECONDS_PER_DAY + UNIX_EPOCH_JULIAN_DAY)
            }
        }
    }

    /// Encode a time of day according to this table.
    pub fn encode_time(&self, time: NaiveTime) -> StoredValue {
        match self.time {
            TimeStorage::Text => StoredValue::Text(format_time(time)),
            TimeStorage::SecondsOfDay => {
                let secs = time.num_seconds_from_midnight();
                let nanos = time.nanosecond();
                if nanos == 0 {
                    StoredValue::Integer(i64::from(secs))
                } else {
                    StoredValue::Real(f64::from(secs) + f64::from(nanos) / 1e9)
                }
            }
        }
    }
}

/// Format a time as `HH:MM:SS` with a fraction only when one is present.
pub fn format_time(time: NaiveTime) -> String {
    time.format("%H:%M:%S%.f").to_string()
}

/// Format a date-time as `YYYY-MM-DD HH:MM:SS[.f]`, the layout SQLite's date
/// functions produce.
pub fn format_datetime(value: NaiveDateTime) -> String {
    value.format("%Y-%m-%d %H:%M:%S%.f").to_string()
}

// =============================================================================
// Parsing
// =============================================================================

fn parse_datetime_text(text: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.naive_local())
        })
}

fn datetime_from_unix_seconds(secs: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp(secs, 0).map(|dt| dt.naive_utc())
}

fn datetime_from_julian_day(day: f64) -> Option<NaiveDateTime> {
    if !day.is_finite() {
        return None;
    }
    let millis = ((day - UNIX_EPOCH_JULIAN_DAY) * SECONDS_PER_DAY * 1000.0).round();
    if millis.abs() > i64::MAX as f64 {
        return None;
    }
    DateTime::from_timestamp_millis(millis as i64).map(|dt| dt.naive_utc())
}

/// Parse any SQLite representation of a date.
///
/// Accepts `YYYY-MM-DD`, datetime text (the date part is kept), integer Unix
/// seconds and real Julian days.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let text = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(date);
    }
    if let Some(dt) = parse_datetime_text(text) {
        return Some(dt.date());
    }
    if let Ok(secs) = text.parse::<i64>() {
        return datetime_from_unix_seconds(secs).map(|dt| dt.date());
    }
    if let Ok(day) = text.parse::<f64>() {
        return datetime_from_julian_day(day).map(|dt| dt.date());
    }
    None
}

/// Parse any SQLite representation of a time of day.
///
/// Accepts `HH:MM[:SS[.f]]`, datetime text (the time part is kept) and numeric
/// seconds since midnight.
pub fn parse_time(raw: &str) -> Option<NaiveTime> {
    let text = raw.trim();
    if let Some(time) = TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(text, fmt).ok())
    {
        return Some(time);
    }
    if let Some(dt) = parse_datetime_text(text) {
        return Some(dt.time());
    }
    let secs = text.parse::<f64>().ok()?;
    if !(0.0..SECONDS_PER_DAY).contains(&secs) {
        return None;
    }
    let whole = secs.trunc();
    let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0);
    NaiveTime::from_num_seconds_from_midnight_opt(whole as u32, nanos as u32)
}

// =============================================================================
// Read-side newtypes
// =============================================================================

/// A calendar date read from any SQLite storage form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DateOnly(pub NaiveDate);

/// A time of day read from any SQLite storage form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeOnly(pub NaiveTime);

impl From<NaiveDate> for DateOnly {
    fn from(value: NaiveDate) -> Self {
        Self(value)
    }
}

impl From<NaiveTime> for TimeOnly {
    fn from(value: NaiveTime) -> Self {
        Self(value)
    }
}

impl fmt::Display for DateOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl fmt::Display for TimeOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_time(self.0))
    }
}

// SQLite converts INTEGER and REAL values to text on request, so every
// non-blob storage class can be read through `&str`.
fn is_textual(ty: &SqliteTypeInfo) -> bool {
    !ty.name().eq_ignore_ascii_case("BLOB")
}

impl Type<Sqlite> for DateOnly {
    fn type_info() -> SqliteTypeInfo {
        <String as Type<Sqlite>>::type_info()
    }

    fn compatible(ty: &SqliteTypeInfo) -> bool {
        is_textual(ty)
    }
}

impl<'r> Decode<'r, Sqlite> for DateOnly {
    fn decode(value: SqliteValueRef<'r>) -> Result<Self, BoxDynError> {
        let text = <&str as Decode<Sqlite>>::decode(value)?;
        parse_date(text)
            .map(DateOnly)
            .ok_or_else(|| format!("cannot interpret {:?} as a date", text).into())
    }
}

impl Type<Sqlite> for TimeOnly {
    fn type_info() -> SqliteTypeInfo {
        <String as Type<Sqlite>>::type_info()
    }

    fn compatible(ty: &SqliteTypeInfo) -> bool {
        is_textual(ty)
    }
}

impl<'r> Decode<'r, Sqlite> for TimeOnly {
    fn decode(value: SqliteValueRef<'r>) -> Result<Self, BoxDynError> {
        let text = <&str as Decode<Sqlite>>::decode(value)?;
        parse_time(text)
            .map(TimeOnly)
            .ok_or_else(|| format!("cannot interpret {:?} as a time of day", text).into())
    }
}
