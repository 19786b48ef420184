//! Dynamic row mapping.
//!
//! [`JsonRow`] maps any SQLite row to a JSON object without a compile-time row
//! type. Values are classified in two phases:
//! 1. the runtime storage class (INTEGER, REAL, TEXT, BLOB, NULL) picks the decoder
//! 2. the declared column type refines it (BOOLEAN columns become JSON booleans,
//!    JSON columns are parsed)

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, FromRow, Row, TypeInfo, ValueRef};

/// Logical category for a SQLite value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Null,
    Integer,
    Boolean,
    Float,
    Text,
    Json,
    Binary,
}

/// Classify a value from its storage class and the column's declared type.
pub fn categorize_type(storage_class: &str, declared_type: &str) -> TypeCategory {
    let declared = declared_type.to_lowercase();
    match storage_class.to_uppercase().as_str() {
        "NULL" => TypeCategory::Null,
        "INTEGER" if declared == "bool" || declared == "boolean" => TypeCategory::Boolean,
        "INTEGER" => TypeCategory::Integer,
        "REAL" => TypeCategory::Float,
        "BLOB" => TypeCategory::Binary,
        "TEXT" if declared.contains("json") => TypeCategory::Json,
        _ => TypeCategory::Text,
    }
}

/// Decode binary data to a JSON value.
///
/// With `decode_binary`, valid UTF-8 is returned as text; otherwise, and for
/// invalid UTF-8, the bytes are base64 encoded.
pub fn decode_binary_value(bytes: &[u8], decode_binary: bool) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    if decode_binary {
        if let Ok(s) = std::str::from_utf8(bytes) {
            return JsonValue::String(s.to_string());
        }
    }
    JsonValue::String(STANDARD.encode(bytes))
}

/// A row as a JSON object keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonRow(pub serde_json::Map<String, JsonValue>);

impl JsonRow {
    pub fn get(&self, column: &str) -> Option<&JsonValue> {
        self.0.get(column)
    }

    pub fn into_inner(self) -> serde_json::Map<String, JsonValue> {
        self.0
    }
}

impl<'r> FromRow<'r, SqliteRow> for JsonRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let mut map = serde_json::Map::with_capacity(row.columns().len());
        for (idx, col) in row.columns().iter().enumerate() {
            let category = {
                let raw = row.try_get_raw(idx)?;
                if raw.is_null() {
                    TypeCategory::Null
                } else {
                    categorize_type(raw.type_info().name(), col.type_info().name())
                }
            };
            map.insert(col.name().to_string(), decode_column(row, idx, category)?);
        }
        Ok(JsonRow(map))
    }
}

fn decode_column(row: &SqliteRow, idx: usize, category: TypeCategory) -> Result<JsonValue, sqlx::Error> {
    let value = match category {
        TypeCategory::Null => JsonValue::Null,
        TypeCategory::Integer => JsonValue::from(row.try_get::<i64, _>(idx)?),
        TypeCategory::Boolean => JsonValue::Bool(row.try_get::<bool, _>(idx)?),
        TypeCategory::Float => {
            let v = row.try_get::<f64, _>(idx)?;
            serde_json::Number::from_f64(v)
                .map(JsonValue::Number)
                .unwrap_or_else(|| JsonValue::String(v.to_string()))
        }
        TypeCategory::Json => {
            let text = row.try_get::<String, _>(idx)?;
            serde_json::from_str(&text).unwrap_or(JsonValue::String(text))
        }
        TypeCategory::Text => JsonValue::String(row.try_get::<String, _>(idx)?),
        TypeCategory::Binary => decode_binary_value(&row.try_get::<Vec<u8>, _>(idx)?, false),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_by_storage_class() {
        assert_eq!(categorize_type("INTEGER", ""), TypeCategory::Integer);
        assert_eq!(categorize_type("REAL", "NUMERIC"), TypeCategory::Float);
        assert_eq!(categorize_type("TEXT", "DATE"), TypeCategory::Text);
        assert_eq!(categorize_type("BLOB", "TEXT"), TypeCategory::Binary);
        assert_eq!(categorize_type("NULL", "INTEGER"), TypeCategory::Null);
    }

    #[test]
    fn test_categorize_refines_with_declared_type() {
        assert_eq!(categorize_type("INTEGER", "BOOLEAN"), TypeCategory::Boolean);
        assert_eq!(categorize_type("TEXT", "json"), TypeCategory::Json);
        // Text stored in an INTEGER-declared column stays text
        assert_eq!(categorize_type("TEXT", "INTEGER"), TypeCategory::Text);
    }

    #[test]
    fn test_decode_binary_value_with_valid_utf8() {
        let bytes = b"hello world";
        assert_eq!(
            decode_binary_value(bytes, true),
            JsonValue::String("hello world".to_string())
        );
        assert_eq!(
            decode_binary_value(bytes, false),
            JsonValue::String("aGVsbG8gd29ybGQ=".to_string())
        );
    }

    #[test]
    fn test_decode_binary_value_with_invalid_utf8() {
        let bytes: &[u8] = &[0xFF, 0xFE, 0x00, 0x01];
        assert_eq!(
            decode_binary_value(bytes, true),
            JsonValue::String("//4AAQ==".to_string())
        );
    }

    #[test]
    fn test_json_row_serializes_transparently() {
        let mut map = serde_json::Map::new();
        map.insert("id".to_string(), JsonValue::from(1));
        let row = JsonRow(map);
        assert_eq!(serde_json::to_string(&row).unwrap(), r#"{"id":1}"#);
        assert_eq!(row.get("id"), Some(&JsonValue::from(1)));
    }
}
