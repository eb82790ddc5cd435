//! MySQL column decoding.
//!
//! Rows are normalized to JSON objects keyed by column name. Decoding is two
//! phases: [`column_kind`] classifies the reported type name, then a per-kind
//! decoder extracts the value. Anything that cannot be decoded becomes `null`
//! and is logged.

use crate::models::Row;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::{Column, Decode, MySql, Row as _, Type, TypeInfo};
use tracing::warn;

/// Logical kind of a MySQL column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Unsigned,
    Decimal,
    Float,
    Boolean,
    Date,
    DateTime,
    Timestamp,
    Time,
    Json,
    Binary,
    Text,
}

/// Classify a MySQL type name as reported by the driver (e.g. `INT UNSIGNED`).
pub fn column_kind(type_name: &str) -> ColumnKind {
    let upper = type_name.trim().to_ascii_uppercase();
    let (base, unsigned) = match upper.strip_suffix(" UNSIGNED") {
        Some(base) => (base, true),
        None => (upper.as_str(), false),
    };

    match base {
        "BOOLEAN" | "BOOL" => ColumnKind::Boolean,
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "INTEGER" | "BIGINT" if unsigned => {
            ColumnKind::Unsigned
        }
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "INTEGER" | "BIGINT" => ColumnKind::Integer,
        "YEAR" => ColumnKind::Unsigned,
        "DECIMAL" | "NUMERIC" => ColumnKind::Decimal,
        "FLOAT" | "DOUBLE" | "REAL" => ColumnKind::Float,
        "DATE" => ColumnKind::Date,
        "DATETIME" => ColumnKind::DateTime,
        "TIMESTAMP" => ColumnKind::Timestamp,
        "TIME" => ColumnKind::Time,
        "JSON" => ColumnKind::Json,
        "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY" | "BIT"
        | "GEOMETRY" => ColumnKind::Binary,
        // VARCHAR, CHAR, TEXT, ENUM, SET and anything unknown
        _ => ColumnKind::Text,
    }
}

/// DECIMAL values as their exact text, never rounded through a float.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        matches!(column_kind(ty.name()), ColumnKind::Decimal)
    }
}

impl<'r> Decode<'r, MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

/// Binary payloads: UTF-8 text when valid, base64 otherwise.
pub fn binary_to_json(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    match std::str::from_utf8(bytes) {
        Ok(s) => JsonValue::String(s.to_string()),
        Err(_) => JsonValue::String(STANDARD.encode(bytes)),
    }
}

/// Conversion of driver rows into [`Row`] objects.
pub trait RowToJson {
    fn to_json_map(&self) -> Row;
}

impl RowToJson for MySqlRow {
    fn to_json_map(&self) -> Row {
        self.columns()
            .iter()
            .map(|col| {
                let kind = column_kind(col.type_info().name());
                let value = decode_column(self, col.ordinal(), kind).unwrap_or_else(|e| {
                    warn!(
                        column = %col.name(),
                        type_name = %col.type_info().name(),
                        error = %e,
                        "Failed to decode column"
                    );
                    JsonValue::Null
                });
                (col.name().to_string(), value)
            })
            .collect()
    }
}

fn decode_column(row: &MySqlRow, idx: usize, kind: ColumnKind) -> Result<JsonValue, sqlx::Error> {
    let value = match kind {
        ColumnKind::Integer => get::<i64>(row, idx)?.map(JsonValue::from),
        ColumnKind::Unsigned => get::<u64>(row, idx)?.map(JsonValue::from),
        ColumnKind::Decimal => get::<RawDecimal>(row, idx)?.map(|d| JsonValue::String(d.0)),
        ColumnKind::Float => get::<f64>(row, idx)?.map(float_to_json),
        ColumnKind::Boolean => get::<bool>(row, idx)?.map(JsonValue::Bool),
        ColumnKind::Date => get::<NaiveDate>(row, idx)?.map(|d| JsonValue::String(d.to_string())),
        ColumnKind::DateTime => {
            get::<NaiveDateTime>(row, idx)?.map(|d| JsonValue::String(d.to_string()))
        }
        ColumnKind::Timestamp => {
            get::<DateTime<Utc>>(row, idx)?.map(|d| JsonValue::String(d.to_rfc3339()))
        }
        ColumnKind::Time => get::<NaiveTime>(row, idx)?.map(|t| JsonValue::String(t.to_string())),
        ColumnKind::Json => get::<JsonValue>(row, idx)?,
        ColumnKind::Binary => get::<Vec<u8>>(row, idx)?.map(|b| binary_to_json(&b)),
        ColumnKind::Text => get::<String>(row, idx)?.map(JsonValue::String),
    };
    Ok(value.unwrap_or(JsonValue::Null))
}

fn get<'r, T>(row: &'r MySqlRow, idx: usize) -> Result<Option<T>, sqlx::Error>
where
    T: Decode<'r, MySql> + Type<MySql>,
{
    row.try_get::<Option<T>, _>(idx)
}

fn float_to_json(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}
