//! Query-related data models.
//!
//! This module defines literal values, query and transaction specs, and the
//! normalized result sets returned by the executors.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// One result row, keyed by column name.
pub type Row = serde_json::Map<String, JsonValue>;

/// Named values for `:identifier` placeholders.
pub type NamedValues = BTreeMap<String, SqlValue>;

/// A literal value that can be bound into a statement.
///
/// Deserializes through [`From<JsonValue>`]: arrays become [`SqlValue::Array`],
/// objects [`SqlValue::Json`]. JSON has no byte or date type, so `Bytes`,
/// `Date` and `DateTime` are only built from Rust values.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    /// NULL value
    Null,
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    /// Serialized and bound as a string literal
    Json(JsonValue),
    /// Expanded as a comma-separated list; nested arrays become `(..)` groups
    Array(Vec<SqlValue>),
}

impl SqlValue {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this value for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) | Self::UInt(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Date(_) => "date",
            Self::DateTime(_) => "datetime",
            Self::Json(_) => "json",
            Self::Array(_) => "array",
        }
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        Self::UInt(v.into())
    }
}

impl From<u64> for SqlValue {
    fn from(v: u64) -> Self {
        Self::UInt(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        Self::DateTime(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTime(v.naive_utc())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

impl<T: Into<SqlValue>> From<Vec<T>> for SqlValue {
    fn from(v: Vec<T>) -> Self {
        Self::Array(v.into_iter().map(Into::into).collect())
    }
}

/// Convert plain JSON into bindable values.
///
/// Objects are kept whole as [`SqlValue::Json`]; arrays become [`SqlValue::Array`].
impl From<JsonValue> for SqlValue {
    fn from(v: JsonValue) -> Self {
        match v {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Self::UInt(u)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            JsonValue::String(s) => Self::String(s),
            JsonValue::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            obj @ JsonValue::Object(_) => Self::Json(obj),
        }
    }
}

impl<'de> Deserialize<'de> for SqlValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        JsonValue::deserialize(deserializer).map(Self::from)
    }
}

/// Values bound into a statement template.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Params {
    #[default]
    None,
    /// Substituted for `?` (values) and `??` (identifiers) in order
    Positional(Vec<SqlValue>),
    /// Substituted for `:identifier` tokens
    Named(NamedValues),
}

impl Params {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::None => true,
            Self::Positional(v) => v.is_empty(),
            Self::Named(m) => m.is_empty(),
        }
    }
}

/// Per-call execution options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// The statement text may contain several `;`-separated statements.
    #[serde(default)]
    pub multiple_statements: bool,
    /// Bind `:identifier` tokens from named params.
    #[serde(default)]
    pub param_labels: bool,
}

impl QueryOptions {
    pub fn multi_statement() -> Self {
        Self {
            multiple_statements: true,
            ..Self::default()
        }
    }
}

/// A single statement to run.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    pub sql: String,
    pub params: Params,
    /// Instrumentation tag only; never affects the statement
    pub label: Option<String>,
    pub options: QueryOptions,
}

impl QuerySpec {
    /// Create a spec with no parameters.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Params::None,
            label: None,
            options: QueryOptions::default(),
        }
    }

    /// Create a spec with `?` placeholders.
    pub fn positional(sql: impl Into<String>, values: Vec<SqlValue>) -> Self {
        Self {
            params: Params::Positional(values),
            ..Self::new(sql)
        }
    }

    /// Create a spec with `:identifier` placeholders; label binding is enabled.
    pub fn named(sql: impl Into<String>, values: NamedValues) -> Self {
        Self {
            params: Params::Named(values),
            options: QueryOptions {
                param_labels: true,
                ..QueryOptions::default()
            },
            ..Self::new(sql)
        }
    }

    /// Set the instrumentation label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the execution options.
    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }
}

/// Statements executed atomically on one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionSpec {
    pub statements: Vec<QuerySpec>,
    pub label: Option<String>,
}

impl TransactionSpec {
    pub fn new(statements: Vec<QuerySpec>) -> Self {
        Self {
            statements,
            label: None,
        }
    }

    /// Append a statement.
    pub fn with_statement(mut self, statement: QuerySpec) -> Self {
        self.statements.push(statement);
        self
    }

    /// Set the instrumentation label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Outcome of one statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub rows: Vec<Row>,
    pub rows_affected: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_insert_id: Option<u64>,
}

impl ResultSet {
    /// Create a result carrying rows only.
    pub fn with_rows(rows: Vec<Row>) -> Self {
        Self {
            rows,
            ..Self::default()
        }
    }

    /// Create a result for write operations (INSERT/UPDATE/DELETE).
    pub fn write_result(rows_affected: u64, last_insert_id: Option<u64>) -> Self {
        Self {
            rows: Vec::new(),
            rows_affected,
            last_insert_id,
        }
    }

    /// Get the number of rows in the result.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The single value of a one-row, one-column result.
    pub fn scalar(&self) -> Option<&JsonValue> {
        match self.rows.as_slice() {
            [row] if row.len() == 1 => row.values().next(),
            _ => None,
        }
    }
}
