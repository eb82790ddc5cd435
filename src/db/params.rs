//! Parameter binding utilities for database queries.
//!
//! Binding is plain text substitution producing a self-contained statement:
//! - [`bind`] replaces `:identifier` tokens from a map of named values
//! - [`format`] replaces `?` (value) and `??` (identifier) placeholders in order
//! - [`escape`] renders a single [`SqlValue`] as a MySQL literal
//! - [`statement_count`] counts the statements in a rendered script
//!
//! All functions are pure. Nothing here is attached to a session, so the
//! rendered SQL can run on whichever pooled connection is handed out.

use crate::error::{DbError, DbResult};
use crate::models::{NamedValues, Params, QuerySpec, SqlValue};
use regex::{Captures, Regex};
use sqlparser::dialect::MySqlDialect;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::fmt::Write as _;
use std::sync::LazyLock;

static LABEL_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":(\w+)").expect("label token pattern is valid"));

/// Substitute `:identifier` tokens whose key is present in `values`.
///
/// Tokens without a matching key are left verbatim.
pub fn bind(template: &str, values: &NamedValues) -> String {
    if values.is_empty() {
        return template.to_string();
    }

    LABEL_TOKEN
        .replace_all(template, |caps: &Captures<'_>| match values.get(&caps[1]) {
            Some(value) => escape(value),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Substitute `?` and `??` placeholders in order.
///
/// `?` takes the next value as a literal, `??` takes it as an identifier.
/// Placeholders beyond the supplied values are left verbatim.
pub fn format(template: &str, values: &[SqlValue]) -> String {
    if values.is_empty() {
        return template.to_string();
    }

    let mut out = String::with_capacity(template.len() + values.len() * 8);
    let mut remaining = values.iter();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '?' {
            out.push(c);
            continue;
        }

        let is_identifier = chars.peek() == Some(&'?');
        if is_identifier {
            chars.next();
        }

        match remaining.next() {
            Some(value) if is_identifier => out.push_str(&escape_identifier_value(value)),
            Some(value) => out.push_str(&escape(value)),
            None if is_identifier => out.push_str("??"),
            None => out.push('?'),
        }
    }

    out
}

/// Render the statement text a spec describes.
///
/// Named params require `param_labels`; positional params go through [`format`].
pub fn render(spec: &QuerySpec) -> DbResult<String> {
    match &spec.params {
        Params::None => Ok(spec.sql.clone()),
        Params::Positional(values) => Ok(format(&spec.sql, values)),
        Params::Named(values) if spec.options.param_labels => Ok(bind(&spec.sql, values)),
        Params::Named(_) => Err(DbError::invalid_input(
            "Named parameters were supplied but parameter-label binding is disabled",
        )),
    }
}

/// Render a value as a MySQL literal.
pub fn escape(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "NULL".to_string(),
        SqlValue::Bool(v) => v.to_string(),
        SqlValue::Int(v) => v.to_string(),
        SqlValue::UInt(v) => v.to_string(),
        SqlValue::Float(v) if v.is_finite() => v.to_string(),
        SqlValue::Float(_) => "NULL".to_string(),
        SqlValue::String(v) => escape_string(v),
        SqlValue::Bytes(v) => escape_bytes(v),
        SqlValue::Date(v) => format!("'{}'", v.format("%Y-%m-%d")),
        SqlValue::DateTime(v) => format!("'{}'", v.format("%Y-%m-%d %H:%M:%S%.3f")),
        SqlValue::Json(v) => escape_string(&v.to_string()),
        SqlValue::Array(items) => array_to_list(items),
    }
}

/// Quote an identifier with backticks; `db.table` becomes `` `db`.`table` ``.
pub fn escape_identifier(name: &str) -> String {
    name.split('.')
        .map(|part| format!("`{}`", part.replace('`', "``")))
        .collect::<Vec<_>>()
        .join(".")
}

fn escape_identifier_value(value: &SqlValue) -> String {
    match value {
        SqlValue::String(name) => escape_identifier(name),
        SqlValue::Array(items) => items
            .iter()
            .map(escape_identifier_value)
            .collect::<Vec<_>>()
            .join(", "),
        other => escape_identifier(&plain_text(other)),
    }
}

/// Unquoted text of a scalar, used when a non-string is bound as an identifier.
fn plain_text(value: &SqlValue) -> String {
    match value {
        SqlValue::String(v) => v.clone(),
        other => escape(other).trim_matches('\'').to_string(),
    }
}

fn array_to_list(items: &[SqlValue]) -> String {
    items
        .iter()
        .map(|item| match item {
            SqlValue::Array(inner) => format!("({})", array_to_list(inner)),
            other => escape(other),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn escape_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\0' => out.push_str("\\0"),
            '\u{8}' => out.push_str("\\b"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{1a}' => out.push_str("\\Z"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out.push('\'');
    out
}

fn escape_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2 + 3);
    out.push_str("X'");
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out.push('\'');
    out
}

/// Number of non-empty `;`-separated statements in `sql`.
///
/// Semicolons inside literals, quoted identifiers and comments do not
/// count. Text the tokenizer rejects is split on bare `;` instead.
pub fn statement_count(sql: &str) -> usize {
    let dialect = MySqlDialect {};
    let tokens = match Tokenizer::new(&dialect, sql).tokenize() {
        Ok(tokens) => tokens,
        Err(_) => {
            return sql.split(';').filter(|part| !part.trim().is_empty()).count();
        }
    };

    let mut count = 0;
    let mut in_statement = false;
    for token in &tokens {
        match token {
            Token::SemiColon => in_statement = false,
            Token::Whitespace(_) | Token::EOF => {}
            _ if !in_statement => {
                in_statement = true;
                count += 1;
            }
            _ => {}
        }
    }
    count
}
