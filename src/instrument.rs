//! Instrumentation and metrics contracts.
//!
//! The engine wraps every unit of work in [`with_instrumentation`], which times
//! the work and reports `{label, duration, metadata}` to an [`Instrument`].
//! Pool events report gauges through a [`MetricsSink`]. Both contracts have
//! `tracing`-backed defaults so the engine logs structurally out of the box.

use crate::error::{DbError, DbResult};
use regex::Regex;
use serde_json::Value as JsonValue;
use sqlparser::dialect::MySqlDialect;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::future::Future;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

static QUOTED_SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"'(?:[^'\\]|\\.)*'|"(?:[^"\\]|\\.)*""#)
        .expect("quoted segment pattern is valid")
});

/// Gauge name for the number of sessions currently checked out.
pub const GAUGE_ACQUIRED: &str = "db.pool.acquired";

/// Gauge name for the number of physical connections ever created.
pub const GAUGE_POOL_SIZE: &str = "db.pool.size";

/// Structured metadata attached to a completed unit of work.
pub type Metadata = serde_json::Map<String, JsonValue>;

/// Receiver of timing and outcome reports.
pub trait Instrument: Send + Sync {
    /// The wrapped work finished successfully.
    fn completed(&self, label: &str, duration: Duration, metadata: &Metadata);

    /// The wrapped work failed. The error is propagated unchanged afterwards.
    fn failed(&self, label: &str, duration: Duration, error: &DbError);
}

/// Receiver of pool gauges.
pub trait MetricsSink: Send + Sync {
    fn gauge(&self, name: &'static str, value: u64);
}

/// Default [`Instrument`]: one `tracing` event per unit of work.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingInstrumentation;

impl Instrument for TracingInstrumentation {
    fn completed(&self, label: &str, duration: Duration, metadata: &Metadata) {
        info!(
            label = %label,
            duration_ms = duration.as_millis() as u64,
            metadata = %JsonValue::Object(metadata.clone()),
            "{}.done",
            label
        );
    }

    fn failed(&self, label: &str, duration: Duration, err: &DbError) {
        error!(
            label = %label,
            duration_ms = duration.as_millis() as u64,
            error = %err.redacted(),
            "{}.failed",
            label
        );
    }
}

/// Default [`MetricsSink`]: gauges are emitted as debug events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn gauge(&self, name: &'static str, value: u64) {
        debug!(metric = name, value = value, "gauge");
    }
}

/// Run `work`, reporting its duration and outcome to `instrument`.
///
/// `extractor` turns a successful result into metadata (row counts and the
/// like). The result of `work` is returned unchanged, errors included.
pub async fn with_instrumentation<T, Fut, E>(
    instrument: &dyn Instrument,
    label: &str,
    work: Fut,
    extractor: E,
) -> DbResult<T>
where
    Fut: Future<Output = DbResult<T>>,
    E: FnOnce(&T) -> Metadata,
{
    let start = Instant::now();
    let result = work.await;
    let duration = start.elapsed();

    match &result {
        Ok(value) => instrument.completed(label, duration, &extractor(value)),
        Err(err) => instrument.failed(label, duration, err),
    }

    result
}

/// Extractor for work whose result carries nothing worth reporting.
pub fn no_metadata<T>(_: &T) -> Metadata {
    Metadata::new()
}

/// Mask every literal in `sql` with `?`.
///
/// Keywords, identifiers and punctuation are kept so the statement stays
/// recognisable in logs. SQL that cannot be tokenized is hidden entirely.
pub fn redact_sql(sql: &str) -> String {
    let dialect = MySqlDialect {};
    let tokens = match Tokenizer::new(&dialect, sql).tokenize() {
        Ok(tokens) => tokens,
        Err(_) => return "<redacted>".to_string(),
    };

    tokens
        .iter()
        .map(|token| match token {
            Token::Number(..)
            | Token::SingleQuotedString(_)
            | Token::DoubleQuotedString(_)
            | Token::NationalStringLiteral(_)
            | Token::EscapedStringLiteral(_)
            | Token::HexStringLiteral(_) => "?".to_string(),
            other => other.to_string(),
        })
        .collect()
}

/// Mask every quoted segment of a server message with `'?'`.
///
/// MySQL echoes offending values in quotes (`Duplicate entry '...' for
/// key ...`); the unquoted text is kept.
pub fn redact_message(message: &str) -> String {
    QUOTED_SEGMENT.replace_all(message, "'?'").into_owned()
}
