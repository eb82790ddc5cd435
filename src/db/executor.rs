//! Query execution engine.
//!
//! Every operation follows the same session discipline:
//! - acquire a session from the [`Pool`]
//! - render the statement text and run it
//! - release the session on success, destroy it on any error
//!
//! Each call is wrapped in [`with_instrumentation`] under
//! `{label}.{operation}`, so duration, row counts and failures are reported
//! whatever the outcome.

use crate::db::params;
use crate::db::pool::Pool;
use crate::error::{DbError, DbResult};
use crate::instrument::{
    Instrument, Metadata, TracingInstrumentation, redact_sql, with_instrumentation,
};
use crate::models::{Params, QueryOptions, QuerySpec, ResultSet, SqlValue};
use std::sync::Arc;
use tracing::debug;

/// Label used when the caller supplies none.
pub const DEFAULT_LABEL: &str = "connector.db_connection";

/// Runs single statements, batches and bulk inserts against a pool.
#[derive(Clone)]
pub struct QueryExecutor {
    pool: Pool,
    instrument: Arc<dyn Instrument>,
}

impl QueryExecutor {
    /// Create an executor that reports through `tracing`.
    pub fn new(pool: Pool) -> Self {
        Self::with_instrument(pool, Arc::new(TracingInstrumentation))
    }

    pub fn with_instrument(pool: Pool, instrument: Arc<dyn Instrument>) -> Self {
        Self { pool, instrument }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Run one statement and return its (first) result set.
    pub async fn execute(&self, spec: &QuerySpec) -> DbResult<ResultSet> {
        let label = operation_label(spec.label.as_deref(), "query");
        let work = async {
            let sql = params::render(spec)?;
            let results = self.run(&sql, false).await?;
            Ok(results.into_iter().next().unwrap_or_default())
        };
        with_instrumentation(&*self.instrument, &label, work, result_metadata).await
    }

    /// Run a multi-statement script and return every result set.
    ///
    /// Requires `multiple_statements` in the query options and a session
    /// provisioned for it.
    pub async fn execute_multi(&self, spec: &QuerySpec) -> DbResult<Vec<ResultSet>> {
        let label = operation_label(spec.label.as_deref(), "multi_stmt_query");
        let work = async {
            require_multi_statement(spec.options)?;
            let sql = params::render(spec)?;
            self.run(&sql, true).await
        };
        with_instrumentation(&*self.instrument, &label, work, results_metadata).await
    }

    /// Bind `template` once per row and run the statements as one script.
    ///
    /// Rows with no values are skipped. A batch with nothing left to run
    /// returns an empty vector without touching the pool.
    pub async fn execute_batch(
        &self,
        template: &str,
        rows: &[Params],
        label: Option<&str>,
        options: QueryOptions,
    ) -> DbResult<Vec<ResultSet>> {
        let label = operation_label(label, "multi_stmt_query");
        let work = async {
            require_multi_statement(options)?;
            let (script, statements) = build_batch_script(template, rows);
            if statements == 0 {
                debug!(label = %label, "Batch has no non-empty rows, nothing to run");
                return Ok(Vec::new());
            }
            debug!(label = %label, statements, "Running batch");
            self.run(&script, true).await
        };
        with_instrumentation(&*self.instrument, &label, work, results_metadata).await
    }

    /// Insert many rows with one statement.
    ///
    /// `sql` carries a single `?` that receives every row as a nested array,
    /// so `VALUES ?` expands to `VALUES (a, b), (c, d)`.
    pub async fn bulk_insert(
        &self,
        sql: &str,
        rows: Vec<Vec<SqlValue>>,
        label: Option<&str>,
    ) -> DbResult<bool> {
        let label = operation_label(label, "bulk_insert");
        let row_count = rows.len();
        let work = async {
            if rows.is_empty() {
                return Err(DbError::invalid_input("bulk insert needs at least one row"));
            }
            let values = SqlValue::Array(rows.into_iter().map(SqlValue::Array).collect());
            let statement = params::format(sql, &[values]);
            self.run(&statement, false).await?;
            Ok(true)
        };
        with_instrumentation(&*self.instrument, &label, work, |_| {
            let mut metadata = Metadata::new();
            metadata.insert("count".into(), row_count.into());
            metadata
        })
        .await
    }

    /// Run `sql` on its own session.
    async fn run(&self, sql: &str, multi_statement: bool) -> DbResult<Vec<ResultSet>> {
        let mut session = self.pool.acquire().await?;

        let provisioned = if multi_statement && !session.supports_multiple_statements() {
            Err(not_provisioned())
        } else {
            session.check_script(sql)
        };
        if let Err(e) = provisioned {
            // Nothing was sent, the session is still clean
            self.pool.release(session);
            return Err(e);
        }

        debug!(session_id = session.id(), sql = %redact_sql(sql), "Executing statement");
        match session.query(sql).await {
            Ok(results) => {
                self.pool.release(session);
                Ok(results)
            }
            Err(e) => {
                self.pool.destroy(session).await;
                Err(e)
            }
        }
    }
}

/// Render one statement per non-empty row and join them into a script.
///
/// Named rows are bound by label and positional rows by `?`. Each
/// statement is terminated by `;`. Returns the script and the number of
/// statements in it.
pub fn build_batch_script(template: &str, rows: &[Params]) -> (String, usize) {
    let mut script = String::new();
    let mut statements = 0;

    for row in rows.iter().filter(|row| !row.is_empty()) {
        let statement = match row {
            Params::Named(values) => params::bind(template, values),
            Params::Positional(values) => params::format(template, values),
            Params::None => continue,
        };
        let statement = statement.trim_end();
        script.push_str(statement);
        if !statement.ends_with(';') {
            script.push(';');
        }
        statements += 1;
    }

    (script, statements)
}

/// `{label}.{operation}`, falling back to [`DEFAULT_LABEL`].
pub(crate) fn operation_label(label: Option<&str>, operation: &str) -> String {
    format!("{}.{}", label.unwrap_or(DEFAULT_LABEL), operation)
}

pub(crate) fn result_metadata(result: &ResultSet) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("count".into(), result.row_count().into());
    metadata.insert("rows_affected".into(), result.rows_affected.into());
    metadata
}

#[allow(clippy::ptr_arg)]
pub(crate) fn results_metadata(results: &Vec<ResultSet>) -> Metadata {
    let mut metadata = Metadata::new();
    let rows: usize = results.iter().map(ResultSet::row_count).sum();
    metadata.insert("count".into(), rows.into());
    metadata.insert("result_sets".into(), results.len().into());
    metadata
}

fn require_multi_statement(options: QueryOptions) -> DbResult<()> {
    if options.multiple_statements {
        Ok(())
    } else {
        Err(DbError::configuration(
            "multi-statement execution requires the multiple_statements option",
        ))
    }
}

fn not_provisioned() -> DbError {
    DbError::configuration(
        "session is not provisioned for multiple statements; enable multiple_statements on the pool",
    )
}
