//! Atomic multi-statement execution.
//!
//! A transaction runs on one dedicated session:
//! `BEGIN → statement* → COMMIT`. The first failing statement triggers a
//! `ROLLBACK` and the session is destroyed whether or not the rollback
//! succeeds. Only a committed transaction returns its session to the pool.

use crate::db::executor::{operation_label, results_metadata};
use crate::db::params;
use crate::db::pool::Pool;
use crate::error::{DbError, DbResult};
use crate::instrument::{Instrument, TracingInstrumentation, with_instrumentation};
use crate::models::{ResultSet, TransactionSpec};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Runs [`TransactionSpec`]s against a pool.
#[derive(Clone)]
pub struct TransactionManager {
    pool: Pool,
    instrument: Arc<dyn Instrument>,
}

impl TransactionManager {
    pub fn new(pool: Pool) -> Self {
        Self::with_instrument(pool, Arc::new(TracingInstrumentation))
    }

    pub fn with_instrument(pool: Pool, instrument: Arc<dyn Instrument>) -> Self {
        Self { pool, instrument }
    }

    /// Run every statement atomically and return one result set per statement.
    ///
    /// All statements are rendered before a session is acquired, so a binding
    /// error never opens a transaction.
    pub async fn run(&self, spec: &TransactionSpec) -> DbResult<Vec<ResultSet>> {
        let label = operation_label(spec.label.as_deref(), "transaction");
        let transaction_id = generate_transaction_id();
        let work = self.run_inner(spec, &transaction_id);
        with_instrumentation(&*self.instrument, &label, work, results_metadata).await
    }

    async fn run_inner(
        &self,
        spec: &TransactionSpec,
        transaction_id: &str,
    ) -> DbResult<Vec<ResultSet>> {
        let statements = spec
            .statements
            .iter()
            .map(params::render)
            .collect::<DbResult<Vec<_>>>()?;

        let mut session = self.pool.acquire().await?;
        let session_id = session.id();

        if let Err(e) = session.begin().await {
            warn!(
                transaction_id = %transaction_id,
                session_id,
                error = %e.redacted(),
                "BEGIN failed"
            );
            self.pool.destroy(session).await;
            return Err(e);
        }

        info!(
            transaction_id = %transaction_id,
            session_id,
            statements = statements.len(),
            "Transaction started"
        );

        let mut results = Vec::with_capacity(statements.len());
        for (index, sql) in statements.iter().enumerate() {
            match session.query(sql).await {
                Ok(sets) => results.push(sets.into_iter().next().unwrap_or_default()),
                Err(statement_error) => {
                    warn!(
                        transaction_id = %transaction_id,
                        statement = index,
                        error = %statement_error.redacted(),
                        "Statement failed, rolling back"
                    );

                    let error = match session.rollback().await {
                        Ok(()) => {
                            info!(transaction_id = %transaction_id, "Transaction rolled back");
                            DbError::transaction_aborted(transaction_id, statement_error)
                        }
                        Err(rollback_error) => {
                            warn!(
                                transaction_id = %transaction_id,
                                error = %rollback_error.redacted(),
                                "Rollback failed"
                            );
                            DbError::rollback_failed(transaction_id, rollback_error, statement_error)
                        }
                    };
                    self.pool.destroy(session).await;
                    return Err(error);
                }
            }
            debug!(transaction_id = %transaction_id, statement = index, "Statement done");
        }

        if let Err(e) = session.commit().await {
            warn!(
                transaction_id = %transaction_id,
                error = %e.redacted(),
                "COMMIT failed"
            );
            self.pool.destroy(session).await;
            return Err(DbError::commit_failed(transaction_id, e));
        }

        self.pool.release(session);
        info!(transaction_id = %transaction_id, "Transaction committed");
        Ok(results)
    }
}

/// Generate a unique transaction ID.
fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}
