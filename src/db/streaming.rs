//! Row streaming with caller-owned sessions.
//!
//! Unlike the other executors, a stream hands its session to the caller.
//! The caller decides whether it goes back to the pool (`Pool::release`) or
//! is thrown away (`Pool::destroy`) once the rows have been consumed.

use crate::db::executor::operation_label;
use crate::db::params;
use crate::db::pool::{Pool, Session};
use crate::error::{DbError, DbResult};
use crate::instrument::{Instrument, Metadata, TracingInstrumentation, with_instrumentation};
use crate::models::{QuerySpec, Row};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use std::sync::Arc;

/// Opens [`StreamingQuery`]s against a pool.
#[derive(Clone)]
pub struct StreamingExecutor {
    pool: Pool,
    instrument: Arc<dyn Instrument>,
}

impl StreamingExecutor {
    pub fn new(pool: Pool) -> Self {
        Self::with_instrument(pool, Arc::new(TracingInstrumentation))
    }

    pub fn with_instrument(pool: Pool, instrument: Arc<dyn Instrument>) -> Self {
        Self { pool, instrument }
    }

    /// Render `spec` and check out the session it will run on.
    ///
    /// No SQL is sent until [`StreamingQuery::rows`] is polled.
    pub async fn stream(&self, spec: &QuerySpec) -> DbResult<StreamingQuery> {
        let label = operation_label(spec.label.as_deref(), "stream");
        let work = async {
            let sql = params::render(spec)?;
            let session = self.pool.acquire().await?;
            Ok(StreamingQuery {
                session,
                sql,
                started: false,
            })
        };
        with_instrumentation(&*self.instrument, &label, work, |query| {
            let mut metadata = Metadata::new();
            metadata.insert("session_id".into(), query.session.id().into());
            metadata
        })
        .await
    }
}

/// A rendered query bound to the session that will run it.
#[derive(Debug)]
pub struct StreamingQuery {
    session: Session,
    sql: String,
    started: bool,
}

impl StreamingQuery {
    /// Run the query and yield rows as the server sends them.
    ///
    /// The query is sent on the first poll. It runs at most once: later
    /// calls yield a single error.
    pub fn rows(&mut self) -> BoxStream<'_, DbResult<Row>> {
        if std::mem::replace(&mut self.started, true) {
            let err = DbError::invalid_input("rows of a streaming query can only be read once");
            return stream::once(async move { Err(err) }).boxed();
        }
        self.session.fetch(&self.sql)
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Give the session back to the caller for release or destroy.
    pub fn into_session(self) -> Session {
        self.session
    }
}
