//! Raw driver abstraction.
//!
//! The pool manages [`Connection`]s produced by a [`Connector`]. Statements
//! reach a connection as fully rendered text, so a driver only has to run SQL,
//! stream rows and close itself. The production driver lives in
//! [`crate::db::mysql`].

use crate::error::DbResult;
use crate::models::{ResultSet, Row};
use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// Opens physical connections on demand.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> DbResult<Box<dyn Connection>>;
}

/// One physical connection.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Run a script and return one result set per statement, in order.
    async fn query(&mut self, sql: &str) -> DbResult<Vec<ResultSet>>;

    /// Run a query and yield its rows as they arrive.
    fn fetch<'c>(&'c mut self, sql: &'c str) -> BoxStream<'c, DbResult<Row>>;

    /// Whether this connection was opened with multi-statement support.
    fn supports_multiple_statements(&self) -> bool;

    /// Close the physical connection.
    async fn close(self: Box<Self>) -> DbResult<()>;

    async fn begin(&mut self) -> DbResult<()> {
        self.query("START TRANSACTION").await.map(|_| ())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.query("COMMIT").await.map(|_| ())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.query("ROLLBACK").await.map(|_| ())
    }
}
