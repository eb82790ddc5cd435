//! MySQL driver backed by `sqlx`.
//!
//! Statements arrive fully rendered, so they are sent over the text protocol
//! without server-side preparation. A multi-statement script comes back as
//! one result set per statement.

use crate::config::PoolConfig;
use crate::db::driver::{Connection, Connector};
use crate::db::pool::Pool;
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{ResultSet, Row};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::{Connection as _, Either, Executor};
use std::str::FromStr;
use tracing::debug;
use url::Url;

/// Opens `sqlx` MySQL connections from a [`PoolConfig`].
#[derive(Debug, Clone)]
pub struct MySqlConnector {
    options: MySqlConnectOptions,
    target: String,
    multiple_statements: bool,
}

impl MySqlConnector {
    /// Build connect options; `driver_options` become URL query parameters.
    pub fn from_config(config: &PoolConfig) -> DbResult<Self> {
        let mut url = Url::parse(&format!("mysql://{}:{}", config.host, config.port))
            .map_err(|e| DbError::configuration(format!("Invalid host '{}': {}", config.host, e)))?;
        url.set_username(&config.user)
            .and_then(|_| url.set_password(config.password.as_deref()))
            .map_err(|_| DbError::configuration("Host does not accept credentials"))?;
        if let Some(database) = &config.database {
            url.set_path(database);
        }
        if !config.driver_options.is_empty() {
            url.query_pairs_mut().extend_pairs(&config.driver_options);
        }

        let options = MySqlConnectOptions::from_str(url.as_str())
            .map_err(DbError::from)?
            .charset(&config.charset);

        Ok(Self {
            options,
            target: format!("{}:{}", config.host, config.port),
            multiple_statements: config.multiple_statements,
        })
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(&self) -> DbResult<Box<dyn Connection>> {
        let conn = MySqlConnection::connect_with(&self.options)
            .await
            .map_err(|e| {
                DbError::connection(
                    format!("Failed to connect to MySQL at {}: {}", self.target, e),
                    "Check host, port, credentials and that the server is reachable",
                )
            })?;
        debug!(target = %self.target, "Opened MySQL connection");

        Ok(Box::new(MySqlDriverConnection {
            conn,
            multiple_statements: self.multiple_statements,
        }))
    }
}

struct MySqlDriverConnection {
    conn: MySqlConnection,
    multiple_statements: bool,
}

#[async_trait]
impl Connection for MySqlDriverConnection {
    async fn query(&mut self, sql: &str) -> DbResult<Vec<ResultSet>> {
        let mut results = Vec::new();
        let mut rows = Vec::new();
        let mut stream = (&mut self.conn).fetch_many(sql);

        while let Some(item) = stream.try_next().await? {
            match item {
                Either::Left(done) => {
                    let last_insert_id = done.last_insert_id();
                    results.push(ResultSet {
                        rows: std::mem::take(&mut rows),
                        rows_affected: done.rows_affected(),
                        last_insert_id: (last_insert_id > 0).then_some(last_insert_id),
                    });
                }
                Either::Right(row) => rows.push(row.to_json_map()),
            }
        }
        if !rows.is_empty() || results.is_empty() {
            results.push(ResultSet::with_rows(rows));
        }

        Ok(results)
    }

    fn fetch<'c>(&'c mut self, sql: &'c str) -> BoxStream<'c, DbResult<Row>> {
        (&mut self.conn)
            .fetch(sql)
            .map(|row| row.map(|row| row.to_json_map()).map_err(DbError::from))
            .boxed()
    }

    fn supports_multiple_statements(&self) -> bool {
        self.multiple_statements
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        self.conn.close().await.map_err(DbError::from)
    }
}

impl Pool {
    /// Create a pool of MySQL sessions.
    pub fn mysql(config: PoolConfig) -> DbResult<Self> {
        let connector = MySqlConnector::from_config(&config)?;
        Pool::new(config, connector)
    }
}
