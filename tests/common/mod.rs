//! Scripted in-memory driver shared by the integration tests.
//!
//! Every statement a connection receives is appended to a shared log.
//! Failures are injected by substring, canned result sets by exact SQL.

#![allow(dead_code)]

use async_trait::async_trait;
use db_connector::config::PoolConfig;
use db_connector::db::{CANARY_SQL, Connection, Connector, Pool};
use db_connector::error::{DbError, DbResult};
use db_connector::instrument::{Instrument, Metadata, MetricsSink};
use db_connector::models::{ResultSet, Row};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct MockState {
    pub log: Mutex<Vec<String>>,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub multi_statement: AtomicBool,
    pub fail_connect: AtomicBool,
    failures: Mutex<Vec<String>>,
    responses: Mutex<HashMap<String, Vec<ResultSet>>>,
    delay: Mutex<Option<Duration>>,
    connect_delay: Mutex<Option<Duration>>,
}

/// Connector handing out scripted connections. Clones share state.
#[derive(Clone, Default)]
pub struct MockDriver {
    pub state: Arc<MockState>,
}

impl MockDriver {
    pub fn new() -> Self {
        let driver = Self::default();
        driver.respond(CANARY_SQL, vec![ResultSet::with_rows(vec![row("healthy", 1)])]);
        driver
    }

    /// Connections report multi-statement support.
    pub fn multi_statement(self) -> Self {
        self.state.multi_statement.store(true, Ordering::SeqCst);
        self
    }

    /// Fail every statement containing `pattern`.
    pub fn fail_on(&self, pattern: &str) {
        self.state.failures.lock().push(pattern.to_string());
    }

    pub fn respond(&self, sql: &str, results: Vec<ResultSet>) {
        self.state.responses.lock().insert(sql.to_string(), results);
    }

    /// Hold every statement for `delay` before answering.
    pub fn delay(&self, delay: Duration) {
        *self.state.delay.lock() = Some(delay);
    }

    /// Hold every connect for `delay` before answering.
    pub fn connect_delay(&self, delay: Option<Duration>) {
        *self.state.connect_delay.lock() = delay;
    }

    pub fn log(&self) -> Vec<String> {
        self.state.log.lock().clone()
    }

    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockDriver {
    async fn connect(&self) -> DbResult<Box<dyn Connection>> {
        let delay = *self.state.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(DbError::connection("connection refused", "Start the server"));
        }
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockConnection {
    state: Arc<MockState>,
}

impl MockConnection {
    fn check(&self, sql: &str) -> DbResult<()> {
        self.state.log.lock().push(sql.to_string());
        let failures = self.state.failures.lock();
        if failures.iter().any(|pattern| sql.contains(pattern.as_str())) {
            return Err(DbError::statement(
                "scripted failure",
                Some("HY000".to_string()),
            ));
        }
        Ok(())
    }

    fn canned(&self, sql: &str) -> Vec<ResultSet> {
        if let Some(results) = self.state.responses.lock().get(sql) {
            return results.clone();
        }
        // One empty result set per statement in the script
        let statements = sql.split(';').filter(|s| !s.trim().is_empty()).count();
        vec![ResultSet::write_result(1, None); statements.max(1)]
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn query(&mut self, sql: &str) -> DbResult<Vec<ResultSet>> {
        let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.state.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.check(sql).map(|_| self.canned(sql));

        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn fetch<'c>(&'c mut self, sql: &'c str) -> BoxStream<'c, DbResult<Row>> {
        if let Err(e) = self.check(sql) {
            return stream::once(async move { Err(e) }).boxed();
        }
        let rows: Vec<DbResult<Row>> = self
            .canned(sql)
            .into_iter()
            .next()
            .map(|result| result.rows)
            .unwrap_or_default()
            .into_iter()
            .map(Ok)
            .collect();
        stream::iter(rows).boxed()
    }

    fn supports_multiple_statements(&self) -> bool {
        self.state.multi_statement.load(Ordering::SeqCst)
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Instrument that records every report.
#[derive(Default)]
pub struct Recorder {
    pub completed: Mutex<Vec<(String, Metadata)>>,
    pub failed: Mutex<Vec<(String, String)>>,
}

impl Instrument for Recorder {
    fn completed(&self, label: &str, _duration: Duration, metadata: &Metadata) {
        self.completed
            .lock()
            .push((label.to_string(), metadata.clone()));
    }

    fn failed(&self, label: &str, _duration: Duration, error: &DbError) {
        self.failed
            .lock()
            .push((label.to_string(), error.redacted().to_string()));
    }
}

/// Metrics sink that records every gauge.
#[derive(Default)]
pub struct Gauges(pub Mutex<Vec<(&'static str, u64)>>);

impl MetricsSink for Gauges {
    fn gauge(&self, name: &'static str, value: u64) {
        self.0.lock().push((name, value));
    }
}

pub fn row(column: &str, value: impl Into<JsonValue>) -> Row {
    let mut row = Row::new();
    row.insert(column.to_string(), value.into());
    row
}

pub fn config(connection_limit: u32) -> PoolConfig {
    PoolConfig {
        connection_limit,
        acquire_timeout_ms: 1_000,
        ..PoolConfig::default()
    }
}

pub fn pool(config: PoolConfig, driver: &MockDriver) -> Pool {
    Pool::new(config, driver.clone()).expect("valid pool config")
}

/// Let background connection closes run.
pub async fn settle() {
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
}
