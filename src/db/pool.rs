//! Connection pool management.
//!
//! A [`Pool`] hands out exclusive [`Session`]s over physical connections opened
//! by a [`Connector`]. Capacity is a semaphore with `connection_limit` permits;
//! each session holds one permit until it is released or destroyed.
//!
//! ## Lifecycle
//! - [`Pool::acquire`] reuses an idle connection or opens a new one
//! - [`Pool::release`] returns a healthy session to the idle set
//! - [`Pool::destroy`] closes the connection; it is never recycled
//!
//! A session dropped without either is treated as destroyed: its protocol
//! state is unknown, so the connection is closed in the background and a
//! warning is logged.
//!
//! ## Counters
//! - `acquired` saturates at 0; underflow attempts are logged
//! - `pool_size` counts connections ever created and never goes down

use crate::config::PoolConfig;
use crate::db::driver::{Connection, Connector};
use crate::db::params;
use crate::error::{AcquireFailure, DbError, DbResult};
use crate::instrument::{GAUGE_ACQUIRED, GAUGE_POOL_SIZE, MetricsSink, TracingMetrics};
use crate::models::{ResultSet, Row};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info, warn};

/// Point-in-time view of pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Physical connections created since the pool was built
    pub pool_size: usize,
    /// Sessions currently checked out
    pub acquired: usize,
    /// Connections parked in the idle set
    pub idle: usize,
    /// Callers waiting for capacity
    pub waiting: usize,
    pub connection_limit: usize,
}

/// Bounded pool of database sessions. Cheap to clone.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn Connection>>>,
    acquired: AtomicUsize,
    pool_size: AtomicUsize,
    waiting: AtomicUsize,
    closed: AtomicBool,
    next_session_id: AtomicU64,
    metrics: Arc<dyn MetricsSink>,
}

impl Pool {
    /// Create a pool that reports gauges through `tracing`.
    ///
    /// No connection is opened until the first acquisition.
    pub fn new(config: PoolConfig, connector: impl Connector) -> DbResult<Self> {
        Self::with_metrics(config, Arc::new(connector), Arc::new(TracingMetrics))
    }

    /// Create a pool with an explicit connector and metrics sink.
    pub fn with_metrics(
        config: PoolConfig,
        connector: Arc<dyn Connector>,
        metrics: Arc<dyn MetricsSink>,
    ) -> DbResult<Self> {
        config.validate().map_err(DbError::configuration)?;

        info!(
            host = %config.host,
            port = config.port,
            connection_limit = config.connection_limit,
            queue_limit = config.queue_limit,
            wait_for_connections = config.wait_for_connections,
            "Creating connection pool"
        );

        let permits = Arc::new(Semaphore::new(config.connection_limit as usize));
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                permits,
                idle: Mutex::new(Vec::new()),
                acquired: AtomicUsize::new(0),
                pool_size: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                next_session_id: AtomicU64::new(1),
                metrics,
            }),
        })
    }

    /// The configuration this pool was built from.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Check out a session.
    ///
    /// At capacity this either fails at once (`wait_for_connections = false`)
    /// or queues, bounded by `queue_limit`. `acquire_timeout_ms` bounds the
    /// whole acquisition, opening a new connection included.
    pub async fn acquire(&self) -> DbResult<Session> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }

        match self.inner.config.acquire_timeout() {
            Some(limit) => tokio::time::timeout(limit, self.checkout())
                .await
                .map_err(|_| {
                    DbError::acquisition(
                        AcquireFailure::TimedOut,
                        format!("no session available after {}ms", limit.as_millis()),
                    )
                })?,
            None => self.checkout().await,
        }
    }

    async fn checkout(&self) -> DbResult<Session> {
        let inner = &self.inner;
        let permit = match Arc::clone(&inner.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(closed_error()),
            Err(TryAcquireError::NoPermits) if !inner.config.wait_for_connections => {
                return Err(DbError::acquisition(
                    AcquireFailure::Exhausted,
                    format!(
                        "all {} sessions are in use",
                        inner.config.connection_limit
                    ),
                ));
            }
            Err(TryAcquireError::NoPermits) => inner.wait_for_permit().await?,
        };

        // Undone on drop unless a session takes over the slot
        let slot = AcquiredSlot::claim(inner);

        let reused = inner.idle.lock().pop();
        let conn = match reused {
            Some(conn) => conn,
            None => match inner.connector.connect().await {
                Ok(conn) => {
                    let size = inner.pool_size.fetch_add(1, Ordering::AcqRel) + 1;
                    inner.metrics.gauge(GAUGE_POOL_SIZE, size as u64);
                    inner.log_lifecycle(0, "connection");
                    conn
                }
                Err(e) => {
                    drop(slot);
                    drop(permit);
                    warn!(error = %e.redacted(), "Failed to open connection");
                    return Err(DbError::acquisition(AcquireFailure::Connect, e.to_string()));
                }
            },
        };

        slot.disarm();
        let id = inner.next_session_id.fetch_add(1, Ordering::Relaxed);
        inner.log_lifecycle(id, "acquire");

        Ok(Session {
            id,
            conn: Some(conn),
            _permit: permit,
            pool: Arc::clone(inner),
        })
    }

    /// Return a session to the idle set.
    pub fn release(&self, mut session: Session) {
        if let Some(conn) = session.conn.take() {
            session.pool.park(session.id, conn);
        }
    }

    /// Close a session's connection instead of recycling it.
    pub async fn destroy(&self, mut session: Session) {
        let Some(conn) = session.conn.take() else {
            return;
        };
        if let Err(e) = conn.close().await {
            debug!(session_id = session.id, error = %e, "Error while closing connection");
        }
        session.pool.decrement_acquired();
        session.pool.log_lifecycle(session.id, "destroy");
    }

    /// Snapshot the pool counters.
    pub fn status(&self) -> PoolStatus {
        let inner = &self.inner;
        PoolStatus {
            pool_size: inner.pool_size.load(Ordering::Acquire),
            acquired: inner.acquired.load(Ordering::Acquire),
            idle: inner.idle.lock().len(),
            waiting: inner.waiting.load(Ordering::Acquire),
            connection_limit: inner.config.connection_limit as usize,
        }
    }

    /// Stop handing out sessions and close idle connections.
    ///
    /// Sessions still checked out are closed when they come back.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.permits.close();

        let idle: Vec<_> = std::mem::take(&mut *self.inner.idle.lock());
        let count = idle.len();
        for conn in idle {
            if let Err(e) = conn.close().await {
                debug!(error = %e, "Error while closing idle connection");
            }
        }
        info!(closed_idle = count, "Connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish()
    }
}

impl PoolInner {
    async fn wait_for_permit(&self) -> DbResult<OwnedSemaphorePermit> {
        let waiting = self.waiting.fetch_add(1, Ordering::AcqRel) + 1;
        let _waiter = WaitingGuard(&self.waiting);

        let queue_limit = self.config.queue_limit as usize;
        if queue_limit > 0 && waiting > queue_limit {
            return Err(DbError::acquisition(
                AcquireFailure::QueueFull,
                format!("{} callers already waiting", queue_limit),
            ));
        }

        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| closed_error())
    }

    fn park(&self, session_id: u64, conn: Box<dyn Connection>) {
        // Checked under the idle lock so nothing is parked after `close` drains it
        let leftover = {
            let mut idle = self.idle.lock();
            if self.closed.load(Ordering::Acquire) {
                Some(conn)
            } else {
                idle.push(conn);
                None
            }
        };
        if let Some(conn) = leftover {
            discard(conn);
        }
        self.decrement_acquired();
        self.log_lifecycle(session_id, "release");
    }

    /// Decrement the checked-out count. Saturates at 0.
    fn decrement_acquired(&self) {
        let result = self
            .acquired
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(1))
            });

        match result {
            Ok(0) => warn!("Acquired count underflow detected - extra release call"),
            Ok(prev) => self.metrics.gauge(GAUGE_ACQUIRED, (prev - 1) as u64),
            Err(_) => {}
        }
    }

    fn log_lifecycle(&self, session_id: u64, event: &str) {
        let acquired = self.acquired.load(Ordering::Acquire);
        if self.config.log_connections {
            info!(session_id, acquired, event, "db.{}", event);
        } else {
            debug!(session_id, acquired, event, "db.{}", event);
        }
    }
}

/// One unit of the `acquired` count, returned if acquisition is abandoned.
struct AcquiredSlot<'a> {
    pool: &'a PoolInner,
    armed: bool,
}

impl<'a> AcquiredSlot<'a> {
    fn claim(pool: &'a PoolInner) -> Self {
        let acquired = pool.acquired.fetch_add(1, Ordering::AcqRel) + 1;
        pool.metrics.gauge(GAUGE_ACQUIRED, acquired as u64);
        Self { pool, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AcquiredSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.decrement_acquired();
        }
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn closed_error() -> DbError {
    DbError::acquisition(AcquireFailure::Closed, "pool has been closed")
}

/// Close a connection without waiting for it.
fn discard(conn: Box<dyn Connection>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = conn.close().await {
                    debug!(error = %e, "Error while closing discarded connection");
                }
            });
        }
        // No runtime left to close on; dropping the connection closes the socket
        Err(_) => drop(conn),
    }
}

/// Exclusive handle to one pooled connection.
///
/// Hand it back with [`Pool::release`] after clean use or [`Pool::destroy`]
/// after an error.
pub struct Session {
    id: u64,
    conn: Option<Box<dyn Connection>>,
    _permit: OwnedSemaphorePermit,
    pool: Arc<PoolInner>,
}

impl Session {
    /// Pool-unique id, used in logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the underlying connection accepts multi-statement scripts.
    pub fn supports_multiple_statements(&self) -> bool {
        self.conn
            .as_ref()
            .is_some_and(|conn| conn.supports_multiple_statements())
    }

    /// Fail unless this session may run `sql`.
    ///
    /// A script with more than one statement needs a session provisioned
    /// for multiple statements. Nothing is sent to the server.
    pub fn check_script(&self, sql: &str) -> DbResult<()> {
        if !self.supports_multiple_statements() && params::statement_count(sql) > 1 {
            return Err(DbError::configuration(
                "script has several statements but the session is not provisioned for \
                 multiple statements; enable multiple_statements on the pool",
            ));
        }
        Ok(())
    }

    /// Run a rendered script and return its result sets.
    ///
    /// Statement errors carry the SQL; log them via `redacted()`.
    pub async fn query(&mut self, sql: &str) -> DbResult<Vec<ResultSet>> {
        self.check_script(sql)?;
        let limit = self.pool.config.statement_timeout();
        let conn = self.connection()?;
        within(limit, "statement", conn.query(sql))
            .await
            .map_err(|e| e.with_sql(sql))
    }

    /// Stream the rows of a rendered query.
    pub fn fetch<'c>(&'c mut self, sql: &'c str) -> BoxStream<'c, DbResult<Row>> {
        if let Err(e) = self.check_script(sql) {
            return stream::once(async move { Err(e) }).boxed();
        }
        match self.conn.as_mut() {
            Some(conn) => conn.fetch(sql),
            None => stream::once(async { Err(detached_error()) }).boxed(),
        }
    }

    pub async fn begin(&mut self) -> DbResult<()> {
        let limit = self.pool.config.statement_timeout();
        within(limit, "begin", self.connection()?.begin()).await
    }

    pub async fn commit(&mut self) -> DbResult<()> {
        let limit = self.pool.config.statement_timeout();
        within(limit, "commit", self.connection()?.commit()).await
    }

    pub async fn rollback(&mut self) -> DbResult<()> {
        let limit = self.pool.config.statement_timeout();
        within(limit, "rollback", self.connection()?.rollback()).await
    }

    fn connection(&mut self) -> DbResult<&mut Box<dyn Connection>> {
        self.conn.as_mut().ok_or_else(detached_error)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("attached", &self.conn.is_some())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        warn!(
            session_id = self.id,
            "Session dropped without release or destroy - discarding connection"
        );
        discard(conn);
        self.pool.decrement_acquired();
    }
}

fn detached_error() -> DbError {
    DbError::internal("session is no longer attached to a connection")
}

async fn within<T>(
    limit: Option<Duration>,
    operation: &str,
    work: impl Future<Output = DbResult<T>>,
) -> DbResult<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .map_err(|_| DbError::timeout(operation, limit.as_millis() as u64))?,
        None => work.await,
    }
}
