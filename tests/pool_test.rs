//! Integration tests for pool capacity, waiting and session disposal.

mod common;

use common::{Gauges, MockDriver, config, pool, settle};
use db_connector::config::PoolConfig;
use db_connector::db::{Pool, QueryExecutor};
use db_connector::error::{AcquireFailure, DbError};
use db_connector::instrument::{GAUGE_ACQUIRED, GAUGE_POOL_SIZE};
use db_connector::models::QuerySpec;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_capacity_bound_under_concurrent_load() {
    let driver = MockDriver::new();
    driver.delay(Duration::from_millis(5));
    let pool = pool(
        PoolConfig {
            acquire_timeout_ms: 0,
            ..config(3)
        },
        &driver,
    );
    let executor = QueryExecutor::new(pool.clone());

    let mut handles = Vec::new();
    for i in 0..24 {
        let executor = executor.clone();
        let jitter = rand::thread_rng().gen_range(0..4u64);
        handles.push(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(jitter)).await;
            executor
                .execute(&QuerySpec::positional("SELECT ?", vec![i.into()]))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert!(driver.max_in_flight() <= 3, "max in flight: {}", driver.max_in_flight());
    assert!(driver.opened() <= 3);
    let status = pool.status();
    assert_eq!(status.acquired, 0);
    assert_eq!(status.waiting, 0);
    assert_eq!(status.idle, status.pool_size);
    assert_eq!(driver.log().len(), 24);
}

#[tokio::test]
async fn test_fail_fast_when_not_waiting() {
    let driver = MockDriver::new();
    let pool = pool(
        PoolConfig {
            wait_for_connections: false,
            ..config(2)
        },
        &driver,
    );

    let first = assert_ok!(pool.acquire().await);
    let second = assert_ok!(pool.acquire().await);
    let err = assert_err!(pool.acquire().await);
    assert!(matches!(
        err,
        DbError::Acquisition {
            reason: AcquireFailure::Exhausted,
            ..
        }
    ));
    assert!(err.is_retryable());

    pool.release(first);
    let third = pool.acquire().await.unwrap();
    pool.release(second);
    pool.release(third);
    assert_eq!(pool.status().acquired, 0);
}

#[tokio::test]
async fn test_queue_limit() {
    let driver = MockDriver::new();
    let pool = pool(
        PoolConfig {
            queue_limit: 1,
            acquire_timeout_ms: 0,
            ..config(1)
        },
        &driver,
    );

    let held = pool.acquire().await.unwrap();

    let waiter_pool = pool.clone();
    let waiter = tokio::spawn(async move { waiter_pool.acquire().await });
    while pool.status().waiting == 0 {
        tokio::task::yield_now().await;
    }

    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(
        err,
        DbError::Acquisition {
            reason: AcquireFailure::QueueFull,
            ..
        }
    ));

    pool.release(held);
    let session = waiter.await.unwrap().unwrap();
    pool.release(session);
    assert_eq!(pool.status().waiting, 0);
}

#[tokio::test]
async fn test_acquire_timeout() {
    let driver = MockDriver::new();
    let pool = pool(
        PoolConfig {
            acquire_timeout_ms: 20,
            ..config(1)
        },
        &driver,
    );

    let held = pool.acquire().await.unwrap();
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(
        err,
        DbError::Acquisition {
            reason: AcquireFailure::TimedOut,
            ..
        }
    ));
    pool.release(held);
}

#[tokio::test]
async fn test_cancelled_acquire_returns_its_slot() {
    let driver = MockDriver::new();
    driver.connect_delay(Some(Duration::from_millis(100)));
    let pool = pool(
        PoolConfig {
            acquire_timeout_ms: 0,
            ..config(2)
        },
        &driver,
    );

    let cancelled = tokio::time::timeout(Duration::from_millis(10), pool.acquire()).await;
    assert!(cancelled.is_err());
    assert_eq!(pool.status().acquired, 0);

    driver.connect_delay(None);
    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    let status = pool.status();
    assert_eq!(status.acquired, 2);
    assert!(status.acquired <= status.connection_limit);
    pool.release(a);
    pool.release(b);
    assert_eq!(pool.status().acquired, 0);
}

#[tokio::test]
async fn test_acquire_timeout_covers_slow_connect() {
    let driver = MockDriver::new();
    driver.connect_delay(Some(Duration::from_millis(500)));
    let pool = pool(
        PoolConfig {
            wait_for_connections: false,
            acquire_timeout_ms: 50,
            ..config(1)
        },
        &driver,
    );

    let started = Instant::now();
    let err = pool.acquire().await.unwrap_err();
    assert!(started.elapsed() < Duration::from_millis(400));
    assert!(matches!(
        err,
        DbError::Acquisition {
            reason: AcquireFailure::TimedOut,
            ..
        }
    ));

    // The slot and permit are free again
    let status = pool.status();
    assert_eq!(status.acquired, 0);
    assert_eq!(status.pool_size, 0);
    driver.connect_delay(None);
    let session = assert_ok!(pool.acquire().await);
    pool.release(session);
}

#[tokio::test]
async fn test_connect_failure_frees_capacity() {
    let driver = MockDriver::new();
    let pool = pool(config(1), &driver);

    driver
        .state
        .fail_connect
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(
        err,
        DbError::Acquisition {
            reason: AcquireFailure::Connect,
            ..
        }
    ));
    assert_eq!(pool.status().acquired, 0);

    driver
        .state
        .fail_connect
        .store(false, std::sync::atomic::Ordering::SeqCst);
    let session = pool.acquire().await.unwrap();
    pool.release(session);
    assert_eq!(pool.status().pool_size, 1);
}

#[tokio::test]
async fn test_statement_timeout_destroys_session() {
    let driver = MockDriver::new();
    driver.delay(Duration::from_millis(200));
    let pool = pool(
        PoolConfig {
            statement_timeout_ms: 10,
            ..config(1)
        },
        &driver,
    );
    let executor = QueryExecutor::new(pool.clone());

    let err = executor
        .execute(&QuerySpec::new("SELECT SLEEP(1)"))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Timeout { .. }));
    assert_eq!(driver.closed(), 1);
    assert_eq!(pool.status().idle, 0);
    assert_eq!(pool.status().acquired, 0);
}

#[tokio::test]
async fn test_gauges_reported() {
    let driver = MockDriver::new();
    let gauges = Arc::new(Gauges::default());
    let pool = Pool::with_metrics(config(2), Arc::new(driver.clone()), gauges.clone()).unwrap();

    let session = pool.acquire().await.unwrap();
    pool.release(session);

    let recorded = gauges.0.lock().clone();
    assert_eq!(
        recorded,
        vec![(GAUGE_ACQUIRED, 1), (GAUGE_POOL_SIZE, 1), (GAUGE_ACQUIRED, 0)]
    );
}

#[tokio::test]
async fn test_dropped_session_is_not_recycled() {
    let driver = MockDriver::new();
    let pool = pool(config(1), &driver);

    {
        let _session = pool.acquire().await.unwrap();
    }
    settle().await;

    assert_eq!(driver.closed(), 1);
    let status = pool.status();
    assert_eq!(status.acquired, 0);
    assert_eq!(status.idle, 0);
}

#[tokio::test]
async fn test_close_releases_idle_and_rejects() {
    let driver = MockDriver::new();
    let pool = pool(config(2), &driver);

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    pool.release(a);
    pool.close().await;
    assert_eq!(driver.closed(), 1);

    // A session returned after close is closed, not parked
    pool.release(b);
    settle().await;
    assert_eq!(driver.closed(), 2);
    assert_eq!(pool.status().idle, 0);

    assert_err!(pool.acquire().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_release_racing_close_never_parks() {
    let driver = MockDriver::new();
    let pool = pool(config(8), &driver);

    let mut sessions = Vec::new();
    for _ in 0..8 {
        sessions.push(pool.acquire().await.unwrap());
    }

    let mut handles = Vec::new();
    for session in sessions {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move { pool.release(session) }));
    }
    pool.close().await;
    for handle in handles {
        handle.await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(pool.status().idle, 0);
    assert_eq!(driver.closed(), 8);
    assert_eq!(pool.status().acquired, 0);
}
