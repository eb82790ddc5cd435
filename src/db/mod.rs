//! Pooled query engine.
//!
//! This module provides:
//! - Parameter binding and literal escaping
//! - The driver seam and the MySQL driver
//! - Connection pooling with release/destroy discipline
//! - Single statement, batch, transactional and streaming execution
//! - Health checks

pub mod driver;
pub mod executor;
pub mod health;
pub mod mysql;
pub mod params;
pub mod pool;
pub mod streaming;
pub mod transaction;
pub mod types;

pub use driver::{Connection, Connector};
pub use executor::{DEFAULT_LABEL, QueryExecutor, build_batch_script};
pub use health::{CANARY_SQL, HealthChecker, HealthProbe, HealthRegistry, HealthReport, SourceHealth};
pub use mysql::MySqlConnector;
pub use pool::{Pool, PoolStatus, Session};
pub use streaming::{StreamingExecutor, StreamingQuery};
pub use transaction::TransactionManager;
