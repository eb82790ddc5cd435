//! DB Connector Library
//!
//! A pooled MySQL query engine: parameter binding, single and multi-statement
//! execution, transactions, row streaming and health checks, all instrumented
//! through a pluggable timing contract.

pub mod config;
pub mod db;
pub mod error;
pub mod instrument;
pub mod models;

pub use config::{Config, PoolConfig};
pub use db::{Pool, QueryExecutor, TransactionManager};
pub use error::{DbError, DbResult};
