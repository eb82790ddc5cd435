//! Data models for the DB connector.
//!
//! This module re-exports all model types used throughout the engine.

pub mod query;

// Re-export commonly used types
pub use query::{
    NamedValues, Params, QueryOptions, QuerySpec, ResultSet, Row, SqlValue, TransactionSpec,
};
