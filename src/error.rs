//! Error types for the DB connector.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Errors that carry SQL text can be rendered through [`DbError::redacted`] so that
//! bound literal values never reach the logs.

use crate::instrument::{redact_message, redact_sql};
use std::fmt;
use thiserror::Error;

/// Why a session could not be handed out by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireFailure {
    /// At capacity and the pool is configured not to wait.
    Exhausted,
    /// At capacity and the wait queue is full.
    QueueFull,
    /// Waited longer than `acquire_timeout_ms`.
    TimedOut,
    /// The pool has been closed.
    Closed,
    /// The connector could not open a new physical connection.
    Connect,
}

impl fmt::Display for AcquireFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted => write!(f, "pool exhausted"),
            Self::QueueFull => write!(f, "queue limit reached"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Closed => write!(f, "pool closed"),
            Self::Connect => write!(f, "connect failed"),
        }
    }
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Acquisition failed ({reason}): {message}")]
    Acquisition {
        reason: AcquireFailure,
        message: String,
    },

    #[error("Connection error: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Statement failed: {message}")]
    Statement {
        message: String,
        /// e.g., "42S02" for unknown table
        sql_state: Option<String>,
        /// Rendered SQL, may contain bound values - log only via `redacted()`
        sql: Option<String>,
    },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Transaction {transaction_id} aborted: {source}")]
    TransactionAborted {
        transaction_id: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("Rollback of transaction {transaction_id} failed: {source}")]
    RollbackFailed {
        transaction_id: String,
        #[source]
        source: Box<DbError>,
        /// The statement error that triggered the rollback.
        statement_error: Box<DbError>,
    },

    #[error("Commit of transaction {transaction_id} failed: {source}")]
    CommitFailed {
        transaction_id: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Health check failed: {message}")]
    HealthCheck {
        message: String,
        #[source]
        source: Option<Box<DbError>>,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create an acquisition error.
    pub fn acquisition(reason: AcquireFailure, message: impl Into<String>) -> Self {
        Self::Acquisition {
            reason,
            message: message.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a statement error with optional SQL state.
    pub fn statement(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Statement {
            message: message.into(),
            sql_state,
            sql: None,
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms,
        }
    }

    pub fn transaction_aborted(transaction_id: impl Into<String>, source: DbError) -> Self {
        Self::TransactionAborted {
            transaction_id: transaction_id.into(),
            source: Box::new(source),
        }
    }

    pub fn rollback_failed(
        transaction_id: impl Into<String>,
        source: DbError,
        statement_error: DbError,
    ) -> Self {
        Self::RollbackFailed {
            transaction_id: transaction_id.into(),
            source: Box::new(source),
            statement_error: Box::new(statement_error),
        }
    }

    pub fn commit_failed(transaction_id: impl Into<String>, source: DbError) -> Self {
        Self::CommitFailed {
            transaction_id: transaction_id.into(),
            source: Box::new(source),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a health check error, optionally wrapping the driver error behind it.
    pub fn health_check(message: impl Into<String>, source: Option<DbError>) -> Self {
        Self::HealthCheck {
            message: message.into(),
            source: source.map(Box::new),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Attach the rendered SQL to a statement error. Other variants are returned as-is.
    pub fn with_sql(self, sql: impl Into<String>) -> Self {
        match self {
            Self::Statement {
                message, sql_state, ..
            } => Self::Statement {
                message,
                sql_state,
                sql: Some(sql.into()),
            },
            other => other,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Acquisition {
                reason: AcquireFailure::Exhausted | AcquireFailure::QueueFull,
                ..
            } => Some("Raise connection_limit/queue_limit or retry later"),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// The engine itself never retries; this is a hint for the caller's policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Acquisition {
                reason: AcquireFailure::Exhausted
                    | AcquireFailure::QueueFull
                    | AcquireFailure::TimedOut
                    | AcquireFailure::Connect,
                ..
            } | Self::Connection { .. }
                | Self::Timeout { .. }
        )
    }

    /// Whether the pool refused or failed to hand out a session.
    pub fn is_acquisition_failure(&self) -> bool {
        matches!(self, Self::Acquisition { .. })
    }

    /// A view of this error that is safe to log: SQL literals are masked.
    pub fn redacted(&self) -> Redacted<'_> {
        Redacted(self)
    }
}

/// Log-safe rendering of a [`DbError`].
pub struct Redacted<'a>(&'a DbError);

impl fmt::Display for Redacted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            DbError::Statement {
                message,
                sql_state,
                sql,
            } => {
                write!(f, "Statement failed: {}", redact_message(message))?;
                if let Some(code) = sql_state {
                    write!(f, " (SQLSTATE: {})", code)?;
                }
                if let Some(sql) = sql {
                    write!(f, " [sql: {}]", redact_sql(sql))?;
                }
                Ok(())
            }
            DbError::TransactionAborted {
                transaction_id,
                source,
            } => write!(
                f,
                "Transaction {} aborted: {}",
                transaction_id,
                source.redacted()
            ),
            DbError::RollbackFailed {
                transaction_id,
                source,
                statement_error,
            } => write!(
                f,
                "Rollback of transaction {} failed: {} (after: {})",
                transaction_id,
                source.redacted(),
                statement_error.redacted()
            ),
            DbError::CommitFailed {
                transaction_id,
                source,
            } => write!(
                f,
                "Commit of transaction {} failed: {}",
                transaction_id,
                source.redacted()
            ),
            DbError::HealthCheck {
                message,
                source: Some(source),
            } => write!(f, "Health check failed: {}: {}", message, source.redacted()),
            other => write!(f, "{}", other),
        }
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::configuration(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::statement(db_err.message(), code)
            }
            sqlx::Error::RowNotFound => DbError::statement("No rows returned", None),
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::statement(format!("Column not found: {}", col), None)
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
