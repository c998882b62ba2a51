//! Error types for atomic-pg.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Statement-building errors (`UnsupportedOperator`, `EmptyColumnSet`, ...) are raised
//! before any connection is touched; driver failures arrive through `From<sqlx::Error>`.

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Unsupported filter operator in key '{key}'")]
    UnsupportedOperator { key: String },

    #[error("Invalid value for filter '{key}': {reason}")]
    InvalidFilterValue { key: String, reason: String },

    #[error("Cannot bind parameter ${position} as {target}: {reason}")]
    InvalidParameter {
        position: usize,
        target: String,
        reason: String,
    },

    #[error("Invalid SQL identifier: '{name}'")]
    InvalidIdentifier { name: String },

    #[error("No columns supplied for {operation} on '{table}'")]
    EmptyColumnSet { operation: String, table: String },

    #[error(
        "Refusing to delete from '{table}' without filters. Use delete_all to remove every row."
    )]
    MissingPredicate { table: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error(
        "Timeout: {operation}{}",
        .elapsed_secs.map(|s| format!(" exceeded {s}s")).unwrap_or_default()
    )]
    Timeout {
        operation: String,
        /// The configured limit, when the error site knows it
        elapsed_secs: Option<u64>,
    },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn unsupported_operator(key: impl Into<String>) -> Self {
        Self::UnsupportedOperator { key: key.into() }
    }

    pub fn invalid_filter_value(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidFilterValue {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_parameter(
        position: usize,
        target: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidParameter {
            position,
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_identifier(name: impl Into<String>) -> Self {
        Self::InvalidIdentifier { name: name.into() }
    }

    pub fn empty_column_set(operation: impl Into<String>, table: impl Into<String>) -> Self {
        Self::EmptyColumnSet {
            operation: operation.into(),
            table: table.into(),
        }
    }

    pub fn missing_predicate(table: impl Into<String>) -> Self {
        Self::MissingPredicate {
            table: table.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs: Some(elapsed_secs),
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable snake_case name of the variant, used in failure reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::UnsupportedOperator { .. } => "unsupported_operator",
            Self::InvalidFilterValue { .. } => "invalid_filter_value",
            Self::InvalidParameter { .. } => "invalid_parameter",
            Self::InvalidIdentifier { .. } => "invalid_identifier",
            Self::EmptyColumnSet { .. } => "empty_column_set",
            Self::MissingPredicate { .. } => "missing_predicate",
            Self::Connection { .. } => "connection_error",
            Self::Database { .. } => "database_error",
            Self::Timeout { .. } => "timeout",
            Self::Transaction { .. } => "transaction_error",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// SQLSTATE reported by the server, if any.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Database { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// True for malformed statement requests. These are never worth retrying.
    pub fn is_statement_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedOperator { .. }
                | Self::InvalidFilterValue { .. }
                | Self::InvalidParameter { .. }
                | Self::InvalidIdentifier { .. }
                | Self::EmptyColumnSet { .. }
                | Self::MissingPredicate { .. }
        )
    }

    /// Check if this error is retryable by a higher-level caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection settings and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            // The pool's own acquire path reports the configured limit; here it is unknown.
            sqlx::Error::PoolTimedOut => DbError::Timeout {
                operation: "connection pool acquire".to_string(),
                elapsed_secs: None,
            },
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Recreate the adapter")
            }
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
            sqlx::Error::ColumnNotFound(col) => DbError::database(
                format!("Column not found: {}", col),
                None,
                "Check the selected column names",
            ),
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

/// Structured form of a failure, returned by reporting atomic scopes
/// instead of an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReport {
    /// Error kind, see [`DbError::kind`].
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql_state: Option<String>,
}

impl From<&DbError> for FailureReport {
    fn from(err: &DbError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            sql_state: err.sql_state().map(String::from),
        }
    }
}
