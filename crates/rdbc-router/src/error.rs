//! Error types for rdbc-router
//!
//! Single-target calls (exec, query, begin) pass the driver's error through
//! unchanged. Fan-out calls (open, close, ping, prepare) aggregate per-target
//! failures into one value:
//! - exactly one failure is returned as-is
//! - several failures are returned as [`Error::Multiple`], in target order

use std::fmt;
use thiserror::Error;

/// Result type for rdbc-router operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed source error carried by driver-facing variants
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Router construction errors (not retriable)
    Construction,
    /// Connection-related errors (retriable)
    Connection,
    /// Statement preparation errors
    Preparation,
    /// Query execution errors
    Query,
    /// Transaction errors
    Transaction,
    /// Use of a closed router or statement (not retriable)
    Closed,
    /// Timeout errors (retriable)
    Timeout,
    /// Caller cancelled the operation
    Cancelled,
    /// Configuration error
    Configuration,
    /// Pool exhausted (retriable with backoff)
    PoolExhausted,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::Timeout | Self::PoolExhausted)
    }
}

/// A failure attributed to one target of a fan-out operation.
///
/// Index 0 is the primary, index `i > 0` is replica `i - 1`.
#[derive(Debug)]
pub struct TargetError {
    /// Position of the target in the connection set
    pub index: usize,
    /// The target's own error
    pub error: Error,
}

impl fmt::Display for TargetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.index == 0 {
            write!(f, "primary: {}", self.error)
        } else {
            write!(f, "replica {}: {}", self.index - 1, self.error)
        }
    }
}

/// Main error type for rdbc-router
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// No primary connection was supplied
    #[error("construction error: {message}")]
    Construction { message: String },

    /// Opening or pinging a target failed
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Preparing a statement on a target failed
    #[error("preparation error: {message}")]
    Preparation {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<BoxError>,
    },

    /// Query execution failed
    #[error("query error: {message}")]
    Query {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<BoxError>,
    },

    /// Transaction error
    #[error("transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Operation on a closed statement
    #[error("statement is closed")]
    StatementClosed,

    /// Operation on a closed router or database handle
    #[error("database is closed")]
    Closed,

    /// Operation timed out
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Operation cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Connection pool exhausted
    #[error("pool exhausted: {message}")]
    PoolExhausted { message: String },

    /// Several targets of a fan-out operation failed
    #[error("{} targets failed: {}", errors.len(), join_target_errors(errors))]
    Multiple { errors: Vec<TargetError> },

    /// Unsupported operation for this driver
    #[error("unsupported: {message}")]
    Unsupported { message: String },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

fn join_target_errors(errors: &[TargetError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Get the error category
    ///
    /// An aggregate reports the category of its first failure.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Construction { .. } => ErrorCategory::Construction,
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Preparation { .. } => ErrorCategory::Preparation,
            Self::Query { .. } => ErrorCategory::Query,
            Self::Transaction { .. } => ErrorCategory::Transaction,
            Self::StatementClosed | Self::Closed => ErrorCategory::Closed,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::PoolExhausted { .. } => ErrorCategory::PoolExhausted,
            Self::Multiple { errors } => errors
                .first()
                .map(|e| e.error.category())
                .unwrap_or(ErrorCategory::Other),
            Self::Unsupported { .. } | Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Create a construction error
    pub fn construction(message: impl Into<String>) -> Self {
        Self::Construction {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a preparation error for the given SQL
    pub fn preparation(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Preparation {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Create a preparation error wrapping the target's failure
    pub fn preparation_with_source(
        message: impl Into<String>,
        sql: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Preparation {
            message: message.into(),
            sql: Some(sql.into()),
            source: Some(Box::new(source)),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create a query error with SQL
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            source: None,
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a pool exhausted error
    pub fn pool_exhausted(message: impl Into<String>) -> Self {
        Self::PoolExhausted {
            message: message.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Fold per-target failures into a single error.
    ///
    /// Returns `None` for an empty list, the error itself for a single
    /// failure and [`Error::Multiple`] otherwise.
    pub fn aggregate(mut errors: Vec<TargetError>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop().map(|e| e.error),
            _ => {
                errors.sort_by_key(|e| e.index);
                Some(Self::Multiple { errors })
            }
        }
    }

    /// Per-target failures of an aggregate, or an empty slice
    pub fn target_errors(&self) -> &[TargetError] {
        match self {
            Self::Multiple { errors } => errors,
            _ => &[],
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Construction => write!(f, "construction"),
            Self::Connection => write!(f, "connection"),
            Self::Preparation => write!(f, "preparation"),
            Self::Query => write!(f, "query"),
            Self::Transaction => write!(f, "transaction"),
            Self::Closed => write!(f, "closed"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Configuration => write!(f, "configuration"),
            Self::PoolExhausted => write!(f, "pool_exhausted"),
            Self::Other => write!(f, "other"),
        }
    }
}
