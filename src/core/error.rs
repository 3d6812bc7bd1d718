//! Error types.
//!
//! `KvsqlError` is the error surface of the library. Optimistic concurrency
//! violations (`NotFound`, `RevisionMismatch`) are distinguished values the
//! caller must handle; only storage contention (`Locked`) is ever retried
//! automatically.

use thiserror::Error;

/// Common kvsql error conditions.
#[derive(Debug, Error)]
pub enum KvsqlError {
    /// A revision was expected but the key has no live row.
    #[error("key not found: {key}")]
    NotFound { key: String },

    /// The expected revision is stale.
    #[error("revision mismatch for {key}: expected {expected}, actual {actual}")]
    RevisionMismatch {
        key: String,
        expected: i64,
        actual: i64,
    },

    /// The caller misused an operation (e.g. a wildcard delete).
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Transient "database is locked" contention.
    #[error("database locked: {message}")]
    Locked { message: String },

    /// Any other storage failure.
    #[error("sql error: {message}")]
    Sql { message: String },

    /// The write committed but the watch notification could not be delivered.
    #[error("notification failed: {message}")]
    Notification { message: String },

    /// HTTP protocol upgrade failed.
    #[error("upgrade failed: {message}")]
    Upgrade { message: String },

    /// Administrative membership call failed.
    #[error("membership: {message}")]
    Membership { message: String },

    /// No member of the node store knows the leader.
    #[error("no leader found")]
    NoLeader,

    /// An operation exceeded its deadline.
    #[error("{operation} timed out")]
    Timeout { operation: String },

    /// TLS configuration or handshake failure.
    #[error("tls: {message}")]
    Tls { message: String },

    /// HTTP transport failure.
    #[error("http: {message}")]
    Http { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl KvsqlError {
    /// Create an InvalidArgument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a Membership error.
    pub fn membership(message: impl Into<String>) -> Self {
        Self::Membership {
            message: message.into(),
        }
    }

    /// Create an Upgrade error.
    pub fn upgrade(message: impl Into<String>) -> Self {
        Self::Upgrade {
            message: message.into(),
        }
    }

    /// Create a Notification error.
    pub fn notification(message: impl Into<String>) -> Self {
        Self::Notification {
            message: message.into(),
        }
    }

    /// Create a Timeout error.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create an Http error.
    pub fn http(message: impl Into<String>) -> Self {
        Self::Http {
            message: message.into(),
        }
    }

    /// Create a Tls error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::Tls {
            message: message.into(),
        }
    }

    /// Check if this error indicates the operation should be retried.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }

    /// Check if this error is an optimistic concurrency violation.
    pub fn is_concurrency_violation(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::RevisionMismatch { .. })
    }
}

impl From<rusqlite::Error> for KvsqlError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => Self::Locked {
                message: err.to_string(),
            },
            _ => Self::Sql {
                message: err.to_string(),
            },
        }
    }
}

impl From<hyper::Error> for KvsqlError {
    fn from(err: hyper::Error) -> Self {
        Self::http(err.to_string())
    }
}

impl From<rustls::Error> for KvsqlError {
    fn from(err: rustls::Error) -> Self {
        Self::tls(err.to_string())
    }
}

/// Result type using KvsqlError.
pub type KvsqlResult<T> = Result<T, KvsqlError>;
