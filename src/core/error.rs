//! Error types for the database layer
//!
//! Every fallible operation returns [`Result`]. Raw backend failures are only
//! turned into [`DatabaseError::Query`] at the connection's query choke point,
//! so callers see one uniform classification regardless of the backend.

use std::fmt;

/// Result type alias for database operations
pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Classification of a failed statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryErrorKind {
    /// The transaction was chosen as a deadlock victim
    Deadlock,
    /// Waiting for a row or table lock timed out
    LockWaitTimeout,
    /// The statement exceeded its execution time limit
    QueryTimeout,
    /// The server refused a write because it is read-only
    ReadOnly,
    /// The connection dropped while the statement ran
    ConnectionLost,
    /// Any other SQL or schema error
    Other,
}

impl QueryErrorKind {
    /// Whether a caller may sensibly retry the whole unit of work
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QueryErrorKind::Deadlock | QueryErrorKind::LockWaitTimeout | QueryErrorKind::QueryTimeout
        )
    }
}

impl fmt::Display for QueryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryErrorKind::Deadlock => "deadlock",
            QueryErrorKind::LockWaitTimeout => "lock wait timeout",
            QueryErrorKind::QueryTimeout => "query timeout",
            QueryErrorKind::ReadOnly => "read-only",
            QueryErrorKind::ConnectionLost => "connection lost",
            QueryErrorKind::Other => "error",
        };
        f.write_str(name)
    }
}

/// Error types for database operations
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// The connection could not be established or restored
    #[error("Connection error ({server}): {message}")]
    Connection {
        server: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A documented precondition was violated by the caller
    #[error("{0}")]
    Expected(String),

    /// A statement failed
    #[error("Query error ({kind}, code {errno}) from {fname}: {message} [query: {sql}]")]
    Query {
        kind: QueryErrorKind,
        errno: String,
        message: String,
        sql: String,
        fname: String,
    },

    /// Programmer or configuration error
    #[error("Unexpected: {0}")]
    Unexpected(String),
}

impl DatabaseError {
    /// Create a connection error for the given server
    pub fn connection(server: impl Into<String>, message: impl Into<String>) -> Self {
        DatabaseError::Connection {
            server: server.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with its underlying cause
    pub fn connection_with_source(
        server: impl Into<String>,
        message: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        DatabaseError::Connection {
            server: server.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a precondition error
    pub fn expected<S: Into<String>>(msg: S) -> Self {
        DatabaseError::Expected(msg.into())
    }

    /// Create a statement error
    pub fn query(
        kind: QueryErrorKind,
        errno: impl Into<String>,
        message: impl Into<String>,
        sql: impl Into<String>,
        fname: impl Into<String>,
    ) -> Self {
        DatabaseError::Query {
            kind,
            errno: errno.into(),
            message: message.into(),
            sql: sql.into(),
            fname: fname.into(),
        }
    }

    /// Create a programmer/configuration error
    pub fn unexpected<S: Into<String>>(msg: S) -> Self {
        DatabaseError::Unexpected(msg.into())
    }

    /// The statement classification, for query errors
    pub fn query_kind(&self) -> Option<QueryErrorKind> {
        match self {
            DatabaseError::Query { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Whether this is a statement failure (the only kind `try_silently` swallows)
    pub fn is_query_error(&self) -> bool {
        matches!(self, DatabaseError::Query { .. })
    }

    /// Whether the caller may retry the unit of work that produced this error
    pub fn is_retryable(&self) -> bool {
        self.query_kind().is_some_and(|kind| kind.is_retryable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = DatabaseError::connection("localhost", "refused");
        assert!(matches!(err, DatabaseError::Connection { .. }));

        let err = DatabaseError::expected("nested transaction");
        assert!(matches!(err, DatabaseError::Expected(_)));

        let err = DatabaseError::query(QueryErrorKind::Other, "1", "syntax", "SELEC 1", "test");
        assert!(err.is_query_error());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = DatabaseError::connection("db1", "Connection refused");
        assert_eq!(err.to_string(), "Connection error (db1): Connection refused");

        let err = DatabaseError::query(
            QueryErrorKind::Deadlock,
            "1213",
            "Deadlock found",
            "UPDATE t SET v = 1",
            "caller",
        );
        assert_eq!(
            err.to_string(),
            "Query error (deadlock, code 1213) from caller: Deadlock found [query: UPDATE t SET v = 1]"
        );
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(QueryErrorKind::Deadlock.is_retryable());
        assert!(QueryErrorKind::LockWaitTimeout.is_retryable());
        assert!(QueryErrorKind::QueryTimeout.is_retryable());
        assert!(!QueryErrorKind::ReadOnly.is_retryable());
        assert!(!QueryErrorKind::Other.is_retryable());
        assert!(!DatabaseError::unexpected("x").is_retryable());
    }
}
