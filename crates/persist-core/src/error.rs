//! Error types for persistence operations.

use std::fmt;

/// The primary error type for all persistence operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (open, disconnect)
    Connection(ConnectionError),
    /// Database errors raised while executing SQL
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction state errors
    Transaction(TransactionError),
    /// Configuration and property errors
    Config(ConfigError),
    /// Caller misuse of the API (bad arguments, wrong state)
    Usage(UsageError),
    /// JPQL parse errors
    Parse(ParseError),
    /// Optimistic version conflict detected at flush
    OptimisticLock(OptimisticLockError),
    /// Pessimistic lock could not be acquired in time; the transaction stays usable
    LockTimeout(QueryError),
    /// Pessimistic lock failure that requires rollback
    PessimisticLock(QueryError),
    /// The shared cache is in a state the operation cannot work with
    CacheState(String),
    /// Serialization/deserialization errors
    Serde(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to open the database
    Connect,
    /// Connection lost during operation
    Disconnected,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<usize>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Permission denied
    Permission,
    /// Data too large for column
    DataTruncation,
    /// Deadlock or busy database
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Statement timeout
    Timeout,
    /// Lock not available (NOWAIT / lock timeout)
    LockNotAvailable,
    /// Interrupted
    Cancelled,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// A transaction is already active
    AlreadyActive,
    /// No transaction is active
    NotActive,
    /// The unit of work was already committed or released
    Closed,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// Misuse of the API: invalid arguments or an operation issued in the wrong state.
#[derive(Debug)]
pub struct UsageError {
    pub kind: UsageErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageErrorKind {
    /// An argument was missing, extra, or of the wrong type
    IllegalArgument,
    /// The operation is not valid in the current state
    IllegalState,
    /// A named query, entity, or attribute does not exist
    NotFound,
}

#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    pub query: String,
    /// Byte offset into `query`
    pub position: usize,
}

#[derive(Debug)]
pub struct OptimisticLockError {
    pub entity: String,
    pub primary_key: String,
    pub expected_version: Option<i64>,
    pub message: String,
}

impl Error {
    /// Build an illegal-argument usage error.
    pub fn illegal_argument(message: impl Into<String>) -> Self {
        Error::Usage(UsageError {
            kind: UsageErrorKind::IllegalArgument,
            message: message.into(),
        })
    }

    /// Build an illegal-state usage error.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Error::Usage(UsageError {
            kind: UsageErrorKind::IllegalState,
            message: message.into(),
        })
    }

    /// Build a not-found usage error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Error::Usage(UsageError {
            kind: UsageErrorKind::NotFound,
            message: message.into(),
        })
    }

    /// Build a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }

    /// Is this a retryable error (deadlock, serialization, lock timeout)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization | QueryErrorKind::Timeout
            ),
            Error::LockTimeout(_) => true,
            _ => false,
        }
    }

    /// Did this error originate in the database?
    pub fn is_database_error(&self) -> bool {
        matches!(
            self,
            Error::Query(_) | Error::LockTimeout(_) | Error::PessimisticLock(_)
        )
    }

    /// Must the surrounding transaction be rolled back after this error?
    ///
    /// A lock timeout leaves the transaction usable; everything else that
    /// reached the database or the version check does not.
    pub fn requires_rollback(&self) -> bool {
        !matches!(
            self,
            Error::LockTimeout(_) | Error::Parse(_) | Error::Config(_)
        )
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) | Error::LockTimeout(q) | Error::PessimisticLock(q) => {
                q.sqlstate.as_deref()
            }
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) | Error::LockTimeout(q) | Error::PessimisticLock(q) => {
                q.sql.as_deref()
            }
            _ => None,
        }
    }

    /// The usage error kind, if this is a usage error.
    pub fn usage_kind(&self) -> Option<UsageErrorKind> {
        match self {
            Error::Usage(u) => Some(u.kind),
            _ => None,
        }
    }
}

impl QueryError {
    /// Create a plain database error with a message.
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            sql: None,
            sqlstate: None,
            message: message.into(),
            detail: None,
            hint: None,
            position: None,
            source: None,
        }
    }

    /// Attach the SQL text.
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23503")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Usage(e) => write!(f, "{}", e),
            Error::Parse(e) => write!(f, "{}", e),
            Error::OptimisticLock(e) => write!(f, "Optimistic lock failure: {}", e),
            Error::LockTimeout(e) => write!(f, "Lock timeout: {}", e.message),
            Error::PessimisticLock(e) => write!(f, "Pessimistic lock failure: {}", e.message),
            Error::CacheState(msg) => write!(f, "Cache state error: {}", msg),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) | Error::LockTimeout(e) | Error::PessimisticLock(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.kind {
            UsageErrorKind::IllegalArgument => "Illegal argument",
            UsageErrorKind::IllegalState => "Illegal state",
            UsageErrorKind::NotFound => "Not found",
        };
        write!(f, "{}: {}", label, self.message)
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Parse error at offset {} in '{}': {}",
            self.position, self.query, self.message
        )
    }
}

impl fmt::Display for OptimisticLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.expected_version {
            Some(v) => write!(
                f,
                "{} [{}] expected version {}: {}",
                self.entity, self.primary_key, v, self.message
            ),
            None => write!(f, "{} [{}]: {}", self.entity, self.primary_key, self.message),
        }
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<UsageError> for Error {
    fn from(err: UsageError) -> Self {
        Error::Usage(err)
    }
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Error::Parse(err)
    }
}

impl From<OptimisticLockError> for Error {
    fn from(err: OptimisticLockError) -> Self {
        Error::OptimisticLock(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for persistence operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_helpers() {
        let query = QueryError {
            kind: QueryErrorKind::Constraint,
            sql: Some("SELECT 1".to_string()),
            sqlstate: Some("23505".to_string()),
            message: "unique violation".to_string(),
            detail: None,
            hint: None,
            position: None,
            source: None,
        };

        assert!(query.is_unique_violation());
        assert!(!query.is_foreign_key_violation());

        let err = Error::Query(query);
        assert_eq!(err.sqlstate(), Some("23505"));
        assert_eq!(err.sql(), Some("SELECT 1"));
        assert!(err.is_database_error());
    }

    #[test]
    fn lock_timeout_keeps_transaction() {
        let timeout = Error::LockTimeout(QueryError::new(
            QueryErrorKind::LockNotAvailable,
            "could not obtain lock",
        ));
        assert!(timeout.is_retryable());
        assert!(!timeout.requires_rollback());

        let pessimistic = Error::PessimisticLock(QueryError::new(
            QueryErrorKind::Deadlock,
            "deadlock detected",
        ));
        assert!(pessimistic.requires_rollback());
        assert!(pessimistic.is_database_error());
    }

    #[test]
    fn usage_constructors_carry_kind() {
        let err = Error::illegal_argument("expected 2 arguments, got 1");
        assert_eq!(err.usage_kind(), Some(UsageErrorKind::IllegalArgument));
        assert_eq!(
            err.to_string(),
            "Illegal argument: expected 2 arguments, got 1"
        );
        assert_eq!(
            Error::illegal_state("closed").usage_kind(),
            Some(UsageErrorKind::IllegalState)
        );
        assert!(Error::config("bad").usage_kind().is_none());
    }

    #[test]
    fn optimistic_lock_display() {
        let err = Error::OptimisticLock(OptimisticLockError {
            entity: "Employee".to_string(),
            primary_key: "[7]".to_string(),
            expected_version: Some(3),
            message: "row was updated or deleted by another transaction".to_string(),
        });
        let text = err.to_string();
        assert!(text.contains("Employee"));
        assert!(text.contains("expected version 3"));
    }
}
