//! Database connection trait and SQL dialects.
//!
//! - [`Connection`] - synchronous statement execution and transaction control
//! - [`Dialect`] - placeholder syntax, identifier quoting and lock clauses
//! - [`LockMode`] - pessimistic locking requested by a query
//!
//! Query execution blocks the calling thread for the duration of the database
//! call; there is no asynchronous path.

use crate::error::{Error, QueryError, QueryErrorKind, Result};
use crate::row::Row;
use crate::value::Value;
use std::time::Duration;

/// SQL dialect spoken by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    #[default]
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier for this dialect.
    ///
    /// Embedded quote characters are doubled.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => {
                let escaped = name.replace('"', "\"\"");
                format!("\"{}\"", escaped)
            }
            Dialect::Mysql => {
                let escaped = name.replace('`', "``");
                format!("`{}`", escaped)
            }
        }
    }

    /// Whether `SELECT ... FOR UPDATE` is understood.
    pub const fn supports_for_update(self) -> bool {
        !matches!(self, Dialect::Sqlite)
    }

    /// The trailing lock clause for a locking read, if the dialect has one.
    pub fn lock_clause(self, mode: LockMode) -> Option<&'static str> {
        if !self.supports_for_update() {
            return None;
        }
        match mode {
            LockMode::None => None,
            LockMode::Pessimistic => Some(" FOR UPDATE"),
            LockMode::PessimisticNoWait => match self {
                Dialect::Postgres | Dialect::Mysql => Some(" FOR UPDATE NOWAIT"),
                Dialect::Sqlite => None,
            },
        }
    }

    /// Statement used to invoke a stored procedure with `arity` arguments.
    pub fn procedure_call(self, name: &str, arity: usize) -> String {
        let args: Vec<String> = (1..=arity).map(|i| self.placeholder(i)).collect();
        match self {
            Dialect::Postgres | Dialect::Mysql => format!("CALL {}({})", name, args.join(", ")),
            Dialect::Sqlite => format!("SELECT {}({})", name, args.join(", ")),
        }
    }

    /// Classify a database error raised by a pessimistic-lock query.
    ///
    /// Lock timeouts are recoverable and leave the transaction usable; any
    /// other failure of a locking statement is a pessimistic lock failure.
    pub fn classify_lock_error(self, err: Error) -> Error {
        let Error::Query(q) = err else {
            return err;
        };
        let is_timeout = matches!(
            q.kind,
            QueryErrorKind::LockNotAvailable | QueryErrorKind::Timeout
        ) || q.sqlstate.as_deref() == Some("55P03")
            || (self == Dialect::Mysql && q.sqlstate.as_deref() == Some("HY000"));
        if is_timeout {
            tracing::debug!(message = %q.message, "Classified lock failure as lock timeout");
            Error::LockTimeout(q)
        } else {
            tracing::debug!(kind = ?q.kind, message = %q.message, "Classified lock failure as pessimistic lock");
            Error::PessimisticLock(q)
        }
    }
}

/// Pessimistic lock requested for a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    #[default]
    None,
    /// `FOR UPDATE`
    Pessimistic,
    /// `FOR UPDATE NOWAIT`
    PessimisticNoWait,
}

/// A database connection capable of executing statements.
///
/// Implementations must be `Send + Sync`; the session layer shares one
/// connection across threads and serializes writers itself.
pub trait Connection: Send + Sync {
    /// The SQL dialect this connection speaks.
    fn dialect(&self) -> Dialect;

    /// Execute a query and return all rows.
    ///
    /// `timeout` bounds a single statement; `None` means no limit.
    fn query(&self, sql: &str, params: &[Value], timeout: Option<Duration>) -> Result<Vec<Row>>;

    /// Execute a statement (INSERT, UPDATE, DELETE) and return rows affected.
    fn execute(&self, sql: &str, params: &[Value], timeout: Option<Duration>) -> Result<u64>;

    /// Like [`Connection::query`], reusing a compiled statement when the
    /// driver keeps a statement cache.
    fn query_cached(
        &self,
        sql: &str,
        params: &[Value],
        timeout: Option<Duration>,
    ) -> Result<Vec<Row>> {
        self.query(sql, params, timeout)
    }

    /// Like [`Connection::execute`], reusing a compiled statement when the
    /// driver keeps a statement cache.
    fn execute_cached(&self, sql: &str, params: &[Value], timeout: Option<Duration>) -> Result<u64> {
        self.execute(sql, params, timeout)
    }

    /// Execute an INSERT and return the generated row id.
    fn insert(&self, sql: &str, params: &[Value]) -> Result<i64>;

    /// Begin a transaction.
    fn begin(&self) -> Result<()>;

    /// Commit the current transaction.
    fn commit(&self) -> Result<()>;

    /// Roll back the current transaction.
    fn rollback(&self) -> Result<()>;

    /// Whether a transaction is currently open on this connection.
    fn in_transaction(&self) -> bool;
}

/// Build the error for a statement that ran past its timeout.
pub fn timeout_error(sql: &str, timeout: Duration) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Timeout,
        sql: Some(sql.to_string()),
        sqlstate: Some("57014".to_string()),
        message: format!("statement exceeded timeout of {} ms", timeout.as_millis()),
        detail: None,
        hint: None,
        position: None,
        source: None,
    })
}
