//! SQLite connection implementation.
//!
//! Safe wrappers around SQLite's C API implementing the persist
//! [`Connection`] trait. One handle is shared behind a mutex; statement
//! timeouts are enforced with a progress handler and compiled statements can
//! be kept in a small per-connection cache.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::borrow_as_ptr)]

use crate::ffi;
use crate::types;
use persist_core::sync;
use persist_core::{
    ColumnInfo, Connection, ConnectionError, ConnectionErrorKind, Dialect, Error, QueryError,
    QueryErrorKind, Result, Row, TransactionError, TransactionErrorKind, Value, timeout_error,
};
use std::collections::HashMap;
use std::ffi::{CStr, CString, c_int};
use std::ptr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Configuration for opening SQLite connections.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Path to the database file, or ":memory:".
    pub path: String,
    pub flags: OpenFlags,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: u32,
    /// Compiled statements kept for the `*_cached` calls.
    pub statement_cache_size: usize,
    pub begin: BeginMode,
    /// Run `PRAGMA foreign_keys = ON` after opening.
    pub foreign_keys: bool,
}

/// Flags controlling how the database is opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub read_only: bool,
    pub read_write: bool,
    /// Create the database if it doesn't exist.
    pub create: bool,
    /// Interpret the path as a URI.
    pub uri: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Default::default()
        }
    }

    pub fn read_write() -> Self {
        Self {
            read_write: true,
            ..Default::default()
        }
    }

    pub fn create_read_write() -> Self {
        Self {
            read_write: true,
            create: true,
            ..Default::default()
        }
    }

    fn to_sqlite_flags(self) -> c_int {
        let mut flags = 0;
        if self.read_only {
            flags |= ffi::SQLITE_OPEN_READONLY;
        }
        if self.read_write {
            flags |= ffi::SQLITE_OPEN_READWRITE;
        }
        if self.create {
            flags |= ffi::SQLITE_OPEN_CREATE;
        }
        if self.uri {
            flags |= ffi::SQLITE_OPEN_URI;
        }
        if flags & (ffi::SQLITE_OPEN_READONLY | ffi::SQLITE_OPEN_READWRITE) == 0 {
            flags |= ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE;
        }
        // The handle is shared between threads behind our own mutex.
        flags | ffi::SQLITE_OPEN_FULLMUTEX
    }
}

/// How `BEGIN` acquires locks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BeginMode {
    #[default]
    Deferred,
    Immediate,
    Exclusive,
}

impl BeginMode {
    fn sql(self) -> &'static str {
        match self {
            BeginMode::Deferred => "BEGIN DEFERRED",
            BeginMode::Immediate => "BEGIN IMMEDIATE",
            BeginMode::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: ":memory:".to_string(),
            flags: OpenFlags::create_read_write(),
            busy_timeout_ms: 5000,
            statement_cache_size: 64,
            begin: BeginMode::Deferred,
            foreign_keys: true,
        }
    }
}

impl SqliteConfig {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn memory() -> Self {
        Self::default()
    }

    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    pub fn statement_cache_size(mut self, size: usize) -> Self {
        self.statement_cache_size = size;
        self
    }

    pub fn begin_mode(mut self, mode: BeginMode) -> Self {
        self.begin = mode;
        self
    }

    pub fn foreign_keys(mut self, enabled: bool) -> Self {
        self.foreign_keys = enabled;
        self
    }
}

// ============================================================================
// Statements
// ============================================================================

/// A statement in use. Owned statements are finalized when dropped; cached
/// ones are reset for reuse.
struct Statement {
    raw: *mut ffi::sqlite3_stmt,
    cached: bool,
}

impl Statement {
    fn prepare(db: *mut ffi::sqlite3, sql: &str) -> Result<Self> {
        Ok(Self {
            raw: prepare_raw(db, sql)?,
            cached: false,
        })
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        // SAFETY: raw came from sqlite3_prepare_v2 and is not used afterwards
        // unless cached, in which case reset keeps it valid
        unsafe {
            if self.cached {
                ffi::sqlite3_reset(self.raw);
                ffi::sqlite3_clear_bindings(self.raw);
            } else {
                ffi::sqlite3_finalize(self.raw);
            }
        }
    }
}

struct CachedStatement {
    raw: *mut ffi::sqlite3_stmt,
    last_used: u64,
}

/// Compiled statements by SQL text, least recently used evicted first.
struct StatementCache {
    entries: HashMap<String, CachedStatement>,
    capacity: usize,
    tick: u64,
    hits: u64,
}

impl StatementCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            tick: 0,
            hits: 0,
        }
    }

    fn acquire(&mut self, db: *mut ffi::sqlite3, sql: &str) -> Result<Statement> {
        if self.capacity == 0 {
            return Statement::prepare(db, sql);
        }
        self.tick += 1;
        if let Some(entry) = self.entries.get_mut(sql) {
            entry.last_used = self.tick;
            self.hits += 1;
            return Ok(Statement {
                raw: entry.raw,
                cached: true,
            });
        }
        let raw = prepare_raw(db, sql)?;
        if self.entries.len() >= self.capacity {
            self.evict_lru();
        }
        self.entries.insert(
            sql.to_string(),
            CachedStatement {
                raw,
                last_used: self.tick,
            },
        );
        Ok(Statement { raw, cached: true })
    }

    fn evict_lru(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(sql, _)| sql.clone());
        if let Some(sql) = oldest {
            if let Some(entry) = self.entries.remove(&sql) {
                tracing::trace!(sql = %sql, "Evicted cached statement");
                // SAFETY: evicted statements are not in use
                unsafe { ffi::sqlite3_finalize(entry.raw) };
            }
        }
    }

    fn clear(&mut self) {
        for (_, entry) in self.entries.drain() {
            // SAFETY: no statement is in use while the connection lock is held
            unsafe { ffi::sqlite3_finalize(entry.raw) };
        }
    }
}

/// Interrupts statements on `db` once `timeout` elapses.
struct Deadline {
    db: *mut ffi::sqlite3,
    at: Box<Instant>,
}

impl Deadline {
    fn arm(db: *mut ffi::sqlite3, timeout: Option<Duration>) -> Option<Self> {
        let timeout = timeout?;
        let mut at = Box::new(Instant::now() + timeout);
        // SAFETY: the boxed instant lives until Drop unregisters the handler
        unsafe {
            ffi::sqlite3_progress_handler(
                db,
                ffi::PROGRESS_INTERVAL,
                Some(ffi::deadline_handler),
                (&raw mut *at).cast(),
            );
        }
        Some(Self { db, at })
    }

    fn expired(&self) -> bool {
        Instant::now() >= *self.at
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        // SAFETY: db is open; clearing the handler drops its pointer
        unsafe { ffi::sqlite3_progress_handler(self.db, 0, None, ptr::null_mut()) };
    }
}

// ============================================================================
// Connection
// ============================================================================

struct SqliteInner {
    db: *mut ffi::sqlite3,
    in_transaction: bool,
    statements: StatementCache,
}

// SAFETY: the handle is opened in serialized mode and every use goes through
// the connection mutex.
unsafe impl Send for SqliteInner {}

/// A connection to a SQLite database, shareable across threads.
pub struct SqliteConnection {
    inner: Mutex<SqliteInner>,
    path: String,
    begin: BeginMode,
}

impl SqliteConnection {
    /// Open a connection with `config`.
    pub fn open(config: &SqliteConfig) -> Result<Self> {
        let c_path = CString::new(config.path.as_str()).map_err(|_| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: "Invalid path: contains null byte".to_string(),
                source: None,
            })
        })?;

        let mut db: *mut ffi::sqlite3 = ptr::null_mut();
        // SAFETY: valid pointers; the return code is checked
        let rc = unsafe {
            ffi::sqlite3_open_v2(
                c_path.as_ptr(),
                &mut db,
                config.flags.to_sqlite_flags(),
                ptr::null(),
            )
        };
        if rc != ffi::SQLITE_OK {
            let msg = if db.is_null() {
                ffi::error_string(rc).to_string()
            } else {
                // SAFETY: a failed open may still return a handle to close
                unsafe {
                    let msg = ffi::last_error_message(db);
                    ffi::sqlite3_close(db);
                    msg
                }
            };
            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: format!("Failed to open database: {msg}"),
                source: None,
            }));
        }
        if config.busy_timeout_ms > 0 {
            // SAFETY: db is open
            unsafe { ffi::sqlite3_busy_timeout(db, config.busy_timeout_ms as c_int) };
        }

        let conn = Self {
            inner: Mutex::new(SqliteInner {
                db,
                in_transaction: false,
                statements: StatementCache::new(config.statement_cache_size),
            }),
            path: config.path.clone(),
            begin: config.begin,
        };
        if config.foreign_keys {
            conn.execute_raw("PRAGMA foreign_keys = ON")?;
        }
        tracing::debug!(
            path = %config.path,
            version = ffi::version(),
            statement_cache = config.statement_cache_size,
            "Opened SQLite connection"
        );
        Ok(conn)
    }

    pub fn open_memory() -> Result<Self> {
        Self::open(&SqliteConfig::memory())
    }

    pub fn open_file(path: impl Into<String>) -> Result<Self> {
        Self::open(&SqliteConfig::file(path))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Run one or more statements without parameters (DDL, pragmas).
    pub fn execute_raw(&self, sql: &str) -> Result<()> {
        let inner = sync::lock(&self.inner);
        let c_sql = CString::new(sql).map_err(|_| null_byte_error(sql))?;
        let mut errmsg: *mut std::ffi::c_char = ptr::null_mut();
        // SAFETY: all pointers are valid for the call
        let rc = unsafe {
            ffi::sqlite3_exec(inner.db, c_sql.as_ptr(), None, ptr::null_mut(), &mut errmsg)
        };
        if rc != ffi::SQLITE_OK {
            let msg = if errmsg.is_null() {
                ffi::error_string(rc).to_string()
            } else {
                // SAFETY: errmsg was allocated by sqlite3_exec
                unsafe {
                    let msg = CStr::from_ptr(errmsg).to_string_lossy().into_owned();
                    ffi::sqlite3_free(errmsg.cast());
                    msg
                }
            };
            // SAFETY: db is open
            let extended = unsafe { ffi::sqlite3_extended_errcode(inner.db) };
            return Err(database_error(rc, extended, sql, msg));
        }
        tracing::trace!(sql = %sql, "Executed raw SQL");
        Ok(())
    }

    pub fn last_insert_rowid(&self) -> i64 {
        let inner = sync::lock(&self.inner);
        // SAFETY: db is open
        unsafe { ffi::sqlite3_last_insert_rowid(inner.db) }
    }

    pub fn changes(&self) -> u64 {
        let inner = sync::lock(&self.inner);
        // SAFETY: db is open
        unsafe { ffi::sqlite3_changes(inner.db) as u64 }
    }

    /// Statements compiled and kept for reuse, and how often one was reused.
    pub fn statement_cache_stats(&self) -> (usize, u64) {
        let inner = sync::lock(&self.inner);
        (inner.statements.entries.len(), inner.statements.hits)
    }

    fn run_query(
        &self,
        sql: &str,
        params: &[Value],
        timeout: Option<Duration>,
        cached: bool,
    ) -> Result<Vec<Row>> {
        let mut inner = sync::lock(&self.inner);
        let db = inner.db;
        let stmt = if cached {
            inner.statements.acquire(db, sql)?
        } else {
            Statement::prepare(db, sql)?
        };
        bind_all(db, &stmt, sql, params)?;

        // SAFETY: stmt is valid
        let col_count = unsafe { ffi::sqlite3_column_count(stmt.raw) };
        let names = (0..col_count)
            .map(|i| {
                // SAFETY: i is a valid column index
                unsafe { types::column_name(stmt.raw, i) }.unwrap_or_else(|| format!("col{i}"))
            })
            .collect();
        let columns = Arc::new(ColumnInfo::new(names));

        let deadline = Deadline::arm(db, timeout);
        let mut rows = Vec::new();
        loop {
            // SAFETY: stmt is valid
            match unsafe { ffi::sqlite3_step(stmt.raw) } {
                ffi::SQLITE_ROW => {
                    let values = (0..col_count)
                        // SAFETY: the statement is positioned on a row
                        .map(|i| unsafe { types::read_column(stmt.raw, i) })
                        .collect();
                    rows.push(Row::with_columns(Arc::clone(&columns), values));
                }
                ffi::SQLITE_DONE => break,
                rc => return Err(step_failure(db, sql, rc, deadline.as_ref(), timeout)),
            }
        }
        tracing::trace!(sql = %sql, params = params.len(), rows = rows.len(), "Query finished");
        Ok(rows)
    }

    fn run_execute(
        inner: &SqliteInner,
        sql: &str,
        params: &[Value],
        timeout: Option<Duration>,
        stmt: &Statement,
    ) -> Result<u64> {
        let db = inner.db;
        bind_all(db, stmt, sql, params)?;
        let deadline = Deadline::arm(db, timeout);
        // SAFETY: stmt is valid
        match unsafe { ffi::sqlite3_step(stmt.raw) } {
            ffi::SQLITE_DONE | ffi::SQLITE_ROW => {
                // SAFETY: db is open
                let changes = unsafe { ffi::sqlite3_changes(db) } as u64;
                tracing::trace!(sql = %sql, params = params.len(), changes, "Statement finished");
                Ok(changes)
            }
            rc => Err(step_failure(db, sql, rc, deadline.as_ref(), timeout)),
        }
    }

    fn execute_with(&self, sql: &str, params: &[Value], timeout: Option<Duration>, cached: bool) -> Result<u64> {
        let mut inner = sync::lock(&self.inner);
        let db = inner.db;
        let stmt = if cached {
            inner.statements.acquire(db, sql)?
        } else {
            Statement::prepare(db, sql)?
        };
        Self::run_execute(&inner, sql, params, timeout, &stmt)
    }

    fn transaction_statement(&self, sql: &str) -> Result<()> {
        let mut inner = sync::lock(&self.inner);
        let stmt = Statement::prepare(inner.db, sql)?;
        Self::run_execute(&inner, sql, &[], None, &stmt)?;
        inner.in_transaction = sql.starts_with("BEGIN");
        Ok(())
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        let inner = self
            .inner
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.statements.clear();
        if !inner.db.is_null() {
            // SAFETY: every statement has been finalized
            unsafe { ffi::sqlite3_close(inner.db) };
        }
    }
}

impl std::fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("path", &self.path)
            .field("begin", &self.begin)
            .finish_non_exhaustive()
    }
}

impl Connection for SqliteConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn query(&self, sql: &str, params: &[Value], timeout: Option<Duration>) -> Result<Vec<Row>> {
        self.run_query(sql, params, timeout, false)
    }

    fn execute(&self, sql: &str, params: &[Value], timeout: Option<Duration>) -> Result<u64> {
        self.execute_with(sql, params, timeout, false)
    }

    fn query_cached(
        &self,
        sql: &str,
        params: &[Value],
        timeout: Option<Duration>,
    ) -> Result<Vec<Row>> {
        self.run_query(sql, params, timeout, true)
    }

    fn execute_cached(&self, sql: &str, params: &[Value], timeout: Option<Duration>) -> Result<u64> {
        self.execute_with(sql, params, timeout, true)
    }

    fn insert(&self, sql: &str, params: &[Value]) -> Result<i64> {
        let inner = sync::lock(&self.inner);
        let stmt = Statement::prepare(inner.db, sql)?;
        Self::run_execute(&inner, sql, params, None, &stmt)?;
        // SAFETY: db is open; read under the same lock as the insert
        Ok(unsafe { ffi::sqlite3_last_insert_rowid(inner.db) })
    }

    fn begin(&self) -> Result<()> {
        if self.in_transaction() {
            return Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::AlreadyActive,
                message: "Already in a transaction".to_string(),
            }));
        }
        self.transaction_statement(self.begin.sql())?;
        tracing::debug!(mode = ?self.begin, "BEGIN");
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        if !self.in_transaction() {
            return Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::NotActive,
                message: "Not in a transaction".to_string(),
            }));
        }
        self.transaction_statement("COMMIT")?;
        tracing::debug!("COMMIT");
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        if !self.in_transaction() {
            return Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::NotActive,
                message: "Not in a transaction".to_string(),
            }));
        }
        self.transaction_statement("ROLLBACK")?;
        tracing::debug!("ROLLBACK");
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        sync::lock(&self.inner).in_transaction
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn null_byte_error(sql: &str) -> Error {
    Error::Query(QueryError::new(QueryErrorKind::Syntax, "SQL contains null byte").with_sql(sql))
}

fn prepare_raw(db: *mut ffi::sqlite3, sql: &str) -> Result<*mut ffi::sqlite3_stmt> {
    let c_sql = CString::new(sql).map_err(|_| null_byte_error(sql))?;
    let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();
    // SAFETY: all pointers are valid for the call
    let rc = unsafe {
        ffi::sqlite3_prepare_v2(
            db,
            c_sql.as_ptr(),
            c_sql.as_bytes().len() as c_int,
            &mut stmt,
            ptr::null_mut(),
        )
    };
    if rc != ffi::SQLITE_OK {
        return Err(last_error(db, sql));
    }
    if stmt.is_null() {
        return Err(Error::Query(
            QueryError::new(QueryErrorKind::Syntax, "SQL contains no statement").with_sql(sql),
        ));
    }
    Ok(stmt)
}

fn bind_all(db: *mut ffi::sqlite3, stmt: &Statement, sql: &str, params: &[Value]) -> Result<()> {
    for (i, param) in params.iter().enumerate() {
        // SAFETY: stmt is valid; indexes are 1-based
        let rc = unsafe { types::bind_value(stmt.raw, (i + 1) as c_int, param) };
        if rc != ffi::SQLITE_OK {
            // SAFETY: db is open
            let msg = unsafe { ffi::last_error_message(db) };
            return Err(Error::Query(
                QueryError::new(
                    QueryErrorKind::Database,
                    format!("Failed to bind parameter {}: {}", i + 1, msg),
                )
                .with_sql(sql),
            ));
        }
    }
    Ok(())
}

fn step_failure(
    db: *mut ffi::sqlite3,
    sql: &str,
    rc: c_int,
    deadline: Option<&Deadline>,
    timeout: Option<Duration>,
) -> Error {
    if rc == ffi::SQLITE_INTERRUPT && deadline.is_some_and(Deadline::expired) {
        let timeout = timeout.unwrap_or_default();
        tracing::warn!(sql = %sql, timeout_ms = timeout.as_millis() as u64, "Statement timed out");
        return timeout_error(sql, timeout);
    }
    last_error(db, sql)
}

fn last_error(db: *mut ffi::sqlite3, sql: &str) -> Error {
    // SAFETY: db is open
    let (code, extended, msg) = unsafe {
        (
            ffi::sqlite3_errcode(db),
            ffi::sqlite3_extended_errcode(db),
            ffi::last_error_message(db),
        )
    };
    database_error(code, extended, sql, msg)
}

fn database_error(code: c_int, extended: c_int, sql: &str, message: String) -> Error {
    let mut err = QueryError::new(error_code_to_kind(code & 0xff), message).with_sql(sql);
    err.sqlstate = sqlstate_for(extended).map(String::from);
    Error::Query(err)
}

fn error_code_to_kind(code: c_int) -> QueryErrorKind {
    match code {
        ffi::SQLITE_CONSTRAINT => QueryErrorKind::Constraint,
        ffi::SQLITE_BUSY => QueryErrorKind::LockNotAvailable,
        ffi::SQLITE_LOCKED => QueryErrorKind::Deadlock,
        ffi::SQLITE_PERM | ffi::SQLITE_AUTH => QueryErrorKind::Permission,
        ffi::SQLITE_NOTFOUND => QueryErrorKind::NotFound,
        ffi::SQLITE_TOOBIG => QueryErrorKind::DataTruncation,
        ffi::SQLITE_INTERRUPT => QueryErrorKind::Cancelled,
        _ => QueryErrorKind::Database,
    }
}

/// SQLSTATE equivalents of the constraint codes callers test for.
fn sqlstate_for(extended: c_int) -> Option<&'static str> {
    match extended {
        ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => Some("23505"),
        ffi::SQLITE_CONSTRAINT_FOREIGNKEY => Some("23503"),
        ffi::SQLITE_CONSTRAINT_NOTNULL => Some("23502"),
        ffi::SQLITE_BUSY | ffi::SQLITE_BUSY_TIMEOUT => Some("55P03"),
        _ => None,
    }
}
