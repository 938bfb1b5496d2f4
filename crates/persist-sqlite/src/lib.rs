//! SQLite driver for persist.
//!
//! Implements the [`persist_core::Connection`] trait over libsqlite3, built
//! from the bundled amalgamation.
//!
//! # Features
//!
//! - Numbered `?N` parameter binding
//! - Transactions with a configurable `BEGIN` mode
//! - Statement timeouts through a progress handler
//! - An LRU cache of compiled statements for the `*_cached` calls
//! - Constraint and busy errors classified with SQLSTATE equivalents
//!
//! # Example
//!
//! ```rust,ignore
//! use persist_core::{Connection, Value};
//! use persist_sqlite::SqliteConnection;
//!
//! let conn = SqliteConnection::open_memory()?;
//! conn.execute_raw("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")?;
//! let id = conn.insert("INSERT INTO users (name) VALUES (?1)", &[Value::Text("Alice".into())])?;
//! ```
//!
//! # Thread Safety
//!
//! `SqliteConnection` is `Send + Sync`. The handle sits behind a mutex, so
//! statements from different threads run one at a time.

// FFI bindings require unsafe code
#![allow(unsafe_code)]

pub mod connection;
pub mod ffi;
pub mod types;

pub use connection::{BeginMode, OpenFlags, SqliteConfig, SqliteConnection};

pub fn sqlite_version() -> &'static str {
    ffi::version()
}

pub fn sqlite_version_number() -> i32 {
    ffi::version_number()
}
