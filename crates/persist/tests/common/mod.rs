//! Shared model and schema for the SQLite integration tests.

#![allow(dead_code)]

use persist_core::{
    AttributeType, CacheIsolation, ClassDescriptor, Connection, EntityRef, Project, Value, sync,
};
use persist_session::{ServerSession, SessionConfig};
use persist_sqlite::SqliteConnection;
use std::sync::Arc;

pub const SCHEMA: &str = "
    CREATE TABLE departments (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
    CREATE TABLE employees (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        salary REAL,
        version INTEGER,
        dept_id INTEGER REFERENCES departments(id),
        city TEXT,
        zip TEXT
    );
    CREATE TABLE accounts (id INTEGER PRIMARY KEY, holder TEXT NOT NULL);
    CREATE TABLE payments (
        id INTEGER PRIMARY KEY,
        amount REAL,
        account_id INTEGER REFERENCES accounts(id)
    );
";

/// Departments own employees; employees embed an address. Accounts are
/// isolated, which makes the payments referring to them protected.
pub fn project() -> Project {
    Project::new()
        .with(
            ClassDescriptor::entity("Department", "departments")
                .id("id", "id", AttributeType::Integer)
                .generated_id()
                .direct("name", "name", AttributeType::Text)
                .one_to_many("employees", "Employee", "department"),
        )
        .with(
            ClassDescriptor::entity("Employee", "employees")
                .id("id", "id", AttributeType::Integer)
                .generated_id()
                .direct("name", "name", AttributeType::Text)
                .direct("salary", "salary", AttributeType::Float)
                .version("version", "version")
                .many_to_one("department", "Department", "dept_id")
                .embedded("address", "Address"),
        )
        .with(
            ClassDescriptor::embeddable("Address")
                .direct("city", "city", AttributeType::Text)
                .direct("zip", "zip", AttributeType::Text),
        )
        .with(
            ClassDescriptor::entity("Account", "accounts")
                .id("id", "id", AttributeType::Integer)
                .direct("holder", "holder", AttributeType::Text)
                .isolation(CacheIsolation::Isolated),
        )
        .with(
            ClassDescriptor::entity("Payment", "payments")
                .id("id", "id", AttributeType::Integer)
                .direct("amount", "amount", AttributeType::Float)
                .many_to_one("account", "Account", "account_id"),
        )
}

pub fn connection() -> Arc<SqliteConnection> {
    let conn = SqliteConnection::open_memory().expect("open sqlite memory db");
    conn.execute_raw(SCHEMA).expect("create schema");
    Arc::new(conn)
}

/// A server over a fresh database, with the connection for direct SQL.
pub fn server_with(config: SessionConfig) -> (ServerSession, Arc<SqliteConnection>) {
    let conn = connection();
    let shared: Arc<dyn Connection> = conn.clone();
    let server = ServerSession::new(project(), shared, config).expect("create server session");
    (server, conn)
}

pub fn server() -> (ServerSession, Arc<SqliteConnection>) {
    server_with(SessionConfig::default())
}

/// Three employees in one department.
pub fn seed(conn: &SqliteConnection) {
    conn.execute_raw(
        "INSERT INTO departments (id, name) VALUES (1, 'Research');
         INSERT INTO employees (id, name, salary, version, dept_id, city, zip)
             VALUES (1, 'Ada', 100.0, 1, 1, 'London', 'N1');
         INSERT INTO employees (id, name, salary, version, dept_id, city, zip)
             VALUES (2, 'Grace', 120.0, 1, 1, 'Arlington', '22201');
         INSERT INTO employees (id, name, salary, version, dept_id, city, zip)
             VALUES (3, 'Edsger', 90.0, 1, 1, NULL, NULL);",
    )
    .expect("seed rows");
}

pub fn text(object: &EntityRef, attribute: &str) -> Option<String> {
    match sync::read(object).value(attribute) {
        Some(Value::Text(s)) => Some(s.clone()),
        _ => None,
    }
}
