//! persist - object-relational persistence with a shared cache and a
//! prepared query pipeline.
//!
//! persist maps dynamic entities onto relational tables and provides:
//!
//! - Queries prepared once and executed concurrently through per-call clones
//! - A shared second-level cache with per-type isolation levels
//! - Units of work holding a transactional working set of clones
//! - JPQL, named queries and query hints
//! - A JSON persistence context for REST-style front ends
//!
//! # Quick Start
//!
//! ```ignore
//! use persist::prelude::*;
//! use std::sync::Arc;
//!
//! let project = Project::new().with(
//!     ClassDescriptor::entity("Employee", "employees")
//!         .id("id", "id", AttributeType::Integer)
//!         .generated_id()
//!         .direct("name", "name", AttributeType::Text),
//! );
//!
//! let conn = SqliteConnection::open_memory()?;
//! conn.execute_raw("CREATE TABLE employees (id INTEGER PRIMARY KEY, name TEXT)")?;
//! let server = ServerSession::new(project, Arc::new(conn), SessionConfig::default())?;
//!
//! // Transactional work
//! let mut uow = server.acquire_unit_of_work(HashMap::new());
//! uow.register_new_object(Entity::new("Employee").with("name", "Ada"))?;
//! uow.commit()?;
//!
//! // Or entity-level JSON operations
//! let ctx = PersistenceContext::new(server);
//! let ada = ctx.find(None, "Employee", &json!(1), &HashMap::new())?;
//! ```
//!
//! # Crates
//!
//! - `persist-core`: values, rows, errors, descriptors, entities, the
//!   `Connection` trait
//! - `persist-query`: `DatabaseQuery`, expressions, JPQL, hints
//! - `persist-session`: shared cache, server session, unit of work
//! - `persist-sqlite`: the SQLite driver

pub mod context;
pub mod json;

pub use context::{PersistenceContext, QueryOutcome, TENANT_ID};
pub use json::{entity_from_json, entity_to_json, key_from_json};

// Re-export the public surface of the layers beneath.
pub use persist_core::{
    AttributeType, AttributeValue, CacheIsolation, ClassDescriptor, Connection, Dialect, Entity,
    EntityRef, Error, LockMode, Mapping, PrimaryKey, Project, QueryTimeout, Result, Row, TriState,
    Value,
};
pub use persist_query::{
    CacheRetrieveMode, CacheStoreMode, CacheUsage, DatabaseQuery, Expression, FlushMode,
    QueryKind, QueryResult, TranslationRow, apply_hints, hints,
};
pub use persist_session::{
    MergeStats, ObjectKey, ObjectState, ServerSession, SessionConfig, SharedCache, UnitOfWork,
};
pub use persist_sqlite::{SqliteConfig, SqliteConnection};

/// Everything needed for typical use.
pub mod prelude {
    pub use crate::{
        AttributeType, CacheIsolation, ClassDescriptor, Connection, DatabaseQuery, Entity,
        EntityRef, Error, Expression, PersistenceContext, Project, QueryOutcome, Result,
        ServerSession, SessionConfig, SqliteConnection, UnitOfWork, Value,
    };
    pub use serde_json::json;
    pub use std::collections::HashMap;
}
