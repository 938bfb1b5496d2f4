//! Core types for the persist object-relational layer.
//!
//! - `Value` and `Row` for dynamically typed SQL data
//! - `Error` taxonomy shared by every layer
//! - `Connection` trait and `Dialect` for synchronous statement execution
//! - `ClassDescriptor` / `Project` mapping metadata with cache isolation
//! - `Entity` dynamic instances with lazy relationship holders

pub mod connection;
pub mod descriptor;
pub mod entity;
pub mod error;
pub mod row;
pub mod sync;
pub mod tristate;
pub mod value;

pub use connection::{Connection, Dialect, LockMode, timeout_error};
pub use descriptor::{
    AttributeType, CacheIsolation, Cardinality, ClassDescriptor, DEFAULT_IDENTITY_MAP_SIZE,
    Mapping, Project, QueryOverrides, QueryTimeout,
};
pub use entity::{
    AttributeValue, CollectionHolder, Entity, EntityRef, PrimaryKey, ValueHolder, entity_ref,
};
pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, OptimisticLockError, ParseError,
    QueryError, QueryErrorKind, Result, TransactionError, TransactionErrorKind, TypeError,
    UsageError, UsageErrorKind,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use tristate::TriState;
pub use value::Value;
